use crate::classifier::{detect_category, fold_accents};
use crate::{Entities, Intent, IntentExtractor, IntentResult};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

static AMOUNT_PATTERN: OnceLock<Regex> = OnceLock::new();

fn amount_pattern() -> &'static Regex {
    AMOUNT_PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)(?:r\$\s*)?(",
            r"\d{1,3}(?:\.\d{3})+(?:,\d{1,2})?",
            r"|\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?",
            r"|\d+(?:[.,]\d{1,2})?",
            r")"
        ))
        .expect("amount pattern compiles")
    })
}

// Phrases are matched against the accent-folded, whitespace-normalized text;
// single words must match a whole token.
const DELETE_WORDS: &[&str] = &["excluir", "apagar", "remover", "deletar", "desfazer"];
const ACCESS_CODE_WORDS: &[&str] = &["codigo", "acesso", "senha", "login", "painel"];
const WEB_REPORT_WORDS: &[&str] = &[
    "relatorio",
    "relatorios",
    "grafico",
    "graficos",
    "site",
    "web",
    "dashboard",
];
const HISTORY_WORDS: &[&str] = &["historico", "extrato"];
const HISTORY_PHRASES: &[&str] = &[
    "meus gastos",
    "minhas despesas",
    "ultimos gastos",
    "quanto gastei",
];
const THANKS_WORDS: &[&str] = &["obrigado", "obrigada", "valeu", "vlw", "agradecido"];
const GREETING_WORDS: &[&str] = &["oi", "ola", "opa", "eai", "salve"];
const GREETING_PHRASES: &[&str] = &["bom dia", "boa tarde", "boa noite", "e ai"];
const HELP_WORDS: &[&str] = &["ajuda", "help", "menu", "comandos"];
const HELP_PHRASES: &[&str] = &["como usar", "o que voce faz"];

/// Offline intent rules used without a model key or as model fallback.
#[derive(Debug, Clone, Default)]
pub struct KeywordExtractor;

impl KeywordExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> IntentResult {
        let folded = fold_accents(text);
        let tokens = folded
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>();
        let normalized = tokens.join(" ");
        let has_word = |words: &[&str]| tokens.iter().any(|token| words.contains(token));
        let has_phrase = |phrases: &[&str]| {
            phrases
                .iter()
                .any(|phrase| format!(" {} ", normalized).contains(&format!(" {} ", phrase)))
        };

        if has_word(DELETE_WORDS) {
            return IntentResult::new(Intent::DeleteExpense);
        }
        if has_word(HISTORY_WORDS) || has_phrase(HISTORY_PHRASES) {
            return IntentResult::new(Intent::ViewHistory);
        }
        // An amount outranks access and report words: "gastei 50 no site".
        if let Some(valor) = find_amount(text) {
            let description = text.trim();
            return IntentResult {
                intent: Intent::RegisterExpense,
                entities: Entities {
                    valor: Some(valor),
                    categoria: Some(detect_category(text).as_str().to_string()),
                    descricao: (!description.is_empty()).then(|| description.to_string()),
                },
            };
        }
        if has_word(ACCESS_CODE_WORDS) {
            return IntentResult::new(Intent::RequestAccessCode);
        }
        if has_word(WEB_REPORT_WORDS) {
            return IntentResult::new(Intent::ViewWebReport);
        }
        if has_word(THANKS_WORDS) {
            return IntentResult::new(Intent::Thanks);
        }
        if has_word(GREETING_WORDS) || has_phrase(GREETING_PHRASES) {
            return IntentResult::new(Intent::Greeting);
        }
        if has_word(HELP_WORDS) || has_phrase(HELP_PHRASES) {
            return IntentResult::new(Intent::Help);
        }
        IntentResult::other()
    }
}

#[async_trait]
impl IntentExtractor for KeywordExtractor {
    fn name(&self) -> &'static str {
        "keywords"
    }

    async fn extract(&self, text: &str) -> IntentResult {
        self.classify(text)
    }
}

/// Finds the first monetary amount in free text.
pub fn find_amount(text: &str) -> Option<f64> {
    amount_pattern()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .filter_map(|found| parse_amount(found.as_str()))
        .find(|value| *value > 0.0)
}

/// Parses an amount written with either decimal separator.
///
/// When both `.` and `,` appear the last one is the decimal separator. A lone
/// separator followed by exactly three digits groups thousands, as in
/// "1.500" or "1,500".
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect::<String>();
    if cleaned.is_empty() {
        return None;
    }
    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            if cleaned.matches(',').count() > 1 || cleaned[comma + 1..].len() == 3 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (Some(dot), None) => {
            let fraction = &cleaned[dot + 1..];
            if cleaned.matches('.').count() > 1 || fraction.len() == 3 {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };
    normalized
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_amount_formats() {
        assert_eq!(parse_amount("12,50"), Some(12.5));
        assert_eq!(parse_amount("12.5"), Some(12.5));
        assert_eq!(parse_amount("R$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("1.500"), Some(1500.0));
        assert_eq!(parse_amount("1,500"), Some(1500.0));
        assert_eq!(parse_amount("30"), Some(30.0));
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn finds_grouped_amounts_in_text() {
        assert_eq!(find_amount("paguei 1.234,56 no aluguel"), Some(1234.56));
        assert_eq!(find_amount("paguei 1,234.56"), Some(1234.56));
        assert_eq!(find_amount("geladeira 1.500"), Some(1500.0));
        assert_eq!(find_amount("lanche 12,50"), Some(12.5));
        assert_eq!(find_amount("sem valor"), None);
    }

    #[test]
    fn registers_expense_with_category() {
        let result = KeywordExtractor::new().classify("Gastei 50 no lanche");
        assert_eq!(result.intent, Intent::RegisterExpense);
        assert_eq!(result.entities.valor, Some(50.0));
        assert_eq!(result.entities.categoria.as_deref(), Some("alimentação"));
        assert_eq!(
            result.entities.descricao.as_deref(),
            Some("Gastei 50 no lanche")
        );
    }

    #[test]
    fn currency_prefix_is_understood() {
        let result = KeywordExtractor::new().classify("uber R$ 23,90");
        assert_eq!(result.intent, Intent::RegisterExpense);
        assert_eq!(result.entities.valor, Some(23.9));
        assert_eq!(result.entities.categoria.as_deref(), Some("transporte"));
    }

    #[test]
    fn commands_without_amounts() {
        let extractor = KeywordExtractor::new();
        assert_eq!(
            extractor.classify("apagar ultimo gasto").intent,
            Intent::DeleteExpense
        );
        assert_eq!(
            extractor.classify("quero acessar o painel").intent,
            Intent::RequestAccessCode
        );
        assert_eq!(
            extractor.classify("me manda o código").intent,
            Intent::RequestAccessCode
        );
        assert_eq!(
            extractor.classify("ver relatório").intent,
            Intent::ViewWebReport
        );
        assert_eq!(
            extractor.classify("Minhas despesas").intent,
            Intent::ViewHistory
        );
        assert_eq!(extractor.classify("Histórico").intent, Intent::ViewHistory);
    }

    #[test]
    fn amounts_outrank_access_and_report_words() {
        let extractor = KeywordExtractor::new();
        let site = extractor.classify("gastei 50 no site da loja");
        assert_eq!(site.intent, Intent::RegisterExpense);
        assert_eq!(site.entities.valor, Some(50.0));

        let gym = extractor.classify("paguei 30 de acesso na academia");
        assert_eq!(gym.intent, Intent::RegisterExpense);
        assert_eq!(gym.entities.valor, Some(30.0));

        let steam = extractor.classify("comprei 200 no login da steam");
        assert_eq!(steam.intent, Intent::RegisterExpense);
        assert_eq!(steam.entities.valor, Some(200.0));

        assert_eq!(
            extractor.classify("apagar o gasto de 50").intent,
            Intent::DeleteExpense
        );
    }

    #[test]
    fn conversational_intents() {
        let extractor = KeywordExtractor::new();
        assert_eq!(extractor.classify("Bom dia!").intent, Intent::Greeting);
        assert_eq!(extractor.classify("oi").intent, Intent::Greeting);
        assert_eq!(extractor.classify("valeu!!").intent, Intent::Thanks);
        assert_eq!(extractor.classify("Obrigada").intent, Intent::Thanks);
        assert_eq!(extractor.classify("como usar?").intent, Intent::Help);
        assert_eq!(extractor.classify("coisa aleatória").intent, Intent::Other);
    }

    #[tokio::test]
    async fn trait_object_dispatch() {
        let extractor: Box<dyn IntentExtractor> = Box::new(KeywordExtractor::new());
        assert_eq!(extractor.name(), "keywords");
        assert_eq!(extractor.extract("oi").await.intent, Intent::Greeting);
    }
}
