//! Intent detection for inbound chat messages.
//!
//! Two extractors implement [`IntentExtractor`]: [`KeywordExtractor`] matches
//! fixed keyword tables offline, [`LanguageModelExtractor`] asks a hosted
//! OpenAI-compatible model and can fall back to the keyword rules.

pub mod classifier;
pub mod model;
pub mod rules;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use classifier::{Category, canonical_category, detect_category, fold_accents};
pub use model::{LanguageModelExtractor, ModelConfig};
pub use rules::{KeywordExtractor, parse_amount};

pub const ROW_HISTORY: &str = "id_historico_list";
pub const ROW_WEB_REPORT: &str = "id_relatorio_list";
pub const ROW_DELETE_EXPENSE: &str = "id_excluir_gasto_list";
pub const ROW_HELP: &str = "id_ajuda_list";

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned no choices")]
    EmptyReply,
    #[error("model reply is not a valid intent document: {0}")]
    InvalidReply(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    RegisterExpense,
    ViewHistory,
    ViewWebReport,
    RequestAccessCode,
    DeleteExpense,
    Greeting,
    Thanks,
    Help,
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::RegisterExpense => "registrar_gasto",
            Intent::ViewHistory => "ver_historico",
            Intent::ViewWebReport => "ver_relatorio_web",
            Intent::RequestAccessCode => "obter_codigo_acesso",
            Intent::DeleteExpense => "excluir_gasto",
            Intent::Greeting => "saudacao",
            Intent::Thanks => "agradecimento",
            Intent::Help => "ajuda",
            Intent::Other => "outro",
        }
    }

    /// Parses a label; anything unknown is [`Intent::Other`].
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "registrar_gasto" => Intent::RegisterExpense,
            "ver_historico" => Intent::ViewHistory,
            "ver_relatorio_web" => Intent::ViewWebReport,
            "obter_codigo_acesso" => Intent::RequestAccessCode,
            "excluir_gasto" => Intent::DeleteExpense,
            "saudacao" => Intent::Greeting,
            "agradecimento" => Intent::Thanks,
            "ajuda" => Intent::Help,
            _ => Intent::Other,
        }
    }

    /// Maps the row id of an interactive list reply.
    pub fn from_list_row(row_id: &str) -> Self {
        match row_id {
            ROW_HISTORY => Intent::ViewHistory,
            ROW_WEB_REPORT => Intent::ViewWebReport,
            ROW_DELETE_EXPENSE => Intent::DeleteExpense,
            ROW_HELP => Intent::Help,
            _ => Intent::Other,
        }
    }
}

impl Serialize for Intent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Intent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(label
            .map(|value| Intent::from_label(&value))
            .unwrap_or(Intent::Other))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default, deserialize_with = "deserialize_amount")]
    pub valor: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub categoria: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub descricao: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    #[serde(default = "default_intent")]
    pub intent: Intent,
    #[serde(default, deserialize_with = "deserialize_entities")]
    pub entities: Entities,
}

impl IntentResult {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            entities: Entities::default(),
        }
    }

    pub fn other() -> Self {
        Self::new(Intent::Other)
    }
}

fn default_intent() -> Intent {
    Intent::Other
}

fn deserialize_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let amount = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => parse_amount(&text),
        _ => None,
    };
    Ok(amount.filter(|value| value.is_finite() && *value >= 0.0))
}

fn deserialize_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    })
}

fn deserialize_entities<'de, D>(deserializer: D) -> Result<Entities, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Entities>::deserialize(deserializer)?.unwrap_or_default())
}

/// Classifies inbound text. Implementations absorb their own failures.
#[async_trait]
pub trait IntentExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn extract(&self, text: &str) -> IntentResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_label_roundtrip() {
        for intent in [
            Intent::RegisterExpense,
            Intent::ViewHistory,
            Intent::ViewWebReport,
            Intent::RequestAccessCode,
            Intent::DeleteExpense,
            Intent::Greeting,
            Intent::Thanks,
            Intent::Help,
            Intent::Other,
        ] {
            assert_eq!(Intent::from_label(intent.as_str()), intent);
        }
        assert_eq!(Intent::from_label("fazer_pix"), Intent::Other);
    }

    #[test]
    fn list_rows_map_to_intents() {
        assert_eq!(Intent::from_list_row(ROW_HISTORY), Intent::ViewHistory);
        assert_eq!(Intent::from_list_row(ROW_WEB_REPORT), Intent::ViewWebReport);
        assert_eq!(
            Intent::from_list_row(ROW_DELETE_EXPENSE),
            Intent::DeleteExpense
        );
        assert_eq!(Intent::from_list_row(ROW_HELP), Intent::Help);
        assert_eq!(Intent::from_list_row("id_desconhecido"), Intent::Other);
    }

    #[test]
    fn entities_accept_loose_model_output() {
        let parsed: IntentResult = serde_json::from_str(
            r#"{"intent":"registrar_gasto","entities":{"valor":"12,50","categoria":"alimentacao","descricao":null}}"#,
        )
        .unwrap();
        assert_eq!(parsed.intent, Intent::RegisterExpense);
        assert_eq!(parsed.entities.valor, Some(12.5));
        assert_eq!(parsed.entities.categoria.as_deref(), Some("alimentacao"));
        assert!(parsed.entities.descricao.is_none());

        let bare: IntentResult = serde_json::from_str(r#"{"intent":null,"entities":null}"#).unwrap();
        assert_eq!(bare, IntentResult::other());

        let negative: IntentResult =
            serde_json::from_str(r#"{"intent":"registrar_gasto","entities":{"valor":-3}}"#).unwrap();
        assert!(negative.entities.valor.is_none());
    }
}
