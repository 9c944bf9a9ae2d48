use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Food,
    Transport,
    Leisure,
    Bills,
    Health,
    Other,
}

/// Checked in order; the first table with a hit wins.
const KEYWORD_TABLES: &[(Category, &[&str])] = &[
    (
        Category::Food,
        &["comida", "lanche", "mercado", "supermercado", "pizza", "refeição"],
    ),
    (
        Category::Transport,
        &["uber", "ônibus", "gasolina", "combustível", "corrida", "transporte"],
    ),
    (
        Category::Leisure,
        &["cinema", "show", "passeio", "lazer", "diversão"],
    ),
    (
        Category::Bills,
        &["luz", "água", "internet", "telefone", "conta"],
    ),
    (
        Category::Health,
        &["remédio", "consulta", "médico", "hospital", "farmácia"],
    ),
];

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Food => "alimentação",
            Category::Transport => "transporte",
            Category::Leisure => "lazer",
            Category::Bills => "contas",
            Category::Health => "saúde",
            Category::Other => "outros",
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        KEYWORD_TABLES
            .iter()
            .find(|(category, _)| category == self)
            .map(|(_, words)| *words)
            .unwrap_or(&[])
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match fold_accents(value.trim()).as_str() {
            "alimentacao" => Ok(Category::Food),
            "transporte" => Ok(Category::Transport),
            "lazer" => Ok(Category::Leisure),
            "contas" => Ok(Category::Bills),
            "saude" => Ok(Category::Health),
            "outros" => Ok(Category::Other),
            _ => Err(()),
        }
    }
}

/// Lower-cases and strips Portuguese diacritics.
pub fn fold_accents(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

/// Maps free text to a category by substring matching.
pub fn detect_category(text: &str) -> Category {
    let folded = fold_accents(text);
    for (category, words) in KEYWORD_TABLES {
        if words
            .iter()
            .any(|word| folded.contains(fold_accents(word).as_str()))
        {
            return *category;
        }
    }
    Category::Other
}

/// Normalizes a category label coming from outside the fixed table.
///
/// Known labels collapse onto their accented form; anything else is kept
/// lower-cased as a free-form category.
pub fn canonical_category(label: &str) -> Option<String> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Category::from_str(trimmed) {
        Ok(category) => Some(category.as_str().to_string()),
        Err(()) => Some(trimmed.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_categories_in_order() {
        assert_eq!(detect_category("Pizza com a galera"), Category::Food);
        assert_eq!(detect_category("UBER pro trabalho"), Category::Transport);
        assert_eq!(detect_category("ingresso do cinema"), Category::Leisure);
        assert_eq!(detect_category("conta de luz"), Category::Bills);
        assert_eq!(detect_category("farmácia"), Category::Health);
        assert_eq!(detect_category("presente de aniversário"), Category::Other);
    }

    #[test]
    fn first_table_wins_on_overlap() {
        // "mercado" (food) appears before "conta" (bills)
        assert_eq!(detect_category("conta do mercado"), Category::Food);
    }

    #[test]
    fn matching_ignores_accents() {
        assert_eq!(detect_category("passagem de onibus"), Category::Transport);
        assert_eq!(detect_category("REMEDIO pra gripe"), Category::Health);
    }

    #[test]
    fn canonical_labels() {
        assert_eq!(
            canonical_category("alimentacao").as_deref(),
            Some("alimentação")
        );
        assert_eq!(canonical_category(" Saude ").as_deref(), Some("saúde"));
        assert_eq!(canonical_category("Educacao").as_deref(), Some("educacao"));
        assert_eq!(canonical_category("  "), None);
        assert_eq!(Category::Bills.keywords().len(), 5);
        assert!(Category::Other.keywords().is_empty());
    }
}
