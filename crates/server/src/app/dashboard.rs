//! View models for the web dashboard pages.

use askama::Template;
use chrono::FixedOffset;
use poquida_storage::{ExpenseRecord, ExpenseStats};

pub const INVALID_CODE: &str = "Código inválido ou expirado";
pub const MISSING_NUMBER: &str = "Digite seu número do WhatsApp";
pub const DELIVERY_FAILED: &str =
    "Não foi possível enviar o código pelo WhatsApp. Tente novamente em instantes.";
pub const UNKNOWN_NUMBER: &str = "Este número não está registrado no WhatsApp";
pub const LOAD_FAILED: &str = "Erro ao carregar dados";

const TABLE_LIMIT: usize = 100;

#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginView {
    pub whatsapp: String,
    pub error: Option<String>,
}

impl LoginView {
    pub fn blank() -> Self {
        Self {
            whatsapp: String::new(),
            error: None,
        }
    }

    pub fn with_error(whatsapp: &str, error: &str) -> Self {
        Self {
            whatsapp: whatsapp.to_string(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Template)]
#[template(path = "verify.html")]
pub struct VerifyView {
    /// Digits only, posted back with the code.
    pub whatsapp: String,
    pub expires_minutes: u64,
    pub error: Option<String>,
}

pub struct CategoryRow {
    pub name: String,
    pub total: String,
    pub count: u64,
    /// Share of the overall total, 0 to 100.
    pub share: u32,
}

pub struct MonthRow {
    pub month: String,
    pub total: String,
}

pub struct ExpenseRow {
    pub date: String,
    pub valor: String,
    pub categoria: String,
    pub descricao: String,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
pub struct DashboardView {
    pub whatsapp: String,
    pub error: Option<String>,
    pub total: String,
    pub count: u64,
    pub average: String,
    pub largest: String,
    pub smallest: String,
    pub categories: Vec<CategoryRow>,
    pub months: Vec<MonthRow>,
    pub expenses: Vec<ExpenseRow>,
}

fn money(value: f64) -> String {
    format!("R$ {:.2}", value)
}

fn optional_money(value: Option<f64>) -> String {
    value.map(money).unwrap_or_else(|| "-".to_string())
}

impl DashboardView {
    /// Expects `expenses` newest first.
    pub fn build(whatsapp: &str, expenses: &[ExpenseRecord], stats: &ExpenseStats) -> Self {
        let offset = FixedOffset::west_opt(3 * 3600);
        let mut categories = stats
            .categories
            .iter()
            .map(|(name, figures)| CategoryRow {
                name: name.clone(),
                total: money(figures.total),
                count: figures.count,
                share: if stats.total > 0.0 {
                    ((figures.total / stats.total) * 100.0).round().clamp(0.0, 100.0) as u32
                } else {
                    0
                },
            })
            .collect::<Vec<_>>();
        categories.sort_by(|a, b| b.share.cmp(&a.share).then_with(|| a.name.cmp(&b.name)));
        Self {
            whatsapp: whatsapp.to_string(),
            error: None,
            total: money(stats.total),
            count: stats.count,
            average: optional_money(stats.average),
            largest: optional_money(stats.largest),
            smallest: optional_money(stats.smallest),
            categories,
            months: stats
                .months
                .iter()
                .rev()
                .map(|(month, total)| MonthRow {
                    month: month.clone(),
                    total: money(*total),
                })
                .collect(),
            expenses: expenses
                .iter()
                .take(TABLE_LIMIT)
                .map(|expense| ExpenseRow {
                    date: match offset {
                        Some(offset) => expense.criado_em.with_timezone(&offset),
                        None => expense.criado_em.fixed_offset(),
                    }
                    .format("%d/%m/%Y %H:%M")
                    .to_string(),
                    valor: money(expense.valor),
                    categoria: expense.categoria.clone(),
                    descricao: expense.descricao.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }

    /// Empty dashboard carrying an error banner.
    pub fn unavailable(whatsapp: &str) -> Self {
        let mut view = Self::build(whatsapp, &[], &ExpenseStats::default());
        view.error = Some(LOAD_FAILED.to_string());
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn expense(id: i64, valor: f64, categoria: &str) -> ExpenseRecord {
        ExpenseRecord {
            id,
            usuario_id: "5511987654321@s.whatsapp.net".to_string(),
            valor,
            categoria: categoria.to_string(),
            descricao: Some(format!("gasto {}", id)),
            criado_em: Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn dashboard_shows_figures_and_shares() {
        let expenses = vec![expense(2, 75.0, "lazer"), expense(1, 25.0, "contas")];
        let stats = ExpenseStats::from_expenses(&expenses);
        let view = DashboardView::build("5511987654321", &expenses, &stats);
        assert_eq!(view.total, "R$ 100.00");
        assert_eq!(view.categories[0].name, "lazer");
        assert_eq!(view.categories[0].share, 75);
        assert_eq!(view.expenses[0].date, "10/05/2024 09:00");
        let html = view.render().unwrap();
        assert!(html.contains("R$ 100.00"));
        assert!(html.contains("gasto 2"));
        assert!(!html.contains(LOAD_FAILED));
    }

    #[test]
    fn unavailable_dashboard_renders_banner() {
        let html = DashboardView::unavailable("5511987654321").render().unwrap();
        assert!(html.contains(LOAD_FAILED));
        assert!(html.contains("R$ 0.00"));
    }

    #[test]
    fn forms_escape_user_input() {
        let html = LoginView::with_error("<script>", MISSING_NUMBER)
            .render()
            .unwrap();
        assert!(html.contains(MISSING_NUMBER));
        assert!(!html.contains("<script>"));
        let verify = VerifyView {
            whatsapp: "5511987654321".to_string(),
            expires_minutes: 10,
            error: Some(INVALID_CODE.to_string()),
        }
        .render()
        .unwrap();
        assert!(verify.contains("name=\"whatsapp\" value=\"5511987654321\""));
        assert!(verify.contains(INVALID_CODE));
    }
}
