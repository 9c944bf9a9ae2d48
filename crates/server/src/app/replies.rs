//! Chat replies sent by the bot, in Brazilian Portuguese.

use chrono::{DateTime, FixedOffset, Utc};
use poquida_intent::{ROW_DELETE_EXPENSE, ROW_HISTORY, ROW_WEB_REPORT};
use poquida_proto::{ListMessage, ListRow, ListSection, OutboundContent};
use poquida_storage::ExpenseRecord;
use std::fmt::Write;
use std::time::Duration;

pub const HISTORY_LIMIT: usize = 10;

pub const GREETING: &str =
    "👋 Olá! Eu sou o PoquidaGrana, seu assistente financeiro. Como posso te ajudar hoje?";
pub const THANKS: &str = "De nada! Fico feliz em ajudar com suas finanças.";
pub const MISSING_AMOUNT: &str = "Entendi que você quer registrar um gasto, mas preciso do *valor* e da *categoria*. Ex: \"Gastei 50 no almoço\".";
pub const NO_EXPENSES: &str = "Você ainda não tem gastos registrados.";
pub const NOTHING_TO_DELETE: &str = "Você não tem gastos registrados para excluir.";
pub const USER_LOOKUP_FAILED: &str =
    "⚠️ Ocorreu um erro ao identificar seu usuário. Por favor, tente novamente mais tarde.";
pub const INTERNAL_ERROR: &str = "🤖 Ops! Ocorreu um erro interno e não consegui processar sua solicitação. A equipe técnica já foi notificada. Por favor, tente novamente.";

const LIST_FOOTER: &str = "Escolha uma opção na lista:";
const HELP_TEXT: &str = "❓ *Não entendi muito bem. Você pode me dizer o que gostaria de fazer (ex: \"Gastei 15 no almoço\") ou escolher uma opção:*\n";

/// Dates in chat are shown in Brasília time (UTC-3, no daylight saving).
fn brasilia(at: &DateTime<Utc>) -> DateTime<FixedOffset> {
    match FixedOffset::west_opt(3 * 3600) {
        Some(offset) => at.with_timezone(&offset),
        None => at.fixed_offset(),
    }
}

pub fn expense_recorded(valor: f64, categoria: &str) -> OutboundContent {
    OutboundContent::List(ListMessage {
        text: format!(
            "✅ *Gasto Registrado!*\n\n💰 Valor: R$ {:.2}\n📂 Categoria: {}\n\nO que você gostaria de fazer a seguir?",
            valor, categoria
        ),
        footer: LIST_FOOTER.to_string(),
        title: "Ações do Gasto".to_string(),
        button_text: "Ver Ações".to_string(),
        sections: vec![ListSection {
            title: "Próximos Passos".to_string(),
            rows: vec![
                ListRow::new(
                    ROW_DELETE_EXPENSE,
                    "🗑️ Excluir Último Gasto",
                    "Remover o gasto que acabei de registrar",
                ),
                ListRow::new(
                    ROW_HISTORY,
                    "📜 Ver Histórico",
                    "Consultar meus gastos anteriores",
                ),
                ListRow::new(
                    ROW_WEB_REPORT,
                    "📊 Acessar Relatório Web",
                    "Ver gráficos e estatísticas",
                ),
            ],
        }],
    })
}

pub fn help_menu() -> OutboundContent {
    OutboundContent::List(ListMessage {
        text: HELP_TEXT.to_string(),
        footer: LIST_FOOTER.to_string(),
        title: "Ajuda e Comandos".to_string(),
        button_text: "Ver Opções".to_string(),
        sections: vec![ListSection {
            title: "Opções Rápidas".to_string(),
            rows: vec![
                ListRow::new(ROW_HISTORY, "📜 Ver Histórico", "Veja seus últimos gastos"),
                ListRow::new(
                    ROW_WEB_REPORT,
                    "📊 Acessar Relatório Web",
                    "Gera um código para o painel de controle",
                ),
                ListRow::new(
                    ROW_DELETE_EXPENSE,
                    "🗑️ Excluir Último Gasto",
                    "Remover o gasto mais recente",
                ),
            ],
        }],
    })
}

/// Expects `expenses` newest first; only the first [`HISTORY_LIMIT`] are shown.
pub fn history(expenses: &[ExpenseRecord]) -> String {
    if expenses.is_empty() {
        return NO_EXPENSES.to_string();
    }
    let mut text = String::from("📊 *Seu Histórico de Gastos (Últimos 10):*\n\n");
    let mut total = 0.0;
    for expense in expenses.iter().take(HISTORY_LIMIT) {
        let _ = writeln!(
            text,
            "• {} - R$ {:.2} ({})",
            brasilia(&expense.criado_em).format("%d/%m/%Y"),
            expense.valor,
            expense.categoria
        );
        total += expense.valor;
    }
    let _ = write!(text, "\n*Total exibido: R$ {:.2}*", total);
    text
}

pub fn expense_deleted(expense: &ExpenseRecord) -> String {
    format!(
        "🗑️ *Gasto Excluído!*\n\nO último gasto (R$ {:.2} - {}) foi removido com sucesso.",
        expense.valor, expense.categoria
    )
}

pub fn delete_failed(reason: &str) -> String {
    format!("❌ Erro ao excluir o gasto: {}", reason)
}

fn expiry_minutes(ttl: Duration) -> u64 {
    ttl.as_secs().div_ceil(60).max(1)
}

/// Reply to a chat request for the dashboard.
pub fn access_code_reply(code: &str, dashboard_url: &str, ttl: Duration) -> String {
    format!(
        "🔐 *Código de Acesso ao Sistema Web*\n\nSeu código: *{}*\n\nAcesse: {}\n\n⏰ Este código expira em {} minutos.",
        code,
        dashboard_url,
        expiry_minutes(ttl)
    )
}

/// Message carrying a code requested from the web login form.
pub fn access_code_delivery(code: &str, ttl: Duration) -> String {
    format!(
        "🔐 *Código de Acesso ao Sistema Web*\n\nSeu código: *{}*\n\n⏰ Este código expira em {} minutos.\n\n💻 Digite este código no site para acessar seus registros.",
        code,
        expiry_minutes(ttl)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expense(id: i64, valor: f64, categoria: &str, day: u32) -> ExpenseRecord {
        ExpenseRecord {
            id,
            usuario_id: "5511987654321@s.whatsapp.net".to_string(),
            valor,
            categoria: categoria.to_string(),
            descricao: None,
            criado_em: Utc.with_ymd_and_hms(2024, 3, day, 15, 0, 0).unwrap(),
        }
    }

    #[test]
    fn history_lists_latest_ten_with_total() {
        let expenses = (1..=12)
            .rev()
            .map(|day| expense(day as i64, 10.0, "lazer", day))
            .collect::<Vec<_>>();
        let text = history(&expenses);
        assert!(text.starts_with("📊 *Seu Histórico de Gastos (Últimos 10):*\n\n"));
        assert!(text.contains("• 12/03/2024 - R$ 10.00 (lazer)\n"));
        assert!(!text.contains("02/03/2024"));
        assert_eq!(text.matches("• ").count(), 10);
        assert!(text.ends_with("\n*Total exibido: R$ 100.00*"));
    }

    #[test]
    fn history_uses_brasilia_date() {
        let mut late = expense(1, 5.5, "contas", 1);
        late.criado_em = Utc.with_ymd_and_hms(2024, 3, 2, 1, 30, 0).unwrap();
        assert!(history(&[late]).contains("• 01/03/2024 - R$ 5.50 (contas)"));
        assert_eq!(history(&[]), NO_EXPENSES);
    }

    #[test]
    fn confirmation_offers_follow_up_rows() {
        let OutboundContent::List(list) = expense_recorded(12.5, "alimentação") else {
            panic!("confirmation must be a list");
        };
        assert!(list.text.contains("💰 Valor: R$ 12.50"));
        assert!(list.text.contains("📂 Categoria: alimentação"));
        let rows = list.sections[0]
            .rows
            .iter()
            .map(|row| row.row_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(rows, vec![ROW_DELETE_EXPENSE, ROW_HISTORY, ROW_WEB_REPORT]);
        let OutboundContent::List(help) = help_menu() else {
            panic!("help must be a list");
        };
        assert_eq!(help.button_text, "Ver Opções");
        assert_eq!(help.sections[0].rows.len(), 3);
    }

    #[test]
    fn code_messages_state_expiry() {
        let reply = access_code_reply("123456", "https://poquida.app", Duration::from_secs(600));
        assert!(reply.contains("Seu código: *123456*"));
        assert!(reply.contains("Acesse: https://poquida.app"));
        assert!(reply.contains("expira em 10 minutos"));
        let delivery = access_code_delivery("654321", Duration::from_secs(90));
        assert!(delivery.contains("*654321*"));
        assert!(delivery.contains("expira em 2 minutos"));
        assert_eq!(
            expense_deleted(&expense(1, 7.0, "transporte", 5)),
            "🗑️ *Gasto Excluído!*\n\nO último gasto (R$ 7.00 - transporte) foi removido com sucesso."
        );
    }
}
