use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

const EXPENSE_COLUMNS: &str = "id, usuario_id, valor, categoria, descricao, criado_em";

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Missing,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub whatsapp: String,
    pub nome: Option<String>,
    pub criado_em: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub usuario_id: String,
    pub valor: f64,
    pub categoria: String,
    pub descricao: Option<String>,
}

impl NewExpense {
    fn validate(&self) -> Result<(), StorageError> {
        if self.usuario_id.trim().is_empty()
            || self.categoria.trim().is_empty()
            || !self.valor.is_finite()
            || self.valor < 0.0
        {
            return Err(StorageError::Invalid);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpenseRecord {
    pub id: i64,
    pub usuario_id: String,
    pub valor: f64,
    pub categoria: String,
    pub descricao: Option<String>,
    pub criado_em: DateTime<Utc>,
}

impl ExpenseRecord {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row.get(0),
            usuario_id: row.get(1),
            valor: row.get(2),
            categoria: row.get(3),
            descricao: row.get(4),
            criado_em: row.get(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub total: f64,
    pub count: u64,
}

/// Aggregated figures behind the dashboard and `/api/chart-data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpenseStats {
    pub total: f64,
    pub count: u64,
    pub categories: BTreeMap<String, CategoryStats>,
    /// Totals keyed `YYYY-MM`.
    pub months: BTreeMap<String, f64>,
    pub largest: Option<f64>,
    pub smallest: Option<f64>,
    pub average: Option<f64>,
}

impl ExpenseStats {
    pub fn from_expenses(expenses: &[ExpenseRecord]) -> Self {
        let mut stats = ExpenseStats::default();
        for expense in expenses {
            stats.total += expense.valor;
            stats.count += 1;
            let category = stats
                .categories
                .entry(expense.categoria.clone())
                .or_default();
            category.total += expense.valor;
            category.count += 1;
            *stats
                .months
                .entry(expense.criado_em.format("%Y-%m").to_string())
                .or_insert(0.0) += expense.valor;
            stats.largest = Some(stats.largest.map_or(expense.valor, |v| v.max(expense.valor)));
            stats.smallest = Some(stats.smallest.map_or(expense.valor, |v| v.min(expense.valor)));
        }
        if stats.count > 0 {
            stats.average = Some(stats.total / stats.count as f64);
        }
        stats
    }
}

/// Persistence operations the bot and the dashboard depend on.
#[async_trait]
pub trait ExpenseStore: Send + Sync {
    async fn find_or_create_user(
        &self,
        whatsapp: &str,
        nome: Option<&str>,
    ) -> Result<UserRecord, StorageError>;

    async fn save_expense(&self, expense: &NewExpense) -> Result<ExpenseRecord, StorageError>;

    /// Newest first.
    async fn expenses_by_user(&self, whatsapp: &str) -> Result<Vec<ExpenseRecord>, StorageError>;

    async fn delete_expense(&self, id: i64) -> Result<(), StorageError>;

    async fn expense_stats(&self, whatsapp: &str) -> Result<ExpenseStats, StorageError> {
        let expenses = self.expenses_by_user(whatsapp).await?;
        Ok(ExpenseStats::from_expenses(&expenses))
    }
}

/// Establishes connectivity to PostgreSQL.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client,
        _pg_task: task,
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Loads the newest `limit` expenses of a user.
    pub async fn recent_expenses(
        &self,
        whatsapp: &str,
        limit: i64,
    ) -> Result<Vec<ExpenseRecord>, StorageError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {EXPENSE_COLUMNS} FROM gastos WHERE usuario_id = $1 ORDER BY criado_em DESC, id DESC LIMIT $2"
                ),
                &[&whatsapp, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(ExpenseRecord::from_row).collect())
    }
}

#[async_trait]
impl ExpenseStore for Storage {
    async fn find_or_create_user(
        &self,
        whatsapp: &str,
        nome: Option<&str>,
    ) -> Result<UserRecord, StorageError> {
        if whatsapp.trim().is_empty() {
            return Err(StorageError::Invalid);
        }
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = self
            .client
            .query_one(
                "INSERT INTO usuarios (whatsapp, nome, criado_em)
                VALUES ($1, $2, now())
                ON CONFLICT (whatsapp) DO UPDATE SET nome = COALESCE(usuarios.nome, EXCLUDED.nome)
                RETURNING id, whatsapp, nome, criado_em",
                &[&whatsapp, &nome],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(UserRecord {
            id: row.get(0),
            whatsapp: row.get(1),
            nome: row.get(2),
            criado_em: row.get(3),
        })
    }

    async fn save_expense(&self, expense: &NewExpense) -> Result<ExpenseRecord, StorageError> {
        expense.validate()?;
        let row = self
            .client
            .query_one(
                &format!(
                    "INSERT INTO gastos (usuario_id, valor, categoria, descricao, criado_em)
                    VALUES ($1, $2, $3, $4, now())
                    RETURNING {EXPENSE_COLUMNS}"
                ),
                &[
                    &expense.usuario_id,
                    &expense.valor,
                    &expense.categoria,
                    &expense.descricao,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(ExpenseRecord::from_row(&row))
    }

    async fn expenses_by_user(&self, whatsapp: &str) -> Result<Vec<ExpenseRecord>, StorageError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {EXPENSE_COLUMNS} FROM gastos WHERE usuario_id = $1 ORDER BY criado_em DESC, id DESC"
                ),
                &[&whatsapp],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(ExpenseRecord::from_row).collect())
    }

    async fn delete_expense(&self, id: i64) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute("DELETE FROM gastos WHERE id = $1", &[&id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expense(id: i64, valor: f64, categoria: &str, month: u32) -> ExpenseRecord {
        ExpenseRecord {
            id,
            usuario_id: "5511999990000@s.whatsapp.net".to_string(),
            valor,
            categoria: categoria.to_string(),
            descricao: None,
            criado_em: Utc.with_ymd_and_hms(2024, month, 10, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn stats_for_empty_history() {
        let stats = ExpenseStats::from_expenses(&[]);
        assert_eq!(stats.total, 0.0);
        assert_eq!(stats.count, 0);
        assert!(stats.categories.is_empty());
        assert!(stats.months.is_empty());
        assert!(stats.largest.is_none());
        assert!(stats.smallest.is_none());
        assert!(stats.average.is_none());
    }

    #[test]
    fn stats_group_by_category_and_month() {
        let expenses = vec![
            expense(3, 40.0, "lazer", 2),
            expense(2, 12.5, "alimentação", 1),
            expense(1, 7.5, "alimentação", 1),
        ];
        let stats = ExpenseStats::from_expenses(&expenses);
        assert_eq!(stats.total, 60.0);
        assert_eq!(stats.count, 3);
        assert_eq!(
            stats.categories["alimentação"],
            CategoryStats {
                total: 20.0,
                count: 2
            }
        );
        assert_eq!(stats.categories["lazer"].count, 1);
        assert_eq!(stats.months["2024-01"], 20.0);
        assert_eq!(stats.months["2024-02"], 40.0);
        assert_eq!(stats.largest, Some(40.0));
        assert_eq!(stats.smallest, Some(7.5));
        assert_eq!(stats.average, Some(20.0));
    }

    #[test]
    fn stats_serialize_for_charts() {
        let stats = ExpenseStats::from_expenses(&[expense(1, 10.0, "contas", 3)]);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["categories"]["contas"]["total"], serde_json::json!(10.0));
        assert_eq!(json["months"]["2024-03"], serde_json::json!(10.0));
    }

    #[test]
    fn invalid_expenses_are_rejected() {
        let mut candidate = NewExpense {
            usuario_id: "5511@s.whatsapp.net".to_string(),
            valor: -1.0,
            categoria: "outros".to_string(),
            descricao: None,
        };
        assert!(matches!(candidate.validate(), Err(StorageError::Invalid)));
        candidate.valor = f64::NAN;
        assert!(matches!(candidate.validate(), Err(StorageError::Invalid)));
        candidate.valor = 3.0;
        assert!(candidate.validate().is_ok());
    }
}
