use chrono::Utc;
use poquida_storage::{ExpenseStore, NewExpense, StorageError, connect};

#[tokio::test]
async fn expense_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let pg = match std::env::var("POQUIDA_TEST_PG_DSN") {
        Ok(value) => value,
        Err(_) => {
            eprintln!("skipping expense_lifecycle: POQUIDA_TEST_PG_DSN not set");
            return Ok(());
        }
    };
    let storage = connect(&pg).await?;
    storage.migrate().await?;
    storage.readiness().await?;

    let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let jid = format!("{}@s.whatsapp.net", suffix);
    let user = storage.find_or_create_user(&jid, Some("Teste")).await?;
    let again = storage.find_or_create_user(&jid, None).await?;
    assert_eq!(user.id, again.id);
    assert_eq!(again.nome.as_deref(), Some("Teste"));

    let first = storage
        .save_expense(&NewExpense {
            usuario_id: jid.clone(),
            valor: 12.5,
            categoria: "alimentação".to_string(),
            descricao: Some("lanche".to_string()),
        })
        .await?;
    let second = storage
        .save_expense(&NewExpense {
            usuario_id: jid.clone(),
            valor: 30.0,
            categoria: "transporte".to_string(),
            descricao: None,
        })
        .await?;

    let listed = storage.expenses_by_user(&jid).await?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(storage.recent_expenses(&jid, 1).await?.len(), 1);

    let stats = storage.expense_stats(&jid).await?;
    assert_eq!(stats.count, 2);
    assert_eq!(stats.total, 42.5);

    storage.delete_expense(first.id).await?;
    assert!(matches!(
        storage.delete_expense(first.id).await,
        Err(StorageError::Missing)
    ));
    storage.delete_expense(second.id).await?;
    assert!(storage.expenses_by_user(&jid).await?.is_empty());
    Ok(())
}
