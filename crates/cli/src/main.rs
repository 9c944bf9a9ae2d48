use poquida_intent::{IntentExtractor, KeywordExtractor};
use poquida_proto::jid_from_phone;
use poquida_storage::{ExpenseStore, Storage, connect};
use std::env;
use tokio::runtime::Builder;
use tracing::info;

const USAGE: &str = "usage: poquida-cli <migrate|diagnose|history <phone>|stats <phone>|classify <text...>>";

fn main() {
    let _ = dotenvy::dotenv();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to init tracing");
    let mut runtime = Builder::new_multi_thread();
    runtime.enable_all();
    let runtime = runtime.build().expect("failed to build runtime");
    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), String> {
    let mut args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() {
        return Err(USAGE.to_string());
    }
    let command = args.remove(0);
    match command.as_str() {
        "migrate" => command_migrate().await,
        "diagnose" => command_diagnose().await,
        "history" => command_history(args).await,
        "stats" => command_stats(args).await,
        "classify" => command_classify(args).await,
        other => Err(format!("unknown command: {}\n{}", other, USAGE)),
    }
}

async fn command_migrate() -> Result<(), String> {
    let storage = storage_connect().await?;
    storage
        .migrate()
        .await
        .map_err(|err| format!("migrate failed: {}", err))?;
    info!("migrations applied");
    Ok(())
}

async fn command_diagnose() -> Result<(), String> {
    let storage = storage_connect().await?;
    storage
        .readiness()
        .await
        .map_err(|err| format!("readiness failed: {}", err))?;
    info!("diagnose complete");
    println!("storage=ok");
    Ok(())
}

fn phone_argument(args: &[String]) -> Result<String, String> {
    let phone = args
        .first()
        .ok_or_else(|| "phone number argument required".to_string())?;
    jid_from_phone(phone).map_err(|err| format!("invalid phone number: {}", err))
}

async fn command_history(args: Vec<String>) -> Result<(), String> {
    let jid = phone_argument(&args)?;
    let storage = storage_connect().await?;
    let expenses = storage
        .recent_expenses(&jid, 20)
        .await
        .map_err(|err| format!("history failed: {}", err))?;
    if expenses.is_empty() {
        println!("no expenses for {}", jid);
        return Ok(());
    }
    for expense in expenses {
        println!(
            "{}\t{}\t{:.2}\t{}\t{}",
            expense.id,
            expense.criado_em.format("%Y-%m-%d %H:%M"),
            expense.valor,
            expense.categoria,
            expense.descricao.unwrap_or_default()
        );
    }
    Ok(())
}

async fn command_stats(args: Vec<String>) -> Result<(), String> {
    let jid = phone_argument(&args)?;
    let storage = storage_connect().await?;
    let stats = storage
        .expense_stats(&jid)
        .await
        .map_err(|err| format!("stats failed: {}", err))?;
    let rendered = serde_json::to_string_pretty(&stats)
        .map_err(|err| format!("encode failed: {}", err))?;
    println!("{}", rendered);
    Ok(())
}

async fn command_classify(args: Vec<String>) -> Result<(), String> {
    if args.is_empty() {
        return Err("text argument required".to_string());
    }
    let text = args.join(" ");
    let result = KeywordExtractor::new().extract(&text).await;
    let rendered =
        serde_json::to_string(&result).map_err(|err| format!("encode failed: {}", err))?;
    println!("{}", rendered);
    Ok(())
}

async fn storage_connect() -> Result<Storage, String> {
    let pg = env::var("POQUIDA_PG_DSN").map_err(|_| "POQUIDA_PG_DSN not set".to_string())?;
    connect(&pg)
        .await
        .map_err(|err| format!("storage connect failed: {}", err))
}
