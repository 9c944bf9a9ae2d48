//! Turns inbound chat messages into expense records and replies.

use super::replies;
use crate::metrics::Metrics;
use crate::security::access::AccessCodeStore;
use crate::transport::{ChatTransport, SeenSet, TransportError};
use crate::util::mask_code;
use poquida_intent::{Intent, IntentExtractor, IntentResult, detect_category};
use poquida_proto::{OutboundContent, WireMessage};
use poquida_storage::{ExpenseStore, NewExpense, StorageError};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Bot {
    store: Arc<dyn ExpenseStore>,
    transport: Arc<dyn ChatTransport>,
    extractor: Arc<dyn IntentExtractor>,
    access: Arc<AccessCodeStore>,
    metrics: Arc<Metrics>,
    seen: Mutex<SeenSet>,
    public_url: String,
}

impl Bot {
    pub fn new(
        store: Arc<dyn ExpenseStore>,
        transport: Arc<dyn ChatTransport>,
        extractor: Arc<dyn IntentExtractor>,
        access: Arc<AccessCodeStore>,
        metrics: Arc<Metrics>,
        seen: SeenSet,
        public_url: String,
    ) -> Self {
        Self {
            store,
            transport,
            extractor,
            access,
            metrics,
            seen: Mutex::new(seen),
            public_url,
        }
    }

    /// Consumes inbound messages until the channel closes, one task per message.
    pub fn spawn(self: Arc<Self>, mut inbound: mpsc::Receiver<WireMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(extractor = self.extractor.name(), "bot dispatcher started");
            while let Some(message) = inbound.recv().await {
                let bot = Arc::clone(&self);
                tokio::spawn(async move { bot.handle(message).await });
            }
            info!("bot dispatcher stopped");
        })
    }

    pub async fn handle(&self, message: WireMessage) {
        if message.message.is_none() || message.key.from_me {
            return;
        }
        let Some(message_id) = message.key.id.as_deref() else {
            return;
        };
        if !self.seen.lock().await.first_sighting(message_id) {
            debug!(message_id = %message_id, "duplicate message ignored");
            self.metrics.mark_duplicate();
            return;
        }
        let Some(text) = message.text().filter(|text| !text.trim().is_empty()) else {
            return;
        };
        self.metrics.mark_inbound();
        let jid = message.key.remote_jid.as_str();
        debug!(jid = %jid, message_id = %message_id, "processing message");

        if let Err(err) = self.process(jid, &text, &message).await {
            error!(jid = %jid, message_id = %message_id, error = %err, "message processing failed");
            self.reply(jid, OutboundContent::text(replies::INTERNAL_ERROR))
                .await;
        }
    }

    async fn process(&self, jid: &str, text: &str, message: &WireMessage) -> Result<(), BotError> {
        if let Err(err) = self.store.find_or_create_user(jid, None).await {
            warn!(jid = %jid, error = %err, "user lookup failed");
            self.transport
                .send(jid, OutboundContent::text(replies::USER_LOOKUP_FAILED))
                .await?;
            return Ok(());
        }

        let decided = if message.is_list_response() {
            let row = message.selected_row_id().unwrap_or_default();
            debug!(jid = %jid, row = %row, "list option selected");
            IntentResult::new(Intent::from_list_row(row))
        } else {
            self.extractor.extract(text).await
        };
        info!(
            jid = %jid,
            intent = decided.intent.as_str(),
            extractor = self.extractor.name(),
            "intent decided"
        );

        let reply = match decided.intent {
            Intent::RegisterExpense => {
                let Some(valor) = decided.entities.valor.filter(|valor| *valor > 0.0) else {
                    return self.send(jid, replies::MISSING_AMOUNT).await;
                };
                let categoria = decided
                    .entities
                    .categoria
                    .unwrap_or_else(|| detect_category(text).as_str().to_string());
                let descricao = decided
                    .entities
                    .descricao
                    .unwrap_or_else(|| text.to_string());
                let record = self
                    .store
                    .save_expense(&NewExpense {
                        usuario_id: jid.to_string(),
                        valor,
                        categoria,
                        descricao: Some(descricao),
                    })
                    .await?;
                self.metrics.mark_expense();
                info!(jid = %jid, expense = record.id, valor = record.valor, categoria = %record.categoria, "expense recorded");
                replies::expense_recorded(record.valor, &record.categoria)
            }
            Intent::ViewHistory => {
                let expenses = self.store.expenses_by_user(jid).await?;
                OutboundContent::text(replies::history(&expenses))
            }
            Intent::ViewWebReport | Intent::RequestAccessCode => {
                let issued = self.access.issue(jid).await;
                self.metrics.mark_code_issued();
                debug!(jid = %jid, code = %mask_code(&issued.code), "access code issued over chat");
                let text =
                    replies::access_code_reply(&issued.code, &self.public_url, self.access.ttl());
                if let Err(err) = self.transport.send(jid, OutboundContent::text(text)).await {
                    self.access.revoke_issued(&issued).await;
                    self.metrics.mark_delivery_failed();
                    return Err(err.into());
                }
                return Ok(());
            }
            Intent::DeleteExpense => {
                let expenses = self.store.expenses_by_user(jid).await?;
                let Some(latest) = expenses.first() else {
                    return self.send(jid, replies::NOTHING_TO_DELETE).await;
                };
                match self.store.delete_expense(latest.id).await {
                    Ok(()) => {
                        info!(jid = %jid, expense = latest.id, "expense deleted");
                        OutboundContent::text(replies::expense_deleted(latest))
                    }
                    Err(err) => {
                        warn!(jid = %jid, expense = latest.id, error = %err, "expense delete failed");
                        OutboundContent::text(replies::delete_failed(&err.to_string()))
                    }
                }
            }
            Intent::Greeting => OutboundContent::text(replies::GREETING),
            Intent::Thanks => OutboundContent::text(replies::THANKS),
            Intent::Help | Intent::Other => replies::help_menu(),
        };
        self.transport.send(jid, reply).await?;
        Ok(())
    }

    async fn send(&self, jid: &str, text: &str) -> Result<(), BotError> {
        self.transport.send(jid, OutboundContent::text(text)).await?;
        Ok(())
    }

    /// Best-effort reply used on the error path.
    async fn reply(&self, jid: &str, content: OutboundContent) {
        if let Err(err) = self.transport.send(jid, content).await {
            warn!(jid = %jid, error = %err, "error reply not delivered");
        }
    }
}
