use crate::classifier::canonical_category;
use crate::rules::KeywordExtractor;
use crate::{IntentError, IntentExtractor, IntentResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama3-8b-8192";

const SYSTEM_PROMPT: &str = r#"Você é um assistente financeiro no WhatsApp. Sua tarefa é analisar a mensagem do usuário, identificar a intenção principal e extrair dados relevantes em formato JSON.

As intenções possíveis são:
- 'registrar_gasto': quando o usuário quer registrar uma despesa.
- 'ver_historico': quando o usuário quer ver seus gastos anteriores.
- 'ver_relatorio_web': quando o usuário quer acessar o painel web ou relatórios.
- 'obter_codigo_acesso': quando o usuário solicita o código de acesso ao painel web.
- 'excluir_gasto': quando o usuário quer remover uma despesa.
- 'saudacao': quando o usuário inicia a conversa ou cumprimenta (ex: "oi", "ola", "bom dia").
- 'agradecimento': quando o usuário agradece (ex: "obrigado", "valeu").
- 'ajuda': quando o usuário pede ajuda ou não entende (ex: "ajuda", "como usar", "o que você faz").
- 'outro': para qualquer outra intenção não listada.

Para 'registrar_gasto', extraia as entidades:
- 'valor': o valor numérico da despesa (ponto como separador decimal).
- 'categoria': alimentacao, transporte, lazer, contas, saude, educacao, casa, vestuario, servicos, presentes ou financas. Se não puder determinar, use 'outros'.
- 'descricao': a descrição textual do gasto.

Exemplos:
- "Gastei 50 no almoço": { "intent": "registrar_gasto", "entities": { "valor": 50, "categoria": "alimentacao", "descricao": "gastei 50 no almoço" } }
- "Minhas despesas": { "intent": "ver_historico", "entities": {} }
- "Quero acessar o painel": { "intent": "obter_codigo_acesso", "entities": {} }
- "Apagar ultimo gasto": { "intent": "excluir_gasto", "entities": {} }

Responda apenas com o objeto JSON, sem texto antes ou depois. Entidades desconhecidas podem ser omitidas ou null."#;

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.2,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Intent extraction backed by an OpenAI-compatible chat completion API.
pub struct LanguageModelExtractor {
    config: ModelConfig,
    client: reqwest::Client,
    fallback: Option<KeywordExtractor>,
}

impl LanguageModelExtractor {
    pub fn new(config: ModelConfig) -> Result<Self, IntentError> {
        let client = reqwest::Client::builder()
            .user_agent("poquida-intent/1.0")
            .timeout(config.timeout)
            .build()
            .map_err(|err| IntentError::Request(err.to_string()))?;
        Ok(Self {
            config,
            client,
            fallback: None,
        })
    }

    /// Answers with the keyword rules instead of `outro` when the model fails.
    pub fn with_fallback(mut self, fallback: KeywordExtractor) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn chat_completion(&self, text: &str) -> Result<String, IntentError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            temperature: self.config.temperature,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        debug!(model = %self.config.model, url = %url, "sending intent request");
        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref api_key) = self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| IntentError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(IntentError::Status { status, body });
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| IntentError::InvalidReply(err.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(IntentError::EmptyReply)
    }

    pub async fn try_extract(&self, text: &str) -> Result<IntentResult, IntentError> {
        let content = self.chat_completion(text).await?;
        parse_model_reply(&content)
    }
}

#[async_trait]
impl IntentExtractor for LanguageModelExtractor {
    fn name(&self) -> &'static str {
        "language-model"
    }

    async fn extract(&self, text: &str) -> IntentResult {
        match self.try_extract(text).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, model = %self.config.model, "intent model call failed");
                match &self.fallback {
                    Some(rules) => rules.classify(text),
                    None => IntentResult::other(),
                }
            }
        }
    }
}

/// Parses the JSON object a model replied with.
///
/// Models occasionally wrap the object in prose or code fences, so only the
/// outermost braces are considered.
pub fn parse_model_reply(content: &str) -> Result<IntentResult, IntentError> {
    let start = content
        .find('{')
        .ok_or_else(|| IntentError::InvalidReply("no JSON object".to_string()))?;
    let end = content
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| IntentError::InvalidReply("unterminated JSON object".to_string()))?;
    let mut result: IntentResult = serde_json::from_str(&content[start..=end])
        .map_err(|err| IntentError::InvalidReply(err.to_string()))?;
    result.entities.categoria = result
        .entities
        .categoria
        .as_deref()
        .and_then(canonical_category);
    Ok(result)
}
