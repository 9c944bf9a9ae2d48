use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;
pub const JID_SUFFIX: &str = "@s.whatsapp.net";
/// Status code the gateway reports when the linked device was logged out.
pub const DISCONNECT_LOGGED_OUT: u16 = 401;

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    InvalidJson,
    FrameTooLarge,
    InvalidJid,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid gateway payload"),
            Self::FrameTooLarge => write!(f, "gateway frame exceeds limits"),
            Self::InvalidJid => write!(f, "invalid jid"),
        }
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectInfo {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DisconnectInfo {
    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(DISCONNECT_LOGGED_OUT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionPhase>,
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub last_disconnect: Option<DisconnectInfo>,
    #[serde(default)]
    pub user: Option<BotUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMessage {
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSelectReply {
    pub selected_row_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub single_select_reply: Option<SingleSelectReply>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedText>,
    #[serde(default)]
    pub image_message: Option<ImageMessage>,
    #[serde(default)]
    pub list_response_message: Option<ListResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
}

impl WireMessage {
    /// Returns the user-visible text carried by the message, if any.
    pub fn text(&self) -> Option<String> {
        let content = self.message.as_ref()?;
        if let Some(title) = content
            .list_response_message
            .as_ref()
            .and_then(|list| list.title.as_deref())
            .filter(|title| !title.trim().is_empty())
        {
            return Some(title.to_string());
        }
        let candidates = [
            content.conversation.as_deref(),
            content
                .extended_text_message
                .as_ref()
                .and_then(|ext| ext.text.as_deref()),
            content
                .image_message
                .as_ref()
                .and_then(|img| img.caption.as_deref()),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|value| !value.trim().is_empty())
            .map(|value| value.to_string())
    }

    pub fn selected_row_id(&self) -> Option<&str> {
        self.message
            .as_ref()?
            .list_response_message
            .as_ref()?
            .single_select_reply
            .as_ref()
            .map(|reply| reply.selected_row_id.as_str())
    }

    pub fn is_list_response(&self) -> bool {
        self.message
            .as_ref()
            .map(|content| content.list_response_message.is_some())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exists: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum GatewayEvent {
    #[serde(rename = "connection.update")]
    ConnectionUpdate(ConnectionUpdate),
    #[serde(rename = "messages.upsert")]
    MessagesUpsert { messages: Vec<WireMessage> },
    #[serde(rename = "creds.update")]
    CredsUpdate {},
    #[serde(rename = "result")]
    CommandResult(CommandResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRow {
    pub row_id: String,
    pub title: String,
    pub description: String,
}

impl ListRow {
    pub fn new(row_id: &str, title: &str, description: &str) -> Self {
        Self {
            row_id: row_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessage {
    pub text: String,
    pub footer: String,
    pub title: String,
    pub button_text: String,
    pub sections: Vec<ListSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundContent {
    Text { text: String },
    List(ListMessage),
}

impl OutboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Main body shown to the recipient regardless of message shape.
    pub fn body(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::List(list) => &list.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum GatewayCommand {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        request_id: String,
        jid: String,
        content: OutboundContent,
    },
    #[serde(rename_all = "camelCase")]
    CheckNumber { request_id: String, jid: String },
    End { reason: String },
}

impl GatewayCommand {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::SendMessage { request_id, .. } | Self::CheckNumber { request_id, .. } => {
                Some(request_id)
            }
            Self::End { .. } => None,
        }
    }
}

/// Decodes a single gateway event frame.
pub fn decode_event(payload: &[u8]) -> Result<GatewayEvent, CodecError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    serde_json::from_slice(payload).map_err(|_| CodecError::InvalidJson)
}

/// Encodes a command into its JSON text frame.
pub fn encode_command(command: &GatewayCommand) -> Result<String, CodecError> {
    let encoded = serde_json::to_string(command).map_err(|_| CodecError::InvalidJson)?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    Ok(encoded)
}

/// Keeps only the digits of a phone number as typed by a person.
pub fn normalize_phone(input: &str) -> String {
    let local = input.split('@').next().unwrap_or_default();
    local.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Builds the user JID for a phone number in any human format.
pub fn jid_from_phone(input: &str) -> Result<String, CodecError> {
    let digits = normalize_phone(input);
    if digits.is_empty() {
        return Err(CodecError::InvalidJid);
    }
    Ok(format!("{}{}", digits, JID_SUFFIX))
}

pub fn phone_from_jid(jid: &str) -> &str {
    jid.strip_suffix(JID_SUFFIX).unwrap_or(jid)
}
