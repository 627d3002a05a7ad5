use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientMessageKey, MessageId, RequestId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    MessagesHistorical {
        request_id: RequestId,
        peer_id: UserId,
        page: u32,
        page_size: u32,
    },
    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        client_key: ClientMessageKey,
        receiver_id: UserId,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        message_ids: Vec<MessageId>,
    },
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::MessagesHistorical { .. } => "messages_historical",
            ClientRequest::PrivateMessage { .. } => "private_message",
            ClientRequest::MessagesRead { .. } => "messages_read",
        }
    }
}

/// One roster entry as reported by the server. The identity is optional on the
/// wire so that malformed entries can be dropped instead of failing the whole
/// snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<DateTime<Utc>>,
}

/// A server-confirmed message as returned by a history page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub content: String,
    pub from_self: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<DateTime<Utc>>,
}

/// A message pushed to the recipient as it is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: MessageId,
    pub from: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    OnlineUsers {
        users: Vec<ContactSummary>,
    },
    HistoryUsers {
        users: Vec<ContactSummary>,
    },
    #[serde(rename_all = "camelCase")]
    MessagesHistorical {
        request_id: RequestId,
        messages: Vec<MessagePayload>,
        #[serde(default)]
        next_page: Option<u32>,
    },
    PrivateMessage {
        message: InboundMessage,
    },
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        message_ids: Vec<MessageId>,
        read_time: DateTime<Utc>,
        from: UserId,
    },
    #[serde(rename_all = "camelCase")]
    PrivateMessageAck {
        client_key: ClientMessageKey,
        id: MessageId,
        timestamp: DateTime<Utc>,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsers { .. } => "online_users",
            ServerEvent::HistoryUsers { .. } => "history_users",
            ServerEvent::MessagesHistorical { .. } => "messages_historical",
            ServerEvent::PrivateMessage { .. } => "private_message",
            ServerEvent::MessagesRead { .. } => "messages_read",
            ServerEvent::PrivateMessageAck { .. } => "private_message_ack",
            ServerEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
