//! Message timeline for the single active conversation.
//!
//! The synchronizer owns the message list and pagination cursor of the
//! selected peer, issues history/send/read requests through a
//! [`CommandSink`], and reconciles the server's asynchronous answers with
//! that timeline. Every response is matched against an explicit table of
//! pending requests; anything the table does not know about is stale and
//! dropped.

use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ClientMessageKey, LocalIdentity, MessageId, RequestId, UserId},
    protocol::{ClientRequest, InboundMessage, MessagePayload},
};
use tracing::{debug, info, warn};

use crate::{
    channel::CommandSink,
    error::{ChannelError, SyncError},
    roster::Contact,
};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const DEFAULT_PREVIEW_LIMIT: usize = 100;
const FIRST_PAGE: u32 = 1;
const PREVIEW_ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: u32,
    pub preview_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<MessageId>,
    pub content: String,
    pub from_self: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub read_time: Option<DateTime<Utc>>,
    pub client_key: Option<ClientMessageKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Not confirmed by the server. Without a retry policy this is also the
    /// failed-send state.
    Pending,
    Sent { at: DateTime<Utc> },
    Read { at: DateTime<Utc> },
}

impl Message {
    fn optimistic(client_key: ClientMessageKey, content: &str) -> Self {
        Self {
            id: None,
            content: content.to_string(),
            from_self: true,
            timestamp: None,
            read_time: None,
            client_key: Some(client_key),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.id.is_some() && self.timestamp.is_some()
    }

    pub fn is_unread_incoming(&self) -> bool {
        !self.from_self && self.read_time.is_none()
    }

    pub fn delivery(&self) -> Delivery {
        match (self.timestamp, self.read_time) {
            (None, _) => Delivery::Pending,
            (Some(_), Some(at)) => Delivery::Read { at },
            (Some(at), None) => Delivery::Sent { at },
        }
    }

    fn mark_read_at(&mut self, read_time: DateTime<Utc>) {
        let read_time = match self.timestamp {
            Some(sent) if read_time < sent => sent,
            _ => read_time,
        };
        self.read_time = Some(read_time);
    }
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        let mut message = Self {
            id: Some(payload.id),
            content: payload.content,
            from_self: payload.from_self,
            timestamp: Some(payload.timestamp),
            read_time: None,
            client_key: None,
        };
        if let Some(read_time) = payload.read_time {
            message.mark_read_at(read_time);
        }
        message
    }
}

impl From<InboundMessage> for Message {
    fn from(inbound: InboundMessage) -> Self {
        let mut message = Self {
            id: Some(inbound.id),
            content: inbound.content,
            from_self: false,
            timestamp: Some(inbound.timestamp),
            read_time: None,
            client_key: None,
        };
        if let Some(read_time) = inbound.read_time {
            message.mark_read_at(read_time);
        }
        message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Loading,
    Ready,
    LoadingOlder,
}

/// Banner for a message that arrived outside the active conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub from: UserId,
    pub preview: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    /// The timeline was cleared for a new (or no) conversation.
    Reset,
    /// Older messages were put in front of the timeline. `first_page` tells
    /// the presentation layer to scroll to the bottom instead of anchoring.
    Prepended { count: usize, first_page: bool },
    Appended { count: usize },
    /// Entries changed in place (send confirmation, read time).
    Updated { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    Timeline(TimelineChange),
    Notification(Notification),
    AudibleAlert,
    RequestFailed {
        kind: &'static str,
        error: ChannelError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryPurpose {
    FirstPage,
    Older,
}

#[derive(Debug, Clone, Copy)]
struct PendingHistory {
    conversation: u64,
    page: u32,
    purpose: HistoryPurpose,
}

/// Requests still waiting for an answer, keyed by their correlation id.
#[derive(Debug, Default)]
struct PendingRequests {
    next_request_id: u64,
    history: HashMap<RequestId, PendingHistory>,
    sends: HashMap<ClientMessageKey, u64>,
}

impl PendingRequests {
    fn allocate_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        RequestId(self.next_request_id)
    }

    fn cancel_all(&mut self) -> usize {
        let cancelled = self.history.len() + self.sends.len();
        self.history.clear();
        self.sends.clear();
        cancelled
    }
}

#[derive(Debug)]
struct ActiveConversation {
    seq: u64,
    peer: Contact,
    phase: SyncPhase,
    messages: Vec<Message>,
    next_page: Option<u32>,
    delivered_pages: HashSet<u32>,
    read_requested: HashSet<MessageId>,
}

impl ActiveConversation {
    fn new(seq: u64, peer: Contact) -> Self {
        Self {
            seq,
            peer,
            phase: SyncPhase::Loading,
            messages: Vec::new(),
            next_page: None,
            delivered_pages: HashSet::new(),
            read_requested: HashSet::new(),
        }
    }

    fn contains_id(&self, id: &MessageId) -> bool {
        self.messages
            .iter()
            .any(|message| message.id.as_ref() == Some(id))
    }
}

pub struct ConversationSync {
    local: LocalIdentity,
    settings: SyncSettings,
    sink: Arc<dyn CommandSink>,
    conversation_seq: u64,
    active: Option<ActiveConversation>,
    pending: PendingRequests,
    notification: Option<Notification>,
    effects: Vec<SyncEffect>,
}

impl ConversationSync {
    pub fn new(local: LocalIdentity, settings: SyncSettings, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            local,
            settings,
            sink,
            conversation_seq: 0,
            active: None,
            pending: PendingRequests::default(),
            notification: None,
            effects: Vec::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.active
            .as_ref()
            .map_or(SyncPhase::Idle, |active| active.phase)
    }

    pub fn active_peer(&self) -> Option<&Contact> {
        self.active.as_ref().map(|active| &active.peer)
    }

    pub fn messages(&self) -> &[Message] {
        self.active
            .as_ref()
            .map_or(&[][..], |active| active.messages.as_slice())
    }

    pub fn next_page(&self) -> Option<u32> {
        self.active.as_ref().and_then(|active| active.next_page)
    }

    pub fn notification(&self) -> Option<&Notification> {
        self.notification.as_ref()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.history.len() + self.pending.sends.len()
    }

    /// Hands the accumulated effects to the caller.
    pub fn drain_effects(&mut self) -> Vec<SyncEffect> {
        mem::take(&mut self.effects)
    }

    /// Makes `peer` the active conversation and requests its newest page.
    pub fn select_peer(&mut self, peer: Contact) {
        info!(
            peer = %peer.user_id,
            conversation = self.conversation_seq + 1,
            "conversation: selected peer"
        );
        self.open(peer, Vec::new());
    }

    pub fn deselect(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.reset_timeline();
        info!("conversation: deselected");
    }

    /// Reloads the active conversation from its first page.
    ///
    /// Messages that were never confirmed survive the reload and stay at the
    /// end of the timeline. Their pending acks are kept so a late
    /// confirmation still reconciles them.
    pub fn resync(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let peer = active.peer.clone();
        let unconfirmed: Vec<Message> = active
            .messages
            .iter()
            .filter(|message| message.id.is_none())
            .cloned()
            .collect();
        let awaiting_ack: Vec<ClientMessageKey> = unconfirmed
            .iter()
            .filter_map(|message| message.client_key.clone())
            .filter(|key| self.pending.sends.contains_key(key))
            .collect();
        info!(
            peer = %peer.user_id,
            conversation = self.conversation_seq + 1,
            unconfirmed = unconfirmed.len(),
            "conversation: resynchronising"
        );

        self.open(peer, unconfirmed);
        let conversation = self.conversation_seq;
        for key in awaiting_ack {
            self.pending.sends.insert(key, conversation);
        }
    }

    fn open(&mut self, peer: Contact, carried: Vec<Message>) {
        self.reset_timeline();
        self.conversation_seq += 1;
        let mut active = ActiveConversation::new(self.conversation_seq, peer);
        if !carried.is_empty() {
            self.effects
                .push(SyncEffect::Timeline(TimelineChange::Appended {
                    count: carried.len(),
                }));
            active.messages = carried;
        }
        self.active = Some(active);
        if let Err(err) = self.request_page(FIRST_PAGE, HistoryPurpose::FirstPage) {
            // Stays in Loading; a reconnect resync reissues the request.
            warn!("conversation: initial history request not sent: {err}");
        }
    }

    /// Scroll-proximity signal: fetch the next older page if there is one.
    ///
    /// Returns whether a request was issued. Requests while a page is already
    /// in flight, or for a page already delivered, are suppressed.
    pub fn load_older(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.phase != SyncPhase::Ready {
            debug!(phase = ?active.phase, "conversation: older page request suppressed");
            return false;
        }
        let Some(page) = active.next_page else {
            return false;
        };
        if active.delivered_pages.contains(&page) {
            debug!(page, "conversation: page already delivered");
            return false;
        }
        active.phase = SyncPhase::LoadingOlder;

        match self.request_page(page, HistoryPurpose::Older) {
            Ok(()) => true,
            Err(err) => {
                warn!(page, "conversation: older page request not sent: {err}");
                if let Some(active) = self.active.as_mut() {
                    active.phase = SyncPhase::Ready;
                }
                false
            }
        }
    }

    /// Appends an optimistic message and issues the send command.
    ///
    /// Returns the correlation key, or `None` when nothing was sent because
    /// no peer is selected or the content is empty.
    pub fn send(&mut self, content: &str) -> Option<ClientMessageKey> {
        if content.is_empty() {
            return None;
        }
        let active = self.active.as_mut()?;
        let client_key = ClientMessageKey::generate();
        active
            .messages
            .push(Message::optimistic(client_key.clone(), content));
        let request = ClientRequest::PrivateMessage {
            client_key: client_key.clone(),
            receiver_id: active.peer.user_id.clone(),
            content: content.to_string(),
        };
        let conversation = active.seq;
        self.effects
            .push(SyncEffect::Timeline(TimelineChange::Appended { count: 1 }));

        match self.submit(request) {
            Ok(()) => {
                self.pending.sends.insert(client_key.clone(), conversation);
            }
            Err(err) => {
                warn!(client_key = %client_key, "conversation: message left unconfirmed: {err}");
            }
        }
        Some(client_key)
    }

    /// Applies a `messages_historical` response.
    pub fn apply_history(
        &mut self,
        request_id: RequestId,
        messages: Vec<MessagePayload>,
        next_page: Option<u32>,
    ) -> Result<(), SyncError> {
        let Some(pending) = self.pending.history.remove(&request_id) else {
            debug!(request_id = %request_id, "conversation: dropping stale history response");
            return Err(SyncError::StaleHistoryResponse(request_id));
        };
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.seq == pending.conversation)
        else {
            debug!(request_id = %request_id, "conversation: history response for inactive conversation");
            return Err(SyncError::StaleHistoryResponse(request_id));
        };

        let mut seen: HashSet<MessageId> = active
            .messages
            .iter()
            .filter_map(|message| message.id.clone())
            .collect();
        let page: Vec<Message> = messages
            .into_iter()
            .filter(|payload| seen.insert(payload.id.clone()))
            .map(Message::from)
            .collect();
        let count = page.len();

        let newer = mem::replace(&mut active.messages, page);
        active.messages.extend(newer);
        active.delivered_pages.insert(pending.page);
        active.next_page = next_page.filter(|next| !active.delivered_pages.contains(next));
        active.phase = SyncPhase::Ready;
        debug!(
            peer = %active.peer.user_id,
            page = pending.page,
            count,
            next_page = ?active.next_page,
            "conversation: history page applied"
        );

        self.effects
            .push(SyncEffect::Timeline(TimelineChange::Prepended {
                count,
                first_page: pending.purpose == HistoryPurpose::FirstPage,
            }));
        self.mark_read();
        Ok(())
    }

    /// Reconciles an optimistic message with its server-assigned id and time.
    pub fn confirm_send(
        &mut self,
        client_key: ClientMessageKey,
        id: MessageId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let Some(conversation) = self.pending.sends.remove(&client_key) else {
            debug!(client_key = %client_key, "conversation: dropping stale send confirmation");
            return Err(SyncError::StaleSendConfirmation(client_key));
        };
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.seq == conversation)
        else {
            return Err(SyncError::StaleSendConfirmation(client_key));
        };

        let slots: Vec<usize> = active
            .messages
            .iter()
            .enumerate()
            .filter(|(_, message)| {
                message.id.is_none() && message.client_key.as_ref() == Some(&client_key)
            })
            .map(|(index, _)| index)
            .collect();
        let slot = match slots.as_slice() {
            [slot] => *slot,
            [] => return Err(SyncError::StaleSendConfirmation(client_key)),
            _ => {
                return Err(SyncError::AmbiguousCorrelationKey {
                    count: slots.len(),
                    key: client_key,
                })
            }
        };

        if active.contains_id(&id) {
            // A history page already delivered the confirmed copy.
            active.messages.remove(slot);
            debug!(message_id = %id, "conversation: optimistic copy merged into delivered message");
            self.effects
                .push(SyncEffect::Timeline(TimelineChange::Updated { count: 1 }));
            return Ok(());
        }

        let message = &mut active.messages[slot];
        message.id = Some(id);
        message.timestamp = Some(timestamp);
        debug!(client_key = %client_key, "conversation: send confirmed");
        self.effects
            .push(SyncEffect::Timeline(TimelineChange::Updated { count: 1 }));
        Ok(())
    }

    /// Routes a pushed message into the timeline or into a notification.
    pub fn receive(&mut self, inbound: InboundMessage) {
        if self.local.is(&inbound.from) {
            debug!(message_id = %inbound.id, "conversation: ignoring own message echo");
            return;
        }

        match self.active.as_mut() {
            Some(active) if active.peer.user_id == inbound.from => {
                if active.contains_id(&inbound.id) {
                    debug!(message_id = %inbound.id, "conversation: duplicate delivery ignored");
                    return;
                }
                active.messages.push(Message::from(inbound));
                self.effects
                    .push(SyncEffect::Timeline(TimelineChange::Appended { count: 1 }));
                self.mark_read();
            }
            _ => {
                let notification = Notification {
                    preview: truncate_preview(&inbound.content, self.settings.preview_limit),
                    from: inbound.from,
                };
                info!(from = %notification.from, "conversation: message outside active conversation");
                self.notification = Some(notification.clone());
                self.effects.push(SyncEffect::Notification(notification));
                self.effects.push(SyncEffect::AudibleAlert);
            }
        }
    }

    /// Applies a read-receipt broadcast to the active timeline.
    ///
    /// Only receipts from the active peer, or from the local user on another
    /// session, are honoured. Unknown ids are ignored.
    pub fn apply_read_receipt(
        &mut self,
        message_ids: &[MessageId],
        read_time: DateTime<Utc>,
        reader: &UserId,
    ) -> usize {
        let Some(active) = self.active.as_mut() else {
            return 0;
        };
        if &active.peer.user_id != reader && !self.local.is(reader) {
            debug!(reader = %reader, "conversation: read receipt for another conversation");
            return 0;
        }

        let ids: HashSet<&MessageId> = message_ids.iter().collect();
        let mut updated = 0;
        for message in active.messages.iter_mut() {
            let listed = message.id.as_ref().is_some_and(|id| ids.contains(id));
            if listed && message.read_time.is_none() {
                message.mark_read_at(read_time);
                updated += 1;
            }
        }
        if updated > 0 {
            self.effects
                .push(SyncEffect::Timeline(TimelineChange::Updated { count: updated }));
        }
        updated
    }

    pub fn dismiss_notification(&mut self) -> bool {
        self.notification.take().is_some()
    }

    fn reset_timeline(&mut self) {
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "conversation: cancelled pending requests");
        }
        self.active = None;
        self.effects
            .push(SyncEffect::Timeline(TimelineChange::Reset));
    }

    fn request_page(&mut self, page: u32, purpose: HistoryPurpose) -> Result<(), SyncError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        let request_id = self.pending.allocate_request_id();
        let request = ClientRequest::MessagesHistorical {
            request_id,
            peer_id: active.peer.user_id.clone(),
            page,
            page_size: self.settings.page_size,
        };
        let pending = PendingHistory {
            conversation: active.seq,
            page,
            purpose,
        };
        self.submit(request)?;
        self.pending.history.insert(request_id, pending);
        debug!(request_id = %request_id, page, "conversation: history requested");
        Ok(())
    }

    /// Sends one batched read receipt for every unread incoming message not
    /// yet requested.
    ///
    /// Ids count as requested only once the receipt was handed to the
    /// channel, so a receipt lost while offline goes out with the next batch.
    fn mark_read(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let message_ids: Vec<MessageId> = active
            .messages
            .iter()
            .filter(|message| message.is_unread_incoming())
            .filter_map(|message| message.id.clone())
            .filter(|id| !active.read_requested.contains(id))
            .collect();
        if message_ids.is_empty() {
            return;
        }

        let count = message_ids.len();
        let request = ClientRequest::MessagesRead {
            message_ids: message_ids.clone(),
        };
        if let Err(err) = self.submit(request) {
            warn!(count, "conversation: read receipt not sent: {err}");
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.read_requested.extend(message_ids);
        }
    }

    fn submit(&mut self, request: ClientRequest) -> Result<(), SyncError> {
        let kind = request.kind();
        self.sink.submit(request).map_err(|source| {
            self.effects.push(SyncEffect::RequestFailed {
                kind,
                error: source.clone(),
            });
            SyncError::Transport { kind, source }
        })
    }
}

/// Caps `content` at `limit` characters, marking the cut with an ellipsis.
pub fn truncate_preview(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{PREVIEW_ELLIPSIS}", &content[..cut]),
        None => content.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
