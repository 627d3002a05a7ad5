use std::{ops::ControlFlow, sync::Arc, time::Duration};

use shared::{
    domain::{LocalIdentity, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub mod auth;
pub mod channel;
pub mod conversation;
pub mod error;
pub mod reconnect;
pub mod roster;
pub mod transport;

pub use auth::AuthGate;
pub use channel::{CommandSink, OutboundChannel};
pub use conversation::{
    ConversationSync, Delivery, Message, Notification, SyncEffect, SyncPhase, SyncSettings,
    TimelineChange,
};
pub use error::{ChannelError, SyncError};
pub use reconnect::ReconnectPolicy;
pub use roster::{Contact, Roster};
pub use transport::{
    websocket_url, ChannelConnector, ChannelHandle, TransportEvent, WebSocketConnector,
};

/// Intents from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    SelectPeer(UserId),
    Deselect,
    SendMessage(String),
    /// The timeline was scrolled close to its oldest loaded message.
    LoadOlder,
    DismissNotification,
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Reconnect attempts are exhausted.
    Failed,
}

/// Why [`ChatClient::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    LoggedOut,
    /// The server rejected the session credentials.
    Rejected(String),
    ConnectionLost,
    CommandsClosed,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    RosterUpdated(Vec<Contact>),
    ConversationChanged {
        peer: Option<Contact>,
    },
    TimelineUpdated {
        change: TimelineChange,
        phase: SyncPhase,
        messages: Vec<Message>,
    },
    Notification {
        notification: Notification,
        display_name: String,
    },
    NotificationDismissed,
    AudibleAlert,
    SessionEnded(SessionEnd),
    Error(String),
}

/// Owns the roster and the active conversation for one signed-in session and
/// drives them from the event channel and the presentation layer's commands.
pub struct ChatClient {
    connector: Arc<dyn ChannelConnector>,
    policy: ReconnectPolicy,
    outbound: OutboundChannel,
    roster: Roster,
    conversation: ConversationSync,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        local: LocalIdentity,
        settings: SyncSettings,
        policy: ReconnectPolicy,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let outbound = OutboundChannel::new();
        let conversation =
            ConversationSync::new(local.clone(), settings, Arc::new(outbound.clone()));
        Self {
            connector,
            policy,
            outbound,
            roster: Roster::new(local),
            conversation,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn conversation(&self) -> &ConversationSync {
        &self.conversation
    }

    /// Connects and serves the session until logout, credential rejection,
    /// exhausted reconnects or the command stream closing.
    pub async fn run(mut self, mut commands: mpsc::Receiver<UiCommand>) -> SessionEnd {
        let mut attempt: u32 = 0;
        let mut connected_before = false;
        loop {
            self.set_connection(ConnectionState::Connecting);
            match self.connector.connect().await {
                Ok(mut handle) => {
                    attempt = 0;
                    self.outbound.attach(handle.outbound.clone());
                    self.set_connection(ConnectionState::Connected);
                    if connected_before && self.policy.resync_on_reconnect {
                        self.conversation.resync();
                        self.flush_effects();
                    }
                    connected_before = true;

                    let flow = self.serve(&mut handle, &mut commands).await;
                    self.outbound.detach();
                    handle.close();
                    if let ControlFlow::Break(end) = flow {
                        return self.shutdown(end);
                    }
                    self.set_connection(ConnectionState::Disconnected);
                }
                Err(err) => warn!(attempt, "transport: connect failed: {err:#}"),
            }

            let Some(delay) = self.policy.delay_for(attempt) else {
                self.set_connection(ConnectionState::Failed);
                return self.shutdown(SessionEnd::ConnectionLost);
            };
            attempt += 1;
            debug!(attempt, delay_ms = delay.as_millis() as u64, "transport: reconnecting after delay");
            if let ControlFlow::Break(end) = self.idle_for(delay, &mut commands).await {
                return self.shutdown(end);
            }
        }
    }

    async fn serve(
        &mut self,
        handle: &mut ChannelHandle,
        commands: &mut mpsc::Receiver<UiCommand>,
    ) -> ControlFlow<SessionEnd> {
        loop {
            tokio::select! {
                event = handle.inbound.recv() => match event {
                    Some(TransportEvent::Frame(event)) => {
                        if let ControlFlow::Break(end) = self.handle_server_event(event) {
                            return ControlFlow::Break(end);
                        }
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        warn!(%reason, "transport: event channel dropped");
                        return ControlFlow::Continue(());
                    }
                    None => return ControlFlow::Continue(()),
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(end) = self.handle_command(command) {
                            return ControlFlow::Break(end);
                        }
                    }
                    None => return ControlFlow::Break(SessionEnd::CommandsClosed),
                },
            }
        }
    }

    /// Keeps serving commands while waiting out a reconnect delay.
    async fn idle_for(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::Receiver<UiCommand>,
    ) -> ControlFlow<SessionEnd> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return ControlFlow::Continue(()),
                command = commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(end) = self.handle_command(command) {
                            return ControlFlow::Break(end);
                        }
                    }
                    None => return ControlFlow::Break(SessionEnd::CommandsClosed),
                },
            }
        }
    }

    pub fn handle_server_event(&mut self, event: ServerEvent) -> ControlFlow<SessionEnd> {
        match event {
            ServerEvent::OnlineUsers { users } => {
                let contacts = self.roster.apply_presence(users).to_vec();
                let _ = self.events.send(ClientEvent::RosterUpdated(contacts));
            }
            ServerEvent::HistoryUsers { users } => {
                let contacts = self.roster.apply_history(users).to_vec();
                let _ = self.events.send(ClientEvent::RosterUpdated(contacts));
            }
            ServerEvent::MessagesHistorical {
                request_id,
                messages,
                next_page,
            } => {
                if let Err(err) = self.conversation.apply_history(request_id, messages, next_page)
                {
                    self.report_sync_error(err);
                }
            }
            ServerEvent::PrivateMessage { message } => self.conversation.receive(message),
            ServerEvent::MessagesRead {
                message_ids,
                read_time,
                from,
            } => {
                self.conversation
                    .apply_read_receipt(&message_ids, read_time, &from);
            }
            ServerEvent::PrivateMessageAck {
                client_key,
                id,
                timestamp,
            } => {
                if let Err(err) = self.conversation.confirm_send(client_key, id, timestamp) {
                    self.report_sync_error(err);
                }
            }
            ServerEvent::Error(err) if err.ends_session() => {
                warn!(code = ?err.code, "session: rejected by server: {}", err.message);
                return ControlFlow::Break(SessionEnd::Rejected(err.message));
            }
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, "session: server error: {}", err.message);
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
            }
        }
        self.flush_effects();
        ControlFlow::Continue(())
    }

    pub fn handle_command(&mut self, command: UiCommand) -> ControlFlow<SessionEnd> {
        match command {
            UiCommand::SelectPeer(user_id) => match self.roster.find(&user_id).cloned() {
                Some(peer) => {
                    self.conversation.select_peer(peer.clone());
                    let _ = self
                        .events
                        .send(ClientEvent::ConversationChanged { peer: Some(peer) });
                }
                None => {
                    let _ = self
                        .events
                        .send(ClientEvent::Error(format!("unknown contact: {user_id}")));
                }
            },
            UiCommand::Deselect => {
                self.conversation.deselect();
                let _ = self
                    .events
                    .send(ClientEvent::ConversationChanged { peer: None });
            }
            UiCommand::SendMessage(content) => {
                self.conversation.send(&content);
            }
            UiCommand::LoadOlder => {
                self.conversation.load_older();
            }
            UiCommand::DismissNotification => {
                if self.conversation.dismiss_notification() {
                    let _ = self.events.send(ClientEvent::NotificationDismissed);
                }
            }
            UiCommand::Logout => return ControlFlow::Break(SessionEnd::LoggedOut),
        }
        self.flush_effects();
        ControlFlow::Continue(())
    }

    fn flush_effects(&mut self) {
        for effect in self.conversation.drain_effects() {
            let event = match effect {
                SyncEffect::Timeline(change) => ClientEvent::TimelineUpdated {
                    change,
                    phase: self.conversation.phase(),
                    messages: self.conversation.messages().to_vec(),
                },
                SyncEffect::Notification(notification) => {
                    let display_name = self
                        .roster
                        .find(&notification.from)
                        .map(|contact| contact.display_name().to_string())
                        .unwrap_or_else(|| notification.from.to_string());
                    ClientEvent::Notification {
                        notification,
                        display_name,
                    }
                }
                SyncEffect::AudibleAlert => ClientEvent::AudibleAlert,
                SyncEffect::RequestFailed { kind, error } => {
                    ClientEvent::Error(format!("{kind} request failed: {error}"))
                }
            };
            let _ = self.events.send(event);
        }
    }

    fn report_sync_error(&self, err: SyncError) {
        if err.is_stale() {
            debug!("conversation: {err}");
        } else {
            warn!("conversation: {err}");
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }
    }

    fn set_connection(&self, state: ConnectionState) {
        info!(?state, "transport: connection state changed");
        let _ = self.events.send(ClientEvent::ConnectionStateChanged(state));
    }

    fn shutdown(mut self, end: SessionEnd) -> SessionEnd {
        info!(?end, "session: ended");
        self.outbound.close();
        self.conversation.deselect();
        self.conversation.drain_effects();
        self.roster.clear();
        let _ = self.events.send(ClientEvent::SessionEnded(end.clone()));
        end
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
