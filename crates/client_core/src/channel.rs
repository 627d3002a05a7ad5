//! Outbound half of the session's event channel.

use std::sync::{Arc, Mutex};

use shared::protocol::ClientRequest;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ChannelError;

/// Anything that can carry a request to the server.
pub trait CommandSink: Send + Sync {
    fn submit(&self, request: ClientRequest) -> Result<(), ChannelError>;
}

#[derive(Debug)]
enum SinkState {
    Detached,
    Attached(mpsc::UnboundedSender<ClientRequest>),
    Closed,
}

/// Owned handle to the outbound side of the channel.
///
/// The transport writer is attached on connect and detached on disconnect;
/// `close` ends the handle for the rest of the session.
#[derive(Debug, Clone)]
pub struct OutboundChannel {
    state: Arc<Mutex<SinkState>>,
}

impl Default for OutboundChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundChannel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::Detached)),
        }
    }

    pub fn attach(&self, writer: mpsc::UnboundedSender<ClientRequest>) {
        let mut state = self.lock();
        if matches!(*state, SinkState::Closed) {
            warn!("transport: attach ignored on closed outbound channel");
            return;
        }
        *state = SinkState::Attached(writer);
    }

    pub fn detach(&self) {
        let mut state = self.lock();
        if matches!(*state, SinkState::Attached(_)) {
            *state = SinkState::Detached;
        }
    }

    pub fn close(&self) {
        *self.lock() = SinkState::Closed;
    }

    pub fn is_attached(&self) -> bool {
        matches!(*self.lock(), SinkState::Attached(_))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        // State is replaced whole, so a poisoned value is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CommandSink for OutboundChannel {
    fn submit(&self, request: ClientRequest) -> Result<(), ChannelError> {
        let mut state = self.lock();
        match &*state {
            SinkState::Attached(writer) => {
                let kind = request.kind();
                if writer.send(request).is_err() {
                    *state = SinkState::Detached;
                    return Err(ChannelError::Disconnected);
                }
                debug!(kind, "transport: request queued");
                Ok(())
            }
            SinkState::Detached => Err(ChannelError::Disconnected),
            SinkState::Closed => Err(ChannelError::Closed),
        }
    }
}
