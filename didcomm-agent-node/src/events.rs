//! Agent events and application message handlers.
//!
//! State machines publish an [`AgentEvent`] on every transition. Waits such as
//! `return_when_is_connected` subscribe to the bus instead of polling the
//! store in a tight loop. Applications can also receive plaintext messages of
//! types the agent has no protocol for through a [`HandlerHandle`].

use didcomm_agent_core::Message;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocols::connection::ConnectionState;
use crate::protocols::credential::CredentialState;
use crate::protocols::proof::ProofState;

/// Capacity of the event channel; slow subscribers skip older events.
const EVENT_CAPACITY: usize = 256;

/// Something observable happened inside the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A connection record changed state.
    ConnectionStateChanged {
        /// Connection id
        connection_id: String,
        /// State before the transition, `None` for a new record
        previous: Option<ConnectionState>,
        /// State after the transition
        state: ConnectionState,
    },
    /// A credential exchange record changed state.
    CredentialStateChanged {
        /// Exchange id
        exchange_id: String,
        /// Thread id
        thread_id: String,
        /// State before the transition, `None` for a new record
        previous: Option<CredentialState>,
        /// State after the transition
        state: CredentialState,
    },
    /// A proof exchange record changed state.
    ProofStateChanged {
        /// Exchange id
        exchange_id: String,
        /// Thread id
        thread_id: String,
        /// State before the transition, `None` for a new record
        previous: Option<ProofState>,
        /// State after the transition
        state: ProofState,
    },
    /// An outbound message could not be delivered after all retries.
    OutboundFailed {
        /// Queue (usually the connection id) the message was sent on
        queue: String,
        /// Message id
        message_id: String,
        /// Target endpoint
        endpoint: String,
        /// Last delivery error
        error: String,
    },
}

/// Broadcast bus of [`AgentEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus without subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Having no subscriber is not an error.
    pub fn emit(&self, event: AgentEvent) {
        debug!(?event, "agent event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }
}

/// A handle to an application task receiving plaintext messages of one type.
#[derive(Clone, Debug)]
pub struct HandlerHandle {
    tx: mpsc::Sender<Message>,
}

impl HandlerHandle {
    /// Creates a new handler handle.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Forwards a message to the handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the receiving task has gone away.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|e| Error::InvalidState(format!("message handler closed: {e}")))
    }
}
