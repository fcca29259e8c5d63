//! Inbound message routing.
//!
//! The [`Dispatcher`] owns an immutable table from protocol URI to the
//! [`ProtocolHandler`] implementing that protocol. Problem reports are not
//! tied to one protocol and are offered to every handler until one of them
//! owns the thread.
//!
//! [`ThreadLocks`] serializes state transitions of one thread while leaving
//! distinct threads fully concurrent.

use async_trait::async_trait;
use didcomm_agent_core::{Message, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::HandlerHandle;

/// Message type of problem reports.
pub const PROBLEM_REPORT: &str = "https://didcomm.org/report-problem/2.0/problem-report";

/// A decrypted and authenticated message, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The plaintext message
    pub message: Message,
    /// Local DID the envelope was decrypted for, if it was encrypted
    pub recipient: Option<String>,
    /// DID the envelope authenticated. `None` for anoncrypt, whose `from`
    /// is only a claim.
    pub authenticated_sender: Option<String>,
}

impl InboundMessage {
    /// The authenticated sender.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageRejected`] if the envelope did not authenticate
    /// its sender.
    pub fn sender(&self) -> Result<&str> {
        self.authenticated_sender.as_deref().ok_or_else(|| {
            Error::MessageRejected(format!(
                "message {} has no authenticated sender",
                self.message.id.as_str()
            ))
        })
    }
}

/// Body of a problem report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    /// Machine readable code, e.g. `verification-failed`
    pub code: String,
    /// Human readable explanation
    #[serde(default)]
    pub comment: Option<String>,
}

impl ProblemReport {
    /// A report with `code` and `comment`.
    pub fn new(code: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            comment: Some(comment.into()),
        }
    }

    /// The report as a message on `thread_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not serialize.
    pub fn into_message(self, thread_id: &str) -> Result<Message> {
        Ok(Message::new(PROBLEM_REPORT, serde_json::to_value(self)?).thread(thread_id))
    }

    /// Explanation, falling back to the code.
    #[must_use]
    pub fn reason(&self) -> String {
        self.comment.clone().unwrap_or_else(|| self.code.clone())
    }
}

/// One protocol's inbound entry point.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol URIs (`https://didcomm.org/<family>/<version>`) handled.
    fn protocols(&self) -> Vec<String>;

    /// Applies the transition an inbound message triggers.
    async fn handle(&self, inbound: InboundMessage) -> Result<()>;

    /// Abandons the exchange on `thread_id` if this handler owns it and
    /// `sender` is its peer. Returns whether the thread was owned.
    async fn handle_problem_report(&self, sender: &str, thread_id: &str, report: &ProblemReport) -> Result<bool>;
}

/// Per-thread transition locks.
#[derive(Debug, Default)]
pub struct ThreadLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `thread_id`.
    pub async fn lock(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(thread_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Routes inbound messages to protocol handlers.
pub struct Dispatcher {
    protocols: HashMap<String, Arc<dyn ProtocolHandler>>,
    handlers: Vec<Arc<dyn ProtocolHandler>>,
    custom: HashMap<String, HandlerHandle>,
}

impl Dispatcher {
    /// Builds the routing table. For a protocol claimed twice, the first handler wins.
    pub fn new(
        handlers: Vec<Arc<dyn ProtocolHandler>>,
        custom: HashMap<String, HandlerHandle>,
    ) -> Self {
        let mut protocols = HashMap::new();
        for handler in &handlers {
            for protocol in handler.protocols() {
                protocols.entry(protocol).or_insert_with(|| handler.clone());
            }
        }
        Self {
            protocols,
            handlers,
            custom,
        }
    }

    /// Whether a message of type `typ` would be routed.
    #[must_use]
    pub fn supports(&self, typ: &MessageType) -> bool {
        typ.as_str() == PROBLEM_REPORT
            || self.custom.contains_key(typ.as_str())
            || typ
                .protocol_uri()
                .map_or(false, |protocol| self.protocols.contains_key(protocol))
    }

    /// Routes one inbound message.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedProtocol`] if no handler claims the message type
    /// - [`Error::MessageRejected`] if an application message or problem
    ///   report has no authenticated sender
    /// - Whatever the handler's transition fails with
    pub async fn dispatch(&self, inbound: InboundMessage) -> Result<()> {
        let typ = inbound.message.typ.clone();
        debug!(message_type = %typ, thread_id = inbound.message.thread_id(), "dispatching message");

        if typ.as_str() == PROBLEM_REPORT {
            return self.dispatch_problem_report(&inbound).await;
        }

        if let Some(handler) = typ.protocol_uri().and_then(|p| self.protocols.get(p)) {
            return handler.handle(inbound).await;
        }

        if let Some(custom) = self.custom.get(typ.as_str()) {
            inbound.sender()?;
            return custom.send(inbound.message).await;
        }

        Err(Error::UnsupportedProtocol(typ.to_string()))
    }

    async fn dispatch_problem_report(&self, inbound: &InboundMessage) -> Result<()> {
        let sender = inbound.sender()?;
        let message = &inbound.message;
        let thread_id = message
            .thid
            .as_deref()
            .ok_or(didcomm_agent_core::Error::MissingField("thid"))?;
        let report: ProblemReport = serde_json::from_value(message.body.clone())?;

        for handler in &self.handlers {
            if handler.handle_problem_report(sender, thread_id, &report).await? {
                return Ok(());
            }
        }

        warn!(thread_id, sender, code = report.code, "problem report for unknown thread");
        Err(Error::RecordNotFound(format!("thread {thread_id}")))
    }
}
