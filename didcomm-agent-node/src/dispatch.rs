//! Outbound message delivery.
//!
//! Packed messages are handed to a [`MessageSender`], which keeps one FIFO
//! queue and worker task per queue key (the connection id). A message is
//! only taken off a queue once the previous one was delivered or given up
//! on, so messages of one connection are never reordered, while different
//! connections deliver concurrently. Enqueueing never waits for delivery.
//!
//! Connection failures, timeouts, `429` and `5xx` answers are transient and
//! retried with the dispatch retry policy; any other refusal is final. When
//! a message is given up on an [`AgentEvent::OutboundFailed`] is published.
//! A worker whose queue stays empty for the idle timeout stops and its
//! queue is forgotten.

use async_trait::async_trait;
use didcomm_agent_core::pack::ENCRYPTED_MEDIA_TYPE;
use didcomm_agent_core::{PackedMessage, PackingType, RetryPolicy};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventBus};

/// Delivers a packed message to an endpoint.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Sends `packed` to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`didcomm_agent_core::Error::Transient`] for failures worth retrying.
    async fn send(&self, endpoint: &str, packed: &PackedMessage) -> didcomm_agent_core::Result<()>;
}

/// Posts envelopes over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpOutboundTransport {
    client: Client,
}

impl HttpOutboundTransport {
    /// Creates a transport using the dispatch timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OutboundTransport for HttpOutboundTransport {
    async fn send(&self, endpoint: &str, packed: &PackedMessage) -> didcomm_agent_core::Result<()> {
        let content_type = match packed.packing {
            PackingType::Signed => didcomm_agent_core::pack::SIGNED_MEDIA_TYPE,
            PackingType::AuthcryptV2 | PackingType::AnonV2 => ENCRYPTED_MEDIA_TYPE,
        };

        debug!("Dispatching message to {endpoint}");
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(packed.data.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    didcomm_agent_core::Error::Transient(e.to_string())
                } else {
                    didcomm_agent_core::Error::DeliveryRejected(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let error = format!("Failed to dispatch message: {status}");
        if is_retryable(status) {
            Err(didcomm_agent_core::Error::Transient(error))
        } else {
            Err(didcomm_agent_core::Error::DeliveryRejected(error))
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// A message waiting in an outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Id of the plaintext message, for logging
    pub message_id: String,
    /// Target endpoint
    pub endpoint: String,
    /// The envelope
    pub packed: PackedMessage,
}

type Queues = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<OutboundMessage>>>>;

/// Per-queue FIFO delivery.
pub struct MessageSender {
    transport: Arc<dyn OutboundTransport>,
    retry: RetryPolicy,
    events: EventBus,
    idle_timeout: Duration,
    queues: Queues,
}

impl MessageSender {
    /// Creates a sender delivering through `transport`.
    pub fn new(transport: Arc<dyn OutboundTransport>, retry: RetryPolicy, events: EventBus) -> Self {
        Self {
            transport,
            retry,
            events,
            idle_timeout: DispatchConfig::default().idle_timeout,
            queues: Arc::default(),
        }
    }

    /// Stops the worker of a queue that stayed empty for `idle_timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of queues with a running worker.
    pub async fn active_queues(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Appends a message to the queue `queue`, starting its worker if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is given.
    pub async fn enqueue(&self, queue: &str, outbound: OutboundMessage) -> Result<()> {
        if outbound.endpoint.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no endpoint to deliver message {} to",
                outbound.message_id
            )));
        }

        let mut queues = self.queues.lock().await;
        let outbound = match queues.get(queue) {
            Some(tx) => match tx.send(outbound) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(outbound)) => outbound,
            },
            None => outbound,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(mpsc::error::SendError(lost)) = tx.send(outbound) {
            return Err(Error::InvalidState(format!(
                "queue {queue} closed before message {} was queued",
                lost.message_id
            )));
        }
        tokio::spawn(deliver(
            Worker {
                queue: queue.to_string(),
                transport: self.transport.clone(),
                retry: self.retry,
                events: self.events.clone(),
                idle_timeout: self.idle_timeout,
                queues: self.queues.clone(),
            },
            rx,
        ));
        queues.insert(queue.to_string(), tx);
        Ok(())
    }
}

struct Worker {
    queue: String,
    transport: Arc<dyn OutboundTransport>,
    retry: RetryPolicy,
    events: EventBus,
    idle_timeout: Duration,
    queues: Queues,
}

async fn deliver(worker: Worker, mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
    let Worker {
        queue,
        transport,
        retry,
        events,
        idle_timeout,
        queues,
    } = worker;

    loop {
        let outbound = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(outbound)) => outbound,
            Ok(None) => return,
            Err(_) => {
                // Enqueueing holds the map lock, so nothing can slip in between.
                let mut queues = queues.lock().await;
                match rx.try_recv() {
                    Ok(outbound) => outbound,
                    Err(_) => {
                        queues.remove(&queue);
                        debug!(queue, "outbound queue idle, worker stopped");
                        return;
                    }
                }
            }
        };

        let result = retry
            .run("deliver message", || transport.send(&outbound.endpoint, &outbound.packed))
            .await;

        match result {
            Ok(()) => debug!(queue, message_id = outbound.message_id, "message delivered"),
            Err(e) => {
                warn!(
                    queue,
                    message_id = outbound.message_id,
                    endpoint = outbound.endpoint,
                    "giving up on message: {e}"
                );
                events.emit(AgentEvent::OutboundFailed {
                    queue: queue.clone(),
                    message_id: outbound.message_id.clone(),
                    endpoint: outbound.endpoint.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::{mock, Sequence};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn packed(data: &str) -> PackedMessage {
        PackedMessage {
            data: data.to_string(),
            packing: PackingType::AuthcryptV2,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    /// Records deliveries; the first message of every queue is slow.
    #[derive(Default)]
    struct RecordingTransport {
        delivered: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl OutboundTransport for RecordingTransport {
        async fn send(&self, _endpoint: &str, packed: &PackedMessage) -> didcomm_agent_core::Result<()> {
            if packed.data.ends_with("-1") {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            self.delivered.lock().await.push(packed.data.clone());
            Ok(())
        }
    }

    mock! {
        Transport {}

        #[async_trait]
        impl OutboundTransport for Transport {
            async fn send(&self, endpoint: &str, packed: &PackedMessage) -> didcomm_agent_core::Result<()>;
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut transport = MockTransport::new();
        let mut sequence = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Err(didcomm_agent_core::Error::Transient("connection reset".into())));
        transport
            .expect_send()
            .withf(|endpoint, packed| endpoint == "http://peer" && packed.data == "retried")
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let sender = MessageSender::new(Arc::new(transport), fast_retry(3), events);
        sender
            .enqueue(
                "connection-c",
                OutboundMessage {
                    message_id: "m1".into(),
                    endpoint: "http://peer".into(),
                    packed: packed("retried"),
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_http_dispatch() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/didcomm"))
            .and(header("content-type", ENCRYPTED_MEDIA_TYPE))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = HttpOutboundTransport::new(&DispatchConfig::default()).unwrap();
        let endpoint = format!("{}/didcomm", mock_server.uri());
        transport.send(&endpoint, &packed("{}")).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_failure_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let transport = HttpOutboundTransport::new(&DispatchConfig::default()).unwrap();
        let endpoint = format!("{}/didcomm", mock_server.uri());
        let error = transport.send(&endpoint, &packed("{}")).await.unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_http_refusal_is_final() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = Arc::new(HttpOutboundTransport::new(&DispatchConfig::default()).unwrap());
        let endpoint = format!("{}/didcomm", mock_server.uri());
        let error = transport.send(&endpoint, &packed("{}")).await.unwrap_err();
        assert!(!error.is_transient());
        assert!(matches!(error, didcomm_agent_core::Error::DeliveryRejected(_)));

        let refused = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&refused)
            .await;
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let sender = MessageSender::new(transport, fast_retry(3), events);
        sender
            .enqueue(
                "connection-d",
                OutboundMessage {
                    message_id: "m1".into(),
                    endpoint: format!("{}/didcomm", refused.uri()),
                    packed: packed("{}"),
                },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, AgentEvent::OutboundFailed { error, .. } if error.contains("400")));
    }

    #[tokio::test]
    async fn test_http_throttling_is_transient() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let transport = HttpOutboundTransport::new(&DispatchConfig::default()).unwrap();
        let endpoint = format!("{}/didcomm", mock_server.uri());
        assert!(transport.send(&endpoint, &packed("{}")).await.unwrap_err().is_transient());

        let unreachable = transport.send("http://127.0.0.1:9/didcomm", &packed("{}")).await;
        assert!(unreachable.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_idle_queues_are_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = MessageSender::new(transport.clone(), fast_retry(1), EventBus::new())
            .with_idle_timeout(Duration::from_millis(50));

        for queue in ["connection-a", "connection-b"] {
            sender
                .enqueue(
                    queue,
                    OutboundMessage {
                        message_id: queue.into(),
                        endpoint: "http://peer".into(),
                        packed: packed(&format!("{queue}-2")),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(sender.active_queues().await, 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sender.active_queues().await, 0);

        sender
            .enqueue(
                "connection-a",
                OutboundMessage {
                    message_id: "again".into(),
                    endpoint: "http://peer".into(),
                    packed: packed("connection-a-3"),
                },
            )
            .await
            .unwrap();
        assert_eq!(sender.active_queues().await, 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut delivered = transport.delivered.lock().await.clone();
        delivered.sort();
        assert_eq!(delivered, vec!["connection-a-2", "connection-a-3", "connection-b-2"]);
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = MessageSender::new(transport.clone(), fast_retry(1), EventBus::new());

        for i in 1..=3 {
            sender
                .enqueue(
                    "connection-a",
                    OutboundMessage {
                        message_id: i.to_string(),
                        endpoint: "http://peer".into(),
                        packed: packed(&format!("a-{i}")),
                    },
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*transport.delivered.lock().await, vec!["a-1", "a-2", "a-3"]);
    }

    #[tokio::test]
    async fn test_exhausted_delivery_emits_event() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let transport = Arc::new(HttpOutboundTransport::new(&DispatchConfig::default()).unwrap());
        let sender = MessageSender::new(transport, fast_retry(2), events);

        sender
            .enqueue(
                "connection-b",
                OutboundMessage {
                    message_id: "m1".into(),
                    endpoint: format!("{}/didcomm", mock_server.uri()),
                    packed: packed("{}"),
                },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, AgentEvent::OutboundFailed { message_id, .. } if message_id == "m1"));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_rejected() {
        let sender = MessageSender::new(
            Arc::new(RecordingTransport::default()),
            fast_retry(1),
            EventBus::new(),
        );
        let result = sender
            .enqueue(
                "c",
                OutboundMessage {
                    message_id: "m".into(),
                    endpoint: String::new(),
                    packed: packed("{}"),
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
