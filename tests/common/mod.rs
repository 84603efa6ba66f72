#![allow(dead_code)]

use async_trait::async_trait;
use conversation_realtime_kit::prelude::*;
use conversation_realtime_kit::ws::types::ABNORMAL_CLOSURE;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use url::Url;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conversation_realtime_kit=debug".into()),
        )
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// How the next connect attempt resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
    Unauthorized,
    /// The handshake never completes.
    Hang,
}

/// What the client wrote to a mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Close { code: u16, reason: String },
}

/// The server end of one accepted mock connection.
pub struct ServerSide {
    pub url: Url,
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
    pub from_client: mpsc::UnboundedReceiver<Sent>,
}

impl ServerSide {
    pub fn push(&self, frame: &str) {
        let _ = self.to_client.send(TransportEvent::Frame(frame.to_owned()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code,
            reason: String::new(),
        });
    }

    /// The socket fails without a close handshake.
    pub fn fail(&self, message: &str) {
        let _ = self.to_client.send(TransportEvent::Error(message.to_owned()));
    }

    pub fn drop_connection(&self) {
        self.close(ABNORMAL_CLOSURE);
    }

    /// Next text frame the client sent, skipping nothing.
    pub async fn next_sent(&mut self) -> Option<Sent> {
        self.from_client.recv().await
    }
}

struct MockState {
    script: Mutex<VecDeque<ConnectOutcome>>,
    fallback: Mutex<ConnectOutcome>,
    connects: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerSide>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(MockState {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(ConnectOutcome::Accept),
                connects: AtomicUsize::new(0),
                servers,
            }),
        };
        (connector, accepted)
    }

    /// Outcomes for the next attempts, in order. Afterwards the fallback applies.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.script.lock().unwrap().extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: ConnectOutcome) {
        *self.state.fallback.lock().unwrap() = outcome;
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, url: &Url) -> conversation_realtime_kit::Result<MockTransport> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.state.fallback.lock().unwrap());

        match outcome {
            ConnectOutcome::Refuse => Err(Error::Transport("connection refused".into())),
            ConnectOutcome::Unauthorized => {
                Err(Error::Unauthorized("server refused the credential (401)".into()))
            }
            ConnectOutcome::Hang => std::future::pending().await,
            ConnectOutcome::Accept => {
                let (to_client, incoming) = mpsc::unbounded_channel();
                let (outgoing, from_client) = mpsc::unbounded_channel();
                let _ = self.state.servers.send(ServerSide {
                    url: url.clone(),
                    to_client,
                    from_client,
                });
                Ok(MockTransport { incoming, outgoing })
            }
        }
    }
}

pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
    outgoing: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> conversation_realtime_kit::Result<()> {
        self.outgoing
            .send(Sent::Text(text))
            .map_err(|_| Error::Transport("mock server gone".into()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.incoming.recv().await.unwrap_or(TransportEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: "mock server dropped".into(),
        })
    }

    async fn close(&mut self, code: u16, reason: &str) -> conversation_realtime_kit::Result<()> {
        let _ = self.outgoing.send(Sent::Close {
            code,
            reason: reason.to_owned(),
        });
        Ok(())
    }
}

/// An unread-count source returning a settable value after a fixed delay.
pub struct ScriptedSource {
    total: AtomicU64,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedSource {
    pub fn new(total: u64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnreadCountSource for ScriptedSource {
    async fn fetch_total_unread(&self) -> conversation_realtime_kit::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        Ok(self.total.load(Ordering::SeqCst))
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default().with_base_url("https://chat.example.test")
}

pub async fn wait_for_status<F>(
    status: &mut watch::Receiver<ConnectionStatus>,
    predicate: F,
) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    let current = tokio::time::timeout(Duration::from_secs(600), status.wait_for(predicate))
        .await
        .expect("timed out waiting for connection status")
        .expect("connection task stopped");
    current.clone()
}

/// Collects every notification of `topic` into a channel.
pub fn collect(
    store: &SubscriptionStore,
    topic: Topic,
) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = store.subscribe(topic, move |n| {
        let _ = tx.send(n.clone());
    });
    (sub, rx)
}

/// Drains what is currently queued without waiting.
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
