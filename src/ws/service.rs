//! The `RealtimeClient` handle and the task that owns the connection.
//!
//! The client is a thin handle: every call becomes a [`Command`] on a bounded
//! channel. A single background task owns the transport, the
//! [`ConnectionMachine`] and both timers (reconnect and keep-alive), and
//! drives them from one `select!` loop. Because only that task ever arms the
//! reconnect timer, at most one reconnect can be pending.

use crate::auth::{Credential, CredentialProvider, EndpointBuilder, QueryTokenEndpoint};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::store::{Notification, SubscriptionStore};
use crate::unread::{UnreadCountSource, UnreadReconciler};
use crate::ws::connection::{ConnectionAction, ConnectionMachine};
use crate::ws::event::OutboundFrame;
use crate::ws::router::EventRouter;
use crate::ws::transport::{Connector, Transport, TransportEvent};
use crate::ws::types::{ConnectionId, ConnectionState, ConnectionStatus, ConversationId, MessageId};
use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

// --- Commands ---

/// Requests from the handle to the connection task.
#[derive(Debug)]
enum Command {
    Connect(Option<Credential>),
    Disconnect(String),
    Send(String),
    Shutdown,
}

// --- Builder ---

/// Builds a [`RealtimeClient`].
pub struct RealtimeClientBuilder<C: Connector> {
    config: ClientConfig,
    connector: C,
    source: Arc<dyn UnreadCountSource>,
    endpoint: Option<Arc<dyn EndpointBuilder>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    store: Option<SubscriptionStore>,
}

impl<C: Connector> RealtimeClientBuilder<C> {
    pub fn new(config: ClientConfig, connector: C, source: Arc<dyn UnreadCountSource>) -> Self {
        Self {
            config,
            connector,
            source,
            endpoint: None,
            credentials: None,
            store: None,
        }
    }

    /// Replaces the default [`QueryTokenEndpoint`].
    pub fn endpoint(mut self, endpoint: impl EndpointBuilder) -> Self {
        self.endpoint = Some(Arc::new(endpoint));
        self
    }

    /// Used by [`RealtimeClient::connect_from_provider`].
    pub fn credential_provider(mut self, provider: impl CredentialProvider) -> Self {
        self.credentials = Some(Arc::new(provider));
        self
    }

    /// Shares an existing store instead of creating one.
    pub fn store(mut self, store: SubscriptionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Validates the configuration and spawns the connection task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<RealtimeClient> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("RealtimeClient must be built inside a tokio runtime".into())
        })?;

        let endpoint: Arc<dyn EndpointBuilder> = match self.endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(QueryTokenEndpoint::from_config(&self.config)?),
        };
        // Store, reconciler and router share one store so every listener sees
        // every notification, whichever component produced it.
        let store = self.store.unwrap_or_default();
        let reconciler = UnreadReconciler::from_config(store.clone(), self.source, &self.config);
        let router = EventRouter::new(store.clone(), reconciler.clone());

        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let driver = Driver {
            connector: self.connector,
            endpoint,
            machine: ConnectionMachine::new(
                self.config.reconnect_policy(),
                self.config.ping_interval,
            ),
            transport: None,
            conn_id: None,
            reconnect_at: None,
            keepalive: None,
            connect_timeout: self.config.connect_timeout,
            store: store.clone(),
            reconciler: reconciler.clone(),
            router: router.clone(),
            status: status_tx,
            commands: command_rx,
        };
        info!(base_url = %self.config.base_url, "Spawning realtime connection task");
        let task = runtime.spawn(driver.run());

        Ok(RealtimeClient {
            commands: command_tx,
            status: status_rx,
            store,
            reconciler,
            router,
            credentials: self.credentials,
            task,
        })
    }
}

// --- Client handle ---

/// Handle to the realtime connection.
///
/// Dropping the handle closes the command channel; the connection task then
/// closes the transport normally and exits. Use [`RealtimeClient::shutdown`]
/// to wait for that.
pub struct RealtimeClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    store: SubscriptionStore,
    reconciler: UnreadReconciler,
    router: EventRouter,
    credentials: Option<Arc<dyn CredentialProvider>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    pub fn builder<C: Connector>(
        config: ClientConfig,
        connector: C,
        source: Arc<dyn UnreadCountSource>,
    ) -> RealtimeClientBuilder<C> {
        RealtimeClientBuilder::new(config, connector, source)
    }

    /// Connects with `credential`. A no-op if already connected with it.
    pub async fn connect(&self, credential: impl Into<Credential>) -> Result<()> {
        self.command(Command::Connect(Some(credential.into()))).await
    }

    /// Connects with whatever the application has; `None` leaves the
    /// connection closed with an error in [`RealtimeClient::status`].
    pub async fn connect_with(&self, credential: Option<Credential>) -> Result<()> {
        self.command(Command::Connect(credential)).await
    }

    /// Connects with the credential from the configured provider.
    pub async fn connect_from_provider(&self) -> Result<()> {
        let provider = self.credentials.as_ref().ok_or_else(|| {
            Error::Configuration("no credential provider configured".into())
        })?;
        self.command(Command::Connect(provider.credential())).await
    }

    /// Closes the connection normally and clears the unread state. Pending
    /// reconnects are cancelled.
    pub async fn disconnect(&self, reason: &str) -> Result<()> {
        self.command(Command::Disconnect(reason.to_owned())).await
    }

    /// Sends a frame if the connection is open; otherwise it is dropped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let text = frame.to_json()?;
        self.command(Command::Send(text)).await
    }

    pub async fn send_typing(&self, is_typing: bool) -> Result<()> {
        self.send(OutboundFrame::Typing { is_typing }).await
    }

    pub async fn mark_message_read(&self, message_id: MessageId) -> Result<()> {
        self.send(OutboundFrame::MessageRead { message_id }).await
    }

    pub async fn request_conversations(&self) -> Result<()> {
        self.send(OutboundFrame::GetConversations).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn reconciler(&self) -> &UnreadReconciler {
        &self.reconciler
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn set_open_conversation(&self, conversation_id: Option<ConversationId>) {
        self.reconciler.set_open_conversation(conversation_id);
    }

    /// Polls the unread total right away.
    pub async fn refresh_unread(&self) -> std::result::Result<u64, Arc<Error>> {
        self.reconciler.refresh_now().await
    }

    /// Closes the connection and waits for the connection task to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        drop(self.commands);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Realtime connection task panicked");
            }
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ClientClosed)
    }
}

// --- Connection task ---

/// Owns the transport and both timers. Lives on its own task; the handle only
/// talks to it through `commands`.
struct Driver<C: Connector> {
    connector: C,
    endpoint: Arc<dyn EndpointBuilder>,
    machine: ConnectionMachine,
    transport: Option<C::Transport>,
    conn_id: Option<ConnectionId>,
    reconnect_at: Option<Instant>,
    keepalive: Option<Interval>,
    connect_timeout: Duration,
    store: SubscriptionStore,
    reconciler: UnreadReconciler,
    router: EventRouter,
    status: watch::Sender<ConnectionStatus>,
    commands: mpsc::Receiver<Command>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        info!("Realtime connection task started");
        loop {
            // Commands first, so a disconnect wins over a frame or a timer that
            // became ready in the same poll.
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = next_event(&mut self.transport) => {
                    self.handle_transport_event(event).await;
                }
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    let actions = self.machine.on_reconnect_timer();
                    self.execute(actions).await;
                }
                _ = next_tick(&mut self.keepalive) => self.send_ping().await,
            }
            self.publish_status();
        }

        // --- Shutdown: handle dropped or shutdown() called ---
        self.reconciler.dispose();
        let actions = self.machine.disconnect("client shut down");
        self.execute(actions).await;
        self.publish_status();
        info!("Realtime connection task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(credential) => {
                let actions = self.machine.connect(credential);
                self.execute(actions).await;
            }
            Command::Disconnect(reason) => {
                self.reconciler.dispose();
                let actions = self.machine.disconnect(&reason);
                self.execute(actions).await;
            }
            Command::Send(text) => self.send_text(text).await,
            Command::Shutdown => {}
        }
    }

    #[instrument(level = "debug", skip_all, fields(conn_id = ?self.conn_id))]
    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => self.router.route_frame(&text),
            // The transport is already gone in both cases below; drop it before
            // the machine decides whether to reconnect.
            TransportEvent::Closed { code, reason } => {
                self.transport = None;
                self.conn_id = None;
                let actions = self.machine.on_closed(code, &reason);
                self.execute(actions).await;
            }
            TransportEvent::Error(message) => {
                self.transport = None;
                self.conn_id = None;
                let actions = self.machine.on_transport_error(&message);
                self.execute(actions).await;
            }
        }
    }

    /// Runs actions until the machine stops producing follow-ups.
    async fn execute(&mut self, actions: Vec<ConnectionAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            debug!(?action, "Executing connection action");
            match action {
                ConnectionAction::OpenTransport { credential } => {
                    let follow_up = self.open_transport(credential, Uuid::new_v4()).await;
                    queue.extend(follow_up);
                }
                ConnectionAction::CloseTransport { code, reason } => {
                    self.close_transport(code, &reason).await;
                    // We initiated this close, so no Closed event will follow
                    // from the transport. Settle the machine here.
                    if self.machine.state() == ConnectionState::Closing {
                        queue.extend(self.machine.on_closed(code, &reason));
                    }
                }
                ConnectionAction::ScheduleReconnect { delay, .. } => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                ConnectionAction::CancelReconnect => self.reconnect_at = None,
                ConnectionAction::StartKeepAlive { interval } => {
                    let mut ticker = interval_at(Instant::now() + interval, interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keepalive = Some(ticker);
                }
                ConnectionAction::StopKeepAlive => self.keepalive = None,
            }
        }
    }

    #[instrument(skip(self, credential), fields(attempt = self.machine.retry_attempt()))]
    async fn open_transport(
        &mut self,
        credential: Credential,
        conn_id: ConnectionId,
    ) -> Vec<ConnectionAction> {
        // --- Step 1: Build the endpoint ---
        // A credential that cannot be put into a URL will not work on retry
        // either, so this is a rejection rather than a transport error.
        let url = match self.endpoint.build(&credential) {
            Ok(url) => url,
            Err(e) => return self.machine.on_rejected(&e.to_string()),
        };

        // --- Step 2: Handshake, bounded by connect_timeout ---
        match timeout(self.connect_timeout, self.connector.connect(&url)).await {
            Ok(Ok(transport)) => {
                self.transport = Some(transport);
                self.conn_id = Some(conn_id);
                let actions = self.machine.on_open();
                info!("Connected");
                self.publish_status();
                // Pushes may have been missed while disconnected.
                self.store.emit(Notification::Refresh);
                self.reconciler.schedule_poll();
                actions
            }
            // --- Step 3: Classify failures ---
            Ok(Err(Error::Unauthorized(reason))) => self.machine.on_rejected(&reason),
            Ok(Err(e)) => self.machine.on_transport_error(&e.to_string()),
            Err(_) => self.machine.on_transport_error(&format!(
                "connect timed out after {}ms",
                self.connect_timeout.as_millis()
            )),
        }
    }

    async fn close_transport(&mut self, code: u16, reason: &str) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        let conn_id = self.conn_id.take();
        if let Err(e) = transport.close(code, reason).await {
            debug!(?conn_id, error = %e, "Error while closing transport");
        }
        info!(?conn_id, code, reason, "Transport closed");
    }

    async fn send_text(&mut self, text: String) {
        let Some(transport) = self.transport.as_mut() else {
            debug!("Not connected; dropping outbound frame");
            return;
        };
        if self.machine.state() != ConnectionState::Open {
            debug!(state = %self.machine.state(), "Not open; dropping outbound frame");
            return;
        }
        if let Err(e) = transport.send(text).await {
            warn!(conn_id = ?self.conn_id, error = %e, "Failed to send frame");
        }
    }

    async fn send_ping(&mut self) {
        match OutboundFrame::Ping.to_json() {
            Ok(ping) => self.send_text(ping).await,
            Err(e) => warn!(error = %e, "Failed to encode ping"),
        }
    }

    fn publish_status(&self) {
        let next = self.machine.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// --- Select helpers ---
// Each resolves only when its input exists, so an idle branch never fires.

async fn next_event<T: Transport>(transport: &mut Option<T>) -> TransportEvent {
    match transport {
        Some(transport) => transport.next_event().await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}
