/*!
The user-facing asynchronous client and its event loop.

One tokio task owns the engine, the socket, and every timer; user calls cross
into it over an operation channel and results come back over per-operation
oneshot channels.  Because the task is the single mutator, the engine and its
substates need no locks.
 */

use crate::config::*;
use crate::connection::NegotiatedSettings;
use crate::engine::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::persist::{MemoryPersistence, Persistence};
use crate::session::MessageListener;
use crate::token::TokenResult;
use crate::transport::{connect_transport, ServerUri, TransportStream};

use log::*;

use rand::Rng;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

/// Signature of a client event callback.
pub type ClientEventListenerCallback = dyn Fn(Arc<ClientEvent>) + Send + Sync;

/// How a user receives client lifecycle events.
#[derive(Clone)]
pub enum ClientEventListener {
    /// Invoke the callback for every event.
    Callback(Arc<ClientEventListenerCallback>),
}

/// A connection attempt is starting.
#[derive(Debug)]
pub struct ConnectionAttemptEvent {}

/// A CONNACK with a success code was received.
#[derive(Debug)]
pub struct ConnectionSuccessEvent {
    /// The broker's CONNACK.
    pub connack: ConnackPacket,

    /// Limits in effect for the new connection.
    pub settings: NegotiatedSettings,
}

/// A connection attempt failed before reaching a successful CONNACK.
#[derive(Debug)]
pub struct ConnectionFailureEvent {
    /// What went wrong.
    pub error: MqttError,
}

/// An established connection was lost.
#[derive(Debug)]
pub struct DisconnectionEvent {
    /// What went wrong.
    pub error: MqttError,

    /// The server's DISCONNECT, when the shutdown was announced.
    pub disconnect: Option<DisconnectPacket>,
}

/// The client reached the stopped state and will not reconnect.
#[derive(Debug)]
pub struct StoppedEvent {}

/// An application message arrived.
#[derive(Debug)]
pub struct PublishReceivedEvent {
    /// The inbound message, topic aliases already resolved.
    pub publish: PublishPacket,
}

/// Every event a client can broadcast to its listeners.
#[derive(Debug)]
pub enum ClientEvent {
    /// A connection attempt is starting.
    ConnectionAttempt(ConnectionAttemptEvent),

    /// A connection reached a successful CONNACK.
    ConnectionSuccess(ConnectionSuccessEvent),

    /// A connection attempt failed.
    ConnectionFailure(ConnectionFailureEvent),

    /// An established connection was lost.
    Disconnection(DisconnectionEvent),

    /// The client stopped and will not reconnect.
    Stopped(StoppedEvent),

    /// An application message arrived.
    PublishReceived(PublishReceivedEvent),
}

/// Future resolving to an operation's outcome.
pub type OperationResultFuture = Pin<Box<dyn Future<Output = MqttResult<TokenResult>> + Send>>;

enum OperationOptions {
    Connect(Option<oneshot::Sender<MqttResult<TokenResult>>>),
    Publish(PublishPacket, oneshot::Sender<MqttResult<TokenResult>>),
    Subscribe(SubscribePacket, oneshot::Sender<MqttResult<TokenResult>>),
    Unsubscribe(UnsubscribePacket, oneshot::Sender<MqttResult<TokenResult>>),
    Disconnect(DisconnectPacket, oneshot::Sender<MqttResult<TokenResult>>),
    Close,
    SetMessageListener(Option<u32>, String, MessageListener),
    RemoveMessageListener(Option<u32>, String),
    AddEventListener(u64, ClientEventListener),
    RemoveEventListener(u64),
    BufferedCount(oneshot::Sender<usize>),
    BufferedGet(usize, oneshot::Sender<Option<MqttPacket>>),
    BufferedRemove(usize, oneshot::Sender<Option<MqttPacket>>),
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
enum ClientImplState {
    Stopped,
    Connecting,
    Connected,
    PendingReconnect,
    Shutdown,
}

/// Handle to a registered event listener.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
}

static SHARED_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Lazily initializes a process-wide runtime for clients built without an
/// explicit handle.  Clients must be closed before process exit; the shared
/// runtime itself lives for the life of the process.
fn shared_runtime_handle() -> MqttResult<Handle> {
    if let Some(runtime) = SHARED_RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(MqttError::new_std_io_error)?;

    // a lost initialization race just drops the extra runtime
    let _ = SHARED_RUNTIME.set(runtime);

    match SHARED_RUNTIME.get() {
        Some(runtime) => Ok(runtime.handle().clone()),
        None => Err(MqttError::new_internal_state_error("shared runtime initialization failed")),
    }
}

/// Builder assembling an [`MqttClient`] from server URIs, connect options,
/// client options, TLS material, and a persistence implementation.
pub struct MqttClientBuilder {
    server_uris: Vec<String>,
    connect_options: ConnectOptions,
    client_options: ClientOptions,
    tls_options: Option<TlsOptions>,
    persistence: Option<Box<dyn Persistence>>,
    default_event_listener: Option<ClientEventListener>,
}

impl MqttClientBuilder {
    /// Starts a builder targeting one broker URI.  More can be added; they
    /// are tried in order on every connection attempt.
    pub fn new(server_uri: &str) -> Self {
        MqttClientBuilder {
            server_uris: vec![server_uri.to_string()],
            connect_options: ConnectOptionsBuilder::new().build(),
            client_options: ClientOptionsBuilder::new().build(),
            tls_options: None,
            persistence: None,
            default_event_listener: None,
        }
    }

    /// Adds a fallback broker URI.
    pub fn with_fallback_server_uri(mut self, server_uri: &str) -> Self {
        self.server_uris.push(server_uri.to_string());
        self
    }

    /// Sets the CONNECT/session configuration.
    pub fn with_connect_options(mut self, connect_options: ConnectOptions) -> Self {
        self.connect_options = connect_options;
        self
    }

    /// Sets the client behavioral configuration.
    pub fn with_client_options(mut self, client_options: ClientOptions) -> Self {
        self.client_options = client_options;
        self
    }

    /// Supplies TLS material for `ssl://`/`wss://` URIs.
    pub fn with_tls_options(mut self, tls_options: TlsOptions) -> Self {
        self.tls_options = Some(tls_options);
        self
    }

    /// Supplies the durable session store.  Defaults to in-memory.
    pub fn with_persistence(mut self, persistence: Box<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Registers a listener that is attached before the first event can
    /// fire.
    pub fn with_default_event_listener(mut self, listener: ClientEventListener) -> Self {
        self.default_event_listener = Some(listener);
        self
    }

    /// Validates the configuration and spawns the client's event loop on the
    /// given runtime, or on a lazily created process-wide runtime when none
    /// is supplied.
    pub fn build(self, runtime: Option<&Handle>) -> MqttResult<MqttClient> {
        let mut uris = Vec::with_capacity(self.server_uris.len());
        for uri in &self.server_uris {
            let parsed = ServerUri::parse(uri)?;
            if parsed.scheme.uses_tls() && self.tls_options.is_none() {
                return Err(MqttError::new_tls_error("tls server uri configured without tls options"));
            }
            uris.push(parsed);
        }

        let mut client_options = self.client_options;
        client_options.reconnect_options.normalize();

        let mut persistence = self.persistence.unwrap_or_else(|| Box::new(MemoryPersistence::new()));
        persistence.open(&self.connect_options.client_id, &uris[0].to_string())?;

        let engine_config = EngineConfig {
            connack_timeout: client_options.connack_timeout,
            buffer_enabled: client_options.buffer_enabled,
            connect_options: self.connect_options,
        };

        let engine = EngineState::new(
            engine_config,
            client_options.buffer_size,
            client_options.queue_full_policy,
            persistence)?;

        let handle = match runtime {
            Some(handle) => handle.clone(),
            None => shared_runtime_handle()?,
        };

        let (operation_sender, operation_receiver) = mpsc::channel(100);

        let mut client_impl = ClientImpl::new(engine, uris, client_options, self.tls_options);
        if let Some(listener) = self.default_event_listener {
            client_impl.event_listeners.insert(0, listener);
        }

        handle.spawn(async move {
            client_event_loop(client_impl, operation_receiver).await;
        });

        Ok(MqttClient {
            operation_sender,
        })
    }
}

/// Asynchronous MQTT v5 client.
///
/// Cheap to clone; all clones feed the same session.
#[derive(Clone)]
pub struct MqttClient {
    operation_sender: mpsc::Sender<OperationOptions>,
}

impl MqttClient {
    fn submit(&self, operation: OperationOptions) -> MqttResult<()> {
        self.operation_sender.try_send(operation)
            .map_err(|_| MqttError::new_client_closed())
    }

    fn submit_with_result(&self, build: impl FnOnce(oneshot::Sender<MqttResult<TokenResult>>) -> OperationOptions) -> OperationResultFuture {
        let (sender, receiver) = oneshot::channel();
        let submit_result = self.submit(build(sender));

        Box::pin(async move {
            submit_result?;
            receiver.await
                .map_err(|_| MqttError::new_client_closed())?
        })
    }

    /// Starts maintaining a connection to the configured brokers.  The
    /// returned future completes with the CONNACK outcome of the first
    /// successful attempt, or with the failure that exhausted every URI.
    pub fn connect(&self) -> OperationResultFuture {
        self.submit_with_result(|sender| OperationOptions::Connect(Some(sender)))
    }

    /// Publishes a message.  The future completes on PUBACK for QoS 1, on
    /// PUBCOMP for QoS 2, and on the transport write for QoS 0.
    pub fn publish(&self, packet: PublishPacket) -> OperationResultFuture {
        self.submit_with_result(|sender| OperationOptions::Publish(packet, sender))
    }

    /// Subscribes to one or more topic filters.  The future completes on
    /// SUBACK with the broker's per-filter reason codes.
    pub fn subscribe(&self, packet: SubscribePacket) -> OperationResultFuture {
        self.submit_with_result(|sender| OperationOptions::Subscribe(packet, sender))
    }

    /// Removes one or more subscriptions.  The future completes on UNSUBACK.
    pub fn unsubscribe(&self, packet: UnsubscribePacket) -> OperationResultFuture {
        self.submit_with_result(|sender| OperationOptions::Unsubscribe(packet, sender))
    }

    /// Gracefully shuts the connection down: the DISCONNECT packet is
    /// flushed before the socket closes, and automatic reconnection is
    /// disabled until the next connect call.
    pub fn disconnect(&self, packet: DisconnectPacket) -> OperationResultFuture {
        self.submit_with_result(|sender| OperationOptions::Disconnect(packet, sender))
    }

    /// Releases the client.  Pending operations fail; buffered work is
    /// dropped; the event loop exits.
    pub fn close(&self) -> MqttResult<()> {
        self.submit(OperationOptions::Close)
    }

    /// Routes inbound publishes matching the filter (or carrying the
    /// subscription identifier) to the listener.
    pub fn set_message_listener(&self, subscription_id: Option<u32>, topic_filter: &str, listener: MessageListener) -> MqttResult<()> {
        self.submit(OperationOptions::SetMessageListener(subscription_id, topic_filter.to_string(), listener))
    }

    /// Removes a message listener registration.
    pub fn remove_message_listener(&self, subscription_id: Option<u32>, topic_filter: &str) -> MqttResult<()> {
        self.submit(OperationOptions::RemoveMessageListener(subscription_id, topic_filter.to_string()))
    }

    /// Registers a client event listener.
    pub fn add_event_listener(&self, listener: ClientEventListener) -> MqttResult<ListenerHandle> {
        static NEXT_LISTENER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let id = NEXT_LISTENER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.submit(OperationOptions::AddEventListener(id, listener))?;
        Ok(ListenerHandle { id })
    }

    /// Removes a client event listener.
    pub fn remove_event_listener(&self, handle: ListenerHandle) -> MqttResult<()> {
        self.submit(OperationOptions::RemoveEventListener(handle.id))
    }

    /// Number of operations waiting in the offline buffer.
    pub async fn buffered_message_count(&self) -> MqttResult<usize> {
        let (sender, receiver) = oneshot::channel();
        self.submit(OperationOptions::BufferedCount(sender))?;
        receiver.await.map_err(|_| MqttError::new_client_closed())
    }

    /// Inspects a buffered operation by position.
    pub async fn buffered_message(&self, index: usize) -> MqttResult<Option<MqttPacket>> {
        let (sender, receiver) = oneshot::channel();
        self.submit(OperationOptions::BufferedGet(index, sender))?;
        receiver.await.map_err(|_| MqttError::new_client_closed())
    }

    /// Removes a buffered operation by position, failing its token.
    pub async fn remove_buffered_message(&self, index: usize) -> MqttResult<Option<MqttPacket>> {
        let (sender, receiver) = oneshot::channel();
        self.submit(OperationOptions::BufferedRemove(index, sender))?;
        receiver.await.map_err(|_| MqttError::new_client_closed())
    }
}

struct ClientImpl {
    engine: EngineState,

    server_uris: Vec<ServerUri>,
    client_options: ClientOptions,
    tls_options: Option<TlsOptions>,

    event_listeners: HashMap<u64, ClientEventListener>,

    current_state: ClientImplState,
    desired_state: ClientImplState,

    packet_events: VecDeque<PacketEvent>,

    last_disconnect: Option<DisconnectPacket>,
    last_error: Option<MqttError>,

    successful_connect_time: Option<Instant>,
    next_reconnect_period: Duration,
}

impl ClientImpl {
    fn new(engine: EngineState, server_uris: Vec<ServerUri>, client_options: ClientOptions,
           tls_options: Option<TlsOptions>) -> ClientImpl {
        let next_reconnect_period = client_options.reconnect_options.min_delay;

        ClientImpl {
            engine,
            server_uris,
            client_options,
            tls_options,
            event_listeners: HashMap::new(),
            current_state: ClientImplState::Stopped,
            desired_state: ClientImplState::Stopped,
            packet_events: VecDeque::new(),
            last_disconnect: None,
            last_error: None,
            successful_connect_time: None,
            next_reconnect_period,
        }
    }

    fn broadcast_event(&self, event: Arc<ClientEvent>) {
        debug!("client - broadcasting {:?}", event);

        for listener in self.event_listeners.values() {
            match listener {
                ClientEventListener::Callback(callback) => {
                    let callback = callback.clone();
                    let event = event.clone();
                    tokio::spawn(async move {
                        callback(event);
                    });
                }
            }
        }
    }

    fn apply_error(&mut self, error: MqttError) {
        debug!("client - applying error: {}", error);
        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
    }

    fn handle_incoming_operation(&mut self, operation: OperationOptions, now: Instant) {
        match operation {
            OperationOptions::Connect(sender) => {
                self.engine.handle_user_event(UserEventContext {
                    event: UserEvent::Connect(sender),
                    current_time: now,
                });
                self.desired_state = ClientImplState::Connected;
            }
            OperationOptions::Publish(packet, sender) => {
                self.engine.handle_user_event(UserEventContext {
                    event: UserEvent::Publish(packet, Some(sender)),
                    current_time: now,
                });
            }
            OperationOptions::Subscribe(packet, sender) => {
                self.engine.handle_user_event(UserEventContext {
                    event: UserEvent::Subscribe(packet, Some(sender)),
                    current_time: now,
                });
            }
            OperationOptions::Unsubscribe(packet, sender) => {
                self.engine.handle_user_event(UserEventContext {
                    event: UserEvent::Unsubscribe(packet, Some(sender)),
                    current_time: now,
                });
            }
            OperationOptions::Disconnect(packet, sender) => {
                self.engine.handle_user_event(UserEventContext {
                    event: UserEvent::Disconnect(packet, Some(sender)),
                    current_time: now,
                });
                self.desired_state = ClientImplState::Stopped;
            }
            OperationOptions::Close => {
                self.engine.reset();
                self.desired_state = ClientImplState::Shutdown;
            }
            OperationOptions::SetMessageListener(subscription_id, filter, listener) => {
                self.engine.set_message_listener(subscription_id, &filter, listener);
            }
            OperationOptions::RemoveMessageListener(subscription_id, filter) => {
                self.engine.remove_message_listener(subscription_id, &filter);
            }
            OperationOptions::AddEventListener(id, listener) => {
                self.event_listeners.insert(id, listener);
            }
            OperationOptions::RemoveEventListener(id) => {
                self.event_listeners.remove(&id);
            }
            OperationOptions::BufferedCount(sender) => {
                let _ = sender.send(self.engine.buffered_message_count());
            }
            OperationOptions::BufferedGet(index, sender) => {
                let _ = sender.send(self.engine.buffered_message(index).cloned());
            }
            OperationOptions::BufferedRemove(index, sender) => {
                let _ = sender.send(self.engine.remove_buffered_message(index));
            }
        }
    }

    fn dispatch_packet_events(&mut self) {
        let mut events = VecDeque::new();
        std::mem::swap(&mut events, &mut self.packet_events);

        for event in events {
            match event {
                PacketEvent::Publish(publish) => {
                    if let Some(listener) = self.engine.get_message_listener(
                        publish.subscription_identifiers.as_ref(), &publish.topic) {
                        listener(&publish);
                    }

                    self.broadcast_event(Arc::new(ClientEvent::PublishReceived(PublishReceivedEvent {
                        publish,
                    })));
                }
                PacketEvent::Connack(connack) => {
                    if connack.reason_code == ConnectReasonCode::Success {
                        self.successful_connect_time = Some(Instant::now());
                        if let Some(settings) = self.engine.negotiated_settings() {
                            self.broadcast_event(Arc::new(ClientEvent::ConnectionSuccess(ConnectionSuccessEvent {
                                connack,
                                settings: settings.clone(),
                            })));
                        }
                    }
                }
                PacketEvent::Disconnect(disconnect) => {
                    self.last_disconnect = Some(disconnect);
                }
            }
        }
    }

    fn handle_incoming_bytes(&mut self, bytes: &[u8], now: Instant) -> MqttResult<()> {
        let mut context = NetworkEventContext {
            event: NetworkEvent::IncomingData(bytes),
            current_time: now,
            packet_events: &mut self.packet_events,
        };

        let result = self.engine.handle_network_event(&mut context);
        self.dispatch_packet_events();
        result
    }

    fn handle_write_completion(&mut self, now: Instant) -> MqttResult<()> {
        let mut context = NetworkEventContext {
            event: NetworkEvent::WriteCompletion,
            current_time: now,
            packet_events: &mut self.packet_events,
        };

        self.engine.handle_network_event(&mut context)
    }

    fn handle_service(&mut self, outbound_data: &mut Vec<u8>, now: Instant) -> MqttResult<()> {
        let mut context = ServiceContext {
            to_socket: outbound_data,
            current_time: now,
        };

        self.engine.service(&mut context)
    }

    fn compute_reconnect_period(&mut self) -> Duration {
        let reconnect_period = self.next_reconnect_period;

        let doubled = self.next_reconnect_period.saturating_mul(2);
        self.next_reconnect_period = doubled.min(self.client_options.reconnect_options.max_delay);

        match self.client_options.reconnect_options.jitter {
            ReconnectJitterType::None => reconnect_period,
            ReconnectJitterType::Uniform => {
                let mut rng = rand::thread_rng();
                let nanos = rng.gen_range(0..reconnect_period.as_nanos().max(1));
                Duration::from_nanos(nanos as u64)
            }
        }
    }

    fn compute_optional_state_transition(&self) -> Option<ClientImplState> {
        match self.current_state {
            ClientImplState::Stopped => {
                match self.desired_state {
                    ClientImplState::Connected => Some(ClientImplState::Connecting),
                    ClientImplState::Shutdown => Some(ClientImplState::Shutdown),
                    _ => None,
                }
            }
            ClientImplState::Connecting | ClientImplState::PendingReconnect => {
                if self.desired_state != ClientImplState::Connected {
                    Some(ClientImplState::Stopped)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn transition_to_state(&mut self, mut new_state: ClientImplState, now: Instant) -> MqttResult<()> {
        let old_state = self.current_state;
        if old_state == new_state {
            return Ok(());
        }

        // a failed or finished connection only reconnects while the user
        // still wants to be connected
        if new_state == ClientImplState::PendingReconnect
            && (self.desired_state != ClientImplState::Connected
                || !self.engine.should_be_connected()
                || !self.client_options.reconnect_options.automatic_reconnect) {
            new_state = ClientImplState::Stopped;
        }

        if new_state == ClientImplState::Stopped && self.desired_state == ClientImplState::Shutdown {
            new_state = ClientImplState::Shutdown;
        }

        debug!("client - transitioning from {:?} to {:?}", old_state, new_state);

        if new_state == ClientImplState::Connected {
            let mut context = NetworkEventContext {
                event: NetworkEvent::ConnectionOpened,
                current_time: now,
                packet_events: &mut self.packet_events,
            };
            self.engine.handle_network_event(&mut context)?;
        } else if old_state == ClientImplState::Connected {
            let mut context = NetworkEventContext {
                event: NetworkEvent::ConnectionClosed,
                current_time: now,
                packet_events: &mut self.packet_events,
            };
            self.engine.handle_network_event(&mut context)?;
        }

        if new_state == ClientImplState::Connecting {
            self.last_error = None;
            self.last_disconnect = None;
            self.broadcast_event(Arc::new(ClientEvent::ConnectionAttempt(ConnectionAttemptEvent {})));
        }

        if old_state == ClientImplState::Connecting && new_state != ClientImplState::Connected {
            let error = self.last_error.take()
                .unwrap_or_else(|| MqttError::new_connection_establishment_failure("connection attempt failed"));
            self.broadcast_event(Arc::new(ClientEvent::ConnectionFailure(ConnectionFailureEvent { error })));
        }

        if old_state == ClientImplState::Connected {
            let error = self.last_error.take()
                .unwrap_or_else(|| MqttError::new_connection_closed("connection closed"));
            let disconnect = self.last_disconnect.take();
            self.broadcast_event(Arc::new(ClientEvent::Disconnection(DisconnectionEvent {
                error,
                disconnect,
            })));

            // a connection that stayed up resets the back-off schedule
            if let Some(connect_time) = self.successful_connect_time.take() {
                if now.duration_since(connect_time) > self.client_options.reconnect_options.stability_reset_period {
                    self.next_reconnect_period = self.client_options.reconnect_options.min_delay;
                }
            }
        }

        if new_state == ClientImplState::Stopped {
            self.broadcast_event(Arc::new(ClientEvent::Stopped(StoppedEvent {})));
        }

        self.current_state = new_state;

        Ok(())
    }
}

async fn client_event_loop(mut client: ClientImpl, mut operation_receiver: mpsc::Receiver<OperationOptions>) {
    let mut done = false;
    while !done {
        let current_state = client.current_state;
        let next_state_result =
            match current_state {
                ClientImplState::Stopped => { process_stopped(&mut client, &mut operation_receiver).await }
                ClientImplState::Connecting => { process_connecting(&mut client, &mut operation_receiver).await }
                ClientImplState::Connected => {
                    // connected processing runs inside process_connecting,
                    // which owns the transport stream; the outer loop never
                    // re-enters this state
                    Err(MqttError::new_internal_state_error("connected state reached without a transport"))
                }
                ClientImplState::PendingReconnect => {
                    let wait = client.compute_reconnect_period();
                    process_pending_reconnect(&mut client, &mut operation_receiver, wait).await
                }
                ClientImplState::Shutdown => { Ok(ClientImplState::Shutdown) }
            };

        done = true;
        if let Ok(next_state) = next_state_result {
            if next_state != ClientImplState::Shutdown
                && client.transition_to_state(next_state, Instant::now()).is_ok() {
                done = false;
            }
        }
    }

    info!("client - event loop exiting");
}

async fn process_stopped(client: &mut ClientImpl, operations: &mut mpsc::Receiver<OperationOptions>) -> MqttResult<ClientImplState> {
    loop {
        match operations.recv().await {
            Some(operation) => {
                client.handle_incoming_operation(operation, Instant::now());
            }
            None => {
                return Ok(ClientImplState::Shutdown);
            }
        }

        if let Some(transition) = client.compute_optional_state_transition() {
            return Ok(transition);
        }
    }
}

async fn process_connecting(client: &mut ClientImpl, operations: &mut mpsc::Receiver<OperationOptions>) -> MqttResult<ClientImplState> {
    // server uris are tried in listed order on every attempt
    for index in 0..client.server_uris.len() {
        let uri = client.server_uris[index].clone();
        info!("client - connecting to {}", uri);

        let connect_future = connect_transport(&uri, client.tls_options.as_ref());
        let connect_result = timeout(client.client_options.connect_timeout, connect_future).await;

        // drain any operations that arrived while dialing
        while let Ok(operation) = operations.try_recv() {
            client.handle_incoming_operation(operation, Instant::now());
        }

        if client.desired_state != ClientImplState::Connected {
            return Ok(ClientImplState::Stopped);
        }

        match connect_result {
            Ok(Ok(stream)) => {
                info!("client - transport established to {}", uri);
                return process_connection(client, operations, stream).await;
            }
            Ok(Err(error)) => {
                info!("client - transport to {} failed: {}", uri, error);
                client.apply_error(error);
            }
            Err(_) => {
                info!("client - transport to {} timed out", uri);
                client.apply_error(MqttError::new_connection_establishment_failure("connection establishment timeout reached"));
            }
        }
    }

    // every uri failed this round
    client.engine.fail_pending_connect(
        MqttError::new_connection_establishment_failure("all server uris failed"));

    Ok(ClientImplState::PendingReconnect)
}

async fn process_connection(client: &mut ClientImpl, operations: &mut mpsc::Receiver<OperationOptions>,
                            stream: TransportStream) -> MqttResult<ClientImplState> {
    client.transition_to_state(ClientImplState::Connected, Instant::now())?;

    let result = process_connected_stream(client, operations, stream).await;

    // surface engine teardown even if the socket half is already gone
    match result {
        Ok(next_state) => Ok(next_state),
        Err(error) => {
            client.apply_error(error);
            Ok(ClientImplState::PendingReconnect)
        }
    }
}

async fn process_connected_stream(client: &mut ClientImpl, operations: &mut mpsc::Receiver<OperationOptions>,
                                  stream: TransportStream) -> MqttResult<ClientImplState> {
    let mut outbound_data: Vec<u8> = Vec::with_capacity(4096);
    let mut cumulative_bytes_written: usize = 0;
    let mut inbound_data: [u8; 4096] = [0; 4096];

    let (stream_reader, mut stream_writer) = split(stream);
    tokio::pin!(stream_reader);

    let mut should_flush = false;
    let mut next_state = None;

    while next_state.is_none() {
        let now = Instant::now();
        let service_timepoint = client.engine.next_service_timepoint(now);
        let service_wait = service_timepoint.map(|timepoint| sleep(timepoint.saturating_duration_since(now)));

        let outbound_slice: Option<&[u8]> =
            if cumulative_bytes_written < outbound_data.len() {
                Some(&outbound_data[cumulative_bytes_written..])
            } else {
                None
            };

        let write_directive =
            if should_flush {
                Some(WriteDirective::Flush)
            } else {
                outbound_slice.map(WriteDirective::Bytes)
            };

        tokio::select! {
            operation = operations.recv() => {
                match operation {
                    Some(operation) => {
                        client.handle_incoming_operation(operation, Instant::now());
                    }
                    None => {
                        next_state = Some(ClientImplState::Shutdown);
                    }
                }
            }
            read_result = stream_reader.read(inbound_data.as_mut_slice()) => {
                match read_result {
                    Ok(0) => {
                        info!("client - connection closed for read");
                        client.apply_error(MqttError::new_connection_closed("network stream closed"));
                        next_state = Some(ClientImplState::PendingReconnect);
                    }
                    Ok(bytes_read) => {
                        if let Err(error) = client.handle_incoming_bytes(&inbound_data[..bytes_read], Instant::now()) {
                            client.apply_error(error);
                            next_state = Some(ClientImplState::PendingReconnect);
                        }
                    }
                    Err(error) => {
                        info!("client - stream read failed: {}", error);
                        let error = if is_connection_established(client.engine.state()) {
                            MqttError::new_connection_closed(error)
                        } else {
                            MqttError::new_connection_establishment_failure(error)
                        };
                        client.apply_error(error);
                        next_state = Some(ClientImplState::PendingReconnect);
                    }
                }
            }
            Some(_) = conditional_wait(service_wait) => {
                if let Err(error) = client.handle_service(&mut outbound_data, Instant::now()) {
                    client.apply_error(error);
                    next_state = Some(ClientImplState::PendingReconnect);
                }
            }
            Some(write_result) = conditional_write(write_directive, &mut stream_writer) => {
                match write_result {
                    Ok(bytes_written) => {
                        if should_flush {
                            should_flush = false;
                            match client.handle_write_completion(Instant::now()) {
                                Ok(()) => {}
                                Err(MqttError::UserInitiatedDisconnect(_)) => {
                                    info!("client - disconnect flushed, stopping");
                                    next_state = Some(ClientImplState::Stopped);
                                }
                                Err(error) => {
                                    client.apply_error(error);
                                    next_state = Some(ClientImplState::PendingReconnect);
                                }
                            }
                        } else {
                            cumulative_bytes_written += bytes_written;
                            if cumulative_bytes_written == outbound_data.len() {
                                outbound_data.clear();
                                cumulative_bytes_written = 0;
                                should_flush = true;
                            }
                        }
                    }
                    Err(error) => {
                        info!("client - stream write failed: {}", error);
                        let error = if is_connection_established(client.engine.state()) {
                            MqttError::new_connection_closed(error)
                        } else {
                            MqttError::new_connection_establishment_failure(error)
                        };
                        client.apply_error(error);
                        next_state = Some(ClientImplState::PendingReconnect);
                    }
                }
            }
        }

        if next_state.is_none() {
            if client.desired_state == ClientImplState::Shutdown {
                next_state = Some(ClientImplState::Shutdown);
            } else if client.desired_state == ClientImplState::Stopped && client.current_state != ClientImplState::Connected {
                next_state = Some(ClientImplState::Stopped);
            }
        }
    }

    let _ = stream_writer.shutdown().await;

    Ok(next_state.unwrap_or(ClientImplState::PendingReconnect))
}

async fn process_pending_reconnect(client: &mut ClientImpl, operations: &mut mpsc::Receiver<OperationOptions>,
                                   wait: Duration) -> MqttResult<ClientImplState> {
    info!("client - reconnecting in {:?}", wait);
    let reconnect_timer = sleep(wait);
    tokio::pin!(reconnect_timer);

    loop {
        tokio::select! {
            operation = operations.recv() => {
                match operation {
                    Some(operation) => {
                        client.handle_incoming_operation(operation, Instant::now());
                    }
                    None => {
                        return Ok(ClientImplState::Shutdown);
                    }
                }
            }
            () = &mut reconnect_timer => {
                return Ok(ClientImplState::Connecting);
            }
        }

        if let Some(transition) = client.compute_optional_state_transition() {
            return Ok(transition);
        }
    }
}

async fn conditional_wait(wait_option: Option<tokio::time::Sleep>) -> Option<()> {
    match wait_option {
        Some(timer) => {
            timer.await;
            Some(())
        }
        None => None,
    }
}

enum WriteDirective<'a> {
    Bytes(&'a [u8]),
    Flush,
}

async fn conditional_write<'a, T>(directive: Option<WriteDirective<'a>>, writer: &mut WriteHalf<T>) -> Option<std::io::Result<usize>>
    where T: tokio::io::AsyncRead + tokio::io::AsyncWrite {
    match directive {
        Some(WriteDirective::Bytes(bytes)) => {
            Some(writer.write(bytes).await)
        }
        Some(WriteDirective::Flush) => {
            match writer.flush().await {
                Ok(()) => Some(Ok(0)),
                Err(error) => Some(Err(error)),
            }
        }
        None => None,
    }
}
