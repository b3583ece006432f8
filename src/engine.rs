/*!
The session engine: a pure state machine that multiplexes user operations onto
one broker connection, drives the QoS 1/2 handshakes, paces transmission
against the server's receive maximum, and owns keep-alive and retry replay.

The engine performs no I/O.  It consumes network events (connection opened,
connection closed, incoming bytes, write completion) and user events, and
emits outbound bytes through [`EngineState::service`].  The client layer owns
the socket, the timers, and reconnect scheduling, and feeds everything through
these entry points; between calls the engine is inert, so no locking is
needed.
 */

use crate::config::*;
use crate::connection::*;
use crate::decode::{Decoder, DecodingContext};
use crate::encode::encode_packet;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::persist::Persistence;
use crate::queue::{QueueFullPolicy, TodoQueue, TodoEntry};
use crate::session::{MessageListener, SessionState};
use crate::token::{Token, TokenResult};

use log::*;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fmt::Display;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum EngineStateType {
    Disconnected,
    PendingConnack,
    Connected,
    PendingDisconnect,
    Halted,
}

impl Display for EngineStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStateType::Disconnected => { write!(f, "Disconnected") }
            EngineStateType::PendingConnack => { write!(f, "PendingConnack") }
            EngineStateType::Connected => { write!(f, "Connected") }
            EngineStateType::PendingDisconnect => { write!(f, "PendingDisconnect") }
            EngineStateType::Halted => { write!(f, "Halted") }
        }
    }
}

pub(crate) fn is_connection_established(state: EngineStateType) -> bool {
    state == EngineStateType::Connected
}

// Packets the client layer surfaces to the user.  Everything else stays
// internal or completes a token.
#[derive(Debug)]
pub(crate) enum PacketEvent {
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Disconnect(DisconnectPacket),
}

pub(crate) enum NetworkEvent<'a> {
    ConnectionOpened,
    ConnectionClosed,
    IncomingData(&'a [u8]),
    WriteCompletion,
}

pub(crate) struct NetworkEventContext<'a> {
    pub event: NetworkEvent<'a>,
    pub current_time: Instant,

    // output field for packets the client layer is interested in
    pub packet_events: &'a mut VecDeque<PacketEvent>,
}

pub(crate) type TokenSender = oneshot::Sender<MqttResult<TokenResult>>;

pub(crate) enum UserEvent {
    Connect(Option<TokenSender>),
    Publish(PublishPacket, Option<TokenSender>),
    Subscribe(SubscribePacket, Option<TokenSender>),
    Unsubscribe(UnsubscribePacket, Option<TokenSender>),
    Disconnect(DisconnectPacket, Option<TokenSender>),
}

pub(crate) struct UserEventContext {
    pub event: UserEvent,
    pub current_time: Instant,
}

pub(crate) struct ServiceContext<'a> {
    // output field for bytes to hand to the transport
    pub to_socket: &'a mut Vec<u8>,
    pub current_time: Instant,
}

pub(crate) struct EngineConfig {
    pub connect_options: ConnectOptions,
    pub connack_timeout: Duration,
    pub buffer_enabled: bool,
}

// Internal outbound work that bypasses the user buffer: connects, acks,
// pings, pubrels, disconnects.
struct PriorityWork {
    packet: MqttPacket,
    token_id: Option<u64>,
}

pub(crate) struct EngineState {
    config: EngineConfig,

    state: EngineStateType,

    session: SessionState,
    connection: ConnectionState,
    todo: TodoQueue,
    decoder: Decoder,
    persistence: Box<dyn Persistence>,

    // all live tokens, keyed by token id
    tokens: std::collections::HashMap<u64, Token>,
    next_token_id: u64,

    // token completed by the next successful or failed CONNACK
    connect_token: Option<u64>,

    // packet ids queued for sequential retransmission after session
    // resumption; drained one entry per write-completion cycle
    replay_queue: VecDeque<u16>,

    // highest priority outbound work; drained before replay and user work
    priority_queue: VecDeque<PriorityWork>,

    // Set after service() hands bytes to the transport; nothing further is
    // encoded until the write-completion event arrives.  This bounds the
    // data between engine and socket to one service batch.
    pending_write_completion: bool,

    // tokens that complete when the in-flight write finishes (qos 0
    // publishes, disconnect)
    write_completion_tokens: VecDeque<u64>,

    // inbound qos 2 ids whose PUBCOMP is in the in-flight write; forgotten
    // durably once the write completes
    pending_inbound_qos2_completions: Vec<u16>,

    connack_deadline: Option<Instant>,
}

impl EngineState {
    pub fn new(config: EngineConfig, buffer_size: usize, queue_policy: QueueFullPolicy,
               mut persistence: Box<dyn Persistence>) -> MqttResult<EngineState> {
        let mut session = SessionState::new(&config.connect_options.client_id);
        session.restore(persistence.as_mut())?;

        Ok(EngineState {
            config,
            state: EngineStateType::Disconnected,
            session,
            connection: ConnectionState::new(Instant::now(), 0),
            todo: TodoQueue::new(buffer_size, queue_policy),
            decoder: Decoder::new(),
            persistence,
            tokens: std::collections::HashMap::new(),
            next_token_id: 1,
            connect_token: None,
            replay_queue: VecDeque::new(),
            priority_queue: VecDeque::new(),
            pending_write_completion: false,
            write_completion_tokens: VecDeque::new(),
            pending_inbound_qos2_completions: Vec::new(),
            connack_deadline: None,
        })
    }

    pub fn state(&self) -> EngineStateType {
        self.state
    }

    pub fn should_be_connected(&self) -> bool {
        self.session.should_be_connected
    }

    pub fn client_id(&self) -> &str {
        &self.session.client_id
    }

    pub fn negotiated_settings(&self) -> Option<&NegotiatedSettings> {
        self.connection.settings.as_ref()
    }

    pub fn set_message_listener(&mut self, subscription_id: Option<u32>, topic_filter: &str, listener: MessageListener) {
        self.session.set_message_listener(subscription_id, topic_filter, listener);
    }

    pub fn remove_message_listener(&mut self, subscription_id: Option<u32>, topic_filter: &str) {
        self.session.remove_message_listener(subscription_id, topic_filter);
    }

    pub fn get_message_listener(&self, subscription_ids: Option<&Vec<u32>>, topic: &str) -> Option<MessageListener> {
        self.session.get_message_listener(subscription_ids, topic)
    }

    pub fn buffered_message(&self, index: usize) -> Option<&MqttPacket> {
        self.todo.get(index).map(|entry| &entry.packet)
    }

    pub fn buffered_message_count(&self) -> usize {
        self.todo.len()
    }

    pub fn remove_buffered_message(&mut self, index: usize) -> Option<MqttPacket> {
        let entry = self.todo.remove(index)?;
        self.fail_token(entry.token_id, MqttError::new_client_closed());
        Some(entry.packet)
    }

    // Crate-public entry points, mirrored from the client layer.

    pub fn handle_user_event(&mut self, context: UserEventContext) {
        let now = context.current_time;

        match context.event {
            UserEvent::Connect(sender) => { self.apply_connect_intent(sender); }
            UserEvent::Publish(publish, sender) => { self.apply_publish(publish, sender, now); }
            UserEvent::Subscribe(subscribe, sender) => { self.apply_subscribe(subscribe, sender); }
            UserEvent::Unsubscribe(unsubscribe, sender) => { self.apply_unsubscribe(unsubscribe, sender); }
            UserEvent::Disconnect(disconnect, sender) => { self.apply_disconnect(disconnect, sender); }
        }
    }

    pub fn handle_network_event(&mut self, context: &mut NetworkEventContext) -> MqttResult<()> {
        let result =
            match &context.event {
                NetworkEvent::ConnectionOpened => { self.handle_connection_opened(context.current_time) }
                NetworkEvent::ConnectionClosed => { self.handle_connection_closed() }
                NetworkEvent::WriteCompletion => { self.handle_write_completion() }
                NetworkEvent::IncomingData(data) => {
                    let data = *data;
                    self.handle_incoming_data(data, context)
                }
            };

        if let Err(error) = &result {
            if !matches!(error, MqttError::UserInitiatedDisconnect(_)) {
                error!("engine - network event handling failed in state {}: {}", self.state, error);
                self.change_state(EngineStateType::Halted);
            }
        }

        result
    }

    /// Encodes as much outbound work as current gates allow into the service
    /// context.  Priority work first, then one retry-replay entry per
    /// write-completion cycle, then user work bounded by the server's receive
    /// maximum.
    pub fn service(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        match self.state {
            EngineStateType::PendingConnack => {
                if let Some(deadline) = self.connack_deadline {
                    if context.current_time >= deadline {
                        error!("engine - connack timeout exceeded");
                        return Err(MqttError::new_connection_establishment_failure("connack response timeout reached"));
                    }
                }

                self.drain_priority_queue(context)?;
            }
            EngineStateType::Connected => {
                self.service_keep_alive(context.current_time)?;
                self.drain_priority_queue(context)?;
                self.drain_replay_queue(context)?;
                self.drain_todo_queue(context)?;
            }
            EngineStateType::PendingDisconnect => {}
            EngineStateType::Disconnected => {}
            EngineStateType::Halted => {
                return Err(MqttError::new_internal_state_error("engine serviced after halt"));
            }
        }

        Ok(())
    }

    /// Earliest instant at which service() would have something to do.
    pub fn next_service_timepoint(&self, now: Instant) -> Option<Instant> {
        match self.state {
            EngineStateType::PendingConnack => {
                if !self.pending_write_completion && !self.priority_queue.is_empty() {
                    return Some(now);
                }

                self.connack_deadline
            }
            EngineStateType::Connected => {
                let keep_alive = self.connection.next_keep_alive_timepoint(self.effective_keep_alive());
                if self.pending_write_completion {
                    return keep_alive;
                }

                if !self.priority_queue.is_empty() || !self.replay_queue.is_empty() || self.todo_head_ready() {
                    return Some(now);
                }

                keep_alive
            }
            _ => None,
        }
    }

    /// Fails every live token and drops all transient state.  Session data in
    /// the durable store is untouched; a future client can resume it.
    pub fn reset(&mut self) {
        self.session.should_be_connected = false;

        let token_ids: Vec<u64> = self.tokens.keys().copied().collect();
        for id in token_ids {
            self.fail_token(id, MqttError::new_client_closed());
        }
        self.tokens.clear();

        self.todo.drain_all();
        self.priority_queue.clear();
        self.replay_queue.clear();
        self.write_completion_tokens.clear();
        self.pending_inbound_qos2_completions.clear();
        self.connect_token = None;
        self.pending_write_completion = false;

        if self.state != EngineStateType::Disconnected {
            self.state = EngineStateType::Halted;
        }

        if let Err(error) = self.persistence.close() {
            warn!("engine - persistence close failed during reset: {}", error);
        }
    }

    /// Fails a pending connect token; used by the client layer when every
    /// server URI has been tried without success.
    pub fn fail_pending_connect(&mut self, error: MqttError) {
        if let Some(token_id) = self.connect_token.take() {
            self.fail_token(token_id, error);
        }
    }

    // User event handling

    fn apply_connect_intent(&mut self, sender: Option<TokenSender>) {
        self.session.should_be_connected = true;

        if let Some(previous) = self.connect_token.take() {
            self.fail_token(previous, MqttError::new_client_closed());
        }

        let connect = self.config.connect_options.to_connect_packet(&self.session.client_id);
        let token_id = self.create_token(MqttPacket::Connect(connect), sender);
        self.connect_token = Some(token_id);
    }

    fn apply_publish(&mut self, mut publish: PublishPacket, sender: Option<TokenSender>, _now: Instant) {
        let token_id = self.create_token(MqttPacket::Publish(publish.clone()), sender);

        if self.state != EngineStateType::Connected && !self.config.buffer_enabled {
            debug!("engine - publish rejected: offline and buffering disabled");
            self.fail_token(token_id, MqttError::new_not_connected());
            return;
        }

        if publish.qos != QualityOfService::AtMostOnce {
            match self.session.next_packet_id() {
                Ok(packet_id) => {
                    publish.packet_id = packet_id;
                    self.session.register_outbound(packet_id, token_id);
                    if let Some(token) = self.tokens.get_mut(&token_id) {
                        token.packet_id = Some(packet_id);
                        if let MqttPacket::Publish(request) = &mut token.request {
                            request.packet_id = packet_id;
                        }
                    }
                }
                Err(error) => {
                    self.fail_token(token_id, error);
                    return;
                }
            }
        }

        info!("engine - queueing {:?} publish for topic \"{}\" as token {}", publish.qos, publish.topic, token_id);
        self.enqueue_user_work(MqttPacket::Publish(publish), token_id);
    }

    fn apply_subscribe(&mut self, mut subscribe: SubscribePacket, sender: Option<TokenSender>) {
        let token_id = self.create_token(MqttPacket::Subscribe(subscribe.clone()), sender);

        if self.state != EngineStateType::Connected && !self.config.buffer_enabled {
            self.fail_token(token_id, MqttError::new_not_connected());
            return;
        }

        match self.session.next_packet_id() {
            Ok(packet_id) => {
                subscribe.packet_id = packet_id;
                self.session.register_outbound(packet_id, token_id);
                if let Some(token) = self.tokens.get_mut(&token_id) {
                    token.packet_id = Some(packet_id);
                    if let MqttPacket::Subscribe(request) = &mut token.request {
                        request.packet_id = packet_id;
                    }
                }
            }
            Err(error) => {
                self.fail_token(token_id, error);
                return;
            }
        }

        info!("engine - queueing subscribe with {} filters as token {}", subscribe.subscriptions.len(), token_id);
        self.enqueue_user_work(MqttPacket::Subscribe(subscribe), token_id);
    }

    fn apply_unsubscribe(&mut self, mut unsubscribe: UnsubscribePacket, sender: Option<TokenSender>) {
        let token_id = self.create_token(MqttPacket::Unsubscribe(unsubscribe.clone()), sender);

        if self.state != EngineStateType::Connected && !self.config.buffer_enabled {
            self.fail_token(token_id, MqttError::new_not_connected());
            return;
        }

        match self.session.next_packet_id() {
            Ok(packet_id) => {
                unsubscribe.packet_id = packet_id;
                self.session.register_outbound(packet_id, token_id);
                if let Some(token) = self.tokens.get_mut(&token_id) {
                    token.packet_id = Some(packet_id);
                    if let MqttPacket::Unsubscribe(request) = &mut token.request {
                        request.packet_id = packet_id;
                    }
                }
            }
            Err(error) => {
                self.fail_token(token_id, error);
                return;
            }
        }

        info!("engine - queueing unsubscribe with {} filters as token {}", unsubscribe.topic_filters.len(), token_id);
        self.enqueue_user_work(MqttPacket::Unsubscribe(unsubscribe), token_id);
    }

    fn apply_disconnect(&mut self, disconnect: DisconnectPacket, sender: Option<TokenSender>) {
        self.session.should_be_connected = false;

        let token_id = self.create_token(MqttPacket::Disconnect(disconnect.clone()), sender);

        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingConnack {
            debug!("engine - disconnect requested while already offline");
            self.complete_token(token_id, None);
            return;
        }

        info!("engine - queueing user disconnect as token {}", token_id);
        self.priority_queue.push_front(PriorityWork {
            packet: MqttPacket::Disconnect(disconnect),
            token_id: Some(token_id),
        });
    }

    fn enqueue_user_work(&mut self, packet: MqttPacket, token_id: u64) {
        match self.todo.add(packet, token_id) {
            Ok(Some(evicted)) => {
                warn!("engine - buffer full, evicting oldest entry (token {})", evicted.token_id);
                self.fail_token(evicted.token_id, MqttError::new_buffer_full());
            }
            Ok(None) => {}
            Err(error) => {
                self.fail_token(token_id, error);
            }
        }
    }

    // Network event handling

    fn handle_connection_opened(&mut self, now: Instant) -> MqttResult<()> {
        if self.state != EngineStateType::Disconnected {
            return Err(MqttError::new_internal_state_error("connection opened in an invalid state"));
        }

        info!("engine - connection opened, sending CONNECT");
        self.change_state(EngineStateType::PendingConnack);

        self.decoder.reset_for_new_connection();
        self.connection = ConnectionState::new(now, self.config.connect_options.topic_alias_maximum.unwrap_or(0));
        self.pending_write_completion = false;
        self.write_completion_tokens.clear();
        self.pending_inbound_qos2_completions.clear();
        self.todo.pause();

        let connect = self.config.connect_options.to_connect_packet(&self.session.client_id);
        self.priority_queue.push_front(PriorityWork {
            packet: MqttPacket::Connect(connect),
            token_id: None,
        });

        self.connack_deadline = Some(now + self.config.connack_timeout);

        Ok(())
    }

    fn handle_connection_closed(&mut self) -> MqttResult<()> {
        if self.state == EngineStateType::Disconnected {
            return Err(MqttError::new_internal_state_error("connection closed in an invalid state"));
        }

        info!("engine - connection closed");
        self.change_state(EngineStateType::Disconnected);
        self.connack_deadline = None;
        self.todo.pause();
        self.pending_write_completion = false;
        self.replay_queue.clear();
        self.pending_inbound_qos2_completions.clear();

        // acks and pings die with the connection; an unflushed disconnect
        // completes trivially since the connection is gone anyway
        let mut abandoned = VecDeque::new();
        std::mem::swap(&mut abandoned, &mut self.priority_queue);
        for work in abandoned {
            if let Some(token_id) = work.token_id {
                self.complete_token(token_id, None);
            }
        }

        // qos 0 publishes between encode and write completion never made it
        let mut unflushed = VecDeque::new();
        std::mem::swap(&mut unflushed, &mut self.write_completion_tokens);
        for token_id in unflushed {
            self.fail_token(token_id, MqttError::new_connection_closed("write did not complete before connection loss"));
        }

        // unacked subscribes/unsubscribes are re-queued at the back of the
        // user queue, behind anything submitted during the outage; unacked
        // publishes stay in the durable retry queue
        let queued: HashSet<u64> = (0..self.todo.len())
            .filter_map(|i| self.todo.get(i).map(|entry| entry.token_id))
            .collect();

        let interrupted: Vec<(u64, MqttPacket)> = self.session.out_tokens.values().copied()
            .filter(|token_id| !queued.contains(token_id))
            .filter_map(|token_id| {
                self.tokens.get(&token_id).and_then(|token| {
                    match &token.request {
                        MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                            Some((token_id, token.request.clone()))
                        }
                        _ => None,
                    }
                })
            })
            .collect();

        for (token_id, packet) in interrupted {
            debug!("engine - re-queueing interrupted {} (token {})", packet_type_to_str(packet_type_of(&packet)), token_id);
            match self.todo.add(packet, token_id) {
                Ok(Some(evicted)) => { self.fail_token(evicted.token_id, MqttError::new_buffer_full()); }
                Ok(None) => {}
                Err(error) => { self.fail_token(token_id, error); }
            }
        }

        // zero session expiry means the session dies with the connection
        if self.config.connect_options.session_expiry_interval_seconds.unwrap_or(0) == 0 {
            debug!("engine - session expiry is zero, clearing session state");
            self.clear_session()?;
        }

        Ok(())
    }

    fn handle_write_completion(&mut self) -> MqttResult<()> {
        if self.state == EngineStateType::Disconnected || self.state == EngineStateType::Halted {
            return Err(MqttError::new_internal_state_error("write completion in an invalid state"));
        }

        if !self.pending_write_completion {
            return Err(MqttError::new_internal_state_error("write completion with no write in flight"));
        }

        self.pending_write_completion = false;

        for packet_id in std::mem::take(&mut self.pending_inbound_qos2_completions) {
            self.session.complete_inbound_qos2(packet_id, self.persistence.as_mut())?;
        }

        // replay entries are written strictly one per completed write
        if self.replay_queue.is_empty() && self.todo.is_paused() && self.state == EngineStateType::Connected {
            debug!("engine - retry replay flushed, resuming user queue");
            self.todo.resume();
        }

        let mut disconnect_flushed = false;
        let completions = std::mem::take(&mut self.write_completion_tokens);
        for token_id in completions {
            if let Some(token) = self.tokens.get(&token_id) {
                if matches!(token.request, MqttPacket::Disconnect(_)) {
                    disconnect_flushed = true;
                }
            }
            self.complete_token(token_id, None);
        }

        if disconnect_flushed {
            info!("engine - user disconnect flushed, closing connection");
            self.change_state(EngineStateType::Halted);
            return Err(MqttError::new_user_initiated_disconnect());
        }

        Ok(())
    }

    fn handle_incoming_data(&mut self, data: &[u8], context: &mut NetworkEventContext) -> MqttResult<()> {
        if self.state == EngineStateType::Disconnected || self.state == EngineStateType::Halted {
            return Err(MqttError::new_internal_state_error("incoming data in an invalid state"));
        }

        self.connection.register_inbound_activity(context.current_time);

        let mut decoded_packets = VecDeque::new();
        let mut decode_context = DecodingContext {
            maximum_packet_size: self.config.connect_options.maximum_packet_size_bytes.unwrap_or(0),
            decoded_packets: &mut decoded_packets,
        };

        self.decoder.decode_bytes(data, &mut decode_context)?;

        for mut packet in decoded_packets {
            if let MqttPacket::Publish(publish) = &mut packet {
                self.connection.inbound_aliases.resolve_topic_alias(&publish.topic_alias, &mut publish.topic)?;
            }

            self.handle_packet(packet, context)?;
        }

        Ok(())
    }

    // Inbound packet dispatch

    fn handle_packet(&mut self, packet: MqttPacket, context: &mut NetworkEventContext) -> MqttResult<()> {
        match packet {
            MqttPacket::Connack(connack) => { self.handle_connack(connack, context) }
            MqttPacket::Publish(publish) => { self.handle_publish(publish, context) }
            MqttPacket::Puback(puback) => { self.handle_puback(puback) }
            MqttPacket::Pubrec(pubrec) => { self.handle_pubrec(pubrec) }
            MqttPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel) }
            MqttPacket::Pubcomp(pubcomp) => { self.handle_pubcomp(pubcomp) }
            MqttPacket::Suback(suback) => { self.handle_suback(suback) }
            MqttPacket::Unsuback(unsuback) => { self.handle_unsuback(unsuback) }
            MqttPacket::Pingresp(_) => { self.handle_pingresp(context.current_time) }
            MqttPacket::Disconnect(disconnect) => { self.handle_server_disconnect(disconnect, context) }
            MqttPacket::Auth(_) => {
                Err(MqttError::new_unimplemented("enhanced authentication exchanges are not implemented"))
            }
            _ => {
                Err(MqttError::new_protocol_error("broker sent a client-only packet type"))
            }
        }
    }

    fn handle_connack(&mut self, connack: ConnackPacket, context: &mut NetworkEventContext) -> MqttResult<()> {
        if self.state != EngineStateType::PendingConnack {
            return Err(MqttError::new_protocol_error("connack received outside of connection establishment"));
        }

        info!("engine - CONNACK received with reason code {:?}", connack.reason_code);

        if connack.reason_code != ConnectReasonCode::Success {
            if let Some(token_id) = self.connect_token.take() {
                self.fail_token(token_id, MqttError::new_connection_establishment_failure("broker rejected the connection"));
            }
            context.packet_events.push_back(PacketEvent::Connack(connack));
            return Err(MqttError::new_connection_establishment_failure("broker rejected connection attempt with failing connack"));
        }

        self.change_state(EngineStateType::Connected);
        self.connack_deadline = None;

        let settings = build_negotiated_settings(
            &connack,
            self.config.connect_options.keep_alive_interval_seconds,
            self.config.connect_options.session_expiry_interval_seconds.unwrap_or(0),
            &self.session.client_id);
        debug!("engine - {}", settings);

        self.session.client_id = settings.client_id.clone();
        self.session.should_be_connected = true;
        self.connection.outbound_aliases.reset_for_new_connection(settings.topic_alias_maximum_to_server);
        self.connection.settings = Some(settings);

        let mut result = Ok(());

        if self.config.connect_options.clean_start || !connack.session_present {
            debug!("engine - no session to resume, dropping delivery state");
            result = self.clear_session();
        } else {
            // replay interrupted qos 1/2 work in packet id order before any
            // fresh traffic
            self.replay_queue = self.session.retry_queue.keys().copied().collect();
            info!("engine - session resumed, {} messages to replay", self.replay_queue.len());
        }

        if self.replay_queue.is_empty() {
            self.todo.resume();
        }

        if let Some(token_id) = self.connect_token.take() {
            if let Some(token) = self.tokens.get_mut(&token_id) {
                token.append_reason_codes(&[connack.reason_code as u8]);
            }
            self.complete_token(token_id, Some(MqttPacket::Connack(connack.clone())));
        }

        context.packet_events.push_back(PacketEvent::Connack(connack));

        result
    }

    fn handle_publish(&mut self, publish: PublishPacket, context: &mut NetworkEventContext) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("publish received before connection establishment"));
        }

        let packet_id = publish.packet_id;

        match publish.qos {
            QualityOfService::AtMostOnce => {
                context.packet_events.push_back(PacketEvent::Publish(publish));
            }

            QualityOfService::AtLeastOnce => {
                context.packet_events.push_back(PacketEvent::Publish(publish));

                self.priority_queue.push_back(PriorityWork {
                    packet: MqttPacket::Puback(PubackPacket {
                        packet_id,
                        ..Default::default()
                    }),
                    token_id: None,
                });
            }

            QualityOfService::ExactlyOnce => {
                // deliver at most once per packet id; the durable marker is
                // written before the pubrec can possibly go out
                if !self.session.inbound_qos2.contains(&packet_id) {
                    self.session.add_inbound_qos2(packet_id, self.persistence.as_mut())?;
                    context.packet_events.push_back(PacketEvent::Publish(publish));
                } else {
                    debug!("engine - suppressing duplicate qos 2 delivery for packet id {}", packet_id);
                }

                // the pubrec is re-sent even for suppressed duplicates
                self.priority_queue.push_back(PriorityWork {
                    packet: MqttPacket::Pubrec(PubrecPacket {
                        packet_id,
                        ..Default::default()
                    }),
                    token_id: None,
                });
            }
        }

        Ok(())
    }

    fn handle_puback(&mut self, puback: PubackPacket) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("puback received before connection establishment"));
        }

        // dropping the durable image happens regardless of the reason code;
        // the broker has spoken and the message is done either way
        let token_id = self.session.complete_outbound(puback.packet_id, self.persistence.as_mut())?;

        if let Some(token_id) = token_id {
            if let Some(token) = self.tokens.get_mut(&token_id) {
                token.append_reason_codes(&[puback.reason_code as u8]);
            }
            self.complete_token(token_id, Some(MqttPacket::Puback(puback)));
        } else {
            // recovered-from-persistence delivery; no caller is waiting
            debug!("engine - puback for recovered packet id {}", puback.packet_id);
        }

        Ok(())
    }

    fn handle_pubrec(&mut self, pubrec: PubrecPacket) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("pubrec received before connection establishment"));
        }

        let packet_id = pubrec.packet_id;

        if (pubrec.reason_code as u8) >= 128 {
            // a failing pubrec terminates the exchange; no pubrel follows
            let token_id = self.session.complete_outbound(packet_id, self.persistence.as_mut())?;
            if let Some(token_id) = token_id {
                if let Some(token) = self.tokens.get_mut(&token_id) {
                    token.append_reason_codes(&[pubrec.reason_code as u8]);
                }
                self.complete_token(token_id, Some(MqttPacket::Pubrec(pubrec)));
            }
            return Ok(());
        }

        if let Some(token_id) = self.session.out_tokens.get(&packet_id).copied() {
            if let Some(token) = self.tokens.get_mut(&token_id) {
                token.append_reason_codes(&[pubrec.reason_code as u8]);
            }
        } else if !self.session.retry_queue.contains_key(&packet_id) {
            return Err(MqttError::new_protocol_error("pubrec does not match any pending qos 2 publish"));
        }

        // the retry entry transitions publish -> pubrel; the packet id stays
        // allocated until the pubcomp arrives
        let pubrel = PubrelPacket {
            packet_id,
            ..Default::default()
        };
        self.session.add_retry(MqttPacket::Pubrel(pubrel.clone()), self.persistence.as_mut())?;

        self.priority_queue.push_back(PriorityWork {
            packet: MqttPacket::Pubrel(pubrel),
            token_id: None,
        });

        Ok(())
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("pubrel received before connection establishment"));
        }

        self.priority_queue.push_back(PriorityWork {
            packet: MqttPacket::Pubcomp(PubcompPacket {
                packet_id: pubrel.packet_id,
                ..Default::default()
            }),
            token_id: None,
        });

        Ok(())
    }

    fn handle_pubcomp(&mut self, pubcomp: PubcompPacket) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("pubcomp received before connection establishment"));
        }

        let token_id = self.session.complete_outbound(pubcomp.packet_id, self.persistence.as_mut())?;

        if let Some(token_id) = token_id {
            if let Some(token) = self.tokens.get_mut(&token_id) {
                token.append_reason_codes(&[pubcomp.reason_code as u8]);
            }
            self.complete_token(token_id, Some(MqttPacket::Pubcomp(pubcomp)));
        } else {
            debug!("engine - pubcomp for recovered packet id {}", pubcomp.packet_id);
        }

        Ok(())
    }

    fn handle_suback(&mut self, suback: SubackPacket) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("suback received before connection establishment"));
        }

        let token_id = self.session.complete_outbound(suback.packet_id, self.persistence.as_mut())?;

        if let Some(token_id) = token_id {
            if let Some(token) = self.tokens.get_mut(&token_id) {
                let codes: Vec<u8> = suback.reason_codes.iter().map(|code| *code as u8).collect();
                token.append_reason_codes(&codes);
            }
            self.complete_token(token_id, Some(MqttPacket::Suback(suback)));
            Ok(())
        } else {
            Err(MqttError::new_protocol_error("suback does not match any pending subscribe"))
        }
    }

    fn handle_unsuback(&mut self, unsuback: UnsubackPacket) -> MqttResult<()> {
        if self.state != EngineStateType::Connected && self.state != EngineStateType::PendingDisconnect {
            return Err(MqttError::new_protocol_error("unsuback received before connection establishment"));
        }

        let token_id = self.session.complete_outbound(unsuback.packet_id, self.persistence.as_mut())?;

        if let Some(token_id) = token_id {
            if let Some(token) = self.tokens.get_mut(&token_id) {
                let codes: Vec<u8> = unsuback.reason_codes.iter().map(|code| *code as u8).collect();
                token.append_reason_codes(&codes);
            }
            self.complete_token(token_id, Some(MqttPacket::Unsuback(unsuback)));
            Ok(())
        } else {
            Err(MqttError::new_protocol_error("unsuback does not match any pending unsubscribe"))
        }
    }

    fn handle_pingresp(&mut self, now: Instant) -> MqttResult<()> {
        match self.state {
            EngineStateType::Connected | EngineStateType::PendingDisconnect => {
                if self.connection.is_ping_outstanding() {
                    self.connection.ping_received(now);
                    Ok(())
                } else {
                    Err(MqttError::new_protocol_error("pingresp received without an outstanding pingreq"))
                }
            }
            _ => {
                Err(MqttError::new_protocol_error("pingresp received before connection establishment"))
            }
        }
    }

    fn handle_server_disconnect(&mut self, disconnect: DisconnectPacket, context: &mut NetworkEventContext) -> MqttResult<()> {
        if self.state == EngineStateType::PendingConnack {
            // the server must send a connack before a disconnect is valid
            return Err(MqttError::new_protocol_error("disconnect received before connack"));
        }

        info!("engine - server disconnect with reason code {:?}", disconnect.reason_code);
        context.packet_events.push_back(PacketEvent::Disconnect(disconnect));

        Err(MqttError::new_connection_closed("server-side disconnect received"))
    }

    // Service helpers

    fn effective_keep_alive(&self) -> Duration {
        let seconds = self.connection.settings.as_ref()
            .map(|settings| settings.server_keep_alive)
            .unwrap_or(self.config.connect_options.keep_alive_interval_seconds);

        Duration::from_secs(seconds as u64)
    }

    fn service_keep_alive(&mut self, now: Instant) -> MqttResult<()> {
        match self.connection.keep_alive(now, self.effective_keep_alive()) {
            KeepAliveAction::Idle => Ok(()),
            KeepAliveAction::SendPing => {
                debug!("engine - keep alive interval reached, queueing PINGREQ");
                self.priority_queue.push_front(PriorityWork {
                    packet: MqttPacket::Pingreq(PingreqPacket {}),
                    token_id: None,
                });
                Ok(())
            }
            KeepAliveAction::ConnectionDead => {
                error!("engine - no PINGRESP within the keep alive deadline");
                Err(MqttError::new_connection_closed("keep alive timeout exceeded"))
            }
        }
    }

    fn emit_packet(&mut self, packet: &MqttPacket, context: &mut ServiceContext) -> MqttResult<()> {
        let bytes = encode_packet(packet)?;
        debug!("engine - emitting {} ({} bytes)", packet_type_to_str(packet_type_of(packet)), bytes.len());
        context.to_socket.extend_from_slice(&bytes);
        self.connection.register_outbound_activity(context.current_time);
        self.pending_write_completion = true;
        Ok(())
    }

    fn drain_priority_queue(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        while !self.pending_write_completion || !context.to_socket.is_empty() {
            let Some(work) = self.priority_queue.pop_front() else {
                return Ok(());
            };

            let is_disconnect = matches!(work.packet, MqttPacket::Disconnect(_));
            let is_pubcomp_for = if let MqttPacket::Pubcomp(pubcomp) = &work.packet {
                Some(pubcomp.packet_id)
            } else {
                None
            };

            self.emit_packet(&work.packet, context)?;

            if let Some(packet_id) = is_pubcomp_for {
                // durable removal waits for the write to finish
                self.pending_inbound_qos2_completions.push(packet_id);
            }

            if let Some(token_id) = work.token_id {
                self.write_completion_tokens.push_back(token_id);
            }

            if is_disconnect {
                self.change_state(EngineStateType::PendingDisconnect);
                return Ok(());
            }
        }

        Ok(())
    }

    fn drain_replay_queue(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        // strictly one replay entry per write-completion cycle, so each
        // retransmission is acknowledged by the socket before the next
        if self.pending_write_completion {
            return Ok(());
        }

        let Some(packet_id) = self.replay_queue.pop_front() else {
            return Ok(());
        };

        let Some(entry) = self.session.retry_queue.get(&packet_id) else {
            // acked while waiting; nothing to resend
            return Ok(());
        };

        let mut packet = entry.clone();
        if let MqttPacket::Publish(publish) = &mut packet {
            publish.duplicate = true;
        }

        info!("engine - replaying {} for packet id {}", packet_type_to_str(packet_type_of(&packet)), packet_id);
        self.emit_packet(&packet, context)
    }

    fn todo_head_ready(&self) -> bool {
        let Some(entry) = self.todo.peek() else {
            return false;
        };

        self.passes_receive_maximum(&entry.packet)
    }

    fn passes_receive_maximum(&self, packet: &MqttPacket) -> bool {
        if let MqttPacket::Publish(publish) = packet {
            if publish.qos != QualityOfService::AtMostOnce {
                if let Some(settings) = &self.connection.settings {
                    return self.session.retry_queue.len() < settings.receive_maximum_from_server as usize;
                }
            }
        }

        true
    }

    fn drain_todo_queue(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        while !self.pending_write_completion || !context.to_socket.is_empty() {
            if !self.replay_queue.is_empty() {
                return Ok(());
            }

            let head_ready = self.todo_head_ready();
            if !head_ready {
                return Ok(());
            }

            let Some(entry) = self.todo.pop() else {
                return Ok(());
            };

            self.emit_user_work(entry, context)?;
        }

        Ok(())
    }

    fn emit_user_work(&mut self, entry: TodoEntry, context: &mut ServiceContext) -> MqttResult<()> {
        let TodoEntry { packet, token_id } = entry;

        match packet {
            MqttPacket::Publish(mut publish) => {
                if publish.qos != QualityOfService::AtMostOnce {
                    // the durable image keeps the full topic; aliases are
                    // connection-scoped and never survive into a replay
                    self.session.add_retry(MqttPacket::Publish(publish.clone()), self.persistence.as_mut())?;
                } else {
                    self.write_completion_tokens.push_back(token_id);
                }

                self.connection.set_topic_alias(&mut publish);
                self.emit_packet(&MqttPacket::Publish(publish), context)
            }
            other => {
                self.emit_packet(&other, context)
            }
        }
    }

    // Token plumbing

    fn create_token(&mut self, request: MqttPacket, sender: Option<TokenSender>) -> u64 {
        let id = self.next_token_id;
        self.next_token_id += 1;

        self.tokens.insert(id, Token::new(id, request, sender));
        id
    }

    fn complete_token(&mut self, token_id: u64, response: Option<MqttPacket>) {
        if let Some(mut token) = self.tokens.remove(&token_id) {
            token.complete(response);
        }
    }

    fn fail_token(&mut self, token_id: u64, error: MqttError) {
        if let Some(mut token) = self.tokens.remove(&token_id) {
            token.fail(error);
        }
    }

    fn clear_session(&mut self) -> MqttResult<()> {
        // work still waiting in the buffer is not part of the discarded
        // session; it goes out fresh on this connection and keeps both its
        // token and its packet id binding
        let queued: Vec<(u64, Option<u16>)> = (0..self.todo.len())
            .filter_map(|i| self.todo.get(i))
            .map(|entry| (entry.token_id, packet_id_of(&entry.packet)))
            .collect();
        let queued_tokens: HashSet<u64> = queued.iter().map(|(token_id, _)| *token_id).collect();

        let orphaned = self.session.clear(self.persistence.as_mut())?;
        for token_id in orphaned {
            if queued_tokens.contains(&token_id) {
                continue;
            }
            self.fail_token(token_id, MqttError::new_connection_closed("session state discarded"));
        }

        for (token_id, packet_id) in queued {
            if let Some(packet_id) = packet_id {
                self.session.register_outbound(packet_id, token_id);
            }
        }

        self.replay_queue.clear();
        Ok(())
    }

    fn change_state(&mut self, next_state: EngineStateType) {
        debug!("engine - transitioning from {} to {}", self.state, next_state);
        self.state = next_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;
    use assert_matches::assert_matches;

    struct Fixture {
        engine: EngineState,
        events: VecDeque<PacketEvent>,
    }

    impl Fixture {
        fn new(clean_start: bool, session_expiry: Option<u32>, buffer_enabled: bool) -> Fixture {
            Fixture::with_persistence(clean_start, session_expiry, buffer_enabled,
                                      Box::new(MemoryPersistence::new()))
        }

        fn with_persistence(clean_start: bool, session_expiry: Option<u32>, buffer_enabled: bool,
                            persistence: Box<dyn Persistence>) -> Fixture {
            let mut connect_options = crate::config::ConnectOptionsBuilder::new()
                .with_client_id("engine-test")
                .with_clean_start(clean_start)
                .build();
            connect_options.session_expiry_interval_seconds = session_expiry;

            let config = EngineConfig {
                connect_options,
                connack_timeout: Duration::from_secs(20),
                buffer_enabled,
            };

            let engine = EngineState::new(config, 100, QueueFullPolicy::Reject, persistence).unwrap();

            Fixture {
                engine,
                events: VecDeque::new(),
            }
        }

        fn network_event(&mut self, event: NetworkEvent) -> MqttResult<()> {
            let mut context = NetworkEventContext {
                event,
                current_time: Instant::now(),
                packet_events: &mut self.events,
            };
            self.engine.handle_network_event(&mut context)
        }

        fn deliver(&mut self, packet: &MqttPacket) -> MqttResult<()> {
            let bytes = encode_packet(packet).unwrap();
            self.network_event(NetworkEvent::IncomingData(&bytes))
        }

        fn service(&mut self) -> Vec<MqttPacket> {
            self.service_at(Instant::now())
        }

        fn service_at(&mut self, current_time: Instant) -> Vec<MqttPacket> {
            let mut to_socket = Vec::new();
            let mut context = ServiceContext {
                to_socket: &mut to_socket,
                current_time,
            };
            self.engine.service(&mut context).unwrap();

            decode_all(&to_socket)
        }

        fn complete_write(&mut self) -> MqttResult<()> {
            self.network_event(NetworkEvent::WriteCompletion)
        }

        /// Runs the connection establishment handshake up through a
        /// successful CONNACK.
        fn establish(&mut self, session_present: bool) {
            self.network_event(NetworkEvent::ConnectionOpened).unwrap();

            let emitted = self.service();
            assert_eq!(emitted.len(), 1);
            assert_matches!(emitted[0], MqttPacket::Connect(_));
            self.complete_write().unwrap();

            self.deliver(&MqttPacket::Connack(ConnackPacket {
                session_present,
                ..Default::default()
            })).unwrap();

            assert_eq!(self.engine.state(), EngineStateType::Connected);
        }

        fn submit_publish(&mut self, qos: QualityOfService, topic: &str) -> oneshot::Receiver<MqttResult<TokenResult>> {
            let (sender, receiver) = oneshot::channel();
            self.engine.handle_user_event(UserEventContext {
                event: UserEvent::Publish(PublishPacket {
                    topic: topic.to_string(),
                    qos,
                    payload: b"payload".to_vec(),
                    ..Default::default()
                }, Some(sender)),
                current_time: Instant::now(),
            });
            receiver
        }
    }

    fn decode_all(bytes: &[u8]) -> Vec<MqttPacket> {
        let mut decoder = Decoder::new();
        let mut decoded = VecDeque::new();
        let mut context = DecodingContext {
            maximum_packet_size: 0,
            decoded_packets: &mut decoded,
        };
        decoder.decode_bytes(bytes, &mut context).unwrap();
        decoded.into_iter().collect()
    }

    #[test]
    fn qos1_publish_completes_on_puback() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let mut receiver = fixture.submit_publish(QualityOfService::AtLeastOnce, "a");

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        let MqttPacket::Publish(on_wire) = &emitted[0] else { panic!("expected publish") };
        assert_eq!(on_wire.packet_id, 1);
        assert!(!on_wire.duplicate);
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Puback(PubackPacket {
            packet_id: 1,
            ..Default::default()
        })).unwrap();

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.reason_codes, vec![0x00]);
        assert_matches!(result.response, Some(MqttPacket::Puback(_)));

        // the packet id is free again
        assert!(fixture.engine.session.out_tokens.is_empty());
        assert!(fixture.engine.session.retry_queue.is_empty());
    }

    #[test]
    fn qos2_publish_walks_the_full_handshake() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let mut receiver = fixture.submit_publish(QualityOfService::ExactlyOnce, "a");

        let emitted = fixture.service();
        assert_matches!(emitted[0], MqttPacket::Publish(_));
        fixture.complete_write().unwrap();
        assert_matches!(fixture.engine.session.retry_queue.get(&1), Some(MqttPacket::Publish(_)));

        fixture.deliver(&MqttPacket::Pubrec(PubrecPacket {
            packet_id: 1,
            ..Default::default()
        })).unwrap();

        // the retry entry flips to pubrel before the pubrel hits the wire
        assert_matches!(fixture.engine.session.retry_queue.get(&1), Some(MqttPacket::Pubrel(_)));

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(emitted[0], MqttPacket::Pubrel(_));
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Pubcomp(PubcompPacket {
            packet_id: 1,
            ..Default::default()
        })).unwrap();

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.reason_codes, vec![0x00, 0x00]);
        assert!(fixture.engine.session.retry_queue.is_empty());
        assert!(fixture.engine.session.out_tokens.is_empty());
    }

    #[test]
    fn qos2_reconnect_after_pubrec_replays_the_pubrel_first() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let mut receiver = fixture.submit_publish(QualityOfService::ExactlyOnce, "a");
        fixture.service();
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Pubrec(PubrecPacket {
            packet_id: 1,
            ..Default::default()
        })).unwrap();

        // the socket drops before the pubrel can be written
        fixture.network_event(NetworkEvent::ConnectionClosed).unwrap();
        assert_matches!(fixture.engine.session.retry_queue.get(&1), Some(MqttPacket::Pubrel(_)));

        fixture.establish(true);

        // the pubrel is the first packet of the resumed session
        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        let MqttPacket::Pubrel(replayed) = &emitted[0] else { panic!("expected pubrel") };
        assert_eq!(replayed.packet_id, 1);
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Pubcomp(PubcompPacket {
            packet_id: 1,
            ..Default::default()
        })).unwrap();

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.reason_codes, vec![0x00, 0x00]);
        assert!(fixture.engine.session.retry_queue.is_empty());
    }

    #[test]
    fn unacked_qos1_publish_is_replayed_with_dup_set() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let _receiver = fixture.submit_publish(QualityOfService::AtLeastOnce, "a");
        fixture.service();
        fixture.complete_write().unwrap();

        // connection dies between publish emission and puback receipt
        fixture.network_event(NetworkEvent::ConnectionClosed).unwrap();
        fixture.establish(true);

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        let MqttPacket::Publish(replayed) = &emitted[0] else { panic!("expected publish") };
        assert_eq!(replayed.packet_id, 1);
        assert!(replayed.duplicate);
    }

    #[test]
    fn replay_precedes_fresh_traffic() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let _in_flight = fixture.submit_publish(QualityOfService::AtLeastOnce, "old");
        fixture.service();
        fixture.complete_write().unwrap();

        fixture.network_event(NetworkEvent::ConnectionClosed).unwrap();

        // fresh work submitted while offline lands in the paused buffer
        let _buffered = fixture.submit_publish(QualityOfService::AtLeastOnce, "new");

        fixture.establish(true);

        let first_batch = fixture.service();
        assert_eq!(first_batch.len(), 1);
        let MqttPacket::Publish(replayed) = &first_batch[0] else { panic!("expected publish") };
        assert_eq!(replayed.topic, "old");
        assert!(replayed.duplicate);
        fixture.complete_write().unwrap();

        let second_batch = fixture.service();
        assert_eq!(second_batch.len(), 1);
        let MqttPacket::Publish(fresh) = &second_batch[0] else { panic!("expected publish") };
        assert_eq!(fresh.topic, "new");
        assert!(!fresh.duplicate);
    }

    #[test]
    fn duplicate_inbound_qos2_is_delivered_once_but_acked_twice() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);
        fixture.events.clear();

        let inbound = MqttPacket::Publish(PublishPacket {
            topic: "q2/topic".to_string(),
            qos: QualityOfService::ExactlyOnce,
            packet_id: 7,
            payload: b"once".to_vec(),
            ..Default::default()
        });

        fixture.deliver(&inbound).unwrap();
        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(&emitted[0], MqttPacket::Pubrec(pubrec) if pubrec.packet_id == 7);
        fixture.complete_write().unwrap();

        // broker retries the same publish; delivery is suppressed, the
        // pubrec is not
        fixture.deliver(&inbound).unwrap();
        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(&emitted[0], MqttPacket::Pubrec(pubrec) if pubrec.packet_id == 7);
        fixture.complete_write().unwrap();

        let publish_deliveries = fixture.events.iter()
            .filter(|event| matches!(event, PacketEvent::Publish(_)))
            .count();
        assert_eq!(publish_deliveries, 1);

        fixture.deliver(&MqttPacket::Pubrel(PubrelPacket {
            packet_id: 7,
            ..Default::default()
        })).unwrap();

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(&emitted[0], MqttPacket::Pubcomp(pubcomp) if pubcomp.packet_id == 7);

        // the durable marker survives until the pubcomp write completes
        assert!(fixture.engine.session.inbound_qos2.contains(&7));
        fixture.complete_write().unwrap();
        assert!(fixture.engine.session.inbound_qos2.is_empty());
    }

    #[test]
    fn inbound_qos2_marker_is_durable_before_the_pubrec() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        fixture.deliver(&MqttPacket::Publish(PublishPacket {
            topic: "q2/topic".to_string(),
            qos: QualityOfService::ExactlyOnce,
            packet_id: 9,
            payload: b"x".to_vec(),
            ..Default::default()
        })).unwrap();

        // marker recorded before any service call could emit the pubrec
        assert!(fixture.engine.session.inbound_qos2.contains(&9));
        assert!(fixture.engine.persistence.get(&crate::persist::make_inbound_key(9)).unwrap().is_some());
    }

    #[test]
    fn qos1_inbound_is_delivered_and_acked() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);
        fixture.events.clear();

        fixture.deliver(&MqttPacket::Publish(PublishPacket {
            topic: "q1/topic".to_string(),
            qos: QualityOfService::AtLeastOnce,
            packet_id: 3,
            payload: b"x".to_vec(),
            ..Default::default()
        })).unwrap();

        assert_eq!(fixture.events.len(), 1);

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(&emitted[0], MqttPacket::Puback(puback) if puback.packet_id == 3);
    }

    #[test]
    fn offline_publish_without_buffering_fails_immediately() {
        let mut fixture = Fixture::new(false, Some(300), false);

        let mut receiver = fixture.submit_publish(QualityOfService::AtLeastOnce, "a");
        assert_matches!(receiver.try_recv().unwrap(), Err(MqttError::NotConnected(_)));
    }

    #[test]
    fn offline_publish_with_buffering_flushes_after_connect() {
        let mut fixture = Fixture::new(false, Some(300), true);

        let _receiver = fixture.submit_publish(QualityOfService::AtLeastOnce, "buffered");
        assert_eq!(fixture.engine.buffered_message_count(), 1);

        fixture.establish(false);

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(&emitted[0], MqttPacket::Publish(publish) if publish.topic == "buffered");
    }

    #[test]
    fn receive_maximum_gates_fresh_qos1_publishes() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.network_event(NetworkEvent::ConnectionOpened).unwrap();
        fixture.service();
        fixture.complete_write().unwrap();
        fixture.deliver(&MqttPacket::Connack(ConnackPacket {
            receive_maximum: Some(1),
            ..Default::default()
        })).unwrap();

        let _first = fixture.submit_publish(QualityOfService::AtLeastOnce, "one");
        let _second = fixture.submit_publish(QualityOfService::AtLeastOnce, "two");

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        fixture.complete_write().unwrap();

        // window is full until the first publish is acknowledged
        assert!(fixture.service().is_empty());

        fixture.deliver(&MqttPacket::Puback(PubackPacket {
            packet_id: 1,
            ..Default::default()
        })).unwrap();

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(&emitted[0], MqttPacket::Publish(publish) if publish.topic == "two");
    }

    #[test]
    fn failing_pubrec_terminates_the_exchange_without_a_pubrel() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let mut receiver = fixture.submit_publish(QualityOfService::ExactlyOnce, "a");
        fixture.service();
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Pubrec(PubrecPacket {
            packet_id: 1,
            reason_code: PubrecReasonCode::NotAuthorized,
            ..Default::default()
        })).unwrap();

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.reason_codes, vec![PubrecReasonCode::NotAuthorized as u8]);

        assert!(fixture.engine.session.retry_queue.is_empty());
        assert!(fixture.service().is_empty());
    }

    #[test]
    fn broker_rejected_puback_still_frees_delivery_state() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let mut receiver = fixture.submit_publish(QualityOfService::AtLeastOnce, "a");
        fixture.service();
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Puback(PubackPacket {
            packet_id: 1,
            reason_code: PubackReasonCode::QuotaExceeded,
            ..Default::default()
        })).unwrap();

        // a rejection is a completion, not an error
        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.reason_codes, vec![PubackReasonCode::QuotaExceeded as u8]);
        assert!(fixture.engine.session.retry_queue.is_empty());
        assert!(fixture.engine.persistence.keys().unwrap().is_empty());
    }

    #[test]
    fn clean_start_discards_recovered_session_state() {
        let mut store = Box::new(MemoryPersistence::new());
        {
            let mut seed_session = crate::session::SessionState::new("engine-test");
            seed_session.add_retry(MqttPacket::Publish(PublishPacket {
                topic: "stale".to_string(),
                qos: QualityOfService::AtLeastOnce,
                packet_id: 5,
                ..Default::default()
            }), store.as_mut()).unwrap();
        }

        let mut fixture = Fixture::with_persistence(true, Some(300), true, store);
        assert_eq!(fixture.engine.session.retry_queue.len(), 1);

        fixture.establish(false);

        // clean start dropped the recovered entry; nothing replays
        assert!(fixture.engine.session.retry_queue.is_empty());
        assert!(fixture.service().is_empty());
    }

    #[test]
    fn recovered_session_replays_without_tokens() {
        let mut store = Box::new(MemoryPersistence::new());
        {
            let mut seed_session = crate::session::SessionState::new("engine-test");
            seed_session.add_retry(MqttPacket::Publish(PublishPacket {
                topic: "recovered".to_string(),
                qos: QualityOfService::AtLeastOnce,
                packet_id: 5,
                ..Default::default()
            }), store.as_mut()).unwrap();
        }

        let mut fixture = Fixture::with_persistence(false, Some(300), true, store);
        fixture.establish(true);

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        let MqttPacket::Publish(replayed) = &emitted[0] else { panic!("expected publish") };
        assert_eq!(replayed.topic, "recovered");
        assert!(replayed.duplicate);
        fixture.complete_write().unwrap();

        // the tokenless ack still frees the packet id and the durable image
        fixture.deliver(&MqttPacket::Puback(PubackPacket {
            packet_id: 5,
            ..Default::default()
        })).unwrap();
        assert!(fixture.engine.session.retry_queue.is_empty());
        assert!(fixture.engine.persistence.keys().unwrap().is_empty());
    }

    #[test]
    fn user_disconnect_flushes_before_the_connection_halts() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let (sender, mut receiver) = oneshot::channel();
        fixture.engine.handle_user_event(UserEventContext {
            event: UserEvent::Disconnect(DisconnectPacket::default(), Some(sender)),
            current_time: Instant::now(),
        });

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        assert_matches!(emitted[0], MqttPacket::Disconnect(_));
        assert_eq!(fixture.engine.state(), EngineStateType::PendingDisconnect);

        // the token completes only once the disconnect is flushed
        assert!(receiver.try_recv().is_err());
        assert_matches!(fixture.complete_write(), Err(MqttError::UserInitiatedDisconnect(_)));
        assert!(receiver.try_recv().unwrap().is_ok());
        assert!(!fixture.engine.should_be_connected());
    }

    #[test]
    fn server_disconnect_surfaces_the_packet_and_fails_the_connection() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);
        fixture.events.clear();

        let result = fixture.deliver(&MqttPacket::Disconnect(DisconnectPacket {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            ..Default::default()
        }));

        assert_matches!(result, Err(MqttError::ConnectionClosed(_)));
        assert!(fixture.events.iter().any(|event| matches!(event, PacketEvent::Disconnect(_))));
    }

    #[test]
    fn rejected_connack_fails_establishment() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.network_event(NetworkEvent::ConnectionOpened).unwrap();
        fixture.service();
        fixture.complete_write().unwrap();

        let result = fixture.deliver(&MqttPacket::Connack(ConnackPacket {
            reason_code: ConnectReasonCode::ServerBusy,
            ..Default::default()
        }));

        assert_matches!(result, Err(MqttError::ConnectionEstablishmentFailure(_)));
    }

    #[test]
    fn connack_reassigns_the_client_id() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.network_event(NetworkEvent::ConnectionOpened).unwrap();
        fixture.service();
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Connack(ConnackPacket {
            assigned_client_identifier: Some("broker-chose-this".to_string()),
            ..Default::default()
        })).unwrap();

        assert_eq!(fixture.engine.client_id(), "broker-chose-this");
    }

    #[test]
    fn idle_connection_pings_within_the_keep_alive_interval() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        // nothing due before the interval elapses
        assert!(fixture.service_at(Instant::now() + Duration::from_secs(30)).is_empty());

        let emitted = fixture.service_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(emitted.len(), 1);
        assert_matches!(emitted[0], MqttPacket::Pingreq(_));
        fixture.complete_write().unwrap();

        fixture.deliver(&MqttPacket::Pingresp(PingrespPacket {})).unwrap();
        assert!(!fixture.engine.connection.is_ping_outstanding());
    }

    #[test]
    fn unanswered_ping_tears_the_connection_down() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let base = Instant::now();
        let emitted = fixture.service_at(base + Duration::from_secs(61));
        assert_matches!(emitted[0], MqttPacket::Pingreq(_));
        fixture.complete_write().unwrap();

        // 1.5x the interval later with no pingresp, service reports the
        // connection dead
        let mut to_socket = Vec::new();
        let mut context = ServiceContext {
            to_socket: &mut to_socket,
            current_time: base + Duration::from_secs(200),
        };
        assert_matches!(fixture.engine.service(&mut context), Err(MqttError::ConnectionClosed(_)));
    }

    #[test]
    fn qos0_publish_completes_on_write_completion() {
        let mut fixture = Fixture::new(false, Some(300), true);
        fixture.establish(false);

        let mut receiver = fixture.submit_publish(QualityOfService::AtMostOnce, "fire-and-forget");

        let emitted = fixture.service();
        assert_eq!(emitted.len(), 1);
        let MqttPacket::Publish(on_wire) = &emitted[0] else { panic!("expected publish") };
        assert_eq!(on_wire.packet_id, 0);

        assert!(receiver.try_recv().is_err());
        fixture.complete_write().unwrap();
        assert!(receiver.try_recv().unwrap().is_ok());
    }
}
