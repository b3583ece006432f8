/*!
Ephemeral per-connection state: activity timestamps, the ping state machine,
topic alias tables, and the limits the broker advertised in its CONNACK.
 */

use crate::alias::{InboundAliasTable, OutboundAliasTable};
use crate::mqtt::*;

use std::fmt;
use std::time::{Duration, Instant};

/// Protocol values in effect for one connection, combining what the client
/// requested with what the broker's CONNACK advertised.
#[derive(Clone, Debug)]
pub struct NegotiatedSettings {
    /// Bound on concurrent unacknowledged QoS 1/2 publishes to the server.
    pub receive_maximum_from_server: u16,

    /// Largest packet the server accepts; zero means the protocol maximum.
    pub maximum_packet_size_to_server: u32,

    /// Most topic aliases the client may use toward the server.
    pub topic_alias_maximum_to_server: u16,

    /// Effective keep alive in seconds; the minimum of the client's request
    /// and the server's override.  Zero disables keep alive.
    pub server_keep_alive: u16,

    /// Highest QoS the server supports.
    pub maximum_qos: QualityOfService,

    /// Session expiry in effect, in seconds.
    pub session_expiry_interval: u32,

    /// Whether the server resumed existing session state.
    pub rejoined_session: bool,

    /// Whether the server supports retained messages.
    pub retain_available: bool,

    /// Whether the server supports wildcard subscription filters.
    pub wildcard_subscriptions_available: bool,

    /// Whether the server supports subscription identifiers.
    pub subscription_identifiers_available: bool,

    /// Whether the server supports shared subscriptions.
    pub shared_subscriptions_available: bool,

    /// Client id in effect; server-assigned when the client sent an empty one.
    pub client_id: String,
}

impl fmt::Display for NegotiatedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NegotiatedSettings {{ client_id:{}, receive_maximum:{}, keep_alive:{}, session_expiry:{}, rejoined:{} }}",
               self.client_id, self.receive_maximum_from_server, self.server_keep_alive,
               self.session_expiry_interval, self.rejoined_session)
    }
}

/// Derives the connection's effective settings from the CONNACK and the
/// requested values.
pub(crate) fn build_negotiated_settings(connack: &ConnackPacket,
                                        requested_keep_alive: u16,
                                        requested_session_expiry: u32,
                                        fallback_client_id: &str) -> NegotiatedSettings {
    let server_keep_alive = match connack.server_keep_alive {
        Some(server_value) => {
            if requested_keep_alive == 0 { server_value } else { server_value.min(requested_keep_alive) }
        }
        None => requested_keep_alive,
    };

    NegotiatedSettings {
        receive_maximum_from_server: connack.receive_maximum.unwrap_or(u16::MAX),
        maximum_packet_size_to_server: connack.maximum_packet_size_bytes.unwrap_or(0),
        topic_alias_maximum_to_server: connack.topic_alias_maximum.unwrap_or(0),
        server_keep_alive,
        maximum_qos: connack.maximum_qos.unwrap_or(QualityOfService::ExactlyOnce),
        session_expiry_interval: connack.session_expiry_interval_seconds.unwrap_or(requested_session_expiry),
        rejoined_session: connack.session_present,
        retain_available: connack.retain_available.unwrap_or(true),
        wildcard_subscriptions_available: connack.wildcard_subscriptions_available.unwrap_or(true),
        subscription_identifiers_available: connack.subscription_identifiers_available.unwrap_or(true),
        shared_subscriptions_available: connack.shared_subscriptions_available.unwrap_or(true),
        client_id: connack.assigned_client_identifier.clone()
            .unwrap_or_else(|| fallback_client_id.to_string()),
    }
}

/// What the keep-alive check decided.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum KeepAliveAction {
    /// Nothing to do yet.
    Idle,

    /// Silence on the outbound side reached the interval; emit a PINGREQ.
    SendPing,

    /// The broker failed to answer a PINGREQ within the round-trip deadline;
    /// tear the connection down.
    ConnectionDead,
}

/// State scoped to a single TCP/TLS/websocket lifetime.  Rebuilt from scratch
/// on every new connection.
pub(crate) struct ConnectionState {
    last_inbound_activity: Instant,
    last_outbound_activity: Instant,

    ping_outstanding: bool,
    ping_deadline: Option<Instant>,

    pub outbound_aliases: OutboundAliasTable,
    pub inbound_aliases: InboundAliasTable,

    /// Server limits; present once the CONNACK has been processed.
    pub settings: Option<NegotiatedSettings>,
}

impl ConnectionState {
    pub fn new(now: Instant, inbound_alias_maximum: u16) -> ConnectionState {
        ConnectionState {
            last_inbound_activity: now,
            last_outbound_activity: now,
            ping_outstanding: false,
            ping_deadline: None,
            outbound_aliases: OutboundAliasTable::new(),
            inbound_aliases: InboundAliasTable::new(inbound_alias_maximum),
            settings: None,
        }
    }

    pub fn register_inbound_activity(&mut self, now: Instant) {
        self.last_inbound_activity = now;
    }

    pub fn register_outbound_activity(&mut self, now: Instant) {
        self.last_outbound_activity = now;
    }

    pub fn ping_received(&mut self, now: Instant) {
        self.last_inbound_activity = now;
        self.ping_outstanding = false;
        self.ping_deadline = None;
    }

    pub fn is_ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    /// Periodic liveness check.  When a ping is due, marks it outstanding
    /// with a round-trip deadline of 1.5x the interval and tells the caller
    /// to emit the PINGREQ; when an outstanding ping blows its deadline, the
    /// connection is declared dead.
    pub fn keep_alive(&mut self, now: Instant, interval: Duration) -> KeepAliveAction {
        if interval.is_zero() {
            return KeepAliveAction::Idle;
        }

        if self.ping_outstanding {
            if let Some(deadline) = self.ping_deadline {
                if now >= deadline {
                    return KeepAliveAction::ConnectionDead;
                }
            }

            return KeepAliveAction::Idle;
        }

        if now.duration_since(self.last_outbound_activity) >= interval {
            self.ping_outstanding = true;
            self.ping_deadline = Some(now + interval.mul_f64(1.5));
            return KeepAliveAction::SendPing;
        }

        KeepAliveAction::Idle
    }

    /// Next instant the keep-alive check needs to run, for the event loop
    /// timer.
    pub fn next_keep_alive_timepoint(&self, interval: Duration) -> Option<Instant> {
        if interval.is_zero() {
            return None;
        }

        if self.ping_outstanding {
            return self.ping_deadline;
        }

        Some(self.last_outbound_activity + interval)
    }

    /// Rewrites an outbound publish to use a topic alias where possible,
    /// teaching the broker new bindings as capacity allows.
    pub fn set_topic_alias(&mut self, publish: &mut PublishPacket) {
        let resolution = self.outbound_aliases.resolve_and_apply_topic_alias(&publish.topic);

        publish.topic_alias = resolution.alias;
        if resolution.skip_topic {
            publish.topic = String::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(10);

    #[test]
    fn keep_alive_pings_after_outbound_silence() {
        let start = Instant::now();
        let mut connection = ConnectionState::new(start, 0);

        assert_eq!(connection.keep_alive(start + Duration::from_secs(5), INTERVAL), KeepAliveAction::Idle);
        assert_eq!(connection.keep_alive(start + INTERVAL, INTERVAL), KeepAliveAction::SendPing);
        assert!(connection.is_ping_outstanding());

        // no second ping while one is outstanding
        assert_eq!(connection.keep_alive(start + Duration::from_secs(11), INTERVAL), KeepAliveAction::Idle);
    }

    #[test]
    fn keep_alive_outbound_traffic_defers_ping() {
        let start = Instant::now();
        let mut connection = ConnectionState::new(start, 0);

        connection.register_outbound_activity(start + Duration::from_secs(8));
        assert_eq!(connection.keep_alive(start + INTERVAL, INTERVAL), KeepAliveAction::Idle);
        assert_eq!(connection.keep_alive(start + Duration::from_secs(18), INTERVAL), KeepAliveAction::SendPing);
    }

    #[test]
    fn pingresp_clears_outstanding_state() {
        let start = Instant::now();
        let mut connection = ConnectionState::new(start, 0);

        assert_eq!(connection.keep_alive(start + INTERVAL, INTERVAL), KeepAliveAction::SendPing);
        connection.ping_received(start + Duration::from_secs(11));
        assert!(!connection.is_ping_outstanding());

        // deadline no longer applies
        assert_eq!(connection.keep_alive(start + Duration::from_secs(11), INTERVAL), KeepAliveAction::Idle);
    }

    #[test]
    fn missing_pingresp_kills_the_connection_at_one_and_a_half_intervals() {
        let start = Instant::now();
        let mut connection = ConnectionState::new(start, 0);

        assert_eq!(connection.keep_alive(start + INTERVAL, INTERVAL), KeepAliveAction::SendPing);
        assert_eq!(connection.keep_alive(start + Duration::from_secs(24), INTERVAL), KeepAliveAction::Idle);
        assert_eq!(connection.keep_alive(start + Duration::from_secs(25), INTERVAL), KeepAliveAction::ConnectionDead);
    }

    #[test]
    fn zero_interval_disables_keep_alive() {
        let start = Instant::now();
        let mut connection = ConnectionState::new(start, 0);

        assert_eq!(connection.keep_alive(start + Duration::from_secs(1000), Duration::ZERO), KeepAliveAction::Idle);
        assert!(connection.next_keep_alive_timepoint(Duration::ZERO).is_none());
    }

    #[test]
    fn negotiated_settings_apply_server_overrides() {
        let connack = ConnackPacket {
            receive_maximum: Some(12),
            server_keep_alive: Some(30),
            topic_alias_maximum: Some(9),
            assigned_client_identifier: Some("assigned-1".to_string()),
            session_expiry_interval_seconds: Some(120),
            ..Default::default()
        };

        let settings = build_negotiated_settings(&connack, 60, 600, "requested-id");
        assert_eq!(settings.receive_maximum_from_server, 12);
        assert_eq!(settings.server_keep_alive, 30);
        assert_eq!(settings.topic_alias_maximum_to_server, 9);
        assert_eq!(settings.client_id, "assigned-1");
        assert_eq!(settings.session_expiry_interval, 120);
    }

    #[test]
    fn negotiated_settings_defaults_without_server_properties() {
        let settings = build_negotiated_settings(&ConnackPacket::default(), 60, 0, "client-9");
        assert_eq!(settings.receive_maximum_from_server, u16::MAX);
        assert_eq!(settings.server_keep_alive, 60);
        assert_eq!(settings.topic_alias_maximum_to_server, 0);
        assert_eq!(settings.client_id, "client-9");
        assert!(settings.retain_available);
    }

    #[test]
    fn topic_alias_rewrite_on_repeat_publish() {
        let mut connection = ConnectionState::new(Instant::now(), 0);
        connection.outbound_aliases.reset_for_new_connection(4);

        let mut first = PublishPacket {
            topic: "t/1".to_string(),
            ..Default::default()
        };
        connection.set_topic_alias(&mut first);
        assert_eq!(first.topic, "t/1");
        assert_eq!(first.topic_alias, Some(1));

        let mut second = PublishPacket {
            topic: "t/1".to_string(),
            ..Default::default()
        };
        connection.set_topic_alias(&mut second);
        assert_eq!(second.topic, "");
        assert_eq!(second.topic_alias, Some(1));
    }
}
