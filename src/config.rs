/*!
Client and connection configuration types and their builders.
 */

use crate::mqtt::*;
use crate::queue::QueueFullPolicy;

use std::sync::Arc;
use std::time::Duration;

/// Configuration for the MQTT CONNECT handshake and the session it creates.
///
/// Constructed with [`ConnectOptionsBuilder`].
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Session identifier.  Empty asks the server to assign one via the
    /// CONNACK assigned-client-identifier property.
    pub(crate) client_id: String,

    /// Discard server-side session state on connect.
    pub(crate) clean_start: bool,

    /// Seconds of permitted outbound silence; zero disables keep alive.
    pub(crate) keep_alive_interval_seconds: u16,

    /// Seconds the server should retain session state after disconnect.
    /// Absent or zero means delivery state dies with the connection.
    pub(crate) session_expiry_interval_seconds: Option<u32>,

    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,

    pub(crate) receive_maximum: Option<u16>,
    pub(crate) topic_alias_maximum: Option<u16>,
    pub(crate) maximum_packet_size_bytes: Option<u32>,
    pub(crate) request_response_information: Option<bool>,
    pub(crate) request_problem_information: Option<bool>,
    pub(crate) authentication_method: Option<String>,
    pub(crate) authentication_data: Option<Vec<u8>>,
    pub(crate) user_properties: Option<Vec<UserProperty>>,

    pub(crate) will_delay_interval_seconds: Option<u32>,
    pub(crate) will: Option<PublishPacket>,
}

impl ConnectOptions {
    /// Materializes the CONNECT packet for one connection attempt.  The
    /// client id passed in reflects any server assignment from a previous
    /// connection.
    pub(crate) fn to_connect_packet(&self, client_id: &str) -> ConnectPacket {
        ConnectPacket {
            keep_alive_interval_seconds: self.keep_alive_interval_seconds,
            clean_start: self.clean_start,
            client_id: client_id.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            session_expiry_interval_seconds: self.session_expiry_interval_seconds,
            receive_maximum: self.receive_maximum,
            maximum_packet_size_bytes: self.maximum_packet_size_bytes,
            topic_alias_maximum: self.topic_alias_maximum,
            request_response_information: self.request_response_information,
            request_problem_information: self.request_problem_information,
            authentication_method: self.authentication_method.clone(),
            authentication_data: self.authentication_data.clone(),
            will_delay_interval_seconds: self.will_delay_interval_seconds,
            will: self.will.clone(),
            user_properties: self.user_properties.clone(),
        }
    }

    /// The configured client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// Builder for [`ConnectOptions`]
#[derive(Debug, Default)]
pub struct ConnectOptionsBuilder {
    options: ConnectOptions,
}

impl ConnectOptionsBuilder {
    /// Creates a builder with a 60 second keep alive and everything else
    /// unset.
    pub fn new() -> Self {
        ConnectOptionsBuilder {
            options: ConnectOptions {
                keep_alive_interval_seconds: 60,
                ..Default::default()
            },
        }
    }

    /// Sets the session identifier.  Empty (the default) asks the server to
    /// assign one.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.options.client_id = client_id.to_string();
        self
    }

    /// Starts a fresh session, discarding server-side state.
    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.options.clean_start = clean_start;
        self
    }

    /// Sets the keep alive interval in seconds; zero disables keep alive.
    pub fn with_keep_alive_interval_seconds(mut self, keep_alive: u16) -> Self {
        self.options.keep_alive_interval_seconds = keep_alive;
        self
    }

    /// Sets how long the server should retain session state after
    /// disconnect, in seconds.
    pub fn with_session_expiry_interval_seconds(mut self, session_expiry: u32) -> Self {
        self.options.session_expiry_interval_seconds = Some(session_expiry);
        self
    }

    /// Sets the authentication user name.
    pub fn with_username(mut self, username: &str) -> Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets the authentication password.
    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Bounds concurrent unacknowledged inbound QoS 1/2 publishes.
    pub fn with_receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.options.receive_maximum = Some(receive_maximum);
        self
    }

    /// Bounds topic aliases the server may use toward this client.
    pub fn with_topic_alias_maximum(mut self, topic_alias_maximum: u16) -> Self {
        self.options.topic_alias_maximum = Some(topic_alias_maximum);
        self
    }

    /// Bounds the size of packets the server may send.
    pub fn with_maximum_packet_size_bytes(mut self, maximum_packet_size_bytes: u32) -> Self {
        self.options.maximum_packet_size_bytes = Some(maximum_packet_size_bytes);
        self
    }

    /// Asks the server for response information in the CONNACK.
    pub fn with_request_response_information(mut self, request: bool) -> Self {
        self.options.request_response_information = Some(request);
        self
    }

    /// Asks the server to include diagnostics on failures.
    pub fn with_request_problem_information(mut self, request: bool) -> Self {
        self.options.request_problem_information = Some(request);
        self
    }

    /// Sets the extended authentication method.
    pub fn with_authentication_method(mut self, method: &str) -> Self {
        self.options.authentication_method = Some(method.to_string());
        self
    }

    /// Sets the extended authentication payload.
    pub fn with_authentication_data(mut self, data: &[u8]) -> Self {
        self.options.authentication_data = Some(data.to_vec());
        self
    }

    /// Attaches user properties to the CONNECT packet.
    pub fn with_user_properties(mut self, user_properties: Vec<UserProperty>) -> Self {
        self.options.user_properties = Some(user_properties);
        self
    }

    /// Sets the will message, modeled as a publish.
    pub fn with_will(mut self, will: PublishPacket) -> Self {
        self.options.will = Some(will);
        self
    }

    /// Sets how long the server should delay publishing the will, in
    /// seconds.
    pub fn with_will_delay_interval_seconds(mut self, delay: u32) -> Self {
        self.options.will_delay_interval_seconds = Some(delay);
        self
    }

    /// Finalizes the options.
    pub fn build(self) -> ConnectOptions {
        self.options
    }
}

/// Controls whether reconnect delays are used exactly or spread uniformly to
/// avoid thundering herds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReconnectJitterType {
    /// Delays follow the doubling schedule exactly.
    #[default]
    None,

    /// Each delay is drawn uniformly from (0, scheduled delay].
    Uniform,
}

/// Automatic reconnection policy: delays double from the minimum to the
/// maximum on consecutive failures and reset to the minimum after a stable
/// connection.
#[derive(Clone, Debug)]
pub struct ReconnectOptions {
    pub(crate) automatic_reconnect: bool,
    pub(crate) min_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) jitter: ReconnectJitterType,

    /// How long a connection must stay up before the delay resets.
    pub(crate) stability_reset_period: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            automatic_reconnect: true,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            jitter: ReconnectJitterType::None,
            stability_reset_period: Duration::from_secs(60),
        }
    }
}

impl ReconnectOptions {
    pub(crate) fn normalize(&mut self) {
        if self.min_delay.is_zero() {
            self.min_delay = Duration::from_millis(10);
        }

        if self.max_delay < self.min_delay {
            self.max_delay = self.min_delay;
        }
    }
}

/// Behavioral configuration for the client as a whole.
///
/// Constructed with [`ClientOptionsBuilder`].
pub struct ClientOptions {
    pub(crate) connect_timeout: Duration,
    pub(crate) connack_timeout: Duration,
    pub(crate) reconnect_options: ReconnectOptions,

    pub(crate) buffer_enabled: bool,
    pub(crate) buffer_size: usize,
    pub(crate) queue_full_policy: QueueFullPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            connect_timeout: Duration::from_secs(30),
            connack_timeout: Duration::from_secs(20),
            reconnect_options: ReconnectOptions::default(),
            buffer_enabled: true,
            buffer_size: 5000,
            queue_full_policy: QueueFullPolicy::Reject,
        }
    }
}

/// Builder for [`ClientOptions`]
#[derive(Default)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Creates a builder with sane defaults: 30 second connect timeout,
    /// automatic reconnect, and a 5000-entry offline buffer.
    pub fn new() -> Self {
        ClientOptionsBuilder {
            options: ClientOptions::default(),
        }
    }

    /// Bounds transport-level connection establishment.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    /// Bounds the wait for the broker's CONNACK.
    pub fn with_connack_timeout(mut self, connack_timeout: Duration) -> Self {
        self.options.connack_timeout = connack_timeout;
        self
    }

    /// Enables or disables automatic reconnection.
    pub fn with_automatic_reconnect(mut self, automatic_reconnect: bool) -> Self {
        self.options.reconnect_options.automatic_reconnect = automatic_reconnect;
        self
    }

    /// Sets the first reconnect delay.
    pub fn with_reconnect_min_delay(mut self, min_delay: Duration) -> Self {
        self.options.reconnect_options.min_delay = min_delay;
        self
    }

    /// Caps the doubling reconnect delay.
    pub fn with_reconnect_max_delay(mut self, max_delay: Duration) -> Self {
        self.options.reconnect_options.max_delay = max_delay;
        self
    }

    /// Selects reconnect delay jitter.
    pub fn with_reconnect_jitter(mut self, jitter: ReconnectJitterType) -> Self {
        self.options.reconnect_options.jitter = jitter;
        self
    }

    /// Sets how long a connection must survive before the reconnect delay
    /// resets to the minimum.
    pub fn with_reconnect_stability_reset_period(mut self, period: Duration) -> Self {
        self.options.reconnect_options.stability_reset_period = period;
        self
    }

    /// Enables or disables offline buffering of user operations.
    pub fn with_buffer_enabled(mut self, buffer_enabled: bool) -> Self {
        self.options.buffer_enabled = buffer_enabled;
        self
    }

    /// Bounds the offline buffer.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.options.buffer_size = buffer_size;
        self
    }

    /// Selects what happens when work is added to a full buffer.
    pub fn with_queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.options.queue_full_policy = policy;
        self
    }

    /// Finalizes the options.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

/// TLS material for `ssl://` and `wss://` connections, pre-built by the
/// caller.  Certificate and key management is out of scope for this crate.
#[derive(Clone)]
pub struct TlsOptions {
    pub(crate) config: Arc<rustls::ClientConfig>,
}

impl TlsOptions {
    /// Wraps an existing rustls client configuration.
    pub fn new(config: Arc<rustls::ClientConfig>) -> TlsOptions {
        TlsOptions { config }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_options_materialize_a_connect_packet() {
        let options = ConnectOptionsBuilder::new()
            .with_client_id("node-12")
            .with_clean_start(true)
            .with_keep_alive_interval_seconds(25)
            .with_session_expiry_interval_seconds(300)
            .with_username("svc")
            .with_password(b"secret")
            .with_receive_maximum(16)
            .build();

        let connect = options.to_connect_packet("node-12");
        assert_eq!(connect.client_id, "node-12");
        assert!(connect.clean_start);
        assert_eq!(connect.keep_alive_interval_seconds, 25);
        assert_eq!(connect.session_expiry_interval_seconds, Some(300));
        assert_eq!(connect.username.as_deref(), Some("svc"));
        assert_eq!(connect.password.as_deref(), Some(b"secret".as_slice()));
        assert_eq!(connect.receive_maximum, Some(16));
    }

    #[test]
    fn connect_packet_uses_reassigned_client_id() {
        let options = ConnectOptionsBuilder::new().with_client_id("").build();
        let connect = options.to_connect_packet("server-assigned-77");
        assert_eq!(connect.client_id, "server-assigned-77");
    }

    #[test]
    fn reconnect_options_normalize_degenerate_values() {
        let mut options = ReconnectOptions {
            automatic_reconnect: true,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: ReconnectJitterType::None,
            stability_reset_period: Duration::from_secs(60),
        };

        options.normalize();
        assert!(!options.min_delay.is_zero());
        assert!(options.max_delay >= options.min_delay);
    }
}
