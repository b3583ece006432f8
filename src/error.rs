/*!
Crate-wide error enumeration and result alias.
 */

use std::error::Error;
use std::fmt;

type ErrorSource = Box<dyn Error + Send + Sync + 'static>;

/// Error type used throughout the crate.
///
/// Variants are grouped by blast radius: decoding/protocol errors are fatal to
/// the current connection, transport errors trigger failover and reconnect
/// scheduling, session and policy errors are surfaced through the submitting
/// operation's token while the session stays up.  Broker rejections are *not*
/// errors; they travel as reason codes on completed tokens.
#[derive(Debug)]
#[non_exhaustive]
pub enum MqttError {

    /// Malformed bytes were received from the broker.  Connection fatal.
    DecodingFailure(DecodingFailureContext),

    /// An outbound packet could not be encoded.  Almost always indicates a
    /// packet that violates a negotiated limit.
    EncodingFailure(EncodingFailureContext),

    /// The broker behaved in a way the MQTT specification disallows and that
    /// cannot be safely ignored.  Connection fatal.
    ProtocolError(ProtocolErrorContext),

    /// An inbound publish referenced a topic alias with no binding or a value
    /// outside the negotiated range.
    InboundTopicAliasNotValid(InboundTopicAliasNotValidContext),

    /// All 65535 packet ids are bound to in-flight operations.  The session
    /// stays up; the submitting operation fails.
    PacketIdsExhausted(PacketIdsExhaustedContext),

    /// An operation was submitted while offline with offline buffering
    /// disabled.
    NotConnected(NotConnectedContext),

    /// The offline buffer is at capacity and the configured policy rejects
    /// new entries.
    BufferFull(BufferFullContext),

    /// A transport-level connection could not be established, covering
    /// everything up to receipt of a successful CONNACK.
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// An established connection was closed for an external reason.
    ConnectionClosed(ConnectionClosedContext),

    /// A transport adapter (websocket, TLS) failed below the byte-stream
    /// abstraction.
    TransportError(TransportErrorContext),

    /// The client was closed while the operation was still incomplete.
    ClientClosed(ClientClosedContext),

    /// The connection was shut down by a user-submitted DISCONNECT.  Not an
    /// actual failure.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// The client reached a state that should be unreachable.  Always a bug.
    InternalStateError(InternalStateErrorContext),

    /// Functionality that is recognized but not implemented (enhanced
    /// authentication exchanges).
    Unimplemented(UnimplementedContext),

    /// Wrapper for `std::io::Error` where no more specific variant applies.
    StdIoError(StdIoErrorContext),

    /// Failure applying TLS configuration.
    TlsError(TlsErrorContext),

    /// Failure reading or writing the durable session store.
    PersistenceFailure(PersistenceFailureContext),
}

/// Details for [`MqttError::DecodingFailure`]
#[derive(Debug)]
pub struct DecodingFailureContext {
    source: ErrorSource,
}

/// Details for [`MqttError::EncodingFailure`]
#[derive(Debug)]
pub struct EncodingFailureContext {
    source: ErrorSource,
}

/// Details for [`MqttError::ProtocolError`]
#[derive(Debug)]
pub struct ProtocolErrorContext {
    source: ErrorSource,
}

/// Details for [`MqttError::InboundTopicAliasNotValid`]
#[derive(Debug)]
pub struct InboundTopicAliasNotValidContext {
    source: ErrorSource,
}

/// Details for [`MqttError::PacketIdsExhausted`]
#[derive(Debug)]
pub struct PacketIdsExhaustedContext {}

/// Details for [`MqttError::NotConnected`]
#[derive(Debug)]
pub struct NotConnectedContext {}

/// Details for [`MqttError::BufferFull`]
#[derive(Debug)]
pub struct BufferFullContext {}

/// Details for [`MqttError::ConnectionEstablishmentFailure`]
#[derive(Debug)]
pub struct ConnectionEstablishmentFailureContext {
    source: ErrorSource,
}

/// Details for [`MqttError::ConnectionClosed`]
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: ErrorSource,
}

/// Details for [`MqttError::TransportError`]
#[derive(Debug)]
pub struct TransportErrorContext {
    source: ErrorSource,
}

/// Details for [`MqttError::ClientClosed`]
#[derive(Debug)]
pub struct ClientClosedContext {}

/// Details for [`MqttError::UserInitiatedDisconnect`]
#[derive(Debug)]
pub struct UserInitiatedDisconnectContext {}

/// Details for [`MqttError::InternalStateError`]
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: ErrorSource,
}

/// Details for [`MqttError::Unimplemented`]
#[derive(Debug)]
pub struct UnimplementedContext {
    source: ErrorSource,
}

/// Details for [`MqttError::StdIoError`]
#[derive(Debug)]
pub struct StdIoErrorContext {
    source: ErrorSource,
}

/// Details for [`MqttError::TlsError`]
#[derive(Debug)]
pub struct TlsErrorContext {
    source: ErrorSource,
}

/// Details for [`MqttError::PersistenceFailure`]
#[derive(Debug)]
pub struct PersistenceFailureContext {
    source: ErrorSource,
}

impl MqttError {

    pub(crate) fn new_decoding_failure(source: impl Into<ErrorSource>) -> Self {
        MqttError::DecodingFailure(DecodingFailureContext { source: source.into() })
    }

    pub(crate) fn new_encoding_failure(source: impl Into<ErrorSource>) -> Self {
        MqttError::EncodingFailure(EncodingFailureContext { source: source.into() })
    }

    pub(crate) fn new_protocol_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::ProtocolError(ProtocolErrorContext { source: source.into() })
    }

    pub(crate) fn new_inbound_topic_alias_not_valid(source: impl Into<ErrorSource>) -> Self {
        MqttError::InboundTopicAliasNotValid(InboundTopicAliasNotValidContext { source: source.into() })
    }

    pub(crate) fn new_packet_ids_exhausted() -> Self {
        MqttError::PacketIdsExhausted(PacketIdsExhaustedContext {})
    }

    pub(crate) fn new_not_connected() -> Self {
        MqttError::NotConnected(NotConnectedContext {})
    }

    pub(crate) fn new_buffer_full() -> Self {
        MqttError::BufferFull(BufferFullContext {})
    }

    /// Constructs a ConnectionEstablishmentFailure from an underlying error.
    pub fn new_connection_establishment_failure(source: impl Into<ErrorSource>) -> Self {
        MqttError::ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext { source: source.into() })
    }

    /// Constructs a ConnectionClosed from an underlying error.
    pub fn new_connection_closed(source: impl Into<ErrorSource>) -> Self {
        MqttError::ConnectionClosed(ConnectionClosedContext { source: source.into() })
    }

    /// Constructs a TransportError from an underlying error.  Typically this
    /// wraps a websocket or TLS library error.
    pub fn new_transport_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::TransportError(TransportErrorContext { source: source.into() })
    }

    pub(crate) fn new_client_closed() -> Self {
        MqttError::ClientClosed(ClientClosedContext {})
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        MqttError::UserInitiatedDisconnect(UserInitiatedDisconnectContext {})
    }

    pub(crate) fn new_internal_state_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::InternalStateError(InternalStateErrorContext { source: source.into() })
    }

    pub(crate) fn new_unimplemented(source: impl Into<ErrorSource>) -> Self {
        MqttError::Unimplemented(UnimplementedContext { source: source.into() })
    }

    /// Constructs a StdIoError from an existing `std::io::Error`.
    pub fn new_std_io_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::StdIoError(StdIoErrorContext { source: source.into() })
    }

    /// Constructs a TlsError from an underlying error.
    pub fn new_tls_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::TlsError(TlsErrorContext { source: source.into() })
    }

    /// Constructs a PersistenceFailure from an underlying error.
    pub fn new_persistence_failure(source: impl Into<ErrorSource>) -> Self {
        MqttError::PersistenceFailure(PersistenceFailureContext { source: source.into() })
    }
}

impl Error for MqttError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttError::DecodingFailure(context) => { Some(context.source.as_ref()) }
            MqttError::EncodingFailure(context) => { Some(context.source.as_ref()) }
            MqttError::ProtocolError(context) => { Some(context.source.as_ref()) }
            MqttError::InboundTopicAliasNotValid(context) => { Some(context.source.as_ref()) }
            MqttError::ConnectionEstablishmentFailure(context) => { Some(context.source.as_ref()) }
            MqttError::ConnectionClosed(context) => { Some(context.source.as_ref()) }
            MqttError::TransportError(context) => { Some(context.source.as_ref()) }
            MqttError::InternalStateError(context) => { Some(context.source.as_ref()) }
            MqttError::Unimplemented(context) => { Some(context.source.as_ref()) }
            MqttError::StdIoError(context) => { Some(context.source.as_ref()) }
            MqttError::TlsError(context) => { Some(context.source.as_ref()) }
            MqttError::PersistenceFailure(context) => { Some(context.source.as_ref()) }
            _ => { None }
        }
    }
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::DecodingFailure(_) => {
                write!(f, "failure decoding an incoming MQTT packet")
            }
            MqttError::EncodingFailure(_) => {
                write!(f, "failure encoding an outbound MQTT packet")
            }
            MqttError::ProtocolError(_) => {
                write!(f, "broker behavior disallowed by the mqtt specification")
            }
            MqttError::InboundTopicAliasNotValid(_) => {
                write!(f, "topic alias value on an incoming publish is not valid")
            }
            MqttError::PacketIdsExhausted(_) => {
                write!(f, "no unused packet ids remain; too many unacknowledged operations in flight")
            }
            MqttError::NotConnected(_) => {
                write!(f, "operation submitted while offline with offline buffering disabled")
            }
            MqttError::BufferFull(_) => {
                write!(f, "offline buffer is full and the queue policy rejects new entries")
            }
            MqttError::ConnectionEstablishmentFailure(_) => {
                write!(f, "failed to establish an MQTT connection to the broker")
            }
            MqttError::ConnectionClosed(_) => {
                write!(f, "client connection was closed; source contains further details")
            }
            MqttError::TransportError(_) => {
                write!(f, "transport adapter failure; source contains further details")
            }
            MqttError::ClientClosed(_) => {
                write!(f, "the operation was incomplete when the client was closed")
            }
            MqttError::UserInitiatedDisconnect(_) => {
                write!(f, "connection was shut down by user action")
            }
            MqttError::InternalStateError(_) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug")
            }
            MqttError::Unimplemented(_) => {
                write!(f, "attempt to invoke functionality that is not implemented")
            }
            MqttError::StdIoError(_) => {
                write!(f, "i/o error; source contains further details")
            }
            MqttError::TlsError(_) => {
                write!(f, "error applying tls configuration")
            }
            MqttError::PersistenceFailure(_) => {
                write!(f, "error reading or writing the durable session store")
            }
        }
    }
}

impl From<std::io::Error> for MqttError {
    fn from(error: std::io::Error) -> Self {
        MqttError::new_std_io_error(error)
    }
}

impl From<core::str::Utf8Error> for MqttError {
    fn from(err: core::str::Utf8Error) -> Self {
        MqttError::new_decoding_failure(err)
    }
}

impl From<rustls_pki_types::InvalidDnsNameError> for MqttError {
    fn from(err: rustls_pki_types::InvalidDnsNameError) -> Self {
        MqttError::new_connection_establishment_failure(err)
    }
}

impl From<tungstenite::error::Error> for MqttError {
    fn from(err: tungstenite::error::Error) -> Self {
        MqttError::new_transport_error(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type MqttResult<T> = Result<T, MqttError>;
