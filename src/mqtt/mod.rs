/*!
Structured data types modeling the MQTT5 control packets.
 */

pub(crate) mod auth;
pub(crate) mod connack;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod ping;
pub(crate) mod puback;
pub(crate) mod pubcomp;
pub(crate) mod publish;
pub(crate) mod pubrec;
pub(crate) mod pubrel;
pub(crate) mod suback;
pub(crate) mod subscribe;
pub(crate) mod unsuback;
pub(crate) mod unsubscribe;

use crate::error::{MqttError, MqttResult};

use std::fmt;

pub use auth::AuthPacket;
pub use connack::ConnackPacket;
pub use connect::ConnectPacket;
pub use disconnect::DisconnectPacket;
pub use ping::{PingreqPacket, PingrespPacket};
pub use puback::PubackPacket;
pub use pubcomp::PubcompPacket;
pub use publish::PublishPacket;
pub use pubrec::PubrecPacket;
pub use pubrel::PubrelPacket;
pub use suback::SubackPacket;
pub use subscribe::SubscribePacket;
pub use unsuback::UnsubackPacket;
pub use unsubscribe::UnsubscribePacket;

macro_rules! define_u8_conversion {
    ($enum_type: ident, $function_name: ident, [$(($variant: ident, $value: expr)),+]) => {
        pub(crate) fn $function_name(value: u8) -> MqttResult<$enum_type> {
            match value {
                $($value => { Ok($enum_type::$variant) })+
                _ => {
                    Err(MqttError::new_decoding_failure(
                        format!("{} is not a valid {} value", value, stringify!($enum_type))))
                }
            }
        }

        impl TryFrom<u8> for $enum_type {
            type Error = MqttError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                $function_name(value)
            }
        }
    };
}

/// MQTT message delivery quality of service.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901234) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum QualityOfService {

    /// The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// The message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// The message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

define_u8_conversion!(QualityOfService, convert_u8_to_quality_of_service, [
    (AtMostOnce, 0), (AtLeastOnce, 1), (ExactlyOnce, 2)
]);

/// Optional property describing a PUBLISH payload's format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PayloadFormatIndicator {

    /// The payload is arbitrary binary data.
    #[default]
    Bytes = 0,

    /// The payload is a well-formed utf-8 string value.
    Utf8 = 1,
}

define_u8_conversion!(PayloadFormatIndicator, convert_u8_to_payload_format_indicator, [
    (Bytes, 0), (Utf8, 1)
]);

/// Configures how retained messages are handled when a subscription's filter
/// matches topics with retained messages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetainHandlingType {

    /// Always send matching retained messages on subscribe.
    #[default]
    SendOnSubscribe = 0,

    /// Send matching retained messages only if the subscription is new.
    SendOnSubscribeIfNew = 1,

    /// Never send retained messages on subscribe.
    DontSend = 2,
}

define_u8_conversion!(RetainHandlingType, convert_u8_to_retain_handling_type, [
    (SendOnSubscribe, 0), (SendOnSubscribeIfNew, 1), (DontSend, 2)
]);

/// Server reason code for a connection attempt, from the CONNACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    #[default]
    Success = 0,
    /// The server does not wish to reveal a failure reason.
    UnspecifiedError = 128,
    /// The CONNECT packet could not be parsed.
    MalformedPacket = 129,
    /// The CONNECT packet does not conform to the specification.
    ProtocolError = 130,
    /// Valid CONNECT, rejected for server-specific reasons.
    ImplementationSpecificError = 131,
    /// The requested protocol version is not supported.
    UnsupportedProtocolVersion = 132,
    /// The client identifier is a valid string but not allowed.
    ClientIdentifierNotValid = 133,
    /// Bad user name or password.
    BadUsernameOrPassword = 134,
    /// The client is not authorized to connect.
    NotAuthorized = 135,
    /// The server is not available.
    ServerUnavailable = 136,
    /// The server is busy; try later.
    ServerBusy = 137,
    /// The client has been banned by administrative action.
    Banned = 138,
    /// The authentication method is not supported.
    BadAuthenticationMethod = 140,
    /// The will topic name is malformed.
    TopicNameInvalid = 144,
    /// The CONNECT packet exceeded the server's maximum packet size.
    PacketTooLarge = 149,
    /// An implementation or administrative limit was exceeded.
    QuotaExceeded = 151,
    /// The will payload does not match its payload format indicator.
    PayloadFormatInvalid = 153,
    /// Retain is requested but not supported by the server.
    RetainNotSupported = 154,
    /// The will QoS is not supported by the server.
    QosNotSupported = 155,
    /// The client should temporarily use another server.
    UseAnotherServer = 156,
    /// The client should permanently use another server.
    ServerMoved = 157,
    /// The connection rate limit has been exceeded.
    ConnectionRateExceeded = 159,
}

define_u8_conversion!(ConnectReasonCode, convert_u8_to_connect_reason_code, [
    (Success, 0), (UnspecifiedError, 128), (MalformedPacket, 129), (ProtocolError, 130),
    (ImplementationSpecificError, 131), (UnsupportedProtocolVersion, 132),
    (ClientIdentifierNotValid, 133), (BadUsernameOrPassword, 134), (NotAuthorized, 135),
    (ServerUnavailable, 136), (ServerBusy, 137), (Banned, 138), (BadAuthenticationMethod, 140),
    (TopicNameInvalid, 144), (PacketTooLarge, 149), (QuotaExceeded, 151),
    (PayloadFormatInvalid, 153), (RetainNotSupported, 154), (QosNotSupported, 155),
    (UseAnotherServer, 156), (ServerMoved, 157), (ConnectionRateExceeded, 159)
]);

/// Reason code for a PUBACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubackReasonCode {
    /// The message was accepted.
    #[default]
    Success = 0,
    /// The message was accepted but there were no matching subscribers.
    NoMatchingSubscribers = 16,
    /// The receiver does not wish to reveal a failure reason.
    UnspecifiedError = 128,
    /// Valid publish, rejected for receiver-specific reasons.
    ImplementationSpecificError = 131,
    /// The sender is not authorized to publish to the topic.
    NotAuthorized = 135,
    /// The topic name is malformed.
    TopicNameInvalid = 144,
    /// The packet id is already in use on the receiver.
    PacketIdentifierInUse = 145,
    /// An implementation or administrative limit was exceeded.
    QuotaExceeded = 151,
    /// The payload does not match its payload format indicator.
    PayloadFormatInvalid = 153,
}

define_u8_conversion!(PubackReasonCode, convert_u8_to_puback_reason_code, [
    (Success, 0), (NoMatchingSubscribers, 16), (UnspecifiedError, 128),
    (ImplementationSpecificError, 131), (NotAuthorized, 135), (TopicNameInvalid, 144),
    (PacketIdentifierInUse, 145), (QuotaExceeded, 151), (PayloadFormatInvalid, 153)
]);

/// Reason code for a PUBREC packet.  Values mirror the PUBACK registry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrecReasonCode {
    /// The message was accepted.
    #[default]
    Success = 0,
    /// The message was accepted but there were no matching subscribers.
    NoMatchingSubscribers = 16,
    /// The receiver does not wish to reveal a failure reason.
    UnspecifiedError = 128,
    /// Valid publish, rejected for receiver-specific reasons.
    ImplementationSpecificError = 131,
    /// The sender is not authorized to publish to the topic.
    NotAuthorized = 135,
    /// The topic name is malformed.
    TopicNameInvalid = 144,
    /// The packet id is already in use on the receiver.
    PacketIdentifierInUse = 145,
    /// An implementation or administrative limit was exceeded.
    QuotaExceeded = 151,
    /// The payload does not match its payload format indicator.
    PayloadFormatInvalid = 153,
}

define_u8_conversion!(PubrecReasonCode, convert_u8_to_pubrec_reason_code, [
    (Success, 0), (NoMatchingSubscribers, 16), (UnspecifiedError, 128),
    (ImplementationSpecificError, 131), (NotAuthorized, 135), (TopicNameInvalid, 144),
    (PacketIdentifierInUse, 145), (QuotaExceeded, 151), (PayloadFormatInvalid, 153)
]);

/// Reason code for a PUBREL packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrelReasonCode {
    /// The release was accepted.
    #[default]
    Success = 0,
    /// No pending QoS 2 exchange exists for the packet id.
    PacketIdentifierNotFound = 146,
}

define_u8_conversion!(PubrelReasonCode, convert_u8_to_pubrel_reason_code, [
    (Success, 0), (PacketIdentifierNotFound, 146)
]);

/// Reason code for a PUBCOMP packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubcompReasonCode {
    /// The release was completed.
    #[default]
    Success = 0,
    /// No pending QoS 2 exchange exists for the packet id.
    PacketIdentifierNotFound = 146,
}

define_u8_conversion!(PubcompReasonCode, convert_u8_to_pubcomp_reason_code, [
    (Success, 0), (PacketIdentifierNotFound, 146)
]);

/// Per-filter reason code in a SUBACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReasonCode {
    /// The subscription was accepted at QoS 0.
    #[default]
    GrantedQos0 = 0,
    /// The subscription was accepted at QoS 1.
    GrantedQos1 = 1,
    /// The subscription was accepted at QoS 2.
    GrantedQos2 = 2,
    /// The server does not wish to reveal a failure reason.
    UnspecifiedError = 128,
    /// Valid subscribe, rejected for server-specific reasons.
    ImplementationSpecificError = 131,
    /// The client is not authorized to make the subscription.
    NotAuthorized = 135,
    /// The topic filter is malformed.
    TopicFilterInvalid = 143,
    /// The packet id is already in use on the server.
    PacketIdentifierInUse = 145,
    /// An implementation or administrative limit was exceeded.
    QuotaExceeded = 151,
    /// Shared subscriptions are not supported by the server.
    SharedSubscriptionsNotSupported = 158,
    /// Subscription identifiers are not supported by the server.
    SubscriptionIdentifiersNotSupported = 161,
    /// Wildcard filters are not supported by the server.
    WildcardSubscriptionsNotSupported = 162,
}

define_u8_conversion!(SubackReasonCode, convert_u8_to_suback_reason_code, [
    (GrantedQos0, 0), (GrantedQos1, 1), (GrantedQos2, 2), (UnspecifiedError, 128),
    (ImplementationSpecificError, 131), (NotAuthorized, 135), (TopicFilterInvalid, 143),
    (PacketIdentifierInUse, 145), (QuotaExceeded, 151), (SharedSubscriptionsNotSupported, 158),
    (SubscriptionIdentifiersNotSupported, 161), (WildcardSubscriptionsNotSupported, 162)
]);

/// Per-filter reason code in an UNSUBACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UnsubackReasonCode {
    /// The subscription was removed.
    #[default]
    Success = 0,
    /// No matching subscription existed.
    NoSubscriptionExisted = 17,
    /// The server does not wish to reveal a failure reason.
    UnspecifiedError = 128,
    /// Valid unsubscribe, rejected for server-specific reasons.
    ImplementationSpecificError = 131,
    /// The client is not authorized to unsubscribe.
    NotAuthorized = 135,
    /// The topic filter is malformed.
    TopicFilterInvalid = 143,
    /// The packet id is already in use on the server.
    PacketIdentifierInUse = 145,
}

define_u8_conversion!(UnsubackReasonCode, convert_u8_to_unsuback_reason_code, [
    (Success, 0), (NoSubscriptionExisted, 17), (UnspecifiedError, 128),
    (ImplementationSpecificError, 131), (NotAuthorized, 135), (TopicFilterInvalid, 143),
    (PacketIdentifierInUse, 145)
]);

/// Reason code for a DISCONNECT packet, in either direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DisconnectReasonCode {
    /// Close the connection normally; do not send the will.
    #[default]
    NormalDisconnection = 0,
    /// Close the connection normally but send the will.
    DisconnectWithWillMessage = 4,
    /// The sender does not wish to reveal a reason.
    UnspecifiedError = 128,
    /// A packet could not be parsed.
    MalformedPacket = 129,
    /// A packet did not conform to the specification.
    ProtocolError = 130,
    /// Valid packet, rejected for implementation-specific reasons.
    ImplementationSpecificError = 131,
    /// The request is not authorized.
    NotAuthorized = 135,
    /// The server is busy.
    ServerBusy = 137,
    /// The server is shutting down.
    ServerShuttingDown = 139,
    /// The keep alive contract was violated.
    KeepAliveTimeout = 141,
    /// Another connection using the same client id has connected.
    SessionTakenOver = 142,
    /// A topic filter is malformed.
    TopicFilterInvalid = 143,
    /// A topic name is malformed.
    TopicNameInvalid = 144,
    /// More publishes were received than the receive maximum allows.
    ReceiveMaximumExceeded = 147,
    /// A topic alias is outside the negotiated range.
    TopicAliasInvalid = 148,
    /// A packet exceeded the receiver's maximum packet size.
    PacketTooLarge = 149,
    /// The message rate is too high.
    MessageRateTooHigh = 150,
    /// An implementation or administrative limit was exceeded.
    QuotaExceeded = 151,
    /// The connection is closed due to administrative action.
    AdministrativeAction = 152,
    /// A payload does not match its payload format indicator.
    PayloadFormatInvalid = 153,
    /// Retain is not supported.
    RetainNotSupported = 154,
    /// The QoS is not supported.
    QosNotSupported = 155,
    /// Temporarily use another server.
    UseAnotherServer = 156,
    /// Permanently use another server.
    ServerMoved = 157,
    /// Shared subscriptions are not supported.
    SharedSubscriptionsNotSupported = 158,
    /// The connection rate limit has been exceeded.
    ConnectionRateExceeded = 159,
    /// The maximum connect time has been exceeded.
    MaximumConnectTime = 160,
    /// Subscription identifiers are not supported.
    SubscriptionIdentifiersNotSupported = 161,
    /// Wildcard subscriptions are not supported.
    WildcardSubscriptionsNotSupported = 162,
}

define_u8_conversion!(DisconnectReasonCode, convert_u8_to_disconnect_reason_code, [
    (NormalDisconnection, 0), (DisconnectWithWillMessage, 4), (UnspecifiedError, 128),
    (MalformedPacket, 129), (ProtocolError, 130), (ImplementationSpecificError, 131),
    (NotAuthorized, 135), (ServerBusy, 137), (ServerShuttingDown, 139), (KeepAliveTimeout, 141),
    (SessionTakenOver, 142), (TopicFilterInvalid, 143), (TopicNameInvalid, 144),
    (ReceiveMaximumExceeded, 147), (TopicAliasInvalid, 148), (PacketTooLarge, 149),
    (MessageRateTooHigh, 150), (QuotaExceeded, 151), (AdministrativeAction, 152),
    (PayloadFormatInvalid, 153), (RetainNotSupported, 154), (QosNotSupported, 155),
    (UseAnotherServer, 156), (ServerMoved, 157), (SharedSubscriptionsNotSupported, 158),
    (ConnectionRateExceeded, 159), (MaximumConnectTime, 160),
    (SubscriptionIdentifiersNotSupported, 161), (WildcardSubscriptionsNotSupported, 162)
]);

/// Reason code for an AUTH packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AuthenticateReasonCode {
    /// Authentication is complete.
    #[default]
    Success = 0,
    /// Continue the authentication exchange.
    ContinueAuthentication = 24,
    /// Initiate re-authentication.
    ReAuthenticate = 25,
}

define_u8_conversion!(AuthenticateReasonCode, convert_u8_to_authenticate_reason_code, [
    (Success, 0), (ContinueAuthentication, 24), (ReAuthenticate, 25)
]);

/// An arbitrary name-value pair attachable to most packets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserProperty {
    /// Property name; need not be unique within a packet.
    pub name: String,

    /// Property value.
    pub value: String,
}

impl fmt::Display for UserProperty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(\"{}\", \"{}\")", self.name, self.value)
    }
}

/// A single subscription entry within a SUBSCRIBE packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {
    /// Topic filter to subscribe to.
    pub topic_filter: String,

    /// Maximum QoS the server may use when forwarding matching messages.
    pub qos: QualityOfService,

    /// Do not forward messages this client itself published.
    pub no_local: bool,

    /// Preserve the retain flag on forwarded messages.
    pub retain_as_published: bool,

    /// Retained-message behavior on subscription establishment.
    pub retain_handling_type: RetainHandlingType,
}

/// Algebraic union of all MQTT5 control packets.
#[derive(Clone, Debug, PartialEq)]
pub enum MqttPacket {
    /// Client-to-server connection request
    Connect(ConnectPacket),
    /// Server connection acknowledgement
    Connack(ConnackPacket),
    /// Application message, either direction
    Publish(PublishPacket),
    /// QoS 1 publish acknowledgement
    Puback(PubackPacket),
    /// First acknowledgement of a QoS 2 publish
    Pubrec(PubrecPacket),
    /// QoS 2 release
    Pubrel(PubrelPacket),
    /// Final acknowledgement of a QoS 2 exchange
    Pubcomp(PubcompPacket),
    /// Subscription request
    Subscribe(SubscribePacket),
    /// Subscription acknowledgement
    Suback(SubackPacket),
    /// Subscription removal request
    Unsubscribe(UnsubscribePacket),
    /// Subscription removal acknowledgement
    Unsuback(UnsubackPacket),
    /// Keep-alive probe
    Pingreq(PingreqPacket),
    /// Keep-alive response
    Pingresp(PingrespPacket),
    /// Connection shutdown notice, either direction
    Disconnect(DisconnectPacket),
    /// Enhanced authentication exchange
    Auth(AuthPacket),
}

/// Discriminant-only view of [`MqttPacket`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// A Connect packet
    Connect,
    /// A Connack packet
    Connack,
    /// A Publish packet
    Publish,
    /// A Puback packet
    Puback,
    /// A Pubrec packet
    Pubrec,
    /// A Pubrel packet
    Pubrel,
    /// A Pubcomp packet
    Pubcomp,
    /// A Subscribe packet
    Subscribe,
    /// A Suback packet
    Suback,
    /// An Unsubscribe packet
    Unsubscribe,
    /// An Unsuback packet
    Unsuback,
    /// A Pingreq packet
    Pingreq,
    /// A Pingresp packet
    Pingresp,
    /// A Disconnect packet
    Disconnect,
    /// An Auth packet
    Auth,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", packet_type_to_str(*self))
    }
}

pub(crate) fn packet_type_of(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => PacketType::Connect,
        MqttPacket::Connack(_) => PacketType::Connack,
        MqttPacket::Publish(_) => PacketType::Publish,
        MqttPacket::Puback(_) => PacketType::Puback,
        MqttPacket::Pubrec(_) => PacketType::Pubrec,
        MqttPacket::Pubrel(_) => PacketType::Pubrel,
        MqttPacket::Pubcomp(_) => PacketType::Pubcomp,
        MqttPacket::Subscribe(_) => PacketType::Subscribe,
        MqttPacket::Suback(_) => PacketType::Suback,
        MqttPacket::Unsubscribe(_) => PacketType::Unsubscribe,
        MqttPacket::Unsuback(_) => PacketType::Unsuback,
        MqttPacket::Pingreq(_) => PacketType::Pingreq,
        MqttPacket::Pingresp(_) => PacketType::Pingresp,
        MqttPacket::Disconnect(_) => PacketType::Disconnect,
        MqttPacket::Auth(_) => PacketType::Auth,
    }
}

pub(crate) fn packet_type_to_str(packet_type: PacketType) -> &'static str {
    match packet_type {
        PacketType::Connect => "CONNECT",
        PacketType::Connack => "CONNACK",
        PacketType::Publish => "PUBLISH",
        PacketType::Puback => "PUBACK",
        PacketType::Pubrec => "PUBREC",
        PacketType::Pubrel => "PUBREL",
        PacketType::Pubcomp => "PUBCOMP",
        PacketType::Subscribe => "SUBSCRIBE",
        PacketType::Suback => "SUBACK",
        PacketType::Unsubscribe => "UNSUBSCRIBE",
        PacketType::Unsuback => "UNSUBACK",
        PacketType::Pingreq => "PINGREQ",
        PacketType::Pingresp => "PINGRESP",
        PacketType::Disconnect => "DISCONNECT",
        PacketType::Auth => "AUTH",
    }
}

/// Returns the packet id bound to a packet, if its type defines one.
pub(crate) fn packet_id_of(packet: &MqttPacket) -> Option<u16> {
    match packet {
        MqttPacket::Publish(publish) => {
            if publish.qos == QualityOfService::AtMostOnce { None } else { Some(publish.packet_id) }
        }
        MqttPacket::Puback(puback) => Some(puback.packet_id),
        MqttPacket::Pubrec(pubrec) => Some(pubrec.packet_id),
        MqttPacket::Pubrel(pubrel) => Some(pubrel.packet_id),
        MqttPacket::Pubcomp(pubcomp) => Some(pubcomp.packet_id),
        MqttPacket::Subscribe(subscribe) => Some(subscribe.packet_id),
        MqttPacket::Suback(suback) => Some(suback.packet_id),
        MqttPacket::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
        MqttPacket::Unsuback(unsuback) => Some(unsuback.packet_id),
        _ => None,
    }
}
