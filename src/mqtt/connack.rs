use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Server response to a CONNECT.  Carries the session-present flag, the
/// connection outcome, and every limit the server advertises for the life of
/// the connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnackPacket {
    /// True when the server resumed existing session state.
    pub session_present: bool,

    /// Connection outcome.
    pub reason_code: ConnectReasonCode,

    /// Server override of the requested session expiry.
    pub session_expiry_interval_seconds: Option<u32>,

    /// Most concurrent unacknowledged QoS 1/2 publishes the server accepts.
    pub receive_maximum: Option<u16>,

    /// Highest QoS the server supports.
    pub maximum_qos: Option<QualityOfService>,

    /// Whether the server supports retained messages.
    pub retain_available: Option<bool>,

    /// Largest packet the server accepts.
    pub maximum_packet_size_bytes: Option<u32>,

    /// Client id chosen by the server when the client sent an empty one.
    pub assigned_client_identifier: Option<String>,

    /// Most topic aliases the server accepts on outbound publishes.
    pub topic_alias_maximum: Option<u16>,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the server.
    pub user_properties: Option<Vec<UserProperty>>,

    /// Whether the server supports wildcard subscription filters.
    pub wildcard_subscriptions_available: Option<bool>,

    /// Whether the server supports subscription identifiers.
    pub subscription_identifiers_available: Option<bool>,

    /// Whether the server supports shared subscriptions.
    pub shared_subscriptions_available: Option<bool>,

    /// Keep alive the server requires, overriding the CONNECT value.
    pub server_keep_alive: Option<u16>,

    /// Response information for request/response topic construction.
    pub response_information: Option<String>,

    /// Alternate server the client should use.
    pub server_reference: Option<String>,

    /// Extended authentication method name.
    pub authentication_method: Option<String>,

    /// Extended authentication payload.
    pub authentication_data: Option<Vec<u8>>,
}

fn compute_connack_property_length(packet: &ConnackPacket) -> usize {
    optional_u32_property_length(&packet.session_expiry_interval_seconds)
        + optional_u16_property_length(&packet.receive_maximum)
        + optional_u8_property_length(&packet.maximum_qos)
        + optional_u8_property_length(&packet.retain_available)
        + optional_u32_property_length(&packet.maximum_packet_size_bytes)
        + optional_string_property_length(&packet.assigned_client_identifier)
        + optional_u16_property_length(&packet.topic_alias_maximum)
        + optional_string_property_length(&packet.reason_string)
        + user_properties_length(&packet.user_properties)
        + optional_u8_property_length(&packet.wildcard_subscriptions_available)
        + optional_u8_property_length(&packet.subscription_identifiers_available)
        + optional_u8_property_length(&packet.shared_subscriptions_available)
        + optional_u16_property_length(&packet.server_keep_alive)
        + optional_string_property_length(&packet.response_information)
        + optional_string_property_length(&packet.server_reference)
        + optional_string_property_length(&packet.authentication_method)
        + optional_binary_property_length(&packet.authentication_data)
}

pub(crate) fn encode_connack(packet: &ConnackPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = compute_connack_property_length(packet);
    let remaining_length = 2 + vli_length(property_length)? + property_length;

    dest.push(CONNACK_FIRST_BYTE);
    write_vli(dest, remaining_length)?;
    dest.push(packet.session_present as u8);
    dest.push(packet.reason_code as u8);

    write_vli(dest, property_length)?;
    write_optional_u32_property(dest, PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, packet.session_expiry_interval_seconds);
    write_optional_u16_property(dest, PROPERTY_KEY_RECEIVE_MAXIMUM, packet.receive_maximum);
    write_optional_u8_property(dest, PROPERTY_KEY_MAXIMUM_QOS, packet.maximum_qos.map(|v| v as u8));
    write_optional_bool_property(dest, PROPERTY_KEY_RETAIN_AVAILABLE, packet.retain_available);
    write_optional_u32_property(dest, PROPERTY_KEY_MAXIMUM_PACKET_SIZE, packet.maximum_packet_size_bytes);
    write_optional_string_property(dest, PROPERTY_KEY_ASSIGNED_CLIENT_IDENTIFIER, &packet.assigned_client_identifier)?;
    write_optional_u16_property(dest, PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM, packet.topic_alias_maximum);
    write_optional_string_property(dest, PROPERTY_KEY_REASON_STRING, &packet.reason_string)?;
    write_user_properties(dest, &packet.user_properties)?;
    write_optional_bool_property(dest, PROPERTY_KEY_WILDCARD_SUBSCRIPTIONS_AVAILABLE, packet.wildcard_subscriptions_available);
    write_optional_bool_property(dest, PROPERTY_KEY_SUBSCRIPTION_IDENTIFIERS_AVAILABLE, packet.subscription_identifiers_available);
    write_optional_bool_property(dest, PROPERTY_KEY_SHARED_SUBSCRIPTIONS_AVAILABLE, packet.shared_subscriptions_available);
    write_optional_u16_property(dest, PROPERTY_KEY_SERVER_KEEP_ALIVE, packet.server_keep_alive);
    write_optional_string_property(dest, PROPERTY_KEY_RESPONSE_INFORMATION, &packet.response_information)?;
    write_optional_string_property(dest, PROPERTY_KEY_SERVER_REFERENCE, &packet.server_reference)?;
    write_optional_string_property(dest, PROPERTY_KEY_AUTHENTICATION_METHOD, &packet.authentication_method)?;
    write_optional_binary_property(dest, PROPERTY_KEY_AUTHENTICATION_DATA, &packet.authentication_data)?;

    Ok(())
}

pub(crate) fn decode_connack(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != CONNACK_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for a connack packet"));
    }

    let mut packet = ConnackPacket::default();

    let mut flags = 0;
    let mut bytes = decode_u8(packet_body, &mut flags)?;
    if (flags & 0xFE) != 0 {
        return Err(MqttError::new_decoding_failure("connack flags reserved bits must be zero"));
    }
    packet.session_present = (flags & 0x01) != 0;

    bytes = decode_u8_as_enum(bytes, &mut packet.reason_code, convert_u8_to_connect_reason_code)?;

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length != bytes.len() {
        return Err(MqttError::new_decoding_failure("connack property length does not match remaining packet length"));
    }

    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_SESSION_EXPIRY_INTERVAL => { bytes = decode_optional_u32(bytes, &mut packet.session_expiry_interval_seconds)?; }
            PROPERTY_KEY_RECEIVE_MAXIMUM => { bytes = decode_optional_u16(bytes, &mut packet.receive_maximum)?; }
            PROPERTY_KEY_MAXIMUM_QOS => {
                let mut value = QualityOfService::AtMostOnce;
                bytes = decode_u8_as_enum(bytes, &mut value, convert_u8_to_quality_of_service)?;
                packet.maximum_qos = Some(value);
            }
            PROPERTY_KEY_RETAIN_AVAILABLE => { bytes = decode_optional_u8_as_bool(bytes, &mut packet.retain_available)?; }
            PROPERTY_KEY_MAXIMUM_PACKET_SIZE => { bytes = decode_optional_u32(bytes, &mut packet.maximum_packet_size_bytes)?; }
            PROPERTY_KEY_ASSIGNED_CLIENT_IDENTIFIER => { bytes = decode_optional_string(bytes, &mut packet.assigned_client_identifier)?; }
            PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM => { bytes = decode_optional_u16(bytes, &mut packet.topic_alias_maximum)?; }
            PROPERTY_KEY_REASON_STRING => { bytes = decode_optional_string(bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut packet.user_properties)?; }
            PROPERTY_KEY_WILDCARD_SUBSCRIPTIONS_AVAILABLE => { bytes = decode_optional_u8_as_bool(bytes, &mut packet.wildcard_subscriptions_available)?; }
            PROPERTY_KEY_SUBSCRIPTION_IDENTIFIERS_AVAILABLE => { bytes = decode_optional_u8_as_bool(bytes, &mut packet.subscription_identifiers_available)?; }
            PROPERTY_KEY_SHARED_SUBSCRIPTIONS_AVAILABLE => { bytes = decode_optional_u8_as_bool(bytes, &mut packet.shared_subscriptions_available)?; }
            PROPERTY_KEY_SERVER_KEEP_ALIVE => { bytes = decode_optional_u16(bytes, &mut packet.server_keep_alive)?; }
            PROPERTY_KEY_RESPONSE_INFORMATION => { bytes = decode_optional_string(bytes, &mut packet.response_information)?; }
            PROPERTY_KEY_SERVER_REFERENCE => { bytes = decode_optional_string(bytes, &mut packet.server_reference)?; }
            PROPERTY_KEY_AUTHENTICATION_METHOD => { bytes = decode_optional_string(bytes, &mut packet.authentication_method)?; }
            PROPERTY_KEY_AUTHENTICATION_DATA => { bytes = decode_optional_binary(bytes, &mut packet.authentication_data)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for a connack packet"));
            }
        }
    }

    Ok(MqttPacket::Connack(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn connack_round_trip_minimal() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
    }

    #[test]
    fn connack_round_trip_rejection() {
        let packet = ConnackPacket {
            reason_code: ConnectReasonCode::ServerBusy,
            reason_string: Some("maintenance window".to_string()),
            server_reference: Some("standby.example.com:1883".to_string()),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
    }

    #[test]
    fn connack_round_trip_all_server_limits() {
        let packet = ConnackPacket {
            session_present: true,
            reason_code: ConnectReasonCode::Success,
            session_expiry_interval_seconds: Some(7200),
            receive_maximum: Some(10),
            maximum_qos: Some(QualityOfService::AtLeastOnce),
            retain_available: Some(true),
            maximum_packet_size_bytes: Some(256 * 1024),
            assigned_client_identifier: Some("auto-91f2".to_string()),
            topic_alias_maximum: Some(16),
            reason_string: None,
            user_properties: Some(vec![
                UserProperty { name: "broker".to_string(), value: "test-fixture".to_string() },
            ]),
            wildcard_subscriptions_available: Some(true),
            subscription_identifiers_available: Some(true),
            shared_subscriptions_available: Some(false),
            server_keep_alive: Some(45),
            response_information: Some("replies/".to_string()),
            server_reference: None,
            authentication_method: None,
            authentication_data: None,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
    }

    #[test]
    fn connack_decode_rejects_reserved_flag_bits() {
        let bytes = vec![CONNACK_FIRST_BYTE, 3, 0x02, 0, 0];
        assert!(decode_connack(bytes[0], &bytes[2..]).is_err());
    }
}
