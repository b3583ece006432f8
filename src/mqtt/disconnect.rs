use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Connection shutdown notice, valid in either direction once a CONNACK has
/// been exchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisconnectPacket {
    /// Why the connection is being closed.
    pub reason_code: DisconnectReasonCode,

    /// Client override of the session expiry negotiated at connect time.
    pub session_expiry_interval_seconds: Option<u32>,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,

    /// Alternate server the client should use.  Server-to-client only.
    pub server_reference: Option<String>,
}

pub(crate) fn encode_disconnect(packet: &DisconnectPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = optional_u32_property_length(&packet.session_expiry_interval_seconds)
        + optional_string_property_length(&packet.reason_string)
        + user_properties_length(&packet.user_properties)
        + optional_string_property_length(&packet.server_reference);

    dest.push(DISCONNECT_FIRST_BYTE);

    if property_length == 0 && packet.reason_code == DisconnectReasonCode::NormalDisconnection {
        write_vli(dest, 0)?;
        return Ok(());
    }

    let remaining_length = 1 + vli_length(property_length)? + property_length;
    write_vli(dest, remaining_length)?;
    dest.push(packet.reason_code as u8);

    write_vli(dest, property_length)?;
    write_optional_u32_property(dest, PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, packet.session_expiry_interval_seconds);
    write_optional_string_property(dest, PROPERTY_KEY_REASON_STRING, &packet.reason_string)?;
    write_user_properties(dest, &packet.user_properties)?;
    write_optional_string_property(dest, PROPERTY_KEY_SERVER_REFERENCE, &packet.server_reference)?;

    Ok(())
}

pub(crate) fn decode_disconnect(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != DISCONNECT_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for a disconnect packet"));
    }

    let mut packet = DisconnectPacket::default();

    if packet_body.is_empty() {
        /* zero-length body means normal disconnection */
        return Ok(MqttPacket::Disconnect(packet));
    }

    let mut bytes = decode_u8_as_enum(packet_body, &mut packet.reason_code, convert_u8_to_disconnect_reason_code)?;
    if bytes.is_empty() {
        return Ok(MqttPacket::Disconnect(packet));
    }

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length != bytes.len() {
        return Err(MqttError::new_decoding_failure("disconnect property length does not match remaining packet length"));
    }

    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_SESSION_EXPIRY_INTERVAL => { bytes = decode_optional_u32(bytes, &mut packet.session_expiry_interval_seconds)?; }
            PROPERTY_KEY_REASON_STRING => { bytes = decode_optional_string(bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut packet.user_properties)?; }
            PROPERTY_KEY_SERVER_REFERENCE => { bytes = decode_optional_string(bytes, &mut packet.server_reference)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for a disconnect packet"));
            }
        }
    }

    Ok(MqttPacket::Disconnect(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn disconnect_round_trip_normal() {
        let packet = DisconnectPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet)));
    }

    #[test]
    fn disconnect_normal_is_two_bytes_on_the_wire() {
        let encoded = encode_packet(&MqttPacket::Disconnect(DisconnectPacket::default())).unwrap();
        assert_eq!(encoded, vec![DISCONNECT_FIRST_BYTE, 0]);
    }

    #[test]
    fn disconnect_round_trip_server_shutdown() {
        let packet = DisconnectPacket {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            session_expiry_interval_seconds: Some(0),
            reason_string: Some("rolling restart".to_string()),
            user_properties: Some(vec![
                UserProperty { name: "window".to_string(), value: "5m".to_string() },
            ]),
            server_reference: Some("b2.example.com:1883".to_string()),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet)));
    }
}
