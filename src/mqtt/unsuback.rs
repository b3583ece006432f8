use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Server response to an UNSUBSCRIBE, with one reason code per filter in
/// request order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnsubackPacket {
    /// Packet id of the unsubscribe being acknowledged.
    pub packet_id: u16,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the server.
    pub user_properties: Option<Vec<UserProperty>>,

    /// Per-filter outcome, one entry per requested filter.
    pub reason_codes: Vec<UnsubackReasonCode>,
}

pub(crate) fn encode_unsuback(packet: &UnsubackPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = optional_string_property_length(&packet.reason_string)
        + user_properties_length(&packet.user_properties);

    let remaining_length = 2 + vli_length(property_length)? + property_length + packet.reason_codes.len();

    dest.push(UNSUBACK_FIRST_BYTE);
    write_vli(dest, remaining_length)?;
    write_u16(dest, packet.packet_id);

    write_vli(dest, property_length)?;
    write_optional_string_property(dest, PROPERTY_KEY_REASON_STRING, &packet.reason_string)?;
    write_user_properties(dest, &packet.user_properties)?;

    for reason_code in &packet.reason_codes {
        dest.push(*reason_code as u8);
    }

    Ok(())
}

pub(crate) fn decode_unsuback(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != UNSUBACK_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for an unsuback packet"));
    }

    let mut packet = UnsubackPacket::default();

    let mut bytes = decode_u16(packet_body, &mut packet.packet_id)?;

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length > bytes.len() {
        return Err(MqttError::new_decoding_failure("unsuback property length exceeds remaining packet length"));
    }

    let mut property_bytes = &bytes[..property_length];
    bytes = &bytes[property_length..];

    while !property_bytes.is_empty() {
        let mut property_key = 0;
        property_bytes = decode_u8(property_bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_REASON_STRING => { property_bytes = decode_optional_string(property_bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { property_bytes = decode_user_property(property_bytes, &mut packet.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for an unsuback packet"));
            }
        }
    }

    if bytes.is_empty() {
        return Err(MqttError::new_decoding_failure("unsuback packets must contain at least one reason code"));
    }

    for byte in bytes {
        packet.reason_codes.push(convert_u8_to_unsuback_reason_code(*byte)?);
    }

    Ok(MqttPacket::Unsuback(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn unsuback_round_trip_single_success() {
        let packet = UnsubackPacket {
            packet_id: 8,
            reason_codes: vec![UnsubackReasonCode::Success],
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsuback(packet)));
    }

    #[test]
    fn unsuback_round_trip_mixed_outcomes() {
        let packet = UnsubackPacket {
            packet_id: 2400,
            reason_string: Some("one filter never existed".to_string()),
            user_properties: None,
            reason_codes: vec![
                UnsubackReasonCode::Success,
                UnsubackReasonCode::NoSubscriptionExisted,
            ],
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsuback(packet)));
    }
}
