use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Subscription removal request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnsubscribePacket {
    /// Packet id; zero until bound by the engine.
    pub packet_id: u16,

    /// Filters to remove, matched exactly against existing subscriptions.
    pub topic_filters: Vec<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_unsubscribe(packet: &UnsubscribePacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = user_properties_length(&packet.user_properties);

    let payload_length: usize = packet.topic_filters.iter().map(|f| 2 + f.len()).sum();
    let remaining_length = 2 + vli_length(property_length)? + property_length + payload_length;

    dest.push(UNSUBSCRIBE_FIRST_BYTE);
    write_vli(dest, remaining_length)?;
    write_u16(dest, packet.packet_id);

    write_vli(dest, property_length)?;
    write_user_properties(dest, &packet.user_properties)?;

    for filter in &packet.topic_filters {
        write_string(dest, filter)?;
    }

    Ok(())
}

pub(crate) fn decode_unsubscribe(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != UNSUBSCRIBE_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for an unsubscribe packet"));
    }

    let mut packet = UnsubscribePacket::default();

    let mut bytes = decode_u16(packet_body, &mut packet.packet_id)?;

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length > bytes.len() {
        return Err(MqttError::new_decoding_failure("unsubscribe property length exceeds remaining packet length"));
    }

    let mut property_bytes = &bytes[..property_length];
    bytes = &bytes[property_length..];

    while !property_bytes.is_empty() {
        let mut property_key = 0;
        property_bytes = decode_u8(property_bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_USER_PROPERTY => { property_bytes = decode_user_property(property_bytes, &mut packet.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for an unsubscribe packet"));
            }
        }
    }

    while !bytes.is_empty() {
        let mut filter = String::new();
        bytes = decode_string(bytes, &mut filter)?;
        packet.topic_filters.push(filter);
    }

    if packet.topic_filters.is_empty() {
        return Err(MqttError::new_decoding_failure("unsubscribe packets must contain at least one filter"));
    }

    Ok(MqttPacket::Unsubscribe(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn unsubscribe_round_trip_single_filter() {
        let packet = UnsubscribePacket {
            packet_id: 8,
            topic_filters: vec!["sport/tennis/+".to_string()],
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet)));
    }

    #[test]
    fn unsubscribe_round_trip_multiple_filters_with_properties() {
        let packet = UnsubscribePacket {
            packet_id: 31999,
            topic_filters: vec![
                "alerts/#".to_string(),
                "config/updates".to_string(),
                "$SYS/broker/load".to_string(),
            ],
            user_properties: Some(vec![
                UserProperty { name: "reason".to_string(), value: "shutdown".to_string() },
            ]),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet)));
    }
}
