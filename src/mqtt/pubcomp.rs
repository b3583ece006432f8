use crate::decode::*;
use crate::encode::*;
use crate::error::MqttResult;
use crate::mqtt::*;

/// Final acknowledgement of a QoS 2 exchange; frees the packet id on both
/// sides.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PubcompPacket {
    /// Packet id of the QoS 2 exchange.
    pub packet_id: u16,

    /// Success or failure indicator for the release.
    pub reason_code: PubcompReasonCode,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_pubcomp(packet: &PubcompPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    encode_ack_packet(AckEncodingFields {
        first_byte: PUBCOMP_FIRST_BYTE,
        packet_id: packet.packet_id,
        reason_code: packet.reason_code as u8,
        reason_string: &packet.reason_string,
        user_properties: &packet.user_properties,
    }, dest)
}

pub(crate) fn decode_pubcomp(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    let fields = decode_ack_packet(first_byte, PUBCOMP_FIRST_BYTE, packet_body)?;

    Ok(MqttPacket::Pubcomp(PubcompPacket {
        packet_id: fields.packet_id,
        reason_code: convert_u8_to_pubcomp_reason_code(fields.reason_code)?,
        reason_string: fields.reason_string,
        user_properties: fields.user_properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubcomp_round_trip_minimal() {
        let packet = PubcompPacket {
            packet_id: 42,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubcomp(packet)));
    }

    #[test]
    fn pubcomp_round_trip_not_found_with_properties() {
        let packet = PubcompPacket {
            packet_id: 65535,
            reason_code: PubcompReasonCode::PacketIdentifierNotFound,
            reason_string: Some("release without a matching pubrec".to_string()),
            user_properties: Some(vec![
                UserProperty { name: "traceid".to_string(), value: "a41c".to_string() },
            ]),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubcomp(packet)));
    }
}
