use crate::decode::*;
use crate::encode::*;
use crate::error::MqttResult;
use crate::mqtt::*;

/// Release of a QoS 2 exchange, sent in response to PUBREC.  Survives
/// reconnects: an unacknowledged PUBREL is retransmitted on session
/// resumption.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PubrelPacket {
    /// Packet id of the QoS 2 exchange.
    pub packet_id: u16,

    /// Success or failure indicator for the release.
    pub reason_code: PubrelReasonCode,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_pubrel(packet: &PubrelPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    encode_ack_packet(AckEncodingFields {
        first_byte: PUBREL_FIRST_BYTE,
        packet_id: packet.packet_id,
        reason_code: packet.reason_code as u8,
        reason_string: &packet.reason_string,
        user_properties: &packet.user_properties,
    }, dest)
}

pub(crate) fn decode_pubrel(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    let fields = decode_ack_packet(first_byte, PUBREL_FIRST_BYTE, packet_body)?;

    Ok(MqttPacket::Pubrel(PubrelPacket {
        packet_id: fields.packet_id,
        reason_code: convert_u8_to_pubrel_reason_code(fields.reason_code)?,
        reason_string: fields.reason_string,
        user_properties: fields.user_properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubrel_round_trip_minimal() {
        let packet = PubrelPacket {
            packet_id: 1023,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubrel(packet)));
    }

    #[test]
    fn pubrel_round_trip_not_found() {
        let packet = PubrelPacket {
            packet_id: 9999,
            reason_code: PubrelReasonCode::PacketIdentifierNotFound,
            reason_string: Some("no pending exchange".to_string()),
            user_properties: None,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubrel(packet)));
    }

    #[test]
    fn pubrel_decode_rejects_wrong_fixed_header_flags() {
        // pubrel requires flag nibble 0x2
        let bytes = vec![0x60, 2, 0, 5];
        assert!(decode_pubrel(bytes[0], &bytes[2..]).is_err());
    }
}
