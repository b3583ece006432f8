use crate::decode::*;
use crate::encode::*;
use crate::error::MqttResult;
use crate::mqtt::*;

/// First acknowledgement of a QoS 2 PUBLISH; the sender answers with PUBREL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PubrecPacket {
    /// Packet id of the QoS 2 exchange.
    pub packet_id: u16,

    /// Success or failure indicator for the publish.
    pub reason_code: PubrecReasonCode,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_pubrec(packet: &PubrecPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    encode_ack_packet(AckEncodingFields {
        first_byte: PUBREC_FIRST_BYTE,
        packet_id: packet.packet_id,
        reason_code: packet.reason_code as u8,
        reason_string: &packet.reason_string,
        user_properties: &packet.user_properties,
    }, dest)
}

pub(crate) fn decode_pubrec(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    let fields = decode_ack_packet(first_byte, PUBREC_FIRST_BYTE, packet_body)?;

    Ok(MqttPacket::Pubrec(PubrecPacket {
        packet_id: fields.packet_id,
        reason_code: convert_u8_to_pubrec_reason_code(fields.reason_code)?,
        reason_string: fields.reason_string,
        user_properties: fields.user_properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubrec_round_trip_minimal() {
        let packet = PubrecPacket {
            packet_id: 1,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubrec(packet)));
    }

    #[test]
    fn pubrec_round_trip_with_properties() {
        let packet = PubrecPacket {
            packet_id: 44000,
            reason_code: PubrecReasonCode::QuotaExceeded,
            reason_string: Some("slow down".to_string()),
            user_properties: Some(vec![
                UserProperty { name: "queue-depth".to_string(), value: "12000".to_string() },
            ]),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubrec(packet)));
    }
}
