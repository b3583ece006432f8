use crate::decode::*;
use crate::encode::*;
use crate::error::MqttResult;
use crate::mqtt::*;

/// Acknowledgement for a QoS 1 PUBLISH.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PubackPacket {
    /// Packet id of the publish being acknowledged.
    pub packet_id: u16,

    /// Success or failure indicator for the publish.
    pub reason_code: PubackReasonCode,

    /// Optional human-readable diagnostic.  Never part of the delivery contract.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_puback(packet: &PubackPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    encode_ack_packet(AckEncodingFields {
        first_byte: PUBACK_FIRST_BYTE,
        packet_id: packet.packet_id,
        reason_code: packet.reason_code as u8,
        reason_string: &packet.reason_string,
        user_properties: &packet.user_properties,
    }, dest)
}

pub(crate) fn decode_puback(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    let fields = decode_ack_packet(first_byte, PUBACK_FIRST_BYTE, packet_body)?;

    Ok(MqttPacket::Puback(PubackPacket {
        packet_id: fields.packet_id,
        reason_code: convert_u8_to_puback_reason_code(fields.reason_code)?,
        reason_string: fields.reason_string,
        user_properties: fields.user_properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn puback_round_trip_minimal() {
        let packet = PubackPacket {
            packet_id: 123,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet)));
    }

    #[test]
    fn puback_round_trip_failing_reason_code_with_properties() {
        let packet = PubackPacket {
            packet_id: 16384,
            reason_code: PubackReasonCode::NotAuthorized,
            reason_string: Some("publishing to that topic requires credentials".to_string()),
            user_properties: Some(vec![
                UserProperty { name: "attempt".to_string(), value: "3".to_string() },
            ]),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet)));
    }

    #[test]
    fn puback_short_form_is_two_bytes_of_body() {
        let packet = MqttPacket::Puback(PubackPacket {
            packet_id: 7,
            ..Default::default()
        });

        let encoded = encode_packet(&packet).unwrap();
        assert_eq!(encoded, vec![PUBACK_FIRST_BYTE, 2, 0, 7]);
    }

    #[test]
    fn puback_decode_rejects_bad_reason_code() {
        let bytes = vec![PUBACK_FIRST_BYTE, 4, 0, 7, 0xF1, 0];
        assert!(decode_puback(bytes[0], &bytes[2..]).is_err());
    }
}
