use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// An application message, in either direction.
///
/// QoS 0 publishes carry no packet id; for QoS 1/2 the engine binds one at
/// transmission time.  An outbound publish may have its topic replaced by a
/// topic alias during encoding; an inbound publish has aliases resolved back
/// to the full topic before the packet reaches the session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    /// Topic to publish to.  May be empty on the wire when a topic alias is
    /// in use.
    pub topic: String,

    /// Delivery quality of service.
    pub qos: QualityOfService,

    /// Retransmission flag; set by the engine when replaying after reconnect.
    pub duplicate: bool,

    /// Ask the server to retain the message for future subscribers.
    pub retain: bool,

    /// Message payload.
    pub payload: Vec<u8>,

    /// Packet id; zero until bound, never encoded for QoS 0.
    pub packet_id: u16,

    /// Declares whether the payload is binary or utf-8 text.
    pub payload_format: Option<PayloadFormatIndicator>,

    /// Seconds until the server may drop an undelivered message.
    pub message_expiry_interval_seconds: Option<u32>,

    /// Integer standing in for the topic to reduce bandwidth.
    pub topic_alias: Option<u16>,

    /// Topic for the receiver to respond on, request/response style.
    pub response_topic: Option<String>,

    /// Opaque blob correlating a response with its request.
    pub correlation_data: Option<Vec<u8>>,

    /// Identifiers of the subscriptions that caused this message to be
    /// forwarded.  Server-to-client only.
    pub subscription_identifiers: Option<Vec<u32>>,

    /// MIME-style description of the payload.
    pub content_type: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

fn compute_publish_property_length(packet: &PublishPacket) -> MqttResult<usize> {
    let mut length = optional_u8_property_length(&packet.payload_format);
    length += optional_u32_property_length(&packet.message_expiry_interval_seconds);
    length += optional_u16_property_length(&packet.topic_alias);
    length += optional_string_property_length(&packet.response_topic);
    length += optional_binary_property_length(&packet.correlation_data);
    length += optional_string_property_length(&packet.content_type);
    length += user_properties_length(&packet.user_properties);

    if let Some(subscription_identifiers) = &packet.subscription_identifiers {
        for id in subscription_identifiers {
            length += 1 + vli_length(*id as usize)?;
        }
    }

    Ok(length)
}

pub(crate) fn encode_publish(packet: &PublishPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let mut first_byte = PACKET_TYPE_PUBLISH << 4;
    if packet.duplicate {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }

    let property_length = compute_publish_property_length(packet)?;

    let mut remaining_length = 2 + packet.topic.len();
    if packet.qos != QualityOfService::AtMostOnce {
        remaining_length += 2;
    }
    remaining_length += vli_length(property_length)? + property_length;
    remaining_length += packet.payload.len();

    dest.push(first_byte);
    write_vli(dest, remaining_length)?;
    write_string(dest, &packet.topic)?;
    if packet.qos != QualityOfService::AtMostOnce {
        write_u16(dest, packet.packet_id);
    }

    write_vli(dest, property_length)?;
    write_optional_u8_property(dest, PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR, packet.payload_format.map(|v| v as u8));
    write_optional_u32_property(dest, PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL, packet.message_expiry_interval_seconds);
    write_optional_u16_property(dest, PROPERTY_KEY_TOPIC_ALIAS, packet.topic_alias);
    write_optional_string_property(dest, PROPERTY_KEY_RESPONSE_TOPIC, &packet.response_topic)?;
    write_optional_binary_property(dest, PROPERTY_KEY_CORRELATION_DATA, &packet.correlation_data)?;
    if let Some(subscription_identifiers) = &packet.subscription_identifiers {
        for id in subscription_identifiers {
            dest.push(PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER);
            write_vli(dest, *id as usize)?;
        }
    }
    write_optional_string_property(dest, PROPERTY_KEY_CONTENT_TYPE, &packet.content_type)?;
    write_user_properties(dest, &packet.user_properties)?;

    dest.extend_from_slice(&packet.payload);

    Ok(())
}

fn decode_publish_properties(property_bytes: &[u8], packet: &mut PublishPacket) -> MqttResult<()> {
    let mut bytes = property_bytes;

    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR => {
                let mut value = PayloadFormatIndicator::Bytes;
                bytes = decode_u8_as_enum(bytes, &mut value, convert_u8_to_payload_format_indicator)?;
                packet.payload_format = Some(value);
            }
            PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL => { bytes = decode_optional_u32(bytes, &mut packet.message_expiry_interval_seconds)?; }
            PROPERTY_KEY_TOPIC_ALIAS => { bytes = decode_optional_u16(bytes, &mut packet.topic_alias)?; }
            PROPERTY_KEY_RESPONSE_TOPIC => { bytes = decode_optional_string(bytes, &mut packet.response_topic)?; }
            PROPERTY_KEY_CORRELATION_DATA => { bytes = decode_optional_binary(bytes, &mut packet.correlation_data)?; }
            PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER => {
                let mut value = 0;
                bytes = decode_vli_into_mutable(bytes, &mut value)?;
                packet.subscription_identifiers.get_or_insert_with(Vec::new).push(value as u32);
            }
            PROPERTY_KEY_CONTENT_TYPE => { bytes = decode_optional_string(bytes, &mut packet.content_type)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut packet.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for a publish packet"));
            }
        }
    }

    Ok(())
}

pub(crate) fn decode_publish(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    let mut packet = PublishPacket {
        duplicate: (first_byte & 0x08) != 0,
        retain: (first_byte & 0x01) != 0,
        qos: convert_u8_to_quality_of_service((first_byte >> 1) & 0x03)?,
        ..Default::default()
    };

    let mut bytes = decode_string(packet_body, &mut packet.topic)?;
    if packet.qos != QualityOfService::AtMostOnce {
        bytes = decode_u16(bytes, &mut packet.packet_id)?;
        if packet.packet_id == 0 {
            return Err(MqttError::new_decoding_failure("qos1+ publish packet id must be non-zero"));
        }
    }

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length > bytes.len() {
        return Err(MqttError::new_decoding_failure("publish property length exceeds remaining packet length"));
    }

    decode_publish_properties(&bytes[..property_length], &mut packet)?;

    packet.payload = bytes[property_length..].to_vec();

    Ok(MqttPacket::Publish(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn publish_round_trip_qos0_minimal() {
        let packet = PublishPacket {
            topic: "telemetry/battery".to_string(),
            payload: b"74".to_vec(),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_qos1_with_packet_id() {
        let packet = PublishPacket {
            topic: "commands/door".to_string(),
            qos: QualityOfService::AtLeastOnce,
            packet_id: 311,
            payload: b"open".to_vec(),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_qos2_all_properties() {
        let packet = PublishPacket {
            topic: "requests/inventory".to_string(),
            qos: QualityOfService::ExactlyOnce,
            duplicate: true,
            retain: true,
            packet_id: 65535,
            payload: vec![0, 1, 2, 3, 254, 255],
            payload_format: Some(PayloadFormatIndicator::Bytes),
            message_expiry_interval_seconds: Some(3600),
            topic_alias: Some(12),
            response_topic: Some("responses/inventory".to_string()),
            correlation_data: Some(vec![9, 9, 9]),
            subscription_identifiers: Some(vec![1, 127, 128, 16384]),
            content_type: Some("application/octet-stream".to_string()),
            user_properties: Some(vec![
                UserProperty { name: "origin".to_string(), value: "warehouse-7".to_string() },
            ]),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_round_trip_empty_payload() {
        let packet = PublishPacket {
            topic: "status/heartbeat".to_string(),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Publish(packet)));
    }

    #[test]
    fn publish_decode_rejects_zero_packet_id_at_qos1() {
        let valid = PublishPacket {
            topic: "a".to_string(),
            qos: QualityOfService::AtLeastOnce,
            packet_id: 1,
            ..Default::default()
        };

        let mut encoded = crate::encode::encode_packet(&MqttPacket::Publish(valid)).unwrap();
        // zero out the packet id field (topic "a" -> packet id lives at offset 5..7)
        encoded[5] = 0;
        encoded[6] = 0;

        assert!(decode_publish(encoded[0], &encoded[2..]).is_err());
    }

    #[test]
    fn publish_decode_rejects_invalid_qos_bits() {
        // qos bits set to 3
        assert!(decode_publish(0x36, &[0, 1, b'a', 0]).is_err());
    }
}
