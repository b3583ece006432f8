use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Subscription request for one or more topic filters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscribePacket {
    /// Packet id; zero until bound by the engine.
    pub packet_id: u16,

    /// Topic filters and per-filter options.
    pub subscriptions: Vec<Subscription>,

    /// Identifier echoed on every publish forwarded due to these
    /// subscriptions.
    pub subscription_identifier: Option<u32>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_subscribe(packet: &SubscribePacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let mut property_length = user_properties_length(&packet.user_properties);
    if let Some(id) = packet.subscription_identifier {
        property_length += 1 + vli_length(id as usize)?;
    }

    let payload_length: usize = packet.subscriptions.iter()
        .map(|s| 2 + s.topic_filter.len() + 1)
        .sum();

    let remaining_length = 2 + vli_length(property_length)? + property_length + payload_length;

    dest.push(SUBSCRIBE_FIRST_BYTE);
    write_vli(dest, remaining_length)?;
    write_u16(dest, packet.packet_id);

    write_vli(dest, property_length)?;
    if let Some(id) = packet.subscription_identifier {
        dest.push(PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER);
        write_vli(dest, id as usize)?;
    }
    write_user_properties(dest, &packet.user_properties)?;

    for subscription in &packet.subscriptions {
        write_string(dest, &subscription.topic_filter)?;

        let mut options = subscription.qos as u8;
        if subscription.no_local {
            options |= 0x04;
        }
        if subscription.retain_as_published {
            options |= 0x08;
        }
        options |= (subscription.retain_handling_type as u8) << 4;
        dest.push(options);
    }

    Ok(())
}

pub(crate) fn decode_subscribe(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != SUBSCRIBE_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for a subscribe packet"));
    }

    let mut packet = SubscribePacket::default();

    let mut bytes = decode_u16(packet_body, &mut packet.packet_id)?;

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length > bytes.len() {
        return Err(MqttError::new_decoding_failure("subscribe property length exceeds remaining packet length"));
    }

    let mut property_bytes = &bytes[..property_length];
    bytes = &bytes[property_length..];

    while !property_bytes.is_empty() {
        let mut property_key = 0;
        property_bytes = decode_u8(property_bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER => {
                let mut value = 0;
                property_bytes = decode_vli_into_mutable(property_bytes, &mut value)?;
                packet.subscription_identifier = Some(value as u32);
            }
            PROPERTY_KEY_USER_PROPERTY => { property_bytes = decode_user_property(property_bytes, &mut packet.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for a subscribe packet"));
            }
        }
    }

    while !bytes.is_empty() {
        let mut subscription = Subscription::default();
        bytes = decode_string(bytes, &mut subscription.topic_filter)?;

        let mut options = 0;
        bytes = decode_u8(bytes, &mut options)?;
        if (options & 0xC0) != 0 {
            return Err(MqttError::new_decoding_failure("subscription options reserved bits must be zero"));
        }

        subscription.qos = convert_u8_to_quality_of_service(options & 0x03)?;
        subscription.no_local = (options & 0x04) != 0;
        subscription.retain_as_published = (options & 0x08) != 0;
        subscription.retain_handling_type = convert_u8_to_retain_handling_type((options >> 4) & 0x03)?;

        packet.subscriptions.push(subscription);
    }

    if packet.subscriptions.is_empty() {
        return Err(MqttError::new_decoding_failure("subscribe packets must contain at least one filter"));
    }

    Ok(MqttPacket::Subscribe(packet))
}
