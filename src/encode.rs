/*!
Pure encoding support: each MQTT5 packet becomes one contiguous byte sequence.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Largest value representable by a variable byte integer (2^28 - 1)
pub(crate) const MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = 268_435_455;

pub(crate) const PACKET_TYPE_CONNECT: u8 = 1;
pub(crate) const PACKET_TYPE_CONNACK: u8 = 2;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = 3;
pub(crate) const PACKET_TYPE_PUBACK: u8 = 4;
pub(crate) const PACKET_TYPE_PUBREC: u8 = 5;
pub(crate) const PACKET_TYPE_PUBREL: u8 = 6;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = 7;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = 9;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = 11;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = 12;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = 13;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = 14;
pub(crate) const PACKET_TYPE_AUTH: u8 = 15;

pub(crate) const CONNECT_FIRST_BYTE: u8 = 0x10;
pub(crate) const CONNACK_FIRST_BYTE: u8 = 0x20;
pub(crate) const PUBACK_FIRST_BYTE: u8 = 0x40;
pub(crate) const PUBREC_FIRST_BYTE: u8 = 0x50;
pub(crate) const PUBREL_FIRST_BYTE: u8 = 0x62;
pub(crate) const PUBCOMP_FIRST_BYTE: u8 = 0x70;
pub(crate) const SUBSCRIBE_FIRST_BYTE: u8 = 0x82;
pub(crate) const SUBACK_FIRST_BYTE: u8 = 0x90;
pub(crate) const UNSUBSCRIBE_FIRST_BYTE: u8 = 0xA2;
pub(crate) const UNSUBACK_FIRST_BYTE: u8 = 0xB0;
pub(crate) const PINGREQ_FIRST_BYTE: u8 = 0xC0;
pub(crate) const PINGRESP_FIRST_BYTE: u8 = 0xD0;
pub(crate) const DISCONNECT_FIRST_BYTE: u8 = 0xE0;
pub(crate) const AUTH_FIRST_BYTE: u8 = 0xF0;

pub(crate) const PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR: u8 = 1;
pub(crate) const PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL: u8 = 2;
pub(crate) const PROPERTY_KEY_CONTENT_TYPE: u8 = 3;
pub(crate) const PROPERTY_KEY_RESPONSE_TOPIC: u8 = 8;
pub(crate) const PROPERTY_KEY_CORRELATION_DATA: u8 = 9;
pub(crate) const PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER: u8 = 11;
pub(crate) const PROPERTY_KEY_SESSION_EXPIRY_INTERVAL: u8 = 17;
pub(crate) const PROPERTY_KEY_ASSIGNED_CLIENT_IDENTIFIER: u8 = 18;
pub(crate) const PROPERTY_KEY_SERVER_KEEP_ALIVE: u8 = 19;
pub(crate) const PROPERTY_KEY_AUTHENTICATION_METHOD: u8 = 21;
pub(crate) const PROPERTY_KEY_AUTHENTICATION_DATA: u8 = 22;
pub(crate) const PROPERTY_KEY_REQUEST_PROBLEM_INFORMATION: u8 = 23;
pub(crate) const PROPERTY_KEY_WILL_DELAY_INTERVAL: u8 = 24;
pub(crate) const PROPERTY_KEY_REQUEST_RESPONSE_INFORMATION: u8 = 25;
pub(crate) const PROPERTY_KEY_RESPONSE_INFORMATION: u8 = 26;
pub(crate) const PROPERTY_KEY_SERVER_REFERENCE: u8 = 28;
pub(crate) const PROPERTY_KEY_REASON_STRING: u8 = 31;
pub(crate) const PROPERTY_KEY_RECEIVE_MAXIMUM: u8 = 33;
pub(crate) const PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM: u8 = 34;
pub(crate) const PROPERTY_KEY_TOPIC_ALIAS: u8 = 35;
pub(crate) const PROPERTY_KEY_MAXIMUM_QOS: u8 = 36;
pub(crate) const PROPERTY_KEY_RETAIN_AVAILABLE: u8 = 37;
pub(crate) const PROPERTY_KEY_USER_PROPERTY: u8 = 38;
pub(crate) const PROPERTY_KEY_MAXIMUM_PACKET_SIZE: u8 = 39;
pub(crate) const PROPERTY_KEY_WILDCARD_SUBSCRIPTIONS_AVAILABLE: u8 = 40;
pub(crate) const PROPERTY_KEY_SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u8 = 41;
pub(crate) const PROPERTY_KEY_SHARED_SUBSCRIPTIONS_AVAILABLE: u8 = 42;

/// Number of bytes a value occupies when encoded as a variable byte integer.
pub(crate) fn vli_length(value: usize) -> MqttResult<usize> {
    match value {
        0..=127 => Ok(1),
        128..=16_383 => Ok(2),
        16_384..=2_097_151 => Ok(3),
        2_097_152..=MAXIMUM_VARIABLE_LENGTH_INTEGER => Ok(4),
        _ => Err(MqttError::new_encoding_failure("value exceeds maximum variable byte integer")),
    }
}

pub(crate) fn write_vli(dest: &mut Vec<u8>, value: usize) -> MqttResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(MqttError::new_encoding_failure("value exceeds maximum variable byte integer"));
    }

    let mut remaining = value;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        dest.push(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

pub(crate) fn write_u16(dest: &mut Vec<u8>, value: u16) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(dest: &mut Vec<u8>, value: u32) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_string(dest: &mut Vec<u8>, value: &str) -> MqttResult<()> {
    if value.len() > u16::MAX as usize {
        return Err(MqttError::new_encoding_failure("string field exceeds 65535 bytes"));
    }

    write_u16(dest, value.len() as u16);
    dest.extend_from_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn write_binary(dest: &mut Vec<u8>, value: &[u8]) -> MqttResult<()> {
    if value.len() > u16::MAX as usize {
        return Err(MqttError::new_encoding_failure("binary field exceeds 65535 bytes"));
    }

    write_u16(dest, value.len() as u16);
    dest.extend_from_slice(value);
    Ok(())
}

/*
 * Property-section sizing.  Each helper returns the full encoded footprint of
 * the property including its one-byte key, or zero when the field is absent.
 */

pub(crate) fn optional_u8_property_length<T>(value: &Option<T>) -> usize {
    if value.is_some() { 2 } else { 0 }
}

pub(crate) fn optional_u16_property_length(value: &Option<u16>) -> usize {
    if value.is_some() { 3 } else { 0 }
}

pub(crate) fn optional_u32_property_length(value: &Option<u32>) -> usize {
    if value.is_some() { 5 } else { 0 }
}

pub(crate) fn optional_string_property_length(value: &Option<String>) -> usize {
    value.as_ref().map_or(0, |v| 3 + v.len())
}

pub(crate) fn optional_binary_property_length(value: &Option<Vec<u8>>) -> usize {
    value.as_ref().map_or(0, |v| 3 + v.len())
}

pub(crate) fn user_properties_length(properties: &Option<Vec<UserProperty>>) -> usize {
    properties.as_ref().map_or(0, |props| {
        props.iter().map(|p| 5 + p.name.len() + p.value.len()).sum()
    })
}

/*
 * Property-section writers, mirrors of the sizing helpers above.
 */

pub(crate) fn write_optional_u8_property(dest: &mut Vec<u8>, key: u8, value: Option<u8>) {
    if let Some(value) = value {
        dest.push(key);
        dest.push(value);
    }
}

pub(crate) fn write_optional_bool_property(dest: &mut Vec<u8>, key: u8, value: Option<bool>) {
    write_optional_u8_property(dest, key, value.map(|v| v as u8));
}

pub(crate) fn write_optional_u16_property(dest: &mut Vec<u8>, key: u8, value: Option<u16>) {
    if let Some(value) = value {
        dest.push(key);
        write_u16(dest, value);
    }
}

pub(crate) fn write_optional_u32_property(dest: &mut Vec<u8>, key: u8, value: Option<u32>) {
    if let Some(value) = value {
        dest.push(key);
        write_u32(dest, value);
    }
}

pub(crate) fn write_optional_string_property(dest: &mut Vec<u8>, key: u8, value: &Option<String>) -> MqttResult<()> {
    if let Some(value) = value {
        dest.push(key);
        write_string(dest, value)?;
    }

    Ok(())
}

pub(crate) fn write_optional_binary_property(dest: &mut Vec<u8>, key: u8, value: &Option<Vec<u8>>) -> MqttResult<()> {
    if let Some(value) = value {
        dest.push(key);
        write_binary(dest, value)?;
    }

    Ok(())
}

pub(crate) fn write_user_properties(dest: &mut Vec<u8>, properties: &Option<Vec<UserProperty>>) -> MqttResult<()> {
    if let Some(properties) = properties {
        for property in properties {
            dest.push(PROPERTY_KEY_USER_PROPERTY);
            write_string(dest, &property.name)?;
            write_string(dest, &property.value)?;
        }
    }

    Ok(())
}

/// Common wire fields of the four publish-acknowledgement packets plus
/// SUBACK/UNSUBACK headers (packet id, reason code, reason string, user
/// properties).
pub(crate) struct AckEncodingFields<'a> {
    pub first_byte: u8,
    pub packet_id: u16,
    pub reason_code: u8,
    pub reason_string: &'a Option<String>,
    pub user_properties: &'a Option<Vec<UserProperty>>,
}

/// Encodes a PUBACK/PUBREC/PUBREL/PUBCOMP packet.  Success acks with no
/// properties use the short two-byte form the specification allows.
pub(crate) fn encode_ack_packet(fields: AckEncodingFields, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = optional_string_property_length(fields.reason_string)
        + user_properties_length(fields.user_properties);

    dest.push(fields.first_byte);

    if property_length == 0 && fields.reason_code == 0 {
        write_vli(dest, 2)?;
        write_u16(dest, fields.packet_id);
        return Ok(());
    }

    let remaining_length = 2 + 1 + vli_length(property_length)? + property_length;
    write_vli(dest, remaining_length)?;
    write_u16(dest, fields.packet_id);
    dest.push(fields.reason_code);
    write_vli(dest, property_length)?;
    write_optional_string_property(dest, PROPERTY_KEY_REASON_STRING, fields.reason_string)?;
    write_user_properties(dest, fields.user_properties)?;

    Ok(())
}

/// Encodes a packet into a contiguous byte sequence ready for the wire.
///
/// The codec is pure: it performs no I/O and holds no state across calls.
pub(crate) fn encode_packet(packet: &MqttPacket) -> MqttResult<Vec<u8>> {
    let mut dest = Vec::with_capacity(64);

    match packet {
        MqttPacket::Connect(connect) => { connect::encode_connect(connect, &mut dest)?; }
        MqttPacket::Connack(connack) => { connack::encode_connack(connack, &mut dest)?; }
        MqttPacket::Publish(publish) => { publish::encode_publish(publish, &mut dest)?; }
        MqttPacket::Puback(puback) => { puback::encode_puback(puback, &mut dest)?; }
        MqttPacket::Pubrec(pubrec) => { pubrec::encode_pubrec(pubrec, &mut dest)?; }
        MqttPacket::Pubrel(pubrel) => { pubrel::encode_pubrel(pubrel, &mut dest)?; }
        MqttPacket::Pubcomp(pubcomp) => { pubcomp::encode_pubcomp(pubcomp, &mut dest)?; }
        MqttPacket::Subscribe(subscribe) => { subscribe::encode_subscribe(subscribe, &mut dest)?; }
        MqttPacket::Suback(suback) => { suback::encode_suback(suback, &mut dest)?; }
        MqttPacket::Unsubscribe(unsubscribe) => { unsubscribe::encode_unsubscribe(unsubscribe, &mut dest)?; }
        MqttPacket::Unsuback(unsuback) => { unsuback::encode_unsuback(unsuback, &mut dest)?; }
        MqttPacket::Pingreq(_) => {
            dest.push(PINGREQ_FIRST_BYTE);
            dest.push(0);
        }
        MqttPacket::Pingresp(_) => {
            dest.push(PINGRESP_FIRST_BYTE);
            dest.push(0);
        }
        MqttPacket::Disconnect(disconnect) => { disconnect::encode_disconnect(disconnect, &mut dest)?; }
        MqttPacket::Auth(auth) => { auth::encode_auth(auth, &mut dest)?; }
    }

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_vli(value: usize) -> Vec<u8> {
        let mut dest = Vec::new();
        write_vli(&mut dest, value).unwrap();
        dest
    }

    #[test]
    fn vli_boundary_encodings() {
        assert_eq!(encoded_vli(0), vec![0x00]);
        assert_eq!(encoded_vli(127), vec![0x7F]);
        assert_eq!(encoded_vli(128), vec![0x80, 0x01]);
        assert_eq!(encoded_vli(16_383), vec![0xFF, 0x7F]);
        assert_eq!(encoded_vli(16_384), vec![0x80, 0x80, 0x01]);
        assert_eq!(encoded_vli(2_097_151), vec![0xFF, 0xFF, 0x7F]);
        assert_eq!(encoded_vli(2_097_152), vec![0x80, 0x80, 0x80, 0x01]);
        assert_eq!(encoded_vli(268_435_455), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn vli_rejects_values_beyond_maximum() {
        let mut dest = Vec::new();
        assert!(write_vli(&mut dest, 268_435_456).is_err());
        assert!(vli_length(268_435_456).is_err());
    }

    #[test]
    fn vli_lengths_match_encodings() {
        for value in [0usize, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455] {
            assert_eq!(vli_length(value).unwrap(), encoded_vli(value).len());
        }
    }

    #[test]
    fn string_field_too_long_is_rejected() {
        let mut dest = Vec::new();
        let oversized = "x".repeat(65_536);
        assert!(write_string(&mut dest, &oversized).is_err());
    }
}
