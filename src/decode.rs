/*!
Streaming deframer and decoding support for incoming MQTT5 packets.
 */

use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

use log::*;

use std::collections::VecDeque;

const DECODE_BUFFER_DEFAULT_SIZE: usize = 16 * 1024;

#[derive(Copy, Clone, Eq, PartialEq)]
enum DecoderState {
    ReadFirstByte,
    ReadRemainingLength,
    ReadBody,
    TerminalError,
}

enum DecoderDirective {
    OutOfData,
    Continue,
    TerminalError(MqttError),
}

/// Per-call decoding parameters supplied by the engine.
pub(crate) struct DecodingContext<'a> {
    /// Largest total packet size the connection allows; zero means the
    /// protocol maximum.
    pub(crate) maximum_packet_size: u32,

    /// Output field receiving every whole packet framed from the input.
    pub(crate) decoded_packets: &'a mut VecDeque<MqttPacket>,
}

/// Incremental packet deframer.
///
/// Holds the residual bytes of a partially received packet between reads.  All
/// parser state is per-instance; a decoder is reset when its connection is
/// replaced.
pub(crate) struct Decoder {
    state: DecoderState,

    scratch: Vec<u8>,

    first_byte: Option<u8>,

    remaining_length: Option<usize>,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            state: DecoderState::ReadFirstByte,
            scratch: Vec::with_capacity(DECODE_BUFFER_DEFAULT_SIZE),
            first_byte: None,
            remaining_length: None,
        }
    }

    pub fn reset_for_new_connection(&mut self) {
        self.state = DecoderState::ReadFirstByte;
        self.scratch.clear();
        self.first_byte = None;
        self.remaining_length = None;
    }

    /// Appends freshly read bytes, emitting zero or more whole packets into
    /// the context.  A decode error is terminal for the connection.
    pub fn decode_bytes(&mut self, bytes: &[u8], context: &mut DecodingContext) -> MqttResult<()> {
        let mut current_slice = bytes;

        let mut directive = DecoderDirective::Continue;
        while let DecoderDirective::Continue = directive {
            match self.state {
                DecoderState::ReadFirstByte => {
                    (directive, current_slice) = self.process_read_first_byte(current_slice);
                }

                DecoderState::ReadRemainingLength => {
                    (directive, current_slice) = self.process_read_remaining_length(current_slice, context);
                }

                DecoderState::ReadBody => {
                    (directive, current_slice) = self.process_read_body(current_slice, context);
                }

                DecoderState::TerminalError => {
                    directive = DecoderDirective::TerminalError(
                        MqttError::new_decoding_failure("decoder already in a terminal failure state"));
                }
            }
        }

        if let DecoderDirective::TerminalError(error) = directive {
            self.state = DecoderState::TerminalError;
            return Err(error);
        }

        Ok(())
    }

    fn process_read_first_byte<'a>(&mut self, bytes: &'a [u8]) -> (DecoderDirective, &'a [u8]) {
        if bytes.is_empty() {
            return (DecoderDirective::OutOfData, bytes);
        }

        self.first_byte = Some(bytes[0]);
        self.state = DecoderState::ReadRemainingLength;

        (DecoderDirective::Continue, &bytes[1..])
    }

    fn process_read_remaining_length<'a>(&mut self, bytes: &'a [u8], context: &DecodingContext) -> (DecoderDirective, &'a [u8]) {
        if bytes.is_empty() {
            return (DecoderDirective::OutOfData, bytes);
        }

        self.scratch.push(bytes[0]);
        let remaining_bytes = &bytes[1..];

        match decode_vli(&self.scratch) {
            Ok(DecodeVliResult::Value(remaining_length, _)) => {
                let mut maximum_size = context.maximum_packet_size as usize;
                if maximum_size == 0 {
                    maximum_size = MAXIMUM_VARIABLE_LENGTH_INTEGER;
                }

                let total_packet_size = 1 + self.scratch.len() + remaining_length as usize;
                if total_packet_size > maximum_size {
                    return (DecoderDirective::TerminalError(
                        MqttError::new_decoding_failure("packet size exceeds negotiated maximum")), remaining_bytes);
                }

                self.remaining_length = Some(remaining_length as usize);
                self.state = DecoderState::ReadBody;
                self.scratch.clear();
                (DecoderDirective::Continue, remaining_bytes)
            }
            Ok(DecodeVliResult::InsufficientData) => {
                if !remaining_bytes.is_empty() {
                    (DecoderDirective::Continue, remaining_bytes)
                } else {
                    (DecoderDirective::OutOfData, remaining_bytes)
                }
            }
            Err(error) => {
                (DecoderDirective::TerminalError(error), remaining_bytes)
            }
        }
    }

    fn process_read_body<'a>(&mut self, bytes: &'a [u8], context: &mut DecodingContext) -> (DecoderDirective, &'a [u8]) {
        let read_so_far = self.scratch.len();
        let bytes_needed = self.remaining_length.unwrap() - read_so_far;
        if bytes_needed > bytes.len() {
            self.scratch.extend_from_slice(bytes);
            return (DecoderDirective::OutOfData, &[]);
        }

        let packet_slice: &[u8] =
            if !self.scratch.is_empty() {
                self.scratch.extend_from_slice(&bytes[..bytes_needed]);
                &self.scratch
            } else {
                &bytes[..bytes_needed]
            };

        match decode_packet(self.first_byte.unwrap(), packet_slice) {
            Ok(packet) => {
                debug!("decoder - framed a complete {} packet", packet_type_to_str(packet_type_of(&packet)));
                context.decoded_packets.push_back(packet);

                self.state = DecoderState::ReadFirstByte;
                self.scratch.clear();
                self.first_byte = None;
                self.remaining_length = None;

                (DecoderDirective::Continue, &bytes[bytes_needed..])
            }
            Err(error) => {
                (DecoderDirective::TerminalError(error), &[])
            }
        }
    }
}

#[derive(Eq, PartialEq, Debug)]
pub(crate) enum DecodeVliResult<'a> {
    /// More bytes are required before the value is complete.
    InsufficientData,

    /// (decoded value, bytes remaining after the encoding)
    Value(u32, &'a [u8]),
}

pub(crate) fn decode_vli(buffer: &[u8]) -> MqttResult<DecodeVliResult> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;

    for (i, byte) in buffer.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as u32) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            return Ok(DecodeVliResult::Value(value, &buffer[(i + 1)..]));
        }
    }

    if buffer.len() < 4 {
        return Ok(DecodeVliResult::InsufficientData);
    }

    Err(MqttError::new_decoding_failure("variable byte integer encoding exceeds four bytes"))
}

pub(crate) fn decode_vli_into_mutable<'a>(bytes: &'a [u8], value: &mut usize) -> MqttResult<&'a [u8]> {
    match decode_vli(bytes)? {
        DecodeVliResult::InsufficientData => {
            Err(MqttError::new_decoding_failure("truncated variable byte integer"))
        }
        DecodeVliResult::Value(vli, remaining) => {
            *value = vli as usize;
            Ok(remaining)
        }
    }
}

pub(crate) fn decode_u8<'a>(bytes: &'a [u8], value: &mut u8) -> MqttResult<&'a [u8]> {
    if bytes.is_empty() {
        return Err(MqttError::new_decoding_failure("field ends before a one-byte value"));
    }

    *value = bytes[0];
    Ok(&bytes[1..])
}

pub(crate) fn decode_u8_as_enum<'a, T>(bytes: &'a [u8], value: &mut T, converter: fn(u8) -> MqttResult<T>) -> MqttResult<&'a [u8]> {
    let mut raw: u8 = 0;
    let remaining = decode_u8(bytes, &mut raw)?;
    *value = converter(raw)?;
    Ok(remaining)
}

pub(crate) fn decode_u16<'a>(bytes: &'a [u8], value: &mut u16) -> MqttResult<&'a [u8]> {
    if bytes.len() < 2 {
        return Err(MqttError::new_decoding_failure("field ends before a two-byte value"));
    }

    *value = u16::from_be_bytes(bytes[..2].try_into().unwrap());
    Ok(&bytes[2..])
}

pub(crate) fn decode_u32<'a>(bytes: &'a [u8], value: &mut u32) -> MqttResult<&'a [u8]> {
    if bytes.len() < 4 {
        return Err(MqttError::new_decoding_failure("field ends before a four-byte value"));
    }

    *value = u32::from_be_bytes(bytes[..4].try_into().unwrap());
    Ok(&bytes[4..])
}

pub(crate) fn decode_string<'a>(bytes: &'a [u8], value: &mut String) -> MqttResult<&'a [u8]> {
    let mut length: u16 = 0;
    let remaining = decode_u16(bytes, &mut length)?;
    let length = length as usize;

    if length > remaining.len() {
        return Err(MqttError::new_decoding_failure("string length prefix exceeds remaining packet bytes"));
    }

    *value = std::str::from_utf8(&remaining[..length])?.to_string();
    Ok(&remaining[length..])
}

pub(crate) fn decode_optional_string<'a>(bytes: &'a [u8], value: &mut Option<String>) -> MqttResult<&'a [u8]> {
    if value.is_some() {
        return Err(MqttError::new_decoding_failure("duplicate string property"));
    }

    let mut unwrapped = String::new();
    let remaining = decode_string(bytes, &mut unwrapped)?;
    *value = Some(unwrapped);
    Ok(remaining)
}

pub(crate) fn decode_binary<'a>(bytes: &'a [u8], value: &mut Vec<u8>) -> MqttResult<&'a [u8]> {
    let mut length: u16 = 0;
    let remaining = decode_u16(bytes, &mut length)?;
    let length = length as usize;

    if length > remaining.len() {
        return Err(MqttError::new_decoding_failure("binary length prefix exceeds remaining packet bytes"));
    }

    *value = remaining[..length].to_vec();
    Ok(&remaining[length..])
}

pub(crate) fn decode_optional_binary<'a>(bytes: &'a [u8], value: &mut Option<Vec<u8>>) -> MqttResult<&'a [u8]> {
    if value.is_some() {
        return Err(MqttError::new_decoding_failure("duplicate binary property"));
    }

    let mut unwrapped = Vec::new();
    let remaining = decode_binary(bytes, &mut unwrapped)?;
    *value = Some(unwrapped);
    Ok(remaining)
}

pub(crate) fn decode_optional_u8_as_bool<'a>(bytes: &'a [u8], value: &mut Option<bool>) -> MqttResult<&'a [u8]> {
    if value.is_some() {
        return Err(MqttError::new_decoding_failure("duplicate boolean property"));
    }

    let mut raw: u8 = 0;
    let remaining = decode_u8(bytes, &mut raw)?;
    if raw > 1 {
        return Err(MqttError::new_decoding_failure("boolean property value is not 0 or 1"));
    }

    *value = Some(raw == 1);
    Ok(remaining)
}

pub(crate) fn decode_optional_u16<'a>(bytes: &'a [u8], value: &mut Option<u16>) -> MqttResult<&'a [u8]> {
    if value.is_some() {
        return Err(MqttError::new_decoding_failure("duplicate two-byte property"));
    }

    let mut raw: u16 = 0;
    let remaining = decode_u16(bytes, &mut raw)?;
    *value = Some(raw);
    Ok(remaining)
}

pub(crate) fn decode_optional_u32<'a>(bytes: &'a [u8], value: &mut Option<u32>) -> MqttResult<&'a [u8]> {
    if value.is_some() {
        return Err(MqttError::new_decoding_failure("duplicate four-byte property"));
    }

    let mut raw: u32 = 0;
    let remaining = decode_u32(bytes, &mut raw)?;
    *value = Some(raw);
    Ok(remaining)
}

pub(crate) fn decode_user_property<'a>(bytes: &'a [u8], properties: &mut Option<Vec<UserProperty>>) -> MqttResult<&'a [u8]> {
    let mut property = UserProperty::default();
    let remaining = decode_string(bytes, &mut property.name)?;
    let remaining = decode_string(remaining, &mut property.value)?;

    properties.get_or_insert_with(Vec::new).push(property);
    Ok(remaining)
}

/// Decoded wire fields shared by PUBACK/PUBREC/PUBREL/PUBCOMP.
#[derive(Default)]
pub(crate) struct AckDecodedFields {
    pub packet_id: u16,
    pub reason_code: u8,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn decode_ack_packet(first_byte: u8, expected_first_byte: u8, packet_body: &[u8]) -> MqttResult<AckDecodedFields> {
    if first_byte != expected_first_byte {
        return Err(MqttError::new_decoding_failure("invalid fixed header for an ack packet"));
    }

    let mut fields = AckDecodedFields::default();

    let mut bytes = decode_u16(packet_body, &mut fields.packet_id)?;
    if bytes.is_empty() {
        /* short form; reason code 0 and no properties */
        return Ok(fields);
    }

    bytes = decode_u8(bytes, &mut fields.reason_code)?;
    if bytes.is_empty() {
        return Ok(fields);
    }

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length != bytes.len() {
        return Err(MqttError::new_decoding_failure("ack property length does not match remaining packet length"));
    }

    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_REASON_STRING => { bytes = decode_optional_string(bytes, &mut fields.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut fields.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for an ack packet"));
            }
        }
    }

    Ok(fields)
}

fn decode_packet(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    let packet_type = first_byte >> 4;

    match packet_type {
        PACKET_TYPE_CONNECT => { connect::decode_connect(first_byte, packet_body) }
        PACKET_TYPE_CONNACK => { connack::decode_connack(first_byte, packet_body) }
        PACKET_TYPE_PUBLISH => { publish::decode_publish(first_byte, packet_body) }
        PACKET_TYPE_PUBACK => { puback::decode_puback(first_byte, packet_body) }
        PACKET_TYPE_PUBREC => { pubrec::decode_pubrec(first_byte, packet_body) }
        PACKET_TYPE_PUBREL => { pubrel::decode_pubrel(first_byte, packet_body) }
        PACKET_TYPE_PUBCOMP => { pubcomp::decode_pubcomp(first_byte, packet_body) }
        PACKET_TYPE_SUBSCRIBE => { subscribe::decode_subscribe(first_byte, packet_body) }
        PACKET_TYPE_SUBACK => { suback::decode_suback(first_byte, packet_body) }
        PACKET_TYPE_UNSUBSCRIBE => { unsubscribe::decode_unsubscribe(first_byte, packet_body) }
        PACKET_TYPE_UNSUBACK => { unsuback::decode_unsuback(first_byte, packet_body) }
        PACKET_TYPE_PINGREQ => { ping::decode_pingreq(first_byte, packet_body) }
        PACKET_TYPE_PINGRESP => { ping::decode_pingresp(first_byte, packet_body) }
        PACKET_TYPE_DISCONNECT => { disconnect::decode_disconnect(first_byte, packet_body) }
        PACKET_TYPE_AUTH => { auth::decode_auth(first_byte, packet_body) }
        _ => {
            Err(MqttError::new_decoding_failure("invalid packet type value"))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::encode::encode_packet;

    /// Encodes a packet and feeds the bytes back through a fresh decoder,
    /// asserting the decoded packet equals the input.  Also re-runs the bytes
    /// one at a time to exercise residual buffering.
    pub(crate) fn do_round_trip_encode_decode_test(packet: &MqttPacket) -> bool {
        let encoded = encode_packet(packet).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded_packets = VecDeque::new();
        let mut context = DecodingContext {
            maximum_packet_size: 0,
            decoded_packets: &mut decoded_packets,
        };

        decoder.decode_bytes(&encoded, &mut context).unwrap();
        assert_eq!(decoded_packets.len(), 1);
        assert_eq!(decoded_packets[0], *packet);

        let mut byte_decoder = Decoder::new();
        let mut trickled_packets = VecDeque::new();
        for byte in &encoded {
            let mut trickle_context = DecodingContext {
                maximum_packet_size: 0,
                decoded_packets: &mut trickled_packets,
            };
            byte_decoder.decode_bytes(std::slice::from_ref(byte), &mut trickle_context).unwrap();
        }

        assert_eq!(trickled_packets.len(), 1);
        assert_eq!(trickled_packets[0], *packet);

        true
    }

    #[test]
    fn vli_boundary_decodings() {
        let cases: Vec<(Vec<u8>, u32)> = vec![
            (vec![0x00], 0),
            (vec![0x7F], 127),
            (vec![0x80, 0x01], 128),
            (vec![0xFF, 0x7F], 16_383),
            (vec![0x80, 0x80, 0x01], 16_384),
            (vec![0xFF, 0xFF, 0x7F], 2_097_151),
            (vec![0x80, 0x80, 0x80, 0x01], 2_097_152),
            (vec![0xFF, 0xFF, 0xFF, 0x7F], 268_435_455),
        ];

        for (bytes, expected) in cases {
            match decode_vli(&bytes).unwrap() {
                DecodeVliResult::Value(value, remaining) => {
                    assert_eq!(value, expected);
                    assert!(remaining.is_empty());
                }
                DecodeVliResult::InsufficientData => panic!("expected a complete value"),
            }
        }
    }

    #[test]
    fn vli_decode_rejects_five_byte_encoding() {
        assert!(decode_vli(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn vli_decode_incomplete_asks_for_more_data() {
        assert_eq!(decode_vli(&[0x80]).unwrap(), DecodeVliResult::InsufficientData);
        assert_eq!(decode_vli(&[0x80, 0x80, 0x80]).unwrap(), DecodeVliResult::InsufficientData);
    }

    #[test]
    fn decoder_frames_multiple_packets_from_one_read() {
        let pingresp = encode_packet(&MqttPacket::Pingresp(crate::mqtt::PingrespPacket {})).unwrap();
        let puback = encode_packet(&MqttPacket::Puback(crate::mqtt::PubackPacket {
            packet_id: 5,
            ..Default::default()
        })).unwrap();

        let mut combined = pingresp.clone();
        combined.extend_from_slice(&puback);

        let mut decoder = Decoder::new();
        let mut decoded_packets = VecDeque::new();
        let mut context = DecodingContext {
            maximum_packet_size: 0,
            decoded_packets: &mut decoded_packets,
        };

        decoder.decode_bytes(&combined, &mut context).unwrap();
        assert_eq!(decoded_packets.len(), 2);
        assert_eq!(packet_type_of(&decoded_packets[0]), PacketType::Pingresp);
        assert_eq!(packet_type_of(&decoded_packets[1]), PacketType::Puback);
    }

    #[test]
    fn decoder_rejects_packet_over_maximum_size() {
        let publish = MqttPacket::Publish(crate::mqtt::PublishPacket {
            topic: "some/topic".to_string(),
            payload: vec![0; 256],
            ..Default::default()
        });
        let encoded = encode_packet(&publish).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded_packets = VecDeque::new();
        let mut context = DecodingContext {
            maximum_packet_size: 64,
            decoded_packets: &mut decoded_packets,
        };

        assert!(decoder.decode_bytes(&encoded, &mut context).is_err());
    }
}
