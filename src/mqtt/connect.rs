use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Client-to-server connection request.
///
/// The will, when present, is modeled as a [`PublishPacket`]; its topic,
/// payload, qos, retain flag, and message properties map onto the will fields
/// of the wire encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectPacket {
    /// Seconds of permitted silence between client packets.  Zero disables
    /// the keep alive contract.
    pub keep_alive_interval_seconds: u16,

    /// Start a fresh session, discarding any server-side session state.
    pub clean_start: bool,

    /// Session identifier.  An empty string asks the server to assign one.
    pub client_id: String,

    /// Authentication user name.
    pub username: Option<String>,

    /// Authentication password.  Read independently of the user name.
    pub password: Option<Vec<u8>>,

    /// Seconds the server should keep session state after disconnect.  Absent
    /// or zero means the session dies with the connection.
    pub session_expiry_interval_seconds: Option<u32>,

    /// Most concurrent unacknowledged QoS 1/2 publishes this client accepts.
    pub receive_maximum: Option<u16>,

    /// Largest packet this client accepts.
    pub maximum_packet_size_bytes: Option<u32>,

    /// Most topic aliases this client accepts on inbound publishes.
    pub topic_alias_maximum: Option<u16>,

    /// Ask the server for response information in the CONNACK.
    pub request_response_information: Option<bool>,

    /// Ask the server to include reason strings and user properties on
    /// failures.
    pub request_problem_information: Option<bool>,

    /// Extended authentication method name.
    pub authentication_method: Option<String>,

    /// Extended authentication payload.
    pub authentication_data: Option<Vec<u8>>,

    /// Seconds the server should delay publishing the will.
    pub will_delay_interval_seconds: Option<u32>,

    /// Message published by the server if this connection dies unexpectedly.
    pub will: Option<PublishPacket>,

    /// Arbitrary name-value pairs supplied by the client.
    pub user_properties: Option<Vec<UserProperty>>,
}

impl Default for ConnectPacket {
    fn default() -> Self {
        ConnectPacket {
            keep_alive_interval_seconds: 60,
            clean_start: false,
            client_id: String::new(),
            username: None,
            password: None,
            session_expiry_interval_seconds: None,
            receive_maximum: None,
            maximum_packet_size_bytes: None,
            topic_alias_maximum: None,
            request_response_information: None,
            request_problem_information: None,
            authentication_method: None,
            authentication_data: None,
            will_delay_interval_seconds: None,
            will: None,
            user_properties: None,
        }
    }
}

fn compute_connect_property_length(packet: &ConnectPacket) -> usize {
    optional_u32_property_length(&packet.session_expiry_interval_seconds)
        + optional_u16_property_length(&packet.receive_maximum)
        + optional_u32_property_length(&packet.maximum_packet_size_bytes)
        + optional_u16_property_length(&packet.topic_alias_maximum)
        + optional_u8_property_length(&packet.request_response_information)
        + optional_u8_property_length(&packet.request_problem_information)
        + optional_string_property_length(&packet.authentication_method)
        + optional_binary_property_length(&packet.authentication_data)
        + user_properties_length(&packet.user_properties)
}

fn compute_will_property_length(packet: &ConnectPacket, will: &PublishPacket) -> usize {
    optional_u32_property_length(&packet.will_delay_interval_seconds)
        + optional_u8_property_length(&will.payload_format)
        + optional_u32_property_length(&will.message_expiry_interval_seconds)
        + optional_string_property_length(&will.content_type)
        + optional_string_property_length(&will.response_topic)
        + optional_binary_property_length(&will.correlation_data)
        + user_properties_length(&will.user_properties)
}

pub(crate) fn encode_connect(packet: &ConnectPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = compute_connect_property_length(packet);

    let mut connect_flags: u8 = 0;
    if packet.clean_start {
        connect_flags |= 1 << 1;
    }
    if packet.username.is_some() {
        connect_flags |= 1 << 7;
    }
    if packet.password.is_some() {
        connect_flags |= 1 << 6;
    }

    let mut will_length = 0;
    if let Some(will) = &packet.will {
        connect_flags |= 1 << 2;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 1 << 5;
        }

        let will_property_length = compute_will_property_length(packet, will);
        will_length = vli_length(will_property_length)? + will_property_length
            + 2 + will.topic.len()
            + 2 + will.payload.len();
    }

    // variable header: protocol name, level byte, flags, keep alive, properties
    let mut remaining_length = 6 + 1 + 1 + 2;
    remaining_length += vli_length(property_length)? + property_length;
    remaining_length += 2 + packet.client_id.len();
    remaining_length += will_length;
    if let Some(username) = &packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(password) = &packet.password {
        remaining_length += 2 + password.len();
    }

    dest.push(CONNECT_FIRST_BYTE);
    write_vli(dest, remaining_length)?;
    write_string(dest, "MQTT")?;
    dest.push(5);
    dest.push(connect_flags);
    write_u16(dest, packet.keep_alive_interval_seconds);

    write_vli(dest, property_length)?;
    write_optional_u32_property(dest, PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, packet.session_expiry_interval_seconds);
    write_optional_u16_property(dest, PROPERTY_KEY_RECEIVE_MAXIMUM, packet.receive_maximum);
    write_optional_u32_property(dest, PROPERTY_KEY_MAXIMUM_PACKET_SIZE, packet.maximum_packet_size_bytes);
    write_optional_u16_property(dest, PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM, packet.topic_alias_maximum);
    write_optional_bool_property(dest, PROPERTY_KEY_REQUEST_RESPONSE_INFORMATION, packet.request_response_information);
    write_optional_bool_property(dest, PROPERTY_KEY_REQUEST_PROBLEM_INFORMATION, packet.request_problem_information);
    write_optional_string_property(dest, PROPERTY_KEY_AUTHENTICATION_METHOD, &packet.authentication_method)?;
    write_optional_binary_property(dest, PROPERTY_KEY_AUTHENTICATION_DATA, &packet.authentication_data)?;
    write_user_properties(dest, &packet.user_properties)?;

    write_string(dest, &packet.client_id)?;

    if let Some(will) = &packet.will {
        let will_property_length = compute_will_property_length(packet, will);
        write_vli(dest, will_property_length)?;
        write_optional_u32_property(dest, PROPERTY_KEY_WILL_DELAY_INTERVAL, packet.will_delay_interval_seconds);
        write_optional_u8_property(dest, PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR, will.payload_format.map(|v| v as u8));
        write_optional_u32_property(dest, PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL, will.message_expiry_interval_seconds);
        write_optional_string_property(dest, PROPERTY_KEY_CONTENT_TYPE, &will.content_type)?;
        write_optional_string_property(dest, PROPERTY_KEY_RESPONSE_TOPIC, &will.response_topic)?;
        write_optional_binary_property(dest, PROPERTY_KEY_CORRELATION_DATA, &will.correlation_data)?;
        write_user_properties(dest, &will.user_properties)?;

        write_string(dest, &will.topic)?;
        write_binary(dest, &will.payload)?;
    }

    if let Some(username) = &packet.username {
        write_string(dest, username)?;
    }

    if let Some(password) = &packet.password {
        write_binary(dest, password)?;
    }

    Ok(())
}

fn decode_connect_properties<'a>(mut bytes: &'a [u8], packet: &mut ConnectPacket) -> MqttResult<()> {
    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_SESSION_EXPIRY_INTERVAL => { bytes = decode_optional_u32(bytes, &mut packet.session_expiry_interval_seconds)?; }
            PROPERTY_KEY_RECEIVE_MAXIMUM => { bytes = decode_optional_u16(bytes, &mut packet.receive_maximum)?; }
            PROPERTY_KEY_MAXIMUM_PACKET_SIZE => { bytes = decode_optional_u32(bytes, &mut packet.maximum_packet_size_bytes)?; }
            PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM => { bytes = decode_optional_u16(bytes, &mut packet.topic_alias_maximum)?; }
            PROPERTY_KEY_REQUEST_RESPONSE_INFORMATION => { bytes = decode_optional_u8_as_bool(bytes, &mut packet.request_response_information)?; }
            PROPERTY_KEY_REQUEST_PROBLEM_INFORMATION => { bytes = decode_optional_u8_as_bool(bytes, &mut packet.request_problem_information)?; }
            PROPERTY_KEY_AUTHENTICATION_METHOD => { bytes = decode_optional_string(bytes, &mut packet.authentication_method)?; }
            PROPERTY_KEY_AUTHENTICATION_DATA => { bytes = decode_optional_binary(bytes, &mut packet.authentication_data)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut packet.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for a connect packet"));
            }
        }
    }

    Ok(())
}

fn decode_will_properties<'a>(mut bytes: &'a [u8], packet: &mut ConnectPacket, will: &mut PublishPacket) -> MqttResult<()> {
    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_WILL_DELAY_INTERVAL => { bytes = decode_optional_u32(bytes, &mut packet.will_delay_interval_seconds)?; }
            PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR => {
                let mut value = PayloadFormatIndicator::Bytes;
                bytes = decode_u8_as_enum(bytes, &mut value, convert_u8_to_payload_format_indicator)?;
                will.payload_format = Some(value);
            }
            PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL => { bytes = decode_optional_u32(bytes, &mut will.message_expiry_interval_seconds)?; }
            PROPERTY_KEY_CONTENT_TYPE => { bytes = decode_optional_string(bytes, &mut will.content_type)?; }
            PROPERTY_KEY_RESPONSE_TOPIC => { bytes = decode_optional_string(bytes, &mut will.response_topic)?; }
            PROPERTY_KEY_CORRELATION_DATA => { bytes = decode_optional_binary(bytes, &mut will.correlation_data)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut will.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for will properties"));
            }
        }
    }

    Ok(())
}

pub(crate) fn decode_connect(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != CONNECT_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for a connect packet"));
    }

    let mut protocol_name = String::new();
    let mut bytes = decode_string(packet_body, &mut protocol_name)?;
    if protocol_name != "MQTT" {
        return Err(MqttError::new_decoding_failure("unrecognized protocol name in connect packet"));
    }

    let mut protocol_level = 0;
    bytes = decode_u8(bytes, &mut protocol_level)?;
    if protocol_level != 5 {
        return Err(MqttError::new_decoding_failure("unsupported protocol level in connect packet"));
    }

    let mut connect_flags = 0;
    bytes = decode_u8(bytes, &mut connect_flags)?;
    if (connect_flags & 0x01) != 0 {
        return Err(MqttError::new_decoding_failure("connect flags reserved bit must be zero"));
    }

    let mut packet = ConnectPacket {
        clean_start: (connect_flags & (1 << 1)) != 0,
        ..Default::default()
    };

    bytes = decode_u16(bytes, &mut packet.keep_alive_interval_seconds)?;

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length > bytes.len() {
        return Err(MqttError::new_decoding_failure("connect property length exceeds remaining packet length"));
    }

    decode_connect_properties(&bytes[..property_length], &mut packet)?;
    bytes = &bytes[property_length..];

    bytes = decode_string(bytes, &mut packet.client_id)?;

    if (connect_flags & (1 << 2)) != 0 {
        let mut will = PublishPacket {
            qos: convert_u8_to_quality_of_service((connect_flags >> 3) & 0x03)?,
            retain: (connect_flags & (1 << 5)) != 0,
            ..Default::default()
        };

        let mut will_property_length = 0;
        bytes = decode_vli_into_mutable(bytes, &mut will_property_length)?;
        if will_property_length > bytes.len() {
            return Err(MqttError::new_decoding_failure("will property length exceeds remaining packet length"));
        }

        decode_will_properties(&bytes[..will_property_length], &mut packet, &mut will)?;
        bytes = &bytes[will_property_length..];

        bytes = decode_string(bytes, &mut will.topic)?;
        bytes = decode_binary(bytes, &mut will.payload)?;

        packet.will = Some(will);
    }

    if (connect_flags & (1 << 7)) != 0 {
        bytes = decode_optional_string(bytes, &mut packet.username)?;
    }

    if (connect_flags & (1 << 6)) != 0 {
        bytes = decode_optional_binary(bytes, &mut packet.password)?;
    }

    if !bytes.is_empty() {
        return Err(MqttError::new_decoding_failure("extra bytes after connect packet payload"));
    }

    Ok(MqttPacket::Connect(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn connect_round_trip_minimal() {
        let packet = ConnectPacket {
            client_id: "reactor-4".to_string(),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connect(packet)));
    }

    #[test]
    fn connect_round_trip_credentials_read_separately() {
        let packet = ConnectPacket {
            client_id: "reactor-4".to_string(),
            username: Some("operator".to_string()),
            password: Some(b"hunter2".to_vec()),
            ..Default::default()
        };

        let encoded = crate::encode::encode_packet(&MqttPacket::Connect(packet.clone())).unwrap();
        if let MqttPacket::Connect(decoded) = decode_connect(encoded[0], &encoded[2..]).unwrap() {
            assert_eq!(decoded.username.as_deref(), Some("operator"));
            assert_eq!(decoded.password.as_deref(), Some(b"hunter2".as_slice()));
        } else {
            panic!("expected a connect packet");
        }

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connect(packet)));
    }

    #[test]
    fn connect_round_trip_everything() {
        let packet = ConnectPacket {
            keep_alive_interval_seconds: 30,
            clean_start: true,
            client_id: "ingest-17".to_string(),
            username: Some("svc-ingest".to_string()),
            password: Some(vec![1, 2, 3, 4]),
            session_expiry_interval_seconds: Some(3600),
            receive_maximum: Some(20),
            maximum_packet_size_bytes: Some(128 * 1024),
            topic_alias_maximum: Some(25),
            request_response_information: Some(true),
            request_problem_information: Some(false),
            authentication_method: None,
            authentication_data: None,
            will_delay_interval_seconds: Some(10),
            will: Some(PublishPacket {
                topic: "clients/ingest-17/offline".to_string(),
                qos: QualityOfService::AtLeastOnce,
                retain: true,
                payload: b"gone".to_vec(),
                payload_format: Some(PayloadFormatIndicator::Utf8),
                message_expiry_interval_seconds: Some(300),
                content_type: Some("text/plain".to_string()),
                ..Default::default()
            }),
            user_properties: Some(vec![
                UserProperty { name: "build".to_string(), value: "2024.06".to_string() },
            ]),
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connect(packet)));
    }

    #[test]
    fn connect_decode_rejects_wrong_protocol_level() {
        let packet = MqttPacket::Connect(ConnectPacket {
            client_id: "c".to_string(),
            ..Default::default()
        });

        let mut encoded = crate::encode::encode_packet(&packet).unwrap();
        encoded[8] = 4; // protocol level byte
        assert!(decode_connect(encoded[0], &encoded[2..]).is_err());
    }
}
