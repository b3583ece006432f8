use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Enhanced authentication exchange packet.  The codec supports it fully; the
/// engine does not drive authentication exchanges and surfaces receipt as an
/// unimplemented-feature error.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthPacket {
    /// Exchange state indicator.
    pub reason_code: AuthenticateReasonCode,

    /// Authentication method; must match the CONNECT value for the session.
    pub authentication_method: Option<String>,

    /// Method-specific payload.
    pub authentication_data: Option<Vec<u8>>,

    /// Optional human-readable diagnostic.
    pub reason_string: Option<String>,

    /// Arbitrary name-value pairs supplied by the sender.
    pub user_properties: Option<Vec<UserProperty>>,
}

pub(crate) fn encode_auth(packet: &AuthPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let property_length = optional_string_property_length(&packet.authentication_method)
        + optional_binary_property_length(&packet.authentication_data)
        + optional_string_property_length(&packet.reason_string)
        + user_properties_length(&packet.user_properties);

    dest.push(AUTH_FIRST_BYTE);

    if property_length == 0 && packet.reason_code == AuthenticateReasonCode::Success {
        write_vli(dest, 0)?;
        return Ok(());
    }

    let remaining_length = 1 + vli_length(property_length)? + property_length;
    write_vli(dest, remaining_length)?;
    dest.push(packet.reason_code as u8);

    write_vli(dest, property_length)?;
    write_optional_string_property(dest, PROPERTY_KEY_AUTHENTICATION_METHOD, &packet.authentication_method)?;
    write_optional_binary_property(dest, PROPERTY_KEY_AUTHENTICATION_DATA, &packet.authentication_data)?;
    write_optional_string_property(dest, PROPERTY_KEY_REASON_STRING, &packet.reason_string)?;
    write_user_properties(dest, &packet.user_properties)?;

    Ok(())
}

pub(crate) fn decode_auth(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != AUTH_FIRST_BYTE {
        return Err(MqttError::new_decoding_failure("invalid fixed header for an auth packet"));
    }

    let mut packet = AuthPacket::default();

    if packet_body.is_empty() {
        return Ok(MqttPacket::Auth(packet));
    }

    let mut bytes = decode_u8_as_enum(packet_body, &mut packet.reason_code, convert_u8_to_authenticate_reason_code)?;
    if bytes.is_empty() {
        return Ok(MqttPacket::Auth(packet));
    }

    let mut property_length = 0;
    bytes = decode_vli_into_mutable(bytes, &mut property_length)?;
    if property_length != bytes.len() {
        return Err(MqttError::new_decoding_failure("auth property length does not match remaining packet length"));
    }

    while !bytes.is_empty() {
        let mut property_key = 0;
        bytes = decode_u8(bytes, &mut property_key)?;

        match property_key {
            PROPERTY_KEY_AUTHENTICATION_METHOD => { bytes = decode_optional_string(bytes, &mut packet.authentication_method)?; }
            PROPERTY_KEY_AUTHENTICATION_DATA => { bytes = decode_optional_binary(bytes, &mut packet.authentication_data)?; }
            PROPERTY_KEY_REASON_STRING => { bytes = decode_optional_string(bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { bytes = decode_user_property(bytes, &mut packet.user_properties)?; }
            _ => {
                return Err(MqttError::new_decoding_failure("invalid property type for an auth packet"));
            }
        }
    }

    Ok(MqttPacket::Auth(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn auth_round_trip_minimal() {
        let packet = AuthPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Auth(packet)));
    }

    #[test]
    fn auth_round_trip_continue_exchange() {
        let packet = AuthPacket {
            reason_code: AuthenticateReasonCode::ContinueAuthentication,
            authentication_method: Some("SCRAM-SHA-256".to_string()),
            authentication_data: Some(vec![11, 22, 33]),
            reason_string: Some("next challenge".to_string()),
            user_properties: None,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Auth(packet)));
    }
}
