use crate::encode::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Keep-alive probe.  Carries no fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PingreqPacket {}

/// Keep-alive response.  Carries no fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PingrespPacket {}

pub(crate) fn decode_pingreq(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != PINGREQ_FIRST_BYTE || !packet_body.is_empty() {
        return Err(MqttError::new_decoding_failure("pingreq packets have a fixed two-byte encoding"));
    }

    Ok(MqttPacket::Pingreq(PingreqPacket {}))
}

pub(crate) fn decode_pingresp(first_byte: u8, packet_body: &[u8]) -> MqttResult<MqttPacket> {
    if first_byte != PINGRESP_FIRST_BYTE || !packet_body.is_empty() {
        return Err(MqttError::new_decoding_failure("pingresp packets have a fixed two-byte encoding"));
    }

    Ok(MqttPacket::Pingresp(PingrespPacket {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn ping_round_trips() {
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pingreq(PingreqPacket {})));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pingresp(PingrespPacket {})));
    }

    #[test]
    fn ping_decode_rejects_nonempty_body() {
        assert!(decode_pingreq(PINGREQ_FIRST_BYTE, &[0]).is_err());
        assert!(decode_pingresp(PINGRESP_FIRST_BYTE, &[0]).is_err());
    }
}
