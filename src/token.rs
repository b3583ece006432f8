/*!
Completion handles pairing user-submitted operations with their terminal
acknowledgements.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::MqttPacket;

use tokio::sync::oneshot;

/// Lifecycle state of one user operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TokenState {
    /// Submitted; terminal packet not yet received.
    Pending,

    /// Terminal packet received or, for packets with no acknowledgement, the
    /// transport write finished.
    Complete,

    /// The operation failed before reaching a terminal packet.
    Failed,
}

/// Outcome delivered to the caller when an operation completes.
#[derive(Debug)]
pub struct TokenResult {
    /// The terminal packet (CONNACK, SUBACK, UNSUBACK, PUBACK, or PUBCOMP),
    /// when the operation has one.
    pub response: Option<MqttPacket>,

    /// Reason codes accumulated across the operation's acknowledgements.  For
    /// a QoS 2 publish this includes the PUBREC codes followed by the PUBCOMP
    /// codes.
    pub reason_codes: Vec<u8>,
}

/// Internal record tracking one in-flight operation.
///
/// Tokens are keyed by a monotone id assigned at submission; packet-id-bearing
/// operations are additionally indexed by packet id in the session state.
/// QoS 0 publishes are tracked by token id alone.
pub(crate) struct Token {
    pub id: u64,

    /// The request packet as submitted (packet id bound in place later).
    pub request: MqttPacket,

    /// Packet id bound to the request, or None for QoS 0 publishes.
    pub packet_id: Option<u16>,

    /// Reason codes accumulated from intermediate acks (PUBREC).
    pub reason_codes: Vec<u8>,

    pub state: TokenState,

    /// Holds the failure when it could not be delivered to the caller.
    pub error: Option<MqttError>,

    sender: Option<oneshot::Sender<MqttResult<TokenResult>>>,
}

impl Token {
    pub fn new(id: u64, request: MqttPacket, sender: Option<oneshot::Sender<MqttResult<TokenResult>>>) -> Token {
        Token {
            id,
            request,
            packet_id: None,
            reason_codes: Vec::new(),
            state: TokenState::Pending,
            error: None,
            sender,
        }
    }

    pub fn append_reason_codes(&mut self, codes: &[u8]) {
        self.reason_codes.extend_from_slice(codes);
    }

    /// Marks the operation complete and delivers the accumulated outcome.
    pub fn complete(&mut self, response: Option<MqttPacket>) {
        if self.state != TokenState::Pending {
            return;
        }

        self.state = TokenState::Complete;

        if let Some(sender) = self.sender.take() {
            let result = TokenResult {
                response,
                reason_codes: std::mem::take(&mut self.reason_codes),
            };
            let _ = sender.send(Ok(result));
        }
    }

    /// Marks the operation failed.  The error lands in the caller's future,
    /// or in the token's error slot when the caller is gone.
    pub fn fail(&mut self, error: MqttError) {
        if self.state != TokenState::Pending {
            return;
        }

        self.state = TokenState::Failed;

        match self.sender.take() {
            Some(sender) => {
                if let Err(unsent) = sender.send(Err(error)) {
                    if let Err(unsent_error) = unsent {
                        self.error = Some(unsent_error);
                    }
                }
            }
            None => {
                self.error = Some(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{PublishPacket, PubackPacket};
    use assert_matches::assert_matches;

    #[test]
    fn token_completes_once_with_accumulated_codes() {
        let (sender, mut receiver) = oneshot::channel();
        let mut token = Token::new(1, MqttPacket::Publish(PublishPacket::default()), Some(sender));

        token.append_reason_codes(&[0x00]);
        token.append_reason_codes(&[0x10]);
        token.complete(Some(MqttPacket::Puback(PubackPacket::default())));
        assert_eq!(token.state, TokenState::Complete);

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.reason_codes, vec![0x00, 0x10]);
        assert_matches!(result.response, Some(MqttPacket::Puback(_)));

        // second completion is ignored
        token.complete(None);
        assert_eq!(token.state, TokenState::Complete);
    }

    #[test]
    fn token_failure_reaches_the_caller() {
        let (sender, mut receiver) = oneshot::channel();
        let mut token = Token::new(2, MqttPacket::Publish(PublishPacket::default()), Some(sender));

        token.fail(MqttError::new_not_connected());
        assert_eq!(token.state, TokenState::Failed);
        assert_matches!(receiver.try_recv().unwrap(), Err(MqttError::NotConnected(_)));
    }

    #[test]
    fn token_failure_without_a_listener_lands_in_the_error_slot() {
        let mut token = Token::new(3, MqttPacket::Publish(PublishPacket::default()), None);

        token.fail(MqttError::new_buffer_full());
        assert_matches!(token.error, Some(MqttError::BufferFull(_)));
    }
}
