/*!
Durable per-session state: the packet-id allocator, in-flight outbound
operations, the retry queue, the inbound QoS 2 registry, and message listener
routing.

Session state survives reconnects whenever the connection was made with
clean-start false and a non-zero session expiry; it is cleared on clean-start
and on connection end with zero session expiry.
 */

use crate::decode::{Decoder, DecodingContext};
use crate::encode::encode_packet;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::persist::*;

use log::*;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Callback invoked with every inbound publish routed to a matching
/// subscription.
pub type MessageListener = Arc<dyn Fn(&PublishPacket) + Send + Sync>;

#[derive(Clone, Eq, PartialEq, Hash)]
struct ListenerKey {
    subscription_id: Option<u32>,
    topic_filter: String,
}

pub(crate) struct SessionState {
    /// Cursor for packet id allocation; points at the next candidate.
    next_packet_id: u16,

    /// packet id -> token id, for outbound operations awaiting a terminal ack.
    pub out_tokens: HashMap<u16, u64>,

    /// packet id -> wire message awaiting retransmission on session
    /// resumption.  Holds PUBLISH entries until PUBREC/PUBACK and PUBREL
    /// entries until PUBCOMP.  Ordered so replay follows packet id order.
    pub retry_queue: BTreeMap<u16, MqttPacket>,

    /// Inbound QoS 2 packet ids for which a PUBREC has been sent but the
    /// PUBREL has not yet been processed.
    pub inbound_qos2: HashSet<u16>,

    listeners: HashMap<ListenerKey, MessageListener>,

    /// User intent: drives automatic reconnection.
    pub should_be_connected: bool,

    /// Session identifier; the broker may overwrite this via the CONNACK
    /// assigned-client-identifier property.
    pub client_id: String,
}

impl SessionState {
    pub fn new(client_id: &str) -> SessionState {
        SessionState {
            next_packet_id: 1,
            out_tokens: HashMap::new(),
            retry_queue: BTreeMap::new(),
            inbound_qos2: HashSet::new(),
            listeners: HashMap::new(),
            should_be_connected: false,
            client_id: client_id.to_string(),
        }
    }

    /// Allocates the first free packet id at or after the cursor, wrapping at
    /// 65535.  Fails after a full rotation finds nothing free.
    pub fn next_packet_id(&mut self) -> MqttResult<u16> {
        let start_id = self.next_packet_id;

        loop {
            let candidate = self.next_packet_id;

            if self.next_packet_id == u16::MAX {
                self.next_packet_id = 1;
            } else {
                self.next_packet_id += 1;
            }

            if !self.is_packet_id_allocated(candidate) {
                return Ok(candidate);
            }

            if self.next_packet_id == start_id {
                error!("session - packet id space exhausted");
                return Err(MqttError::new_packet_ids_exhausted());
            }
        }
    }

    fn is_packet_id_allocated(&self, id: u16) -> bool {
        self.out_tokens.contains_key(&id)
            || self.retry_queue.contains_key(&id)
            || self.inbound_qos2.contains(&id)
    }

    /// Binds a token to a freshly allocated packet id.
    pub fn register_outbound(&mut self, packet_id: u16, token_id: u64) {
        debug_assert!(!self.out_tokens.contains_key(&packet_id));
        self.out_tokens.insert(packet_id, token_id);
    }

    /// Frees a packet id on terminal acknowledgement, dropping any retry
    /// state and its durable image.  Returns the owning token id when one
    /// exists; entries recovered from persistence after a restart have none.
    pub fn complete_outbound(&mut self, packet_id: u16, persistence: &mut dyn Persistence) -> MqttResult<Option<u64>> {
        let token_id = self.out_tokens.remove(&packet_id);

        if self.retry_queue.remove(&packet_id).is_some() {
            persistence.remove(&make_outbound_key(packet_id))?;
        }

        Ok(token_id)
    }

    /// Records a wire message for retransmission, durably.  Replaces any
    /// existing entry for the packet id, which is how a PUBLISH becomes a
    /// PUBREL when the PUBREC arrives.
    pub fn add_retry(&mut self, packet: MqttPacket, persistence: &mut dyn Persistence) -> MqttResult<()> {
        let packet_id = packet_id_of(&packet)
            .ok_or_else(|| MqttError::new_internal_state_error("retry queue entries must carry a packet id"))?;

        let wire_image = encode_packet(&packet)?;
        persistence.put(&make_outbound_key(packet_id), &wire_image)?;
        self.retry_queue.insert(packet_id, packet);

        Ok(())
    }

    /// Durably records an inbound QoS 2 packet id.  Must be called before the
    /// PUBREC is emitted so a restart cannot double-deliver.
    pub fn add_inbound_qos2(&mut self, packet_id: u16, persistence: &mut dyn Persistence) -> MqttResult<()> {
        persistence.put(&make_inbound_key(packet_id), &[])?;
        self.inbound_qos2.insert(packet_id);
        Ok(())
    }

    /// Forgets an inbound QoS 2 packet id.  Called after the PUBCOMP has been
    /// handed to the transport.
    pub fn complete_inbound_qos2(&mut self, packet_id: u16, persistence: &mut dyn Persistence) -> MqttResult<()> {
        self.inbound_qos2.remove(&packet_id);
        persistence.remove(&make_inbound_key(packet_id))?;
        Ok(())
    }

    /// Drops all delivery state and resets the packet id cursor.  Invoked on
    /// clean-start and on connection end with zero session expiry.  Returns
    /// the token ids that were still in flight so the caller can fail them.
    pub fn clear(&mut self, persistence: &mut dyn Persistence) -> MqttResult<Vec<u64>> {
        let orphaned: Vec<u64> = self.out_tokens.values().copied().collect();

        self.out_tokens.clear();
        self.retry_queue.clear();
        self.inbound_qos2.clear();
        self.next_packet_id = 1;
        persistence.clear()?;

        Ok(orphaned)
    }

    /// Reloads the retry queue and the inbound QoS 2 registry from the
    /// durable store.  Recovered retry entries have no tokens; their eventual
    /// acks free the packet ids silently.
    pub fn restore(&mut self, persistence: &mut dyn Persistence) -> MqttResult<()> {
        for key in persistence.keys()? {
            match parse_key(&key) {
                Some((OUTBOUND_KEY_PREFIX, packet_id)) => {
                    let blob = persistence.get(&key)?
                        .ok_or_else(|| MqttError::new_persistence_failure("listed key vanished during restore"))?;
                    let packet = decode_wire_image(&blob)?;
                    info!("session - restored outbound {} for packet id {}",
                          packet_type_to_str(packet_type_of(&packet)), packet_id);
                    self.retry_queue.insert(packet_id, packet);
                }
                Some((INBOUND_KEY_PREFIX, packet_id)) => {
                    info!("session - restored inbound qos2 marker for packet id {}", packet_id);
                    self.inbound_qos2.insert(packet_id);
                }
                _ => {
                    warn!("session - ignoring unrecognized persistence key \"{}\"", key);
                }
            }
        }

        Ok(())
    }

    pub fn set_message_listener(&mut self, subscription_id: Option<u32>, topic_filter: &str, listener: MessageListener) {
        self.listeners.insert(ListenerKey {
            subscription_id,
            topic_filter: topic_filter.to_string(),
        }, listener);
    }

    pub fn remove_message_listener(&mut self, subscription_id: Option<u32>, topic_filter: &str) {
        self.listeners.remove(&ListenerKey {
            subscription_id,
            topic_filter: topic_filter.to_string(),
        });
    }

    /// Resolves the listener for an inbound publish.  A subscription
    /// identifier on the publish takes precedence; otherwise the topic is
    /// matched against listener filters with MQTT wildcard semantics.
    pub fn get_message_listener(&self, subscription_ids: Option<&Vec<u32>>, topic: &str) -> Option<MessageListener> {
        if let Some(ids) = subscription_ids {
            for id in ids {
                for (key, listener) in &self.listeners {
                    if key.subscription_id == Some(*id) {
                        return Some(listener.clone());
                    }
                }
            }
        }

        for (key, listener) in &self.listeners {
            if topic_filter_matches(&key.topic_filter, topic) {
                return Some(listener.clone());
            }
        }

        None
    }
}

/// Decodes a single packet from a stored wire image.
fn decode_wire_image(blob: &[u8]) -> MqttResult<MqttPacket> {
    let mut decoder = Decoder::new();
    let mut decoded_packets = VecDeque::new();
    let mut context = DecodingContext {
        maximum_packet_size: 0,
        decoded_packets: &mut decoded_packets,
    };

    decoder.decode_bytes(blob, &mut context)?;

    decoded_packets.pop_front()
        .ok_or_else(|| MqttError::new_persistence_failure("stored wire image does not contain a whole packet"))
}

/// Matches a topic name against a subscription filter.
///
/// `+` matches exactly one level, `#` matches any remainder including the
/// parent level, and wildcards never match topics whose first level starts
/// with `$`.
pub(crate) fn topic_filter_matches(filter: &str, topic: &str) -> bool {
    if (filter.starts_with('+') || filter.starts_with('#')) && topic.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match filter_levels.next() {
            Some("#") => {
                return true;
            }
            Some("+") => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            Some(filter_level) => {
                if topic_levels.next() != Some(filter_level) {
                    return false;
                }
            }
            None => {
                return topic_levels.next().is_none();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_session() -> (SessionState, MemoryPersistence) {
        (SessionState::new("test-client"), MemoryPersistence::new())
    }

    fn make_qos2_publish(packet_id: u16) -> MqttPacket {
        MqttPacket::Publish(PublishPacket {
            topic: "a".to_string(),
            qos: QualityOfService::ExactlyOnce,
            packet_id,
            payload: b"x".to_vec(),
            ..Default::default()
        })
    }

    #[test]
    fn packet_ids_are_unique_while_in_flight() {
        let (mut session, _) = make_session();

        let first = session.next_packet_id().unwrap();
        session.register_outbound(first, 100);

        let second = session.next_packet_id().unwrap();
        assert_ne!(first, second);
        session.register_outbound(second, 101);

        // skip over ids held by the retry queue as well
        let mut store = MemoryPersistence::new();
        let third = session.next_packet_id().unwrap();
        session.add_retry(make_qos2_publish(third), &mut store).unwrap();
        let fourth = session.next_packet_id().unwrap();
        assert!(![first, second, third].contains(&fourth));
    }

    #[test]
    fn packet_id_cursor_wraps() {
        let (mut session, _) = make_session();
        session.next_packet_id = u16::MAX;

        assert_eq!(session.next_packet_id().unwrap(), u16::MAX);
        assert_eq!(session.next_packet_id().unwrap(), 1);
    }

    #[test]
    fn packet_id_exhaustion_fails_and_recovers() {
        let (mut session, mut store) = make_session();

        for id in 1..=u16::MAX {
            session.register_outbound(id, id as u64);
        }
        assert_matches!(session.next_packet_id(), Err(MqttError::PacketIdsExhausted(_)));

        // freeing any id makes allocation work again
        session.complete_outbound(40_000, &mut store).unwrap();
        assert_eq!(session.next_packet_id().unwrap(), 40_000);
    }

    #[test]
    fn complete_outbound_drops_retry_state_and_durable_image() {
        let (mut session, mut store) = make_session();

        let id = session.next_packet_id().unwrap();
        session.register_outbound(id, 7);
        session.add_retry(make_qos2_publish(id), &mut store).unwrap();
        assert!(store.get(&make_outbound_key(id)).unwrap().is_some());

        let token_id = session.complete_outbound(id, &mut store).unwrap();
        assert_eq!(token_id, Some(7));
        assert!(session.retry_queue.is_empty());
        assert!(store.get(&make_outbound_key(id)).unwrap().is_none());
    }

    #[test]
    fn retry_entry_transitions_publish_to_pubrel() {
        let (mut session, mut store) = make_session();

        session.add_retry(make_qos2_publish(9), &mut store).unwrap();
        session.add_retry(MqttPacket::Pubrel(PubrelPacket {
            packet_id: 9,
            ..Default::default()
        }), &mut store).unwrap();

        assert_eq!(session.retry_queue.len(), 1);
        assert_matches!(session.retry_queue.get(&9), Some(MqttPacket::Pubrel(_)));

        // the durable image reflects the transition too
        let blob = store.get(&make_outbound_key(9)).unwrap().unwrap();
        let restored = decode_wire_image(&blob).unwrap();
        assert_matches!(restored, MqttPacket::Pubrel(_));
    }

    #[test]
    fn restore_rebuilds_retry_queue_and_inbound_registry() {
        let (mut session, mut store) = make_session();

        session.add_retry(make_qos2_publish(3), &mut store).unwrap();
        session.add_retry(make_qos2_publish(1), &mut store).unwrap();
        session.add_inbound_qos2(17, &mut store).unwrap();

        let mut recovered = SessionState::new("test-client");
        recovered.restore(&mut store).unwrap();

        let replay_order: Vec<u16> = recovered.retry_queue.keys().copied().collect();
        assert_eq!(replay_order, vec![1, 3]);
        assert!(recovered.inbound_qos2.contains(&17));
        assert!(recovered.out_tokens.is_empty());
    }

    #[test]
    fn clear_resets_everything_and_reports_orphans() {
        let (mut session, mut store) = make_session();

        let id = session.next_packet_id().unwrap();
        session.register_outbound(id, 55);
        session.add_retry(make_qos2_publish(id), &mut store).unwrap();
        session.add_inbound_qos2(8, &mut store).unwrap();

        let orphaned = session.clear(&mut store).unwrap();
        assert_eq!(orphaned, vec![55]);
        assert!(session.retry_queue.is_empty());
        assert!(session.inbound_qos2.is_empty());
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(session.next_packet_id().unwrap(), 1);
    }

    #[test]
    fn listener_resolution_prefers_subscription_identifier() {
        let (mut session, _) = make_session();

        session.set_message_listener(Some(5), "by-id/topic", Arc::new(|_| {}));
        session.set_message_listener(None, "some/+", Arc::new(|_| {}));

        assert!(session.get_message_listener(Some(&vec![5]), "unrelated/topic").is_some());
        assert!(session.get_message_listener(None, "some/topic").is_some());
        assert!(session.get_message_listener(None, "unrelated/topic").is_none());
    }

    #[test]
    fn listener_removal() {
        let (mut session, _) = make_session();

        session.set_message_listener(None, "a/b", Arc::new(|_| {}));
        session.remove_message_listener(None, "a/b");
        assert!(session.get_message_listener(None, "a/b").is_none());
    }

    #[test]
    fn topic_filter_single_level_wildcard() {
        assert!(topic_filter_matches("sport/tennis/+", "sport/tennis/player1"));
        assert!(!topic_filter_matches("sport/tennis/+", "sport/tennis/player1/ranking"));
        assert!(!topic_filter_matches("sport/tennis/+", "sport/tennis"));
    }

    #[test]
    fn topic_filter_multi_level_wildcard() {
        assert!(topic_filter_matches("sport/#", "sport"));
        assert!(topic_filter_matches("sport/#", "sport/tennis/player1"));
        assert!(topic_filter_matches("#", "anything/at/all"));
    }

    #[test]
    fn topic_filter_dollar_topics_hidden_from_wildcards() {
        assert!(!topic_filter_matches("#", "$SYS/broker/load"));
        assert!(!topic_filter_matches("+/broker/load", "$SYS/broker/load"));
        assert!(topic_filter_matches("$SYS/#", "$SYS/broker/load"));
        assert!(!topic_filter_matches("$SYS/#", "sport/tennis"));
    }

    #[test]
    fn topic_filter_exact_match() {
        assert!(topic_filter_matches("a/b/c", "a/b/c"));
        assert!(!topic_filter_matches("a/b/c", "a/b"));
        assert!(!topic_filter_matches("a/b", "a/b/c"));
    }
}
