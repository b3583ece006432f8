/*!
Durable session store contract and the in-memory implementation.

The engine keys entries by direction: outbound PUBLISH/PUBREL wire images
under `s-<packet id>`, inbound QoS 2 acknowledgement markers under
`r-<packet id>`.  Writes must be durable before the corresponding wire packet
is emitted (PUBREC) or the packet id is reused (PUBCOMP); the engine sequences
its calls accordingly and a conforming implementation must not defer them.
 */

use crate::error::MqttResult;

use std::collections::HashMap;

pub(crate) const OUTBOUND_KEY_PREFIX: &str = "s-";
pub(crate) const INBOUND_KEY_PREFIX: &str = "r-";

pub(crate) fn make_outbound_key(packet_id: u16) -> String {
    format!("{}{}", OUTBOUND_KEY_PREFIX, packet_id)
}

pub(crate) fn make_inbound_key(packet_id: u16) -> String {
    format!("{}{}", INBOUND_KEY_PREFIX, packet_id)
}

pub(crate) fn parse_key(key: &str) -> Option<(&str, u16)> {
    let packet_id = key.get(2..)?.parse().ok()?;
    let prefix = key.get(..2)?;
    if prefix == OUTBOUND_KEY_PREFIX || prefix == INBOUND_KEY_PREFIX {
        Some((prefix, packet_id))
    } else {
        None
    }
}

/// Durable mapping from string keys to byte blobs, used to carry in-flight
/// QoS 1/2 state across process restarts.
///
/// The store is opened once per client, scoped by client id and server URI,
/// and accessed only from the client's event loop.
pub trait Persistence: Send {
    /// Prepares the store for use by the named session.
    fn open(&mut self, client_id: &str, server_uri: &str) -> MqttResult<()>;

    /// Durably associates a blob with a key, replacing any existing value.
    fn put(&mut self, key: &str, blob: &[u8]) -> MqttResult<()>;

    /// Retrieves a blob by key.
    fn get(&self, key: &str) -> MqttResult<Option<Vec<u8>>>;

    /// Removes a key; removing an absent key is not an error.
    fn remove(&mut self, key: &str) -> MqttResult<()>;

    /// Lists every stored key.
    fn keys(&self) -> MqttResult<Vec<String>>;

    /// Removes all keys.
    fn clear(&mut self) -> MqttResult<()>;

    /// Releases the store.
    fn close(&mut self) -> MqttResult<()>;
}

/// Session store that keeps everything in process memory.
///
/// Suitable for tests and for deployments that only need delivery guarantees
/// to survive reconnects, not process restarts.
#[derive(Default)]
pub struct MemoryPersistence {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> MemoryPersistence {
        MemoryPersistence {
            entries: HashMap::new(),
        }
    }
}

impl Persistence for MemoryPersistence {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> MqttResult<()> {
        Ok(())
    }

    fn put(&mut self, key: &str, blob: &[u8]) -> MqttResult<()> {
        self.entries.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> MqttResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> MqttResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> MqttResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn clear(&mut self) -> MqttResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn close(&mut self) -> MqttResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_persistence_put_get_remove() {
        let mut store = MemoryPersistence::new();
        store.open("client-1", "tcp://localhost:1883").unwrap();

        store.put(&make_outbound_key(5), &[1, 2, 3]).unwrap();
        assert_eq!(store.get(&make_outbound_key(5)).unwrap(), Some(vec![1, 2, 3]));

        store.remove(&make_outbound_key(5)).unwrap();
        assert_eq!(store.get(&make_outbound_key(5)).unwrap(), None);

        // removing again is fine
        store.remove(&make_outbound_key(5)).unwrap();
    }

    #[test]
    fn key_scheme_round_trips() {
        assert_eq!(parse_key(&make_outbound_key(17)), Some((OUTBOUND_KEY_PREFIX, 17)));
        assert_eq!(parse_key(&make_inbound_key(65535)), Some((INBOUND_KEY_PREFIX, 65535)));
        assert_eq!(parse_key("junk"), None);
        assert_eq!(parse_key("s-notanumber"), None);
    }

    #[test]
    fn keys_lists_both_partitions() {
        let mut store = MemoryPersistence::new();
        store.put(&make_outbound_key(1), &[0]).unwrap();
        store.put(&make_inbound_key(2), &[]).unwrap();

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["r-2".to_string(), "s-1".to_string()]);
    }
}
