/*!
Bounded FIFO of pending outbound work.

Draining is cooperative and owned by the engine: entries leave the queue only
while the queue is not paused, the server's receive maximum has room for the
head entry, and the transport is accepting bytes.  The queue itself only
provides ordering, capacity enforcement, and the paused gate; it never touches
the codec or the socket.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::MqttPacket;

use std::collections::VecDeque;

/// What to do when work is added to a full queue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum QueueFullPolicy {
    /// Fail the new entry's token.
    #[default]
    Reject,

    /// Evict the oldest entry, failing its token, and accept the new one.
    DropOldest,
}

/// One unit of pending outbound work.
#[derive(Debug)]
pub(crate) struct TodoEntry {
    pub packet: MqttPacket,
    pub token_id: u64,
}

pub(crate) struct TodoQueue {
    entries: VecDeque<TodoEntry>,
    limit: usize,
    policy: QueueFullPolicy,
    paused: bool,
}

impl TodoQueue {
    pub fn new(limit: usize, policy: QueueFullPolicy) -> TodoQueue {
        TodoQueue {
            entries: VecDeque::new(),
            limit,
            policy,
            paused: false,
        }
    }

    /// Appends work.  On a full queue the configured policy either rejects
    /// the addition or returns the evicted oldest entry so the caller can
    /// fail its token.
    pub fn add(&mut self, packet: MqttPacket, token_id: u64) -> MqttResult<Option<TodoEntry>> {
        let mut evicted = None;

        if self.entries.len() >= self.limit {
            match self.policy {
                QueueFullPolicy::Reject => {
                    return Err(MqttError::new_buffer_full());
                }
                QueueFullPolicy::DropOldest => {
                    evicted = self.entries.pop_front();
                }
            }
        }

        self.entries.push_back(TodoEntry { packet, token_id });
        Ok(evicted)
    }

    /// Head entry, without removing it.  None while paused so drain loops
    /// stop naturally during replay.
    pub fn peek(&self) -> Option<&TodoEntry> {
        if self.paused {
            return None;
        }

        self.entries.front()
    }

    /// Removes and returns the head entry; None while paused or empty.
    pub fn pop(&mut self) -> Option<TodoEntry> {
        if self.paused {
            return None;
        }

        self.entries.pop_front()
    }

    /// Suppresses draining.  Asserted at connection end and held until retry
    /// replay finishes on the next connection.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer inspection for the user-facing accessors.
    pub fn get(&self, index: usize) -> Option<&TodoEntry> {
        self.entries.get(index)
    }

    /// Removes an arbitrary buffered entry, returning it so the caller can
    /// fail its token.
    pub fn remove(&mut self, index: usize) -> Option<TodoEntry> {
        self.entries.remove(index)
    }

    /// Empties the queue, returning everything for token cleanup.
    pub fn drain_all(&mut self) -> VecDeque<TodoEntry> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::PublishPacket;
    use assert_matches::assert_matches;

    fn make_entry_packet(tag: u16) -> MqttPacket {
        MqttPacket::Publish(PublishPacket {
            topic: format!("t/{}", tag),
            ..Default::default()
        })
    }

    #[test]
    fn fifo_order_preserved() {
        let mut queue = TodoQueue::new(10, QueueFullPolicy::Reject);
        queue.add(make_entry_packet(1), 1).unwrap();
        queue.add(make_entry_packet(2), 2).unwrap();
        queue.add(make_entry_packet(3), 3).unwrap();

        assert_eq!(queue.pop().unwrap().token_id, 1);
        assert_eq!(queue.pop().unwrap().token_id, 2);
        assert_eq!(queue.pop().unwrap().token_id, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn reject_policy_fails_additions_when_full() {
        let mut queue = TodoQueue::new(2, QueueFullPolicy::Reject);
        queue.add(make_entry_packet(1), 1).unwrap();
        queue.add(make_entry_packet(2), 2).unwrap();

        assert_matches!(queue.add(make_entry_packet(3), 3), Err(MqttError::BufferFull(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_oldest_policy_evicts_the_head() {
        let mut queue = TodoQueue::new(2, QueueFullPolicy::DropOldest);
        queue.add(make_entry_packet(1), 1).unwrap();
        queue.add(make_entry_packet(2), 2).unwrap();

        let evicted = queue.add(make_entry_packet(3), 3).unwrap().unwrap();
        assert_eq!(evicted.token_id, 1);
        assert_eq!(queue.pop().unwrap().token_id, 2);
        assert_eq!(queue.pop().unwrap().token_id, 3);
    }

    #[test]
    fn paused_queue_accepts_but_does_not_drain() {
        let mut queue = TodoQueue::new(10, QueueFullPolicy::Reject);
        queue.pause();
        queue.add(make_entry_packet(1), 1).unwrap();

        assert!(queue.peek().is_none());
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 1);

        queue.resume();
        assert_eq!(queue.pop().unwrap().token_id, 1);
    }

    #[test]
    fn inspection_accessors_see_buffered_work() {
        let mut queue = TodoQueue::new(10, QueueFullPolicy::Reject);
        queue.add(make_entry_packet(1), 1).unwrap();
        queue.add(make_entry_packet(2), 2).unwrap();

        assert_eq!(queue.get(1).unwrap().token_id, 2);
        assert!(queue.get(5).is_none());

        let removed = queue.remove(0).unwrap();
        assert_eq!(removed.token_id, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(0).unwrap().token_id, 2);
    }
}
