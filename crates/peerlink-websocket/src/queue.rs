//! Byte-bounded receive queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::message::Message;

/// Byte capacity of an endpoint's receive queue.
pub const RECV_QUEUE_LIMIT: usize = 1024 * 1024;

/// Bounded FIFO of inbound messages, accounted in payload bytes.
///
/// The queue is internally synchronized: the inbound dispatcher pushes from
/// transport tasks while user threads pop. The byte total is kept in an
/// atomic so `amount` never takes the lock.
#[derive(Debug)]
pub struct RecvQueue {
    limit: usize,
    entries: Mutex<VecDeque<Message>>,
    amount: AtomicUsize,
}

impl RecvQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(VecDeque::new()),
            amount: AtomicUsize::new(0),
        }
    }

    /// Append a message.
    ///
    /// When the new entry would push the byte total past the limit, the
    /// oldest entries are dropped until it fits. An entry larger than the
    /// whole limit is still admitted once the queue is empty, so a single
    /// oversized message cannot wedge the feed.
    pub fn push(&self, message: Message) {
        let size = message.size();
        let mut entries = self.entries.lock().unwrap();
        while !entries.is_empty() && self.amount.load(Ordering::Acquire) + size > self.limit {
            if let Some(dropped) = entries.pop_front() {
                self.amount.fetch_sub(dropped.size(), Ordering::AcqRel);
            }
        }
        self.amount.fetch_add(size, Ordering::AcqRel);
        entries.push_back(message);
    }

    /// Remove and return the head entry, without blocking.
    pub fn try_pop(&self) -> Option<Message> {
        let mut entries = self.entries.lock().unwrap();
        let message = entries.pop_front()?;
        self.amount.fetch_sub(message.size(), Ordering::AcqRel);
        Some(message)
    }

    /// Clone of the head entry, leaving the queue untouched.
    pub fn peek(&self) -> Option<Message> {
        self.entries.lock().unwrap().front().cloned()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Total queued payload bytes.
    pub fn amount(&self) -> usize {
        self.amount.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn binary(len: usize) -> Message {
        Message::Binary(Bytes::from(vec![0u8; len]))
    }

    #[test]
    fn fifo_order() {
        let queue = RecvQueue::new(RECV_QUEUE_LIMIT);
        queue.push(Message::Text("a".to_string()));
        queue.push(Message::Text("b".to_string()));

        assert_eq!(queue.try_pop(), Some(Message::Text("a".to_string())));
        assert_eq!(queue.try_pop(), Some(Message::Text("b".to_string())));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn byte_accounting_tracks_push_and_pop() {
        let queue = RecvQueue::new(RECV_QUEUE_LIMIT);
        queue.push(binary(100));
        queue.push(binary(50));
        assert_eq!(queue.amount(), 150);
        assert_eq!(queue.len(), 2);

        queue.try_pop();
        assert_eq!(queue.amount(), 50);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest_until_the_new_entry_fits() {
        let queue = RecvQueue::new(100);
        queue.push(binary(60));
        queue.push(binary(30));
        queue.push(binary(50)); // 140 > 100: drops the 60-byte entry

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.amount(), 80);
        assert_eq!(queue.try_pop().map(|m| m.size()), Some(30));
    }

    #[test]
    fn oversized_entry_is_admitted_alone() {
        let queue = RecvQueue::new(10);
        queue.push(binary(5));
        queue.push(binary(25));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.amount(), 25);
    }

    #[test]
    fn peek_leaves_the_head_in_place() {
        let queue = RecvQueue::new(RECV_QUEUE_LIMIT);
        queue.push(Message::Text("head".to_string()));

        assert_eq!(queue.peek(), Some(Message::Text("head".to_string())));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(Message::Text("head".to_string())));
    }
}
