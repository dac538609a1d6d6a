//! Per-session message queue with tile-cancel semantics.
//!
//! The connection's read loop is the only producer and the session consumer
//! task the only consumer. `get` waits until an item is available; the `eof`
//! sentinel pushed by [`MessageQueue::shutdown`] is what wakes a consumer for
//! the last time.

use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use tokio::sync::Notify;

use crate::protocol::EOF_MESSAGE;

/// Command that drops pending tile requests.
pub const CANCEL_TILES: &str = "canceltiles";

const TILE_PREFIX: &str = "tile ";

/// Ordered, unbounded, thread-safe FIFO of pending commands. Items are kept
/// as the raw frame bytes.
#[derive(Default)]
pub struct MessageQueue {
    items: StdMutex<VecDeque<Bytes>>,
    available: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command.
    ///
    /// `canceltiles` removes every pending `tile ` request and jumps to the
    /// front of the queue.
    pub fn put(&self, value: impl Into<Bytes>) {
        let value = value.into();
        {
            let mut items = self.lock();
            if value == CANCEL_TILES {
                items.retain(|item| !item.starts_with(TILE_PREFIX.as_bytes()));
                items.push_front(value);
            } else {
                items.push_back(value);
            }
        }
        self.available.notify_one();
    }

    /// Remove and return the oldest item, waiting for one if empty.
    pub async fn get(&self) -> Bytes {
        loop {
            if let Some(item) = self.lock().pop_front() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Discard every pending item.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Discard pending items and enqueue the `eof` sentinel, atomically.
    pub fn shutdown(&self) {
        {
            let mut items = self.lock();
            items.clear();
            items.push_back(Bytes::from_static(EOF_MESSAGE.as_bytes()));
        }
        self.available.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = MessageQueue::new();
        queue.put("a");
        queue.put("b");
        queue.put("c");
        assert_eq!(queue.get().await, "a");
        assert_eq!(queue.get().await, "b");
        assert_eq!(queue.get().await, "c");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_producer() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.put("status");
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "status");
    }

    #[test]
    fn canceltiles_drops_pending_tiles_and_goes_first() {
        let queue = MessageQueue::new();
        queue.put("tile part=0 width=256");
        queue.put("status");
        queue.put("tile part=0 width=512");
        queue.put(CANCEL_TILES);

        let items: Vec<Bytes> = queue.lock().iter().cloned().collect();
        assert_eq!(items, vec![CANCEL_TILES, "status"]);
    }

    #[tokio::test]
    async fn shutdown_discards_pending_work() {
        let queue = MessageQueue::new();
        for i in 0..100 {
            queue.put(format!("tile part=0 id={i}"));
        }
        queue.shutdown();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, EOF_MESSAGE);
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = MessageQueue::new();
        queue.put("a");
        queue.put("b");
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn keeps_non_utf8_bytes() {
        let queue = MessageQueue::new();
        queue.put(Bytes::from_static(b"tile \xff\xfe"));
        queue.put(Bytes::from_static(b"x\xff\xfey"));
        queue.put(CANCEL_TILES);
        assert_eq!(queue.get().await, CANCEL_TILES);
        assert_eq!(&queue.get().await[..], b"x\xff\xfey");
        assert!(queue.is_empty());
    }
}
