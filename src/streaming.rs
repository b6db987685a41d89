//! In-order body streaming queue
//!
//! Parts complete in whatever order the network delivers them; the user
//! sees bytes in object order. Each GET meta-request owns one queue:
//! completed parts insert themselves keyed by part index, and a delivery
//! task drains runs whose head matches the next-to-deliver counter. The
//! counter only ever advances — a part can neither be delivered twice nor
//! out of order.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::Notify;

/// One part body waiting for in-order delivery
#[derive(Debug)]
pub(crate) struct StreamedPart {
    /// Part index within the meta-request (0-based)
    pub part_index: u32,
    /// Byte offset of this part within the object
    pub offset: u64,
    /// Part body
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<u32, StreamedPart>,
    next_index: u32,
    closed: bool,
}

/// Per-meta-request ordered queue feeding the body-streaming task
#[derive(Debug, Default)]
pub(crate) struct StreamingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl StreamingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a completed part. Pushing the same index twice is a logic
    /// error upstream; the later push wins and the earlier body is dropped.
    pub(crate) fn push(&self, part: StreamedPart) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed || part.part_index < state.next_index {
                // Late arrival after close/clear; nothing will deliver it.
                return;
            }
            state.pending.insert(part.part_index, part);
        }
        self.notify.notify_one();
    }

    /// Mark that no further parts will be pushed. Delivery drains what is
    /// already in order and then ends.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.notify.notify_one();
    }

    /// Drop all undelivered parts (cancellation and fatal-error paths).
    /// Returns how many entries and bytes were dropped so the caller can
    /// settle reference counts and backpressure accounting.
    pub(crate) fn clear(&self) -> (usize, u64) {
        let drained = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut state.pending)
        };
        let entries = drained.len();
        let bytes = drained.values().map(|p| p.body.len() as u64).sum();
        self.notify.notify_one();
        (entries, bytes)
    }

    /// Next part in strict index order. Waits until the head of the queue
    /// matches the next-to-deliver counter; returns `None` once the queue
    /// is closed and no in-order part remains.
    pub(crate) async fn next_ready(&self) -> Option<StreamedPart> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let head_matches = state
                    .pending
                    .first_key_value()
                    .map(|(index, _)| *index == state.next_index)
                    .unwrap_or(false);
                if head_matches {
                    let index = state.next_index;
                    let part = state.pending.remove(&index);
                    state.next_index += 1;
                    return part;
                }
                if state.closed {
                    // Closed with a gap means the remaining entries can
                    // never be delivered in order; the queue is done.
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn part(index: u32, len: usize) -> StreamedPart {
        StreamedPart {
            part_index: index,
            offset: u64::from(index) * len as u64,
            body: Bytes::from(vec![index as u8; len]),
        }
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let queue = StreamingQueue::new();
        queue.push(part(0, 4));
        queue.push(part(1, 4));
        queue.close();

        assert_eq!(queue.next_ready().await.unwrap().part_index, 0);
        assert_eq!(queue.next_ready().await.unwrap().part_index, 1);
        assert!(queue.next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_waits() {
        let queue = Arc::new(StreamingQueue::new());
        queue.push(part(1, 4));
        queue.push(part(2, 4));

        // Head is part 1 but next-to-deliver is 0: nothing is ready.
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut order = Vec::new();
                while let Some(p) = queue.next_ready().await {
                    order.push(p.part_index);
                }
                order
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending_len(), 2);

        queue.push(part(0, 4));
        queue.close();
        assert_eq!(waiter.await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_clear_reports_dropped_bytes() {
        let queue = StreamingQueue::new();
        queue.push(part(0, 10));
        queue.push(part(1, 6));

        let (entries, bytes) = queue.clear();
        assert_eq!(entries, 2);
        assert_eq!(bytes, 16);

        queue.close();
        assert!(queue.next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let queue = StreamingQueue::new();
        queue.close();
        queue.push(part(0, 4));
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_close_with_gap_ends_delivery() {
        let queue = StreamingQueue::new();
        queue.push(part(0, 4));
        queue.push(part(2, 4)); // part 1 will never arrive
        queue.close();

        assert_eq!(queue.next_ready().await.unwrap().part_index, 0);
        assert!(queue.next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_offsets_accompany_parts() {
        let queue = StreamingQueue::new();
        queue.push(StreamedPart {
            part_index: 0,
            offset: 0,
            body: Bytes::from_static(b"abcd"),
        });
        queue.close();
        let delivered = queue.next_ready().await.unwrap();
        assert_eq!(delivered.offset, 0);
        assert_eq!(&delivered.body[..], b"abcd");
    }
}
