//! Priority-ordered staging of outbound segment chains.
//!
//! [`TransmitQueue`] sits between message producers and the node's transmit
//! thread. Producers enqueue whole fragment chains with a priority; the
//! transmit thread pulls one segment at a time. A chain being drained is
//! held aside and finished before any other entry is considered, so the
//! fragments of one message are never interleaved with another's, whatever
//! priorities arrive in the meantime.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ipcbus_wire::segment::{Priority, Segment};

use crate::error::{NodeError, Result};

/// Default cap on queued chains before [`TransmitQueue::transmit`] refuses.
pub const DEFAULT_PENDING_LIMIT: usize = 1024;

enum TxEntry {
    Chain {
        segments: VecDeque<Segment>,
        priority: u8,
    },
    Release,
}

impl TxEntry {
    fn priority(&self) -> u8 {
        match self {
            TxEntry::Chain { priority, .. } => *priority,
            // Sentinels rank with the highest priority so a shutdown is
            // seen promptly even under a backlog.
            TxEntry::Release => 0,
        }
    }
}

/// One pull from the queue, as seen by the transmit thread.
pub enum TxPull {
    Segment(Segment),
    /// A release sentinel: the consumer should stop pulling.
    Released,
}

struct TxInner {
    entries: VecDeque<TxEntry>,
    /// Remainder of the chain currently being drained. Served before any
    /// entry, which keeps one message's fragments contiguous on the wire.
    in_flight: Option<VecDeque<Segment>>,
    next_id: u32,
}

pub struct TransmitQueue {
    inner: Mutex<TxInner>,
    available: Condvar,
    max_pending: usize,
}

impl Default for TransmitQueue {
    fn default() -> Self {
        TransmitQueue::new(DEFAULT_PENDING_LIMIT)
    }
}

impl TransmitQueue {
    pub fn new(max_pending: usize) -> Self {
        TransmitQueue {
            inner: Mutex::new(TxInner {
                entries: VecDeque::new(),
                in_flight: None,
                next_id: 1,
            }),
            available: Condvar::new(),
            max_pending,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next message id to every fragment of `chain` and insert
    /// the chain by priority.
    ///
    /// Insertion is stable: the chain lands behind existing entries of the
    /// same priority, so equal-priority messages leave in submission order.
    /// Returns the assigned message id.
    pub fn transmit(&self, mut chain: Vec<Segment>, priority: Priority) -> Result<u32> {
        if chain.is_empty() {
            return Err(NodeError::EmptyMessage);
        }

        let mut inner = self.lock();
        if inner.entries.len() >= self.max_pending {
            return Err(NodeError::QueueRefused {
                pending: inner.entries.len(),
            });
        }

        let id = inner.next_id;
        // Message ids wrap but never revisit zero, which marks "unset".
        inner.next_id = inner.next_id.checked_add(1).unwrap_or(1);
        for seg in &mut chain {
            seg.set_msg_id(id);
            seg.set_priority(priority);
        }

        let p = priority.as_bits();
        let at = inner
            .entries
            .iter()
            .position(|entry| entry.priority() > p)
            .unwrap_or(inner.entries.len());
        inner.entries.insert(
            at,
            TxEntry::Chain {
                segments: chain.into(),
                priority: p,
            },
        );

        self.available.notify_one();
        Ok(id)
    }

    /// Block up to `timeout` for the next deliverable segment.
    ///
    /// Returns `None` when nothing became available within the window.
    pub fn next_segment(&self, timeout: Duration) -> Option<TxPull> {
        let inner = self.lock();
        let (mut inner, wait) = self
            .available
            .wait_timeout_while(inner, timeout, |inner| {
                inner.in_flight.is_none() && inner.entries.is_empty()
            })
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() && inner.in_flight.is_none() && inner.entries.is_empty() {
            return None;
        }

        let pull = if let Some(mut rest) = inner.in_flight.take() {
            let seg = rest.pop_front()?;
            if !rest.is_empty() {
                inner.in_flight = Some(rest);
            }
            TxPull::Segment(seg)
        } else {
            match inner.entries.pop_front()? {
                TxEntry::Release => TxPull::Released,
                TxEntry::Chain { mut segments, .. } => {
                    let seg = segments.pop_front()?;
                    if !segments.is_empty() {
                        inner.in_flight = Some(segments);
                    }
                    TxPull::Segment(seg)
                }
            }
        };

        if inner.in_flight.is_some() || !inner.entries.is_empty() {
            self.available.notify_one();
        }
        Some(pull)
    }

    /// Enqueue a release sentinel that unblocks a shutting-down consumer.
    pub fn release_consumer(&self) {
        let mut inner = self.lock();
        let at = inner
            .entries
            .iter()
            .position(|entry| entry.priority() > 0)
            .unwrap_or(inner.entries.len());
        inner.entries.insert(at, TxEntry::Release);
        self.available.notify_one();
    }

    /// Number of queued entries, counting a partially drained chain as one.
    pub fn pending(&self) -> usize {
        let inner = self.lock();
        inner.entries.len() + usize::from(inner.in_flight.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    use bytes::Bytes;
    use ipcbus_wire::chain::fragment_payload;
    use ipcbus_wire::segment::PAYLOAD_CAPACITY;

    fn single(tag: u8) -> Vec<Segment> {
        let mut seg = Segment::new();
        seg.set_dst(2);
        seg.set_payload(Bytes::copy_from_slice(&[tag]));
        vec![seg]
    }

    fn pull_segment(queue: &TransmitQueue) -> Segment {
        match queue.next_segment(Duration::from_secs(1)) {
            Some(TxPull::Segment(seg)) => seg,
            Some(TxPull::Released) => panic!("unexpected release sentinel"),
            None => panic!("queue produced nothing"),
        }
    }

    #[test]
    fn ids_are_sequential_and_stamped_on_every_fragment() {
        let queue = TransmitQueue::default();
        assert_eq!(
            queue.transmit(single(1), Priority::Medium).expect("first"),
            1
        );

        let mut template = Segment::new();
        template.set_dst(2);
        let chain =
            fragment_payload(&template, &vec![7u8; PAYLOAD_CAPACITY * 2]).expect("fragment");
        assert_eq!(queue.transmit(chain, Priority::Medium).expect("second"), 2);

        assert_eq!(pull_segment(&queue).msg_id(), 1);
        assert_eq!(pull_segment(&queue).msg_id(), 2);
        assert_eq!(pull_segment(&queue).msg_id(), 2);
    }

    #[test]
    fn higher_priority_overtakes_with_fifo_ties() {
        let queue = TransmitQueue::default();
        queue.transmit(single(1), Priority::Low).expect("low");
        queue.transmit(single(2), Priority::High).expect("high a");
        queue.transmit(single(3), Priority::Medium).expect("medium");
        queue.transmit(single(4), Priority::High).expect("high b");

        let order: Vec<u8> = (0..4).map(|_| pull_segment(&queue).payload()[0]).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn in_flight_chain_finishes_before_later_high_priority() {
        let queue = TransmitQueue::default();
        let mut template = Segment::new();
        template.set_dst(2);
        let chain =
            fragment_payload(&template, &vec![0u8; PAYLOAD_CAPACITY * 3]).expect("fragment");
        let slow_id = queue.transmit(chain, Priority::Background).expect("chain");

        assert_eq!(pull_segment(&queue).msg_id(), slow_id);

        // A high-priority message arriving mid-chain must wait for the
        // remaining fragments.
        let fast_id = queue.transmit(single(9), Priority::High).expect("high");
        assert_eq!(pull_segment(&queue).msg_id(), slow_id);
        assert_eq!(pull_segment(&queue).msg_id(), slow_id);
        assert_eq!(pull_segment(&queue).msg_id(), fast_id);
    }

    #[test]
    fn empty_chain_is_refused() {
        let queue = TransmitQueue::default();
        assert!(matches!(
            queue.transmit(Vec::new(), Priority::Medium),
            Err(NodeError::EmptyMessage)
        ));
    }

    #[test]
    fn full_queue_refuses_with_pending_count() {
        let queue = TransmitQueue::new(2);
        queue.transmit(single(1), Priority::Medium).expect("one");
        queue.transmit(single(2), Priority::Medium).expect("two");
        match queue.transmit(single(3), Priority::Medium) {
            Err(NodeError::QueueRefused { pending }) => assert_eq!(pending, 2),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn id_wrap_skips_zero() {
        let queue = TransmitQueue::default();
        queue.lock().next_id = u32::MAX;
        assert_eq!(
            queue.transmit(single(1), Priority::Medium).expect("max"),
            u32::MAX
        );
        assert_eq!(
            queue.transmit(single(2), Priority::Medium).expect("wrap"),
            1
        );
    }

    #[test]
    fn release_sentinel_ranks_ahead_of_background_traffic() {
        let queue = TransmitQueue::default();
        queue
            .transmit(single(1), Priority::Background)
            .expect("background");
        queue.release_consumer();

        assert!(matches!(
            queue.next_segment(Duration::from_secs(1)),
            Some(TxPull::Released)
        ));
        assert_eq!(pull_segment(&queue).payload()[0], 1);
    }

    #[test]
    fn empty_queue_times_out() {
        let queue = TransmitQueue::default();
        let start = Instant::now();
        assert!(queue.next_segment(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn blocked_consumer_wakes_on_transmit() {
        let queue = std::sync::Arc::new(TransmitQueue::default());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            thread::spawn(move || match queue.next_segment(Duration::from_secs(2)) {
                Some(TxPull::Segment(seg)) => seg.msg_id(),
                _ => 0,
            })
        };

        thread::sleep(Duration::from_millis(30));
        let id = queue.transmit(single(1), Priority::Medium).expect("send");
        assert_eq!(waiter.join().expect("join"), id);
    }
}
