//! Synchronous message collection for the CLI commands.
//!
//! The commands drive a transport from one thread, so they reassemble
//! multipart chains inline instead of through a node's reassembly thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ipcbus_node::Accumulator;
use ipcbus_wire::Segment;

/// How long a partial multipart message may sit before it is discarded.
pub const REASSEMBLY_WINDOW: Duration = Duration::from_secs(5);

/// Partial multipart messages keyed by sender GUID.
#[derive(Default)]
pub struct ChainCollector {
    partial: HashMap<u64, Accumulator>,
}

impl ChainCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received segment. A complete message comes back as its
    /// ordered fragment chain; `None` means more fragments are pending.
    pub fn submit(&mut self, seg: Segment) -> Option<Vec<Segment>> {
        if !seg.is_multipart() {
            return Some(vec![seg]);
        }

        let guid = seg.guid();
        let acc = self
            .partial
            .entry(guid)
            .or_insert_with(|| Accumulator::new(REASSEMBLY_WINDOW));
        acc.submit(seg);
        if acc.is_complete() {
            return self.partial.remove(&guid).map(Accumulator::take_chain);
        }

        let now = Instant::now();
        self.partial.retain(|_, acc| !acc.is_expired(now));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcbus_wire::fragment_payload;

    fn chain_of(src: u32, msg_id: u32, len: usize) -> Vec<Segment> {
        let mut template = Segment::new();
        template.set_src(src);
        template.set_dst(99);
        let mut chain =
            fragment_payload(&template, &vec![0x5a; len]).expect("payload should fragment");
        for seg in &mut chain {
            seg.set_msg_id(msg_id);
        }
        chain
    }

    #[test]
    fn single_segment_is_complete_immediately() {
        let mut collector = ChainCollector::new();
        let chain = collector
            .submit(chain_of(1, 10, 100).remove(0))
            .expect("single segment should complete");
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn multipart_completes_on_last_fragment() {
        let mut collector = ChainCollector::new();
        let mut fragments = chain_of(1, 11, 2500);
        assert_eq!(fragments.len(), 3);

        let last = fragments.pop().expect("trailer");
        for seg in fragments {
            assert!(collector.submit(seg).is_none());
        }
        let chain = collector.submit(last).expect("chain should complete");
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn interleaved_senders_do_not_mix() {
        let mut collector = ChainCollector::new();
        let mut from_a = chain_of(1, 12, 1500);
        let mut from_b = chain_of(2, 12, 1500);

        assert!(collector.submit(from_a.remove(0)).is_none());
        assert!(collector.submit(from_b.remove(0)).is_none());

        let done_a = collector.submit(from_a.remove(0)).expect("a completes");
        assert!(done_a.iter().all(|seg| seg.src() == 1));
        let done_b = collector.submit(from_b.remove(0)).expect("b completes");
        assert!(done_b.iter().all(|seg| seg.src() == 2));
    }
}
