//! Fragment collection for one in-flight multipart message.
//!
//! An [`Accumulator`] is created when the first fragment of a new message
//! GUID arrives and lives until the message completes or its reassembly
//! window expires. Fragments may arrive in any order; the list is kept
//! sorted by fragment number so the finished chain reads front to back.
//! The expected total is learned from the initial-flagged trailer, which
//! carries the highest fragment number.

use std::time::{Duration, Instant};

use tracing::debug;

use ipcbus_wire::segment::Segment;

pub struct Accumulator {
    expires_at: Instant,
    timeout: Duration,
    expected: u16,
    received: u16,
    fragments: Vec<Segment>,
}

impl Accumulator {
    pub fn new(timeout: Duration) -> Self {
        Accumulator {
            expires_at: Instant::now() + timeout,
            timeout,
            expected: 0,
            received: 0,
            fragments: Vec::new(),
        }
    }

    /// Fold one fragment into the collection and rearm the expiry clock.
    ///
    /// A fragment carrying both the multipart and initial flags names the
    /// total fragment count. A fragment number seen before replaces the
    /// earlier copy rather than growing the chain, so a retransmitted
    /// fragment cannot satisfy [`is_complete`](Self::is_complete) early.
    pub fn submit(&mut self, seg: Segment) {
        if seg.is_multipart() && seg.is_initial() {
            self.expected = seg.frag_no();
        }

        let frag_no = seg.frag_no();
        match self.fragments.iter().position(|f| f.frag_no() >= frag_no) {
            Some(at) if self.fragments[at].frag_no() == frag_no => {
                debug!(frag_no, "replacing duplicate fragment");
                self.fragments[at] = seg;
            }
            Some(at) => {
                self.fragments.insert(at, seg);
                self.received += 1;
            }
            None => {
                self.fragments.push(seg);
                self.received += 1;
            }
        }

        self.expires_at = Instant::now() + self.timeout;
    }

    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.received == self.expected
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn received(&self) -> u16 {
        self.received
    }

    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// Consume the accumulator and hand back the ordered fragment chain.
    pub fn take_chain(self) -> Vec<Segment> {
        self.fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcbus_wire::chain::{assemble_payload, fragment_payload};
    use ipcbus_wire::segment::PAYLOAD_CAPACITY;

    fn three_fragments() -> (Vec<Segment>, Vec<u8>) {
        let payload: Vec<u8> = (0..PAYLOAD_CAPACITY * 2 + 500)
            .map(|i| (i % 251) as u8)
            .collect();
        let mut template = Segment::new();
        template.set_src(7);
        template.set_dst(9);
        let chain = fragment_payload(&template, &payload).expect("fragment");
        assert_eq!(chain.len(), 3);
        (chain, payload)
    }

    #[test]
    fn in_order_arrival_completes_on_trailer() {
        let (chain, payload) = three_fragments();
        let mut accum = Accumulator::new(Duration::from_secs(5));

        for (index, seg) in chain.into_iter().enumerate() {
            assert!(!accum.is_complete(), "complete before fragment {index}");
            accum.submit(seg);
        }

        assert!(accum.is_complete());
        assert_eq!(accum.received(), 3);
        assert_eq!(accum.expected(), 3);
        assert_eq!(assemble_payload(&accum.take_chain()).as_ref(), payload);
    }

    #[test]
    fn out_of_order_arrival_is_reordered() {
        let (mut chain, payload) = three_fragments();
        let mut accum = Accumulator::new(Duration::from_secs(5));

        // Trailer first: the expected total is known immediately but the
        // message stays incomplete until the body fragments land.
        accum.submit(chain.remove(2));
        assert_eq!(accum.expected(), 3);
        assert!(!accum.is_complete());

        accum.submit(chain.remove(1));
        accum.submit(chain.remove(0));
        assert!(accum.is_complete());

        let rebuilt = accum.take_chain();
        let numbers: Vec<u16> = rebuilt.iter().map(Segment::frag_no).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(assemble_payload(&rebuilt).as_ref(), payload);
    }

    #[test]
    fn duplicate_fragment_replaces_without_counting() {
        let (chain, _) = three_fragments();
        let mut accum = Accumulator::new(Duration::from_secs(5));

        accum.submit(chain[0].clone());
        accum.submit(chain[0].clone());
        assert_eq!(accum.received(), 1);

        accum.submit(chain[1].clone());
        accum.submit(chain[2].clone());
        assert!(accum.is_complete());
        assert_eq!(accum.take_chain().len(), 3);
    }

    #[test]
    fn submission_rearms_expiry() {
        let (chain, _) = three_fragments();
        let mut accum = Accumulator::new(Duration::from_millis(30));

        std::thread::sleep(Duration::from_millis(45));
        assert!(accum.is_expired(Instant::now()));

        accum.submit(chain[0].clone());
        assert!(!accum.is_expired(Instant::now()));
        assert!(accum.is_expired(Instant::now() + Duration::from_millis(60)));
    }

    #[test]
    fn fresh_accumulator_is_neither_complete_nor_expired() {
        let accum = Accumulator::new(Duration::from_secs(5));
        assert!(!accum.is_complete());
        assert!(!accum.is_expired(Instant::now()));
        assert_eq!(accum.received(), 0);
        assert_eq!(accum.expected(), 0);
    }
}
