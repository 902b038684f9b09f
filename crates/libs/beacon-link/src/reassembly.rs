//! Inbound fragment accumulation.

/// Outcome of feeding one fragment to the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// More fragments are expected.
    Pending,
    /// Final fragment received; the buffer holds one whole request.
    Complete(Vec<u8>),
    /// Accumulation would have exceeded the bound. The in-progress message
    /// (and the fragment that overflowed it) was dropped; the next fragment
    /// starts a new message.
    Overflow { discarded: usize },
}

/// Accumulates fragments into one bounded logical buffer.
///
/// There is no way to resume a message after overflow and the peer is not
/// told about the loss; it will simply never see a reply to that request.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Reassembler {
    pub fn new(max_len: usize) -> Self {
        Self { buffer: Vec::new(), max_len }
    }

    pub fn push(&mut self, more_fragments: bool, payload: &[u8]) -> Assembly {
        let projected = self.buffer.len().saturating_add(payload.len());
        if projected > self.max_len {
            let discarded = self.buffer.len() + payload.len();
            log::warn!(
                "ble: incoming rpc overflow, resetting buffer discarded={} max={}",
                discarded,
                self.max_len
            );
            self.reset();
            return Assembly::Overflow { discarded };
        }

        self.buffer.extend_from_slice(payload);
        if more_fragments {
            return Assembly::Pending;
        }
        Assembly::Complete(std::mem::take(&mut self.buffer))
    }

    /// Drop any partially received message.
    pub fn reset(&mut self) {
        self.buffer = Vec::new();
    }

    /// Bytes accumulated for the message in progress.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{split, Fragment};

    fn feed(reassembler: &mut Reassembler, wire: &[Vec<u8>]) -> Vec<Assembly> {
        wire.iter()
            .map(|raw| {
                let fragment = Fragment::parse(raw).expect("fragment");
                reassembler.push(fragment.more_fragments, fragment.payload)
            })
            .collect()
    }

    #[test]
    fn reassembles_any_split_in_order() {
        let message: Vec<u8> = (0..200u32).map(|value| (value * 7) as u8).collect();
        for max_payload in [1, 3, 17, 199, 200, 500] {
            let mut reassembler = Reassembler::new(4096);
            let outcomes = feed(&mut reassembler, &split(&message, max_payload));
            let (last, pending) = outcomes.split_last().expect("outcomes");
            assert!(pending.iter().all(|outcome| *outcome == Assembly::Pending));
            assert_eq!(*last, Assembly::Complete(message.clone()), "max_payload={max_payload}");
            assert!(reassembler.is_empty());
        }
    }

    #[test]
    fn single_final_fragment_completes_immediately() {
        let mut reassembler = Reassembler::new(16);
        assert_eq!(reassembler.push(false, b"abc"), Assembly::Complete(b"abc".to_vec()));
    }

    #[test]
    fn overflow_discards_in_progress_message() {
        let mut reassembler = Reassembler::new(8);
        assert_eq!(reassembler.push(true, &[1; 5]), Assembly::Pending);
        assert_eq!(reassembler.push(true, &[2; 4]), Assembly::Overflow { discarded: 9 });
        assert!(reassembler.is_empty());

        // The tail of the dropped message is treated as a brand new message.
        assert_eq!(reassembler.push(false, &[3; 2]), Assembly::Complete(vec![3; 2]));
    }

    #[test]
    fn overflow_on_final_fragment_produces_nothing() {
        let mut reassembler = Reassembler::new(4);
        assert_eq!(reassembler.push(true, &[1; 3]), Assembly::Pending);
        assert_eq!(reassembler.push(false, &[1; 3]), Assembly::Overflow { discarded: 6 });
        assert!(reassembler.is_empty());
    }

    #[test]
    fn overflow_leaves_buffer_empty_for_any_boundary() {
        let message = vec![0xAB; 64];
        for max_payload in [1, 5, 16, 63] {
            let mut reassembler = Reassembler::new(32);
            for raw in split(&message, max_payload) {
                let fragment = Fragment::parse(&raw).expect("fragment");
                if let Assembly::Overflow { .. } =
                    reassembler.push(fragment.more_fragments, fragment.payload)
                {
                    assert!(reassembler.is_empty());
                }
                assert!(reassembler.len() <= reassembler.max_len());
            }
        }
    }

    #[test]
    fn exact_bound_is_accepted() {
        let mut reassembler = Reassembler::new(4);
        assert_eq!(reassembler.push(true, &[1, 2]), Assembly::Pending);
        assert_eq!(reassembler.push(false, &[3, 4]), Assembly::Complete(vec![1, 2, 3, 4]));
    }
}
