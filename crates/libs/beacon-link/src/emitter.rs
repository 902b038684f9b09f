//! Outbound response slicing.

use crate::fragment::Fragment;

/// Serves one staged response as a sequence of bounded fragments.
///
/// The peer pulls fragments by reading the characteristic; once the response
/// is exhausted every read returns an empty, final fragment until a new
/// response is staged.
#[derive(Debug)]
pub struct Emitter {
    buffer: Vec<u8>,
    cursor: usize,
    max_payload: usize,
}

impl Emitter {
    pub fn new(max_payload: usize) -> Self {
        Self { buffer: Vec::new(), cursor: 0, max_payload: max_payload.max(1) }
    }

    /// Replace whatever is pending with `response` and rewind.
    pub fn stage(&mut self, response: Vec<u8>) {
        log::debug!("ble: outgoing rpc response size={}", response.len());
        self.buffer = response;
        self.cursor = 0;
    }

    pub fn poll(&mut self) -> Fragment<'_> {
        let remaining = self.buffer.len() - self.cursor;
        let start = self.cursor;
        if remaining > self.max_payload {
            self.cursor += self.max_payload;
            return Fragment::new(true, &self.buffer[start..self.cursor]);
        }
        self.cursor = self.buffer.len();
        Fragment::last(&self.buffer[start..])
    }

    /// [`Emitter::poll`] encoded as a characteristic value.
    pub fn poll_wire(&mut self) -> Vec<u8> {
        self.poll().to_wire()
    }

    /// Drop the staged response.
    pub fn clear(&mut self) {
        self.buffer = Vec::new();
        self.cursor = 0;
    }

    /// Bytes of the staged response not yet handed out.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_emitter_returns_empty_final_fragment() {
        let mut emitter = Emitter::new(500);
        for _ in 0..3 {
            assert!(emitter.poll().is_idle());
        }
    }

    #[test]
    fn slices_response_and_then_drains_idempotently() {
        let response: Vec<u8> = (0..1200u32).map(|value| value as u8).collect();
        let mut emitter = Emitter::new(500);
        emitter.stage(response.clone());

        let first = emitter.poll_wire();
        assert_eq!(first.len(), 501);
        assert_eq!(first[0], 1);
        let second = emitter.poll_wire();
        assert_eq!(second[0], 1);
        let third = emitter.poll_wire();
        assert_eq!(third[0], 0);
        assert_eq!(third.len(), 201);

        let mut joined = first[1..].to_vec();
        joined.extend_from_slice(&second[1..]);
        joined.extend_from_slice(&third[1..]);
        assert_eq!(joined, response);

        for _ in 0..5 {
            assert_eq!(emitter.poll_wire(), vec![0x00]);
        }
        assert_eq!(emitter.remaining(), 0);
    }

    #[test]
    fn response_of_exactly_max_payload_is_one_final_fragment() {
        let mut emitter = Emitter::new(4);
        emitter.stage(vec![1, 2, 3, 4]);
        let fragment = emitter.poll();
        assert!(!fragment.more_fragments);
        assert_eq!(fragment.payload, &[1, 2, 3, 4]);
        assert!(emitter.poll().is_idle());
    }

    #[test]
    fn staging_rewinds_a_partially_read_response() {
        let mut emitter = Emitter::new(2);
        emitter.stage(vec![1, 2, 3, 4, 5]);
        assert!(emitter.poll().more_fragments);
        emitter.stage(vec![9]);
        let fragment = emitter.poll();
        assert_eq!(fragment.payload, &[9]);
        assert!(!fragment.more_fragments);
    }

    #[test]
    fn empty_staged_response_reads_as_idle() {
        let mut emitter = Emitter::new(8);
        emitter.stage(Vec::new());
        assert!(emitter.poll().is_idle());
    }
}
