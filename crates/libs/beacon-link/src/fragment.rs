//! Fragment framing for the RPC characteristic.
//!
//! Every characteristic value is one control byte followed by an opaque
//! payload slice. Only bit 0 of the control byte is meaningful.

use crate::error::FragmentError;

/// Control byte size prepended to every fragment.
pub const HEADER_SIZE: usize = 1;

const MORE_FRAGMENTS: u8 = 0x01;

/// One wire fragment borrowed from a characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// `true` on every fragment except the last one of a message.
    pub more_fragments: bool,
    pub payload: &'a [u8],
}

impl<'a> Fragment<'a> {
    pub fn new(more_fragments: bool, payload: &'a [u8]) -> Self {
        Self { more_fragments, payload }
    }

    /// Final (or only) fragment of a message.
    pub fn last(payload: &'a [u8]) -> Self {
        Self::new(false, payload)
    }

    /// Split a raw characteristic value into header flag and payload.
    pub fn parse(raw: &'a [u8]) -> Result<Self, FragmentError> {
        let (&control, payload) = raw.split_first().ok_or(FragmentError::Empty)?;
        Ok(Self { more_fragments: control & MORE_FRAGMENTS != 0, payload })
    }

    /// Encode to the characteristic value representation.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.push(if self.more_fragments { MORE_FRAGMENTS } else { 0 });
        out.extend_from_slice(self.payload);
        out
    }

    /// Drained emitter marker: empty payload, nothing more to read.
    pub fn is_idle(&self) -> bool {
        !self.more_fragments && self.payload.is_empty()
    }
}

/// Split `message` into wire fragments of at most `max_payload` bytes each.
///
/// Used by the peer side of the link (the companion, or the simulator acting
/// as one). An empty message still produces one final fragment.
pub fn split(message: &[u8], max_payload: usize) -> Vec<Vec<u8>> {
    let max_payload = max_payload.max(1);
    if message.is_empty() {
        return vec![Fragment::last(&[]).to_wire()];
    }
    let count = message.len().div_ceil(max_payload);
    message
        .chunks(max_payload)
        .enumerate()
        .map(|(index, chunk)| Fragment::new(index + 1 < count, chunk).to_wire())
        .collect()
}
