//! # Turn Buffer
//!
//! Accumulates the binary chunks of one connection until enough bytes are collected
//! to run a processing cycle.
//!
//! ## Key Properties:
//! - **Byte-oriented**: chunks are opaque (they may be a compressed container), so the
//!   buffer counts bytes, not samples
//! - **Threshold trigger**: a cycle starts as soon as `len() >= threshold`, never before
//! - **Take-and-clear**: the contents are moved out when a cycle starts, so the next
//!   cycle always starts from an empty buffer regardless of how the previous one ended

/// Growing byte buffer owned by a single session.
#[derive(Debug)]
pub struct TurnBuffer {
    data: Vec<u8>,
    threshold: usize,
}

impl TurnBuffer {
    /// Create an empty buffer that becomes ready at `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            data: Vec::with_capacity(threshold),
            threshold,
        }
    }

    /// Append one chunk; returns whether the buffer reached the threshold.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        self.data.extend_from_slice(chunk);
        self.is_ready()
    }

    pub fn is_ready(&self) -> bool {
        self.data.len() >= self.threshold
    }

    /// Move the accumulated bytes out, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.data, Vec::with_capacity(self.threshold))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_keeps_accumulating() {
        let mut buffer = TurnBuffer::new(4096);
        assert!(!buffer.push(&[0u8; 1000]));
        assert!(!buffer.push(&[0u8; 3000]));
        assert_eq!(buffer.len(), 4000);
        assert!(!buffer.is_ready());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut buffer = TurnBuffer::new(4096);
        assert!(!buffer.push(&[1u8; 4095]));
        assert!(buffer.push(&[2u8; 1]));
    }

    #[test]
    fn test_single_oversized_chunk_is_ready_immediately() {
        let mut buffer = TurnBuffer::new(4096);
        assert!(buffer.push(&[0u8; 10_000]));
        assert_eq!(buffer.len(), 10_000);
    }

    #[test]
    fn test_take_returns_everything_in_order_and_empties() {
        let mut buffer = TurnBuffer::new(4);
        buffer.push(&[1, 2]);
        buffer.push(&[3, 4, 5]);

        let taken = buffer.take();
        assert_eq!(taken, vec![1, 2, 3, 4, 5]);
        assert!(buffer.is_empty());
        assert!(!buffer.is_ready());

        buffer.push(&[9]);
        assert_eq!(buffer.take(), vec![9]);
    }
}
