//! Fixed-capacity read buffer with compaction.
//!
//! Bytes are read into the spare region, the parser consumes a prefix of
//! the filled region, and whatever it left behind is moved to the front so
//! a partial request survives until the next read.
//!
//! ```text
//!  before consume(5):  [ a a a a a b b b . . . . ]   len = 8
//!                        ^consumed ^kept
//!  after consume(5):   [ b b b . . . . . . . . . ]   len = 3
//! ```

/// Smallest buffer a connection may use.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Default per-connection buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// A fixed-size byte buffer that never grows.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ReadBuffer {
    /// Allocates a buffer of `capacity` bytes, raised to [`MIN_BUFFER_SIZE`].
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(MIN_BUFFER_SIZE)].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when no more bytes can be read in.
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// The valid bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The writable region after the valid bytes.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` bytes of the spare region as valid.
    ///
    /// # Panics
    ///
    /// If `n` is larger than the spare region.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.data.len() - self.len,
            "advance past buffer capacity"
        );
        self.len += n;
    }

    /// Drops the first `n` valid bytes and moves the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == 0 {
            return;
        }
        if n < self.len {
            self.data.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffer: &mut ReadBuffer, bytes: &[u8]) -> usize {
        let spare = buffer.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        buffer.advance(n);
        n
    }

    #[test]
    fn test_minimum_capacity() {
        assert_eq!(ReadBuffer::new(16).capacity(), MIN_BUFFER_SIZE);
        assert_eq!(ReadBuffer::new(4096).capacity(), 4096);
    }

    #[test]
    fn test_consume_keeps_tail() {
        let mut buffer = ReadBuffer::new(MIN_BUFFER_SIZE);
        fill(&mut buffer, b"GET / HTTP/1.1\r\nHo");

        buffer.consume(16);

        assert_eq!(buffer.filled(), b"Ho");
        fill(&mut buffer, b"st: x\r\n");
        assert_eq!(buffer.filled(), b"Host: x\r\n");
    }

    #[test]
    fn test_consume_everything() {
        let mut buffer = ReadBuffer::new(MIN_BUFFER_SIZE);
        fill(&mut buffer, b"abc");
        buffer.consume(10);
        assert!(buffer.is_empty());
        assert_eq!(buffer.spare_mut().len(), MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_full_buffer() {
        let mut buffer = ReadBuffer::new(MIN_BUFFER_SIZE);
        let written = fill(&mut buffer, &[b'x'; 2000]);

        assert_eq!(written, MIN_BUFFER_SIZE);
        assert!(buffer.is_full());
        assert!(buffer.spare_mut().is_empty());
    }

    #[test]
    #[should_panic(expected = "advance past buffer capacity")]
    fn test_advance_past_capacity_panics() {
        let mut buffer = ReadBuffer::new(MIN_BUFFER_SIZE);
        buffer.advance(MIN_BUFFER_SIZE + 1);
    }

    #[test]
    fn test_compaction_invariant() {
        // valid bytes == received - consumed, and never above capacity
        let mut buffer = ReadBuffer::new(MIN_BUFFER_SIZE);
        let mut received = 0usize;
        let mut consumed = 0usize;

        for round in 0..200usize {
            let chunk = vec![b'a' + (round % 26) as u8; (round * 37) % 300 + 1];
            received += fill(&mut buffer, &chunk);

            let take = (round * 53) % (buffer.len() + 1);
            buffer.consume(take);
            consumed += take;

            assert_eq!(buffer.len(), received - consumed);
            assert!(buffer.len() <= buffer.capacity());
        }
    }

    #[test]
    fn test_compaction_preserves_order() {
        let mut buffer = ReadBuffer::new(MIN_BUFFER_SIZE);
        fill(&mut buffer, b"0123456789");
        buffer.consume(3);
        fill(&mut buffer, b"ab");
        buffer.consume(2);
        assert_eq!(buffer.filled(), b"56789ab");
    }
}
