/// Byte queue backing a stream's read and write sides.
///
/// Bytes are appended at the tail and consumed from the head. The consumed
/// prefix is trimmed lazily: `start` advances on consume and the backing
/// vector is compacted once the dead prefix dominates, so repeated small
/// drains stay O(1) amortized. The unconsumed region is always one
/// contiguous slice, which keeps delimiter scans simple.
pub(crate) struct Buffer {
    data: Vec<u8>,
    start: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The unconsumed bytes as one contiguous slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Appends bytes at the tail.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Advances the head past `n` bytes without copying them out.
    pub fn consume(&mut self, n: usize) {
        self.start += n.min(self.len());
        self.compact();
    }

    /// Removes and returns the first `n` unconsumed bytes (fewer if the
    /// buffer is shorter).
    pub fn drain(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.len());
        let out = self.data[self.start..self.start + n].to_vec();
        self.start += n;
        self.compact();
        out
    }

    /// Removes and returns everything unconsumed.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.data[self.start..].to_vec();
        self.clear();
        out
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Finds `pattern` in the unconsumed bytes, searching no earlier than
    /// offset `from`. The returned index is relative to the head.
    pub fn find_from(&self, pattern: &[u8], from: usize) -> Option<usize> {
        let haystack = self.as_bytes();
        if pattern.is_empty() || from >= haystack.len() {
            return None;
        }
        haystack[from..]
            .windows(pattern.len())
            .position(|window| window == pattern)
            .map(|pos| from + pos)
    }

    fn compact(&mut self) {
        if self.start > 0 && self.start * 2 >= self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_and_drain() {
        let mut buf = Buffer::new();
        buf.extend(b"hello world");
        assert_eq!(buf.len(), 11);

        let head = buf.drain(6);
        assert_eq!(head, b"hello ");
        assert_eq!(buf.as_bytes(), b"world");

        // over-draining yields what is left
        let rest = buf.drain(100);
        assert_eq!(rest, b"world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consume_keeps_remainder_contiguous() {
        let mut buf = Buffer::new();
        buf.extend(b"abcdef");
        buf.consume(2);
        assert_eq!(buf.as_bytes(), b"cdef");
        buf.extend(b"gh");
        assert_eq!(buf.as_bytes(), b"cdefgh");
    }

    #[test]
    fn test_find_from_respects_offset() {
        let mut buf = Buffer::new();
        buf.extend(b"one\ntwo\n");
        assert_eq!(buf.find_from(b"\n", 0), Some(3));
        assert_eq!(buf.find_from(b"\n", 4), Some(7));
        assert_eq!(buf.find_from(b"\n", 8), None);
        assert_eq!(buf.find_from(b"", 0), None);
    }

    #[test]
    fn test_find_spanning_appends() {
        // a pattern arriving split across two appends is still found when
        // the search backs up past the seam
        let mut buf = Buffer::new();
        buf.extend(b"head\r");
        assert_eq!(buf.find_from(b"\r\n", 0), None);
        buf.extend(b"\ntail");
        assert_eq!(buf.find_from(b"\r\n", 4), Some(4));
    }

    #[test]
    fn test_take_all_resets() {
        let mut buf = Buffer::new();
        buf.extend(b"leftover");
        buf.consume(4);
        assert_eq!(buf.take_all(), b"over");
        assert!(buf.is_empty());
        assert_eq!(buf.find_from(b"x", 0), None);
    }
}
