//! Bounded per-session output capture.

/// Capacity of a session's output ring: 256 KiB.
pub const OUTPUT_CAP: usize = 256 * 1024;

/// Byte ring holding the most recent captured output.
///
/// On overflow the oldest bytes are discarded first; readers that
/// fell behind the discard watermark silently get the surviving
/// suffix.
#[derive(Debug, Default)]
pub struct OutputRing {
    buf: Vec<u8>,
}

impl OutputRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends captured bytes, trimming from the front to keep the
    /// ring within [`OUTPUT_CAP`].
    pub fn append(&mut self, data: &[u8]) {
        if data.len() >= OUTPUT_CAP {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - OUTPUT_CAP..]);
            return;
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() > OUTPUT_CAP {
            let excess = self.buf.len() - OUTPUT_CAP;
            self.buf.drain(..excess);
        }
    }

    /// Total bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been captured yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the bytes from `offset` through the buffer end, plus
    /// the current total. Offsets past the end yield an empty slice.
    #[must_use]
    pub fn slice_from(&self, offset: usize) -> (Vec<u8>, usize) {
        let total = self.buf.len();
        let data = if offset < total {
            self.buf[offset..].to_vec()
        } else {
            Vec::new()
        };
        (data, total)
    }
}
