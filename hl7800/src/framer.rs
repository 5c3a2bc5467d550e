//! Splits the byte stream from the modem into lines and raw data blocks.
//!
//! Lines end at CR, LF or CRLF. A CR that ends up as the last buffered byte leaves a pending LF
//! to swallow, so a CRLF split across two reads never produces an extra empty line. This also
//! matters for data mode, where the raw payload directly follows the `CONNECT` line.

/// Accumulates bytes from the transport and hands out framed lines.
pub struct LineFramer<const N: usize> {
    buffer: [u8; N],
    start: usize,
    end: usize,
    swallow_lf: bool,
}
impl<const N: usize> LineFramer<N> {
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; N],
            start: 0,
            end: 0,
            swallow_lf: false,
        }
    }
    /// The amount of bytes currently buffered.
    pub const fn buffered(&self) -> usize {
        self.end - self.start
    }
    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.swallow_lf = false;
    }
    /// Move the unread bytes to the front of the buffer.
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buffer.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
    /// Returns the free space at the end of the buffer, for the transport to read into.
    ///
    /// If the buffer is completely full with no line boundary in it, the content can't ever be
    /// framed, so it is discarded and framing resynchronizes on the next line boundary.
    pub fn spare(&mut self) -> &mut [u8] {
        self.compact();
        if self.end == N {
            warn!("RX buffer overrun, dropping {} bytes.", N);
            self.clear();
        }
        &mut self.buffer[self.end..]
    }
    /// Mark `len` bytes, that were written into [Self::spare], as buffered.
    pub fn commit(&mut self, len: usize) {
        self.end = (self.end + len).min(N);
    }
    /// Append bytes to the buffer.
    ///
    /// Returns the number of bytes accepted, which is less than `bytes.len()` if the buffer ran
    /// full.
    pub fn feed(&mut self, mut bytes: &[u8]) -> usize {
        let mut accepted = 0;
        while !bytes.is_empty() {
            let spare = self.spare();
            let len = spare.len().min(bytes.len());
            if len == 0 {
                break;
            }
            spare[..len].copy_from_slice(&bytes[..len]);
            self.commit(len);
            accepted += len;
            bytes = &bytes[len..];
        }
        accepted
    }
    fn drop_pending_lf(&mut self) {
        if self.swallow_lf && self.start < self.end {
            if self.buffer[self.start] == b'\n' {
                self.start += 1;
            }
            self.swallow_lf = false;
        }
    }
    /// Take the next complete line out of the buffer, without its terminator.
    ///
    /// Returns [None] if no complete line is buffered yet.
    pub fn next_line(&mut self) -> Option<&[u8]> {
        self.drop_pending_lf();
        let unread = &self.buffer[self.start..self.end];
        let terminator = unread.iter().position(|b| *b == b'\r' || *b == b'\n')?;
        let line_start = self.start;
        let line_end = self.start + terminator;
        self.start = line_end + 1;
        if self.buffer[line_end] == b'\r' {
            if self.start < self.end {
                if self.buffer[self.start] == b'\n' {
                    self.start += 1;
                }
            } else {
                self.swallow_lf = true;
            }
        }
        Some(&self.buffer[line_start..line_end])
    }
    /// Take exactly `len` raw bytes out of the buffer, ignoring line boundaries.
    ///
    /// Returns [None] until all `len` bytes are buffered.
    pub fn next_raw(&mut self, len: usize) -> Option<&[u8]> {
        self.drop_pending_lf();
        if self.swallow_lf || self.buffered() < len {
            return None;
        }
        let raw_start = self.start;
        self.start += len;
        Some(&self.buffer[raw_start..self.start])
    }
}
impl<const N: usize> Default for LineFramer<N> {
    fn default() -> Self {
        Self::new()
    }
}
