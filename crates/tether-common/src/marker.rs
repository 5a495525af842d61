//! Stream synchronization on a fixed marker.
//!
//! A transport may print arbitrary text (shell banners, launcher logs) before
//! the protocol begins. The agent writes [`MARK`] right before its first
//! protocol byte; the controller discards everything up to and including the
//! marker with [`skip_preamble`].
//!
//! [`MarkFinder`] is the matcher both sides share. It holds back a partial
//! match instead of forwarding it, and on a mismatch flushes the held bytes
//! as literals before reprocessing the mismatching byte from the start state.

use std::io::{self, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Marker that separates transport noise from the protocol stream.
pub const MARK: &[u8] = b"<===[TETHER CHANNEL BEGINS]===>";

/// Upper bound on preamble bytes [`skip_preamble`] will discard.
pub const MAX_PREAMBLE_LEN: u64 = 1 << 20;

/// Matcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// No bytes held.
    Normal,
    /// The first `k` marker bytes have been seen and are held back.
    Partial(usize),
}

/// Streaming marker matcher.
///
/// The held buffer is always a prefix of the marker, so only its length is
/// stored.
#[derive(Debug, Clone)]
pub struct MarkFinder {
    mark: &'static [u8],
    held: usize,
}

impl Default for MarkFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkFinder {
    /// Creates a matcher for [`MARK`].
    #[must_use]
    pub const fn new() -> Self {
        Self { mark: MARK, held: 0 }
    }

    /// Creates a matcher for an arbitrary non-empty marker.
    ///
    /// Returns `None` for an empty marker.
    #[must_use]
    pub const fn with_mark(mark: &'static [u8]) -> Option<Self> {
        if mark.is_empty() {
            None
        } else {
            Some(Self { mark, held: 0 })
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> MarkerState {
        match self.held {
            0 => MarkerState::Normal,
            k => MarkerState::Partial(k),
        }
    }

    /// Feeds one byte. Forwarded bytes are appended to `out`.
    ///
    /// Returns `true` when this byte completes a marker.
    pub fn push(&mut self, byte: u8, out: &mut Vec<u8>) -> bool {
        if self.held > 0 {
            if byte == self.mark[self.held] {
                self.held += 1;
                if self.held == self.mark.len() {
                    self.held = 0;
                    return true;
                }
                return false;
            }
            out.extend_from_slice(&self.mark[..self.held]);
            self.held = 0;
        }
        if byte == self.mark[0] {
            if self.mark.len() == 1 {
                return true;
            }
            self.held = 1;
        } else {
            out.push(byte);
        }
        false
    }

    /// Flushes any held partial match as literal bytes.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mark[..self.held]);
        self.held = 0;
    }
}

/// A [`Write`] adapter that elides every occurrence of a marker and calls
/// `on_mark` once per completed match, in stream order.
///
/// The sink is only handed back by [`finish`](Self::finish), which flushes
/// any pending partial match first.
pub struct MarkFindingWriter<W: Write, F: FnMut()> {
    inner: W,
    finder: MarkFinder,
    on_mark: F,
    scratch: Vec<u8>,
}

impl<W: Write, F: FnMut()> MarkFindingWriter<W, F> {
    /// Wraps `inner`, matching [`MARK`].
    pub fn new(inner: W, on_mark: F) -> Self {
        Self::with_finder(inner, MarkFinder::new(), on_mark)
    }

    /// Wraps `inner` with a custom matcher.
    pub fn with_finder(inner: W, finder: MarkFinder, on_mark: F) -> Self {
        Self {
            inner,
            finder,
            on_mark,
            scratch: Vec::new(),
        }
    }

    /// Current matcher state.
    pub const fn state(&self) -> MarkerState {
        self.finder.state()
    }

    /// Borrows the wrapped sink.
    pub const fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Flushes any held partial match and the wrapped sink, then returns
    /// the sink.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the wrapped sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.finder.finish(&mut self.scratch);
        self.drain()?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn drain(&mut self) -> io::Result<()> {
        if !self.scratch.is_empty() {
            self.inner.write_all(&self.scratch)?;
            self.scratch.clear();
        }
        Ok(())
    }
}

impl<W: Write, F: FnMut()> Write for MarkFindingWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if self.finder.push(byte, &mut self.scratch) {
                self.drain()?;
                (self.on_mark)();
            }
        }
        self.drain()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Consumes `reader` up to and including the first [`MARK`], handing every
/// preamble byte to `on_noise`.
///
/// Never reads past the marker: the reader is left positioned on the first
/// protocol byte. Returns the number of bytes consumed, marker included.
///
/// # Errors
///
/// Returns `UnexpectedEof` if the stream ends before the marker,
/// `InvalidData` if the preamble exceeds [`MAX_PREAMBLE_LEN`], and any I/O
/// error from the reader.
pub async fn skip_preamble<R, F>(reader: &mut R, mut on_noise: F) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut finder = MarkFinder::new();
    let mut noise = Vec::new();
    let mut consumed_total = 0u64;
    loop {
        let (consumed, found) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                finder.finish(&mut noise);
                if !noise.is_empty() {
                    on_noise(&noise);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before the channel marker",
                ));
            }
            let mut consumed = 0;
            let mut found = false;
            for &byte in buf {
                consumed += 1;
                if finder.push(byte, &mut noise) {
                    found = true;
                    break;
                }
            }
            (consumed, found)
        };
        reader.consume(consumed);
        consumed_total += consumed as u64;
        if !noise.is_empty() {
            on_noise(&noise);
            noise.clear();
        }
        if found {
            return Ok(consumed_total);
        }
        if consumed_total > MAX_PREAMBLE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no channel marker within {MAX_PREAMBLE_LEN} bytes"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::io::{AsyncReadExt, BufReader};

    fn head() -> &'static [u8] {
        &MARK[..MARK.len() / 2]
    }

    #[test]
    fn two_marks_are_removed() {
        let count = Cell::new(0);
        let mut w = MarkFindingWriter::new(Vec::new(), || count.set(count.get() + 1));
        let mut input = b"foo".to_vec();
        input.extend_from_slice(MARK);
        input.extend_from_slice(b"bar");
        input.extend_from_slice(MARK);
        w.write_all(&input).unwrap();
        assert_eq!(w.finish().unwrap().as_slice(), b"foobar");
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn partial_mark_is_held_then_flushed_on_mismatch() {
        let count = Cell::new(0);
        let mut w = MarkFindingWriter::new(Vec::new(), || count.set(count.get() + 1));
        let mut first = b"bar".to_vec();
        first.extend_from_slice(head());
        w.write_all(&first).unwrap();
        assert_eq!(w.get_ref().as_slice(), b"bar");
        assert_eq!(w.state(), MarkerState::Partial(head().len()));

        w.write_all(b"foo").unwrap();
        let mut expected = first.clone();
        expected.extend_from_slice(b"foo");
        assert_eq!(w.get_ref(), &expected);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn finish_flushes_pending_partial_match() {
        let count = Cell::new(0);
        let mut w = MarkFindingWriter::new(Vec::new(), || count.set(count.get() + 1));
        let mut input = b"foo".to_vec();
        input.extend_from_slice(head());
        w.write_all(&input).unwrap();
        assert_eq!(w.state(), MarkerState::Partial(head().len()));
        assert_eq!(w.get_ref().as_slice(), b"foo");
        assert_eq!(w.finish().unwrap(), input);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn byte_by_byte_mark_is_found() {
        let count = Cell::new(0);
        let mut w = MarkFindingWriter::new(Vec::new(), || count.set(count.get() + 1));
        w.write_all(b"1").unwrap();
        for byte in MARK {
            w.write_all(&[*byte]).unwrap();
        }
        w.write_all(b"2").unwrap();
        assert_eq!(w.finish().unwrap().as_slice(), b"12");
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn mismatch_flushes_held_bytes_without_backtracking() {
        let mut finder = MarkFinder::with_mark(b"aab").unwrap();
        let mut out = Vec::new();
        let mut matches = 0;
        for &byte in b"aaab" {
            if finder.push(byte, &mut out) {
                matches += 1;
            }
        }
        finder.finish(&mut out);
        assert_eq!(out, b"aaab");
        assert_eq!(matches, 0);
    }

    #[test]
    fn empty_mark_is_refused() {
        assert!(MarkFinder::with_mark(b"").is_none());
    }

    #[tokio::test]
    async fn skip_preamble_leaves_reader_on_first_protocol_byte() {
        let mut stream = b"login banner\r\n".to_vec();
        stream.extend_from_slice(MARK);
        stream.extend_from_slice(b"\x00\x00\x00\x02hi");
        let mut reader = BufReader::with_capacity(4, stream.as_slice());

        let mut noise = Vec::new();
        let consumed = skip_preamble(&mut reader, |chunk| noise.extend_from_slice(chunk))
            .await
            .unwrap();
        assert_eq!(noise, b"login banner\r\n");
        assert_eq!(consumed as usize, 14 + MARK.len());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x00\x00\x00\x02hi");
    }

    #[tokio::test]
    async fn skip_preamble_fails_at_eof_without_marker() {
        let mut stream = b"noise".to_vec();
        stream.extend_from_slice(head());
        let mut reader = BufReader::new(stream.as_slice());
        let mut noise = Vec::new();
        let err = skip_preamble(&mut reader, |chunk| noise.extend_from_slice(chunk))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(noise, stream);
    }
}
