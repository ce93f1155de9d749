//! Stream framing: turns raw child-process pipes into discrete text bursts.
//!
//! The decisive output of a remote unlock session is a prompt with no
//! trailing newline, so framing on newlines alone would sit on the decisive
//! bytes forever. [`BurstReader`] therefore emits complete lines (newline
//! included) as they arrive, and additionally flushes whatever partial text
//! has accumulated once the stream goes silent for a configurable interval.
//! [`LineWriter`] is the write-side counterpart: every written string goes
//! out newline-terminated and flushed.

use std::io;
use std::mem;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::trace;
use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// How long the output stream must stay silent before buffered partial text
/// is flushed as a burst of its own.
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_millis(200);

/// Frames a raw byte stream into text bursts.
///
/// Bytes are decoded incrementally (multi-byte characters split across read
/// chunks are reassembled) and ANSI escape sequences are stripped before
/// framing, so prompt matching downstream sees plain text.
///
/// `next_burst` is cancel safe: all buffered text lives in the reader itself,
/// so a burst can never be lost to a dropped future.
pub struct BurstReader<R> {
    reader: R,
    /// Raw stripped bytes that do not yet form complete UTF-8.
    carry: BytesMut,
    /// Decoded text waiting to be framed.
    pending: String,
    silence_timeout: Option<Duration>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> BurstReader<R> {
    /// Wrap a raw byte stream. With `silence_timeout` of `None`, bursts are
    /// only emitted on newlines and at end of stream.
    pub fn new(reader: R, silence_timeout: Option<Duration>) -> Self {
        Self {
            reader,
            carry: BytesMut::new(),
            pending: String::new(),
            silence_timeout,
            eof: false,
        }
    }

    /// The next burst, or `None` once the stream has ended and all buffered
    /// text has been emitted. Read errors end the stream like EOF; at this
    /// layer a broken pipe and a closed pipe call for the same reaction.
    pub async fn next_burst(&mut self) -> Option<String> {
        loop {
            if let Some(newline) = memchr(b'\n', self.pending.as_bytes()) {
                let rest = self.pending.split_off(newline + 1);
                return Some(mem::replace(&mut self.pending, rest));
            }

            if self.eof {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(mem::take(&mut self.pending));
            }

            let mut chunk = [0u8; 4096];
            let read = match self.silence_timeout {
                // The silence timer restarts on every read; it only needs to
                // run while a partial burst is actually waiting.
                Some(silence) if !self.pending.is_empty() => {
                    match timeout(silence, self.reader.read(&mut chunk)).await {
                        Err(_) => return Some(mem::take(&mut self.pending)),
                        Ok(read) => read,
                    }
                }
                _ => self.reader.read(&mut chunk).await,
            };

            match read {
                Ok(0) => self.eof = true,
                Ok(n) => self.ingest(&chunk[..n]),
                Err(e) => {
                    trace!("read error treated as end of stream: {e}");
                    self.eof = true;
                }
            }
        }
    }

    /// Strip escape sequences from a chunk and move every complete UTF-8
    /// character into the pending text, keeping any incomplete trailing
    /// sequence for the next chunk.
    fn ingest(&mut self, bytes: &[u8]) {
        let cleaned = strip_ansi_escapes::strip(bytes);
        self.carry.extend_from_slice(&cleaned);

        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    self.pending.push_str(text);
                    self.carry.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.pending
                        .push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end of the chunk; the
                        // rest of the character is still in flight.
                        None => {
                            self.carry.advance(valid);
                            return;
                        }
                        Some(invalid) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            self.carry.advance(valid + invalid);
                        }
                    }
                }
            }
        }
    }
}

/// Wraps a byte sink so every written string goes out newline-terminated.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write `line` followed by a newline, and flush.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    /// Write bytes as-is, without newline termination. Used for control
    /// bytes like interrupt and end-of-transmission.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    /// Close the underlying sink, propagating EOF downstream. Dropping the
    /// writer closes the sink too; this form surfaces the error.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect<R: AsyncRead + Unpin>(mut reader: BurstReader<R>) -> Vec<String> {
        let mut bursts = Vec::new();
        while let Some(burst) = reader.next_burst().await {
            bursts.push(burst);
        }
        bursts
    }

    #[tokio::test]
    async fn whole_lines_become_bursts() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let reader = BurstReader::new(rx, None);
        tx.write_all(b"hello\nworld\n").await.unwrap();
        drop(tx);
        assert_eq!(collect(reader).await, vec!["hello\n", "world\n"]);
    }

    #[tokio::test]
    async fn empty_stream_yields_no_bursts() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        assert_eq!(collect(BurstReader::new(rx, None)).await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn unfinished_line_flushes_at_end_of_stream() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let reader = BurstReader::new(rx, None);
        tx.write_all(b"hello\nworld\nworle").await.unwrap();
        drop(tx);
        assert_eq!(collect(reader).await, vec!["hello\n", "world\n", "worle"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_flushes_partial_burst_before_more_bytes_arrive() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let reader = BurstReader::new(rx, Some(Duration::from_millis(200)));

        tokio::spawn(async move {
            tx.write_all(b"hello\nworld\nworle").await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.write_all(b"worlf").await.unwrap();
        });

        assert_eq!(
            collect(reader).await,
            vec!["hello\n", "world\n", "worle", "worlf"]
        );
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = BurstReader::new(rx, None);

        // U+1F510 (🔐) split down the middle.
        tx.write_all(&[0xf0, 0x9f]).await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(&[0x94, 0x90, b'\n']).await.unwrap();
        drop(tx);

        assert_eq!(reader.next_burst().await.as_deref(), Some("\u{1f510}\n"));
        assert_eq!(reader.next_burst().await, None);
    }

    #[tokio::test]
    async fn ansi_sequences_are_stripped() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let reader = BurstReader::new(rx, None);
        tx.write_all(b"\x1b[32mgreen\x1b[0m\nplain\n").await.unwrap();
        drop(tx);
        assert_eq!(collect(reader).await, vec!["green\n", "plain\n"]);
    }

    #[tokio::test]
    async fn write_line_appends_one_newline_per_write() {
        let sink = tokio_test::io::Builder::new()
            .write(b"hello")
            .write(b"\n")
            .write(b"world")
            .write(b"\n")
            .build();
        let mut writer = LineWriter::new(sink);
        writer.write_line("hello").await.unwrap();
        writer.write_line("world").await.unwrap();
    }

    #[tokio::test]
    async fn write_raw_passes_bytes_through() {
        let sink = tokio_test::io::Builder::new().write(b"\x03\x03\x04").build();
        let mut writer = LineWriter::new(sink);
        writer.write_raw(b"\x03\x03\x04").await.unwrap();
    }
}
