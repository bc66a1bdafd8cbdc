//! Output capture and live subscriptions
//!
//! Every session accumulates stdout/stderr into [`OutputBuffers`]. A caller
//! may additionally subscribe to a bounded channel of [`OutputChunk`]s. The
//! buffers are authoritative; a subscriber that stops draining loses chunks
//! (counted in `dropped`) but never stalls the process readers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Default subscription channel capacity
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// Which stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// Text emitted by the session itself (manual-mode instructions)
    System,
}

/// One piece of live output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Originating session
    pub session_id: String,
    /// Stream
    pub stream: StreamKind,
    /// Decoded text (lossy UTF-8)
    pub text: String,
}

#[derive(Debug, Default)]
struct Streams {
    stdout: String,
    stderr: String,
}

/// Accumulated stdout/stderr plus the live subscriber
#[derive(Debug)]
pub struct OutputBuffers {
    session_id: String,
    streams: Mutex<Streams>,
    subscriber: Mutex<Option<mpsc::Sender<OutputChunk>>>,
    changed: Notify,
    dropped: AtomicU64,
}

impl OutputBuffers {
    /// Create empty buffers for a session
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            streams: Mutex::new(Streams::default()),
            subscriber: Mutex::new(None),
            changed: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Replace the subscriber; returns the receiving end
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<OutputChunk> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.subscriber.lock() = Some(tx);
        rx
    }

    /// Drop the subscriber
    pub fn unsubscribe(&self) {
        self.subscriber.lock().take();
    }

    /// Append text and forward it
    pub fn push(&self, stream: StreamKind, text: &str) {
        {
            let mut streams = self.streams.lock();
            match stream {
                StreamKind::Stdout => streams.stdout.push_str(text),
                StreamKind::Stderr => streams.stderr.push_str(text),
                StreamKind::System => {}
            }
        }
        self.forward(stream, text);
        self.changed.notify_waiters();
    }

    fn forward(&self, stream: StreamKind, text: &str) {
        let mut guard = self.subscriber.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        let chunk = OutputChunk {
            session_id: self.session_id.clone(),
            stream,
            text: text.to_string(),
        };
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(session_id = %self.session_id, dropped = total, "output subscriber lagging");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                guard.take();
            }
        }
    }

    /// Clear both buffers
    pub fn clear(&self) {
        let mut streams = self.streams.lock();
        streams.stdout.clear();
        streams.stderr.clear();
    }

    /// Snapshot of stdout
    #[must_use]
    pub fn stdout(&self) -> String {
        self.streams.lock().stdout.clone()
    }

    /// Snapshot of stderr
    #[must_use]
    pub fn stderr(&self) -> String {
        self.streams.lock().stderr.clone()
    }

    /// Text preceding `marker` in stdout, if the marker has arrived
    #[must_use]
    pub fn stdout_before(&self, marker: &str) -> Option<String> {
        let streams = self.streams.lock();
        streams
            .stdout
            .find(marker)
            .map(|idx| streams.stdout[..idx].to_string())
    }

    /// Future resolving on the next push or wake
    ///
    /// Call `enable()` on the pinned future before re-checking the buffers so
    /// a push between the check and the await is not missed.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Wake every waiter without new output (process exit)
    pub fn wake(&self) {
        self.changed.notify_waiters();
    }

    /// Chunks a lagging subscriber missed
    #[must_use]
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Incremental UTF-8 decoder that holds back a character split across reads
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode everything up to a trailing incomplete sequence
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }

    /// Flush whatever is left at EOF
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let width = match bytes[i] {
            0x80..=0xBF => continue,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let available = bytes.len() - i;
        return if available < width { available } else { 0 };
    }
    0
}

/// Pump a child stream into the buffers until EOF
pub(crate) async fn pump<R>(mut reader: R, buffers: Arc<OutputBuffers>, stream: StreamKind)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut carry = Utf8Carry::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = carry.decode(&buf[..n]);
                if !text.is_empty() {
                    buffers.push(stream, &text);
                }
            }
        }
    }
    let rest = carry.finish();
    if !rest.is_empty() {
        buffers.push(stream, &rest);
    }
    buffers.wake();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_before_marker() {
        let buffers = OutputBuffers::new("s");
        buffers.push(StreamKind::Stdout, "hello\n__M");
        assert_eq!(buffers.stdout_before("__MARK__"), None);

        buffers.push(StreamKind::Stdout, "ARK__\ntrailing");
        assert_eq!(buffers.stdout_before("__MARK__").as_deref(), Some("hello\n"));
    }

    #[test]
    fn system_text_is_not_buffered() {
        let buffers = OutputBuffers::new("s");
        buffers.push(StreamKind::System, "run this");
        assert!(buffers.stdout().is_empty());
        assert!(buffers.stderr().is_empty());
    }

    #[tokio::test]
    async fn subscriber_receives_chunks_in_order() {
        let buffers = OutputBuffers::new("s");
        let mut rx = buffers.subscribe(4);

        buffers.push(StreamKind::Stdout, "a");
        buffers.push(StreamKind::Stderr, "b");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.stream, first.text.as_str()), (StreamKind::Stdout, "a"));
        assert_eq!((second.stream, second.text.as_str()), (StreamKind::Stderr, "b"));
    }

    #[test]
    fn split_character_waits_for_its_remaining_bytes() {
        let mut carry = Utf8Carry::default();
        let bytes = "caf\u{e9} \u{1f600}".as_bytes();

        assert_eq!(carry.decode(&bytes[..4]), "caf");
        assert_eq!(carry.decode(&bytes[4..7]), "\u{e9} ");
        assert_eq!(carry.decode(&bytes[7..9]), "");
        assert_eq!(carry.decode(&bytes[9..]), "\u{1f600}");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn truncated_character_at_eof_is_replaced() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(b"ok\xc3"), "ok");
        assert_eq!(carry.finish(), "\u{fffd}");
    }

    #[test]
    fn invalid_bytes_are_not_held_back() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(carry.decode(b"\xbf"), "\u{fffd}");
    }

    #[tokio::test]
    async fn pump_keeps_character_across_read_boundary() {
        let mut bytes = vec![b' '; 4095];
        bytes.extend_from_slice("\u{e9}\n".as_bytes());
        let buffers = Arc::new(OutputBuffers::new("s"));

        pump(&bytes[..], buffers.clone(), StreamKind::Stdout).await;

        let stdout = buffers.stdout();
        assert_eq!(stdout.len(), 4098);
        assert!(stdout.ends_with("\u{e9}\n"));
        assert!(!stdout.contains('\u{fffd}'));
    }

    #[test]
    fn full_subscriber_drops_but_buffers_keep_everything() {
        let buffers = OutputBuffers::new("s");
        let _rx = buffers.subscribe(1);

        buffers.push(StreamKind::Stdout, "1");
        buffers.push(StreamKind::Stdout, "2");
        buffers.push(StreamKind::Stdout, "3");

        assert_eq!(buffers.dropped_chunks(), 2);
        assert_eq!(buffers.stdout(), "123");
    }
}
