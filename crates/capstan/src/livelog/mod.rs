/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Streaming log collector.
//!
//! A [`LiveLog`] is a write-only sink backed by a temp file that also fans
//! chunks out to live subscribers, so a streaming endpoint can attach to a
//! run already in flight. The raw byte stream from a child may cut a
//! multi-byte UTF-8 codepoint at a chunk boundary; the collector holds up
//! to three trailing bytes back until the codepoint completes, then
//! transcodes leniently (invalid sequences become U+FFFD) before writing.
//!
//! After the run finishes, [`LiveLog::compress_and_cleanup`] streams the
//! file through zlib into base64 and deletes it; the resulting string is
//! what the log row stores.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sink::LogSink;

/// Buffered chunks a slow subscriber may lag behind by before chunks are
/// dropped for it.
const SUBSCRIBER_BUFFER: usize = 100;

/// How much of the file tail `read_last_lines` inspects.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Process-wide index of in-flight collectors, keyed by log id.
///
/// Owned by whoever wires the process together and injected where needed;
/// executor code never reaches for a global.
#[derive(Default)]
pub struct LiveLogRegistry {
    logs: RwLock<HashMap<u64, Arc<LiveLog>>>,
}

impl LiveLogRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a collector for `log_id`, registers it, and returns it.
    pub fn create(self: &Arc<Self>, log_id: u64) -> std::io::Result<Arc<LiveLog>> {
        let log = Arc::new(LiveLog::new(log_id, Arc::downgrade(self))?);
        self.logs
            .write()
            .expect("livelog registry poisoned")
            .insert(log_id, log.clone());
        Ok(log)
    }

    /// Looks up the collector for an in-flight run.
    pub fn get(&self, log_id: u64) -> Option<Arc<LiveLog>> {
        self.logs
            .read()
            .expect("livelog registry poisoned")
            .get(&log_id)
            .cloned()
    }

    fn remove(&self, log_id: u64) {
        self.logs
            .write()
            .expect("livelog registry poisoned")
            .remove(&log_id);
    }

    pub fn len(&self) -> usize {
        self.logs.read().expect("livelog registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

struct LiveLogInner {
    temp: Option<NamedTempFile>,
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    remainder: Vec<u8>,
    closed: bool,
}

/// A per-run streaming log collector.
pub struct LiveLog {
    log_id: u64,
    registry: Weak<LiveLogRegistry>,
    inner: Mutex<LiveLogInner>,
}

impl LiveLog {
    fn new(log_id: u64, registry: Weak<LiveLogRegistry>) -> std::io::Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("task_log_")
            .suffix(".log")
            .tempfile()?;
        let path = temp.path().to_path_buf();
        let writer = BufWriter::new(temp.reopen()?);

        Ok(Self {
            log_id,
            registry,
            inner: Mutex::new(LiveLogInner {
                temp: Some(temp),
                writer: Some(writer),
                path,
                subscribers: Vec::new(),
                next_subscriber: 0,
                remainder: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    /// Appends bytes, holding back a trailing partial UTF-8 codepoint.
    ///
    /// Returns `Err` only when the collector is closed; downstream sinks
    /// treat that as "swallow".
    pub fn write(&self, p: &[u8]) -> std::io::Result<()> {
        let mut inner = self.inner.lock().expect("livelog poisoned");
        if inner.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "log collector closed",
            ));
        }

        let mut payload = std::mem::take(&mut inner.remainder);
        payload.extend_from_slice(p);

        let safe = utf8_safe_prefix_len(&payload);
        if safe < payload.len() {
            inner.remainder = payload[safe..].to_vec();
        }
        if safe == 0 {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&payload[..safe]);
        let data = text.as_bytes();

        if let Some(writer) = inner.writer.as_mut() {
            writer.write_all(data)?;
        }
        fan_out(&mut inner.subscribers, data);
        Ok(())
    }

    /// Registers a live subscriber; the id is the ticket for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let mut inner = self.inner.lock().expect("livelog poisoned");
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    /// Drops a subscriber; its channel closes.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("livelog poisoned");
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Flushes the residual bytes as a final chunk, closes every
    /// subscriber channel, and removes the collector from the registry.
    /// Further writes are refused. Idempotent.
    pub fn close(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().expect("livelog poisoned");
        if inner.closed {
            return Ok(());
        }

        if !inner.remainder.is_empty() {
            let tail = std::mem::take(&mut inner.remainder);
            let text = String::from_utf8_lossy(&tail).into_owned();
            if let Some(writer) = inner.writer.as_mut() {
                let _ = writer.write_all(text.as_bytes());
            }
            fan_out(&mut inner.subscribers, text.as_bytes());
        }

        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
        }
        // Dropping the senders closes every subscriber channel.
        inner.subscribers.clear();
        inner.closed = true;
        drop(inner);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.log_id);
        }
        debug!(log_id = self.log_id, "log collector closed");
        Ok(())
    }

    /// Streams the temp file through zlib into base64, deletes the file,
    /// and returns the encoded string. Safe to call exactly once, after
    /// [`close`](Self::close) (which it performs if needed).
    pub fn compress_and_cleanup(&self) -> std::io::Result<String> {
        self.close()?;

        let temp = {
            let mut inner = self.inner.lock().expect("livelog poisoned");
            inner.temp.take().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "log collector already compressed",
                )
            })?
        };

        let mut file = temp.reopen()?;
        let mut out = Vec::new();
        {
            let b64 = base64::write::EncoderWriter::new(&mut out, &BASE64);
            let mut zlib = ZlibEncoder::new(b64, Compression::default());
            std::io::copy(&mut file, &mut zlib)?;
            let mut b64 = zlib.finish()?;
            b64.finish()?;
        }
        // Dropping the NamedTempFile removes it from disk.
        drop(temp);

        String::from_utf8(out)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-ascii base64"))
    }

    /// Returns at most `n + 1` trailing lines from the last 64 KiB of the
    /// file. Intended for failure previews while a run is still going.
    pub fn read_last_lines(&self, n: usize) -> std::io::Result<Vec<u8>> {
        let path = {
            let mut inner = self.inner.lock().expect("livelog poisoned");
            if let Some(writer) = inner.writer.as_mut() {
                writer.flush()?;
            }
            inner.path.clone()
        };

        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();
        let window = size.min(TAIL_WINDOW);
        file.seek(SeekFrom::Start(size - window))?;

        let mut data = Vec::with_capacity(window as usize);
        file.read_to_end(&mut data)?;

        let lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
        if lines.len() > n + 1 {
            Ok(lines[lines.len() - n - 1..].join(&b'\n'))
        } else {
            Ok(data)
        }
    }

    /// Path of the backing temp file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().expect("livelog poisoned").path.clone()
    }
}

impl LogSink for LiveLog {
    fn write_chunk(&self, chunk: &[u8]) {
        // Writes to a closed collector are swallowed.
        let _ = self.write(chunk);
    }
}

fn fan_out(subscribers: &mut Vec<Subscriber>, data: &[u8]) {
    if subscribers.is_empty() {
        return;
    }
    subscribers.retain(|sub| match sub.tx.try_send(data.to_vec()) {
        Ok(()) => true,
        // Slow subscriber: drop this chunk for it, keep the channel.
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(subscriber = sub.id, "log subscriber lagging, chunk dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Length of the longest prefix that does not end mid-codepoint.
fn utf8_safe_prefix_len(payload: &[u8]) -> usize {
    let len = payload.len();
    let start = len.saturating_sub(4);
    for i in (start..len).rev() {
        let b = payload[i];
        let is_start = b < 0x80 || b >= 0xC0;
        if is_start {
            let width = match b {
                0x00..=0x7F => 1,
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                _ => 4,
            };
            if i + width > len {
                return i;
            }
            break;
        }
    }
    len
}

/// Compresses a string the same way a finalized log is stored:
/// base64(zlib(utf8)). Used for synthetic outputs when no collector exists.
pub fn compress_to_base64(text: &str) -> std::io::Result<String> {
    let mut out = Vec::new();
    {
        let b64 = base64::write::EncoderWriter::new(&mut out, &BASE64);
        let mut zlib = ZlibEncoder::new(b64, Compression::default());
        zlib.write_all(text.as_bytes())?;
        let mut b64 = zlib.finish()?;
        b64.finish()?;
    }
    String::from_utf8(out)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-ascii base64"))
}

/// Inverse of [`compress_to_base64`]; exposed for consumers that render
/// stored log rows.
pub fn decompress_from_base64(encoded: &str) -> std::io::Result<String> {
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
    let mut text = String::new();
    decoder.read_to_string(&mut text)?;
    Ok(text)
}
