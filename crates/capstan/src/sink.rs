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

//! Output sinks for captured child-process bytes.
//!
//! The executor is handed two [`SharedSink`]s for stdout and stderr. When
//! both are the *same* `Arc` (checked with [`Arc::ptr_eq`]) the output is
//! merged and the executor may attach the child to a pseudo-terminal.
//! Writing to a sink never fails from the caller's perspective; a sink that
//! has gone away simply swallows the bytes.

use std::sync::{Arc, Mutex};

/// A write-only destination for child-process output.
///
/// Implementations must tolerate writes after close and must never block
/// the writer for long: fan-out to slow consumers is the sink's problem.
pub trait LogSink: Send + Sync {
    /// Accept one chunk of raw output bytes.
    fn write_chunk(&self, chunk: &[u8]);

    /// Whether this sink discards everything it receives.
    ///
    /// The executor refuses PTY mode for discarding sinks — there is no
    /// point paying for a terminal nobody reads.
    fn is_null(&self) -> bool {
        false
    }
}

/// Shared handle to a sink. Identity (`Arc::ptr_eq`) signals merged output.
pub type SharedSink = Arc<dyn LogSink>;

/// A sink that discards all input.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_chunk(&self, _chunk: &[u8]) {}

    fn is_null(&self) -> bool {
        true
    }
}

/// A sink that accumulates everything into memory.
///
/// Used by the scheduler as the combined capture buffer and by tests as a
/// cheap probe.
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the bytes collected so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().expect("buffer sink poisoned").clone()
    }

    /// Lossy UTF-8 view of the collected bytes.
    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl LogSink for BufferSink {
    fn write_chunk(&self, chunk: &[u8]) {
        self.buf
            .lock()
            .expect("buffer sink poisoned")
            .extend_from_slice(chunk);
    }
}

/// Tees every chunk into a shared capture buffer and an optional onward sink.
///
/// The scheduler wraps the handler-provided writers in `TeeSink`s that all
/// share one capture buffer, so a run's merged output is available for the
/// result even when the handler also streams it elsewhere. When stdout and
/// stderr resolve to the same onward sink a single `TeeSink` is used for
/// both, preserving the merged identity the executor looks for.
pub struct TeeSink {
    capture: Arc<BufferSink>,
    onward: Option<SharedSink>,
}

impl TeeSink {
    pub fn new(capture: Arc<BufferSink>, onward: Option<SharedSink>) -> Self {
        Self { capture, onward }
    }
}

impl LogSink for TeeSink {
    fn write_chunk(&self, chunk: &[u8]) {
        self.capture.write_chunk(chunk);
        if let Some(onward) = &self.onward {
            onward.write_chunk(chunk);
        }
    }
}
