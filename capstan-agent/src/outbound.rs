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

//! Serialized outbound channel to the control node.
//!
//! Many producers — heartbeats, result frames, per-run log writers — feed
//! one writer task per connection. Control frames go through a bounded
//! channel; log chunks go through a drop-oldest queue so a slow socket
//! sheds output instead of stalling a running task.

use std::collections::VecDeque;
use std::sync::Mutex;

use capstan::frames::Frame;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Control frames buffered before senders block.
const CONTROL_BUFFER: usize = 64;

/// Log chunks retained when the socket falls behind.
const LOG_QUEUE_CAPACITY: usize = 1024;

/// The producer side of one connection's writer.
pub struct Outbound {
    control_tx: mpsc::Sender<Frame>,
    logs: Mutex<VecDeque<Frame>>,
    log_notify: Notify,
}

impl Outbound {
    /// Returns the handle plus the receiver the writer task drains.
    pub fn new() -> (std::sync::Arc<Self>, mpsc::Receiver<Frame>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        (
            std::sync::Arc::new(Self {
                control_tx,
                logs: Mutex::new(VecDeque::with_capacity(LOG_QUEUE_CAPACITY)),
                log_notify: Notify::new(),
            }),
            control_rx,
        )
    }

    /// Queues a control frame, failing when the connection is gone.
    pub fn send_control(&self, frame: Frame) -> Result<(), ()> {
        self.control_tx.try_send(frame).map_err(|err| {
            warn!(error = %err, "control frame dropped");
        })
    }

    /// Queues a log chunk; the oldest chunk is evicted when full.
    pub fn push_log(&self, frame: Frame) {
        {
            let mut logs = self.logs.lock().expect("log queue poisoned");
            if logs.len() >= LOG_QUEUE_CAPACITY {
                logs.pop_front();
            }
            logs.push_back(frame);
        }
        self.log_notify.notify_one();
    }

    /// Takes the next queued log chunk, if any.
    pub fn pop_log(&self) -> Option<Frame> {
        self.logs.lock().expect("log queue poisoned").pop_front()
    }

    /// Resolves when a log chunk may be available.
    pub async fn log_available(&self) {
        self.log_notify.notified().await;
    }
}
