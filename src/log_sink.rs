// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-visible event log.
//!
//! Producers on any task append lines through a cloned [`LogSink`]; the
//! foreground side drains them from a single channel, so lines arrive in
//! the order they were appended.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Line tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Tx,
    Rx,
    Info,
    Error,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTag::Tx => "TX",
            LogTag::Rx => "RX",
            LogTag::Info => "INFO",
            LogTag::Error => "ERROR",
        }
    }
}

/// A single appended line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub tag: LogTag,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tag.as_str(), self.message)
    }
}

/// Append-only handle to the event log.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl LogSink {
    /// Create a sink and the receiver the foreground drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn append(&self, tag: LogTag, message: impl Into<String>) {
        let line = LogLine {
            timestamp: Local::now(),
            tag,
            message: message.into(),
        };
        debug!("{}", line);

        // Nobody listening any more; the line has nowhere to go.
        let _ = self.tx.send(line);
    }

    pub fn tx(&self, message: impl Into<String>) {
        self.append(LogTag::Tx, message);
    }

    pub fn rx(&self, message: impl Into<String>) {
        self.append(LogTag::Rx, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogTag::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogTag::Error, message);
    }
}
