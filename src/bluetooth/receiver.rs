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

//! Background receive loop.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{format_wire_bytes, to_wire_bytes, Frame};
use super::transport::{StreamHandle, TransportError};
use crate::log_sink::LogSink;

/// Default read buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Drains a stream handle on a background task and logs what arrives.
///
/// At most one loop is active at a time; [`ReceiveLoop::start`] is a no-op
/// while the previous one is still active. A cancelled loop stops counting
/// as active immediately, even if its task has not been scheduled yet.
pub struct ReceiveLoop {
    /// Generation of the active loop, 0 when none is.
    active: Arc<AtomicU64>,
    next_generation: AtomicU64,
    cancel_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    buffer_size: usize,
}

impl ReceiveLoop {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            active: Arc::new(AtomicU64::new(0)),
            next_generation: AtomicU64::new(1),
            cancel_tx: Mutex::new(None),
            task: Mutex::new(None),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Whether a loop is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// Start reading from `handle`.
    ///
    /// `on_exit` runs when the loop stops on a transport error, after the
    /// loop has stopped counting as active. It does not run on
    /// cancellation.
    /// Returns `false` if a loop was already running.
    pub fn start<F, Fut>(&self, handle: Arc<dyn StreamHandle>, sink: LogSink, on_exit: F) -> bool
    where
        F: FnOnce(TransportError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if self
            .active
            .compare_exchange(0, generation, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Receive loop already active");
            return false;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let active = self.active.clone();
        let buffer_size = self.buffer_size;

        let task = tokio::spawn(async move {
            let outcome = run(handle, sink, cancel_rx, buffer_size).await;
            // Leave a newer loop's generation alone.
            let _ = active.compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire);
            if let Some(err) = outcome {
                on_exit(err).await;
            }
        });

        *self.cancel_tx.lock() = Some(cancel_tx);
        *self.task.lock() = Some(task);
        info!("Receive loop {} started", generation);
        true
    }

    /// Ask the running loop to stop. Does not wait for it.
    ///
    /// A read that is already blocked only returns once the handle is
    /// closed, so callers close the handle right after this.
    pub fn cancel(&self) {
        if let Some(cancel_tx) = self.cancel_tx.lock().take() {
            let _ = cancel_tx.send(true);
        }
        self.active.store(0, Ordering::Release);
        // Detach; the task finishes on its own.
        self.task.lock().take();
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Read until cancelled or the transport fails. Returns the failure, if any.
async fn run(
    handle: Arc<dyn StreamHandle>,
    sink: LogSink,
    mut cancel_rx: watch::Receiver<bool>,
    buffer_size: usize,
) -> Option<TransportError> {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        if *cancel_rx.borrow_and_update() {
            debug!("Receive loop cancelled");
            return None;
        }

        let result = tokio::select! {
            biased;

            _ = cancel_rx.changed() => {
                debug!("Receive loop cancelled during read");
                return None;
            }
            result = handle.read(&mut buffer) => result,
        };

        match result {
            Ok(0) => continue,
            Ok(n) => handle_frame(&sink, &Frame::from_bytes(&buffer[..n])),
            // Teardown cancels before it closes the handle.
            Err(_) if *cancel_rx.borrow() => {
                debug!("Receive loop cancelled, handle closed");
                return None;
            }
            Err(e) => {
                warn!("Receive loop stopped: {}", e);
                sink.error(format!("RX error: {}", e));
                return Some(e);
            }
        }
    }
}

/// Log a received chunk and its decoded value.
fn handle_frame(sink: &LogSink, frame: &Frame) {
    debug!("Received {} bytes", frame.raw.len());
    sink.rx(format!("◀ {}", frame.text.trim_end()));

    match &frame.parsed {
        Ok(value) => {
            sink.rx(format!("value ◀ 0x{:04X} ({})", value, value));
            sink.rx(format!(
                "big-endian ◀ {}",
                format_wire_bytes(&to_wire_bytes(*value))
            ));
        }
        Err(e) => {
            debug!("Undecodable frame: {}", e);
            sink.error(format!("RX decode error: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::transport::SplitHandle;
    use crate::log_sink::LogTag;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    fn duplex() -> (Arc<dyn StreamHandle>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(local);
        (Arc::new(SplitHandle::new(reader, writer)), remote)
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_loop_running() {
        let (handle, mut remote) = duplex();
        let (sink, mut lines) = LogSink::channel();
        let receiver = ReceiveLoop::new(DEFAULT_BUFFER_SIZE);

        assert!(receiver.start(handle, sink, |_| async {}));

        remote.write_all(b"garbage").await.unwrap();
        assert_eq!(lines.recv().await.unwrap().message, "◀ garbage");
        assert_eq!(lines.recv().await.unwrap().tag, LogTag::Error);
        assert!(receiver.is_active());

        remote.write_all(b"0x0010\r\n").await.unwrap();
        assert_eq!(lines.recv().await.unwrap().message, "◀ 0x0010");
        assert_eq!(lines.recv().await.unwrap().message, "value ◀ 0x0010 (16)");
        assert_eq!(lines.recv().await.unwrap().message, "big-endian ◀ 00 10");

        receiver.cancel();
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (handle, _remote) = duplex();
        let (sink, _lines) = LogSink::channel();
        let receiver = ReceiveLoop::new(DEFAULT_BUFFER_SIZE);

        assert!(receiver.start(handle.clone(), sink.clone(), |_| async {}));
        assert!(!receiver.start(handle, sink, |_| async {}));
        receiver.cancel();
    }

    #[tokio::test]
    async fn test_remote_close_ends_loop() {
        let (handle, remote) = duplex();
        let (sink, mut lines) = LogSink::channel();
        let receiver = ReceiveLoop::new(DEFAULT_BUFFER_SIZE);
        let (exit_tx, exit_rx) = oneshot::channel();

        receiver.start(handle, sink, move |err| async move {
            let _ = exit_tx.send(err);
        });
        drop(remote);

        let err = tokio::time::timeout(Duration::from_secs(1), exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, TransportError::Closed);
        assert!(!receiver.is_active());

        let line = lines.recv().await.unwrap();
        assert_eq!(line.tag, LogTag::Error);
        assert_eq!(line.message, "RX error: Stream closed");
    }

    #[tokio::test]
    async fn test_cancel_clears_active_flag() {
        let (handle, _remote) = duplex();
        let (sink, _lines) = LogSink::channel();
        let receiver = ReceiveLoop::new(DEFAULT_BUFFER_SIZE);

        receiver.start(handle.clone(), sink.clone(), |_| async {});
        receiver.cancel();
        assert!(!receiver.is_active());

        // The old task has not run yet; a fresh loop still starts.
        assert!(receiver.start(handle, sink, |_| async {}));
        receiver.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_old_loop_exit_keeps_new_loop_active() {
        let (old_handle, _old_remote) = duplex();
        let (new_handle, _new_remote) = duplex();
        let (sink, _lines) = LogSink::channel();
        let receiver = ReceiveLoop::new(DEFAULT_BUFFER_SIZE);

        receiver.start(old_handle.clone(), sink.clone(), |_| async {});
        receiver.cancel();
        old_handle.close().await;
        assert!(receiver.start(new_handle, sink, |_| async {}));

        // Give the cancelled task time to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.is_active());
        receiver.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_then_close_logs_nothing() {
        for _ in 0..50 {
            let (handle, _remote) = duplex();
            let (sink, mut lines) = LogSink::channel();
            let receiver = ReceiveLoop::new(DEFAULT_BUFFER_SIZE);
            let (exit_tx, mut exit_rx) = oneshot::channel();

            receiver.start(handle.clone(), sink, move |err| async move {
                let _ = exit_tx.send(err);
            });
            tokio::task::yield_now().await;
            receiver.cancel();
            handle.close().await;

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(lines.try_recv().is_err());
            assert!(exit_rx.try_recv().is_err());
        }
    }
}
