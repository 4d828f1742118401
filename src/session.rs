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

//! Connection lifecycle: connect on demand, send, receive, teardown.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    encode_request, DeviceRef, ReceiveLoop, StreamHandle, Transport, TransportError,
};
use crate::log_sink::LogSink;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
        }
    }
}

/// Session-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connect failed: {0}")]
    ConnectFailed(TransportError),

    #[error("Link error: {0}")]
    Transport(TransportError),
}

/// Authorization consulted before the radio is touched.
pub trait CapabilityCheck: Send + Sync {
    fn can_connect(&self) -> bool;
}

/// Fixed answer, usually taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapability(pub bool);

impl CapabilityCheck for StaticCapability {
    fn can_connect(&self) -> bool {
        self.0
    }
}

/// State shared with the receive loop's exit path.
struct Shared {
    state: RwLock<ConnectionState>,
    handle: RwLock<Option<Arc<dyn StreamHandle>>>,
    /// Bumped by every teardown so an in-flight connect can notice it.
    epoch: AtomicU64,
    sink: LogSink,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Connection state: {} -> {}", previous.as_str(), state.as_str());
        }
    }

    fn current_handle(&self) -> Option<Arc<dyn StreamHandle>> {
        self.handle.read().clone()
    }

    /// Drop `handle` if it is still the live one.
    async fn link_lost(&self, handle: &Arc<dyn StreamHandle>) {
        let lost = {
            let mut guard = self.handle.write();
            match guard.as_ref() {
                Some(current) if same_handle(current, handle) => guard.take(),
                _ => None,
            }
        };

        if let Some(lost) = lost {
            self.set_state(ConnectionState::Disconnected);
            info!("Link lost, session disconnected");
            lost.close().await;
        }
    }
}

fn same_handle(a: &Arc<dyn StreamHandle>, b: &Arc<dyn StreamHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A single logical connection to one remote device.
///
/// Connect attempts are serialized: a caller arriving while another attempt
/// is in flight waits for it and reuses its result. Sends are serialized
/// around the write. The receive loop runs on its own task against the
/// same handle.
pub struct Session {
    transport: Arc<dyn Transport>,
    capability: Arc<dyn CapabilityCheck>,
    shared: Arc<Shared>,
    receiver: ReceiveLoop,
    connect_lock: Mutex<()>,
    send_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        capability: Arc<dyn CapabilityCheck>,
        sink: LogSink,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            transport,
            capability,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                handle: RwLock::new(None),
                epoch: AtomicU64::new(0),
                sink,
            }),
            receiver: ReceiveLoop::new(read_buffer_size),
            connect_lock: Mutex::new(()),
            send_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the receive loop is running.
    pub fn is_receiving(&self) -> bool {
        self.receiver.is_active()
    }

    /// Connect to `device` unless already connected.
    ///
    /// Returns `Ok(false)` when no device has been selected yet.
    pub async fn ensure_connected(&self, device: Option<&DeviceRef>) -> Result<bool, SessionError> {
        if self.is_connected() {
            return Ok(true);
        }
        let Some(device) = device else {
            debug!("No device selected yet");
            return Ok(false);
        };

        let _connecting = self.connect_lock.lock().await;
        if self.is_connected() {
            debug!("Connected by a concurrent attempt");
            return Ok(true);
        }

        let epoch = self.shared.epoch.load(Ordering::Acquire);
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.sink.info(format!("Connecting to {}", device));

        if !self.capability.can_connect() {
            self.shared.set_state(ConnectionState::Disconnected);
            warn!("Connect to {} not permitted", device);
            self.shared.sink.error("Bluetooth connect permission denied");
            return Err(SessionError::ConnectFailed(TransportError::PermissionDenied));
        }

        let handle = match self.transport.open(device).await {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!("Connect to {} failed: {}", device, e);
                self.shared.sink.error(format!("Connect failed: {}", e));
                return Err(SessionError::ConnectFailed(e));
            }
        };

        if self.shared.epoch.load(Ordering::Acquire) != epoch {
            handle.close().await;
            self.shared.set_state(ConnectionState::Disconnected);
            info!("Session torn down while connecting to {}", device);
            self.shared.sink.error("Connect aborted by teardown");
            return Err(SessionError::ConnectFailed(TransportError::Closed));
        }

        *self.shared.handle.write() = Some(handle.clone());
        self.shared.set_state(ConnectionState::Connected);
        info!("Connected to {}", device);
        self.shared.sink.info("Connected");

        self.start_receiving(handle);
        Ok(true)
    }

    /// Write `bytes` to the device.
    ///
    /// The `TX` line is appended before the write so a fast reply can never
    /// be logged ahead of it.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let handle = match self.shared.current_handle() {
            Some(handle) if self.is_connected() => handle,
            _ => {
                self.shared.sink.error("Send failed: not connected");
                return Err(SessionError::NotConnected);
            }
        };

        let _sending = self.send_lock.lock().await;
        self.shared
            .sink
            .tx(format!("▶ {}", String::from_utf8_lossy(bytes).trim_end()));
        if let Err(e) = handle.write(bytes).await {
            warn!("Write failed: {}", e);
            self.shared.sink.error(format!("TX error: {}", e));
            self.receiver.cancel();
            self.shared.link_lost(&handle).await;
            return Err(SessionError::Transport(e));
        }

        debug!("Sent {} bytes", bytes.len());
        Ok(())
    }

    /// Send the identification query and make sure replies are being read.
    pub async fn send_request(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            self.ensure_receiving();
        }
        self.send(&encode_request()).await
    }

    /// Start the receive loop on the live handle if it is not running.
    ///
    /// Returns `true` if a new loop was started.
    pub fn ensure_receiving(&self) -> bool {
        match self.shared.current_handle() {
            Some(handle) => self.start_receiving(handle),
            None => false,
        }
    }

    fn start_receiving(&self, handle: Arc<dyn StreamHandle>) -> bool {
        let shared = self.shared.clone();
        let watched = handle.clone();
        self.receiver
            .start(handle, self.shared.sink.clone(), move |_| async move {
                shared.link_lost(&watched).await;
            })
    }

    /// Stop receiving, close the link and reset to `Disconnected`.
    ///
    /// Safe to call repeatedly and from any task.
    pub async fn teardown(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.receiver.cancel();

        let handle = self.shared.handle.write().take();
        self.shared.set_state(ConnectionState::Disconnected);

        if let Some(handle) = handle {
            handle.close().await;
            info!("Session torn down");
            self.shared.sink.info("Disconnected");
        }
    }
}
