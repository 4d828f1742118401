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

//! Stream transport abstraction.
//!
//! A [`Transport`] opens a connection to a [`DeviceRef`] and hands back a
//! [`StreamHandle`]. The handle is shared between the send path and the
//! receive loop; reads and writes go through separate halves so the two
//! directions never wait on each other.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Transport-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Stream closed")]
    Closed,

    #[error("IO error: {0}")]
    IoError(String),
}

/// Remote endpoint selected from the paired devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub name: String,
    pub address: String,
}

impl DeviceRef {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// An open stream connection.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// Write all bytes and flush.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes. Returns [`TransportError::Closed`] at
    /// end of stream or once the handle has been closed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Release the connection. Unblocks a pending read.
    async fn close(&self);
}

/// Factory for stream connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection. Blocks the calling task until the link is up.
    async fn open(&self, device: &DeviceRef) -> Result<Arc<dyn StreamHandle>, TransportError>;
}

/// [`StreamHandle`] over an independent reader and writer.
pub struct SplitHandle<R, W> {
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
    closed_tx: watch::Sender<bool>,
}

impl<R, W> SplitHandle<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            closed_tx,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

#[async_trait]
impl<R, W> StreamHandle for SplitHandle<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::IoError(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::IoError(e.to_string()))?;
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let capacity = buf.len();
        tokio::select! {
            _ = closed_rx.changed() => Err(TransportError::Closed),
            result = async {
                let mut reader = self.reader.lock().await;
                reader.read(buf).await
            } => match result {
                Ok(0) if capacity > 0 => Err(TransportError::Closed),
                Ok(n) => Ok(n),
                Err(e) => Err(TransportError::IoError(e.to_string())),
            },
        }
    }

    async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        debug!("Closing stream handle");

        // A write in flight keeps its half. That half is not shut down here
        // and stays open until the last clone of the handle is dropped;
        // later writes still fail on the closed flag.
        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type DuplexHandle = SplitHandle<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn duplex_handle() -> (DuplexHandle, DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(local);
        (SplitHandle::new(reader, writer), remote)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (handle, mut remote) = duplex_handle();

        handle.write(b"%#IDN?\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"%#IDN?\r");

        remote.write_all(b"0x00AB\r\n").await.unwrap();
        let n = handle.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0x00AB\r\n");
    }

    #[tokio::test]
    async fn test_remote_close_reports_closed() {
        let (handle, remote) = duplex_handle();
        drop(remote);

        let mut buf = [0u8; 16];
        assert_eq!(handle.read(&mut buf).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (handle, _remote) = duplex_handle();
        let handle = Arc::new(handle);

        let reader = handle.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read did not unblock")
            .unwrap();
        assert_eq!(result, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (handle, _remote) = duplex_handle();
        handle.close().await;
        handle.close().await;

        assert_eq!(handle.write(b"x").await, Err(TransportError::Closed));
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf).await, Err(TransportError::Closed));
    }
}
