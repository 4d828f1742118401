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

//! Bluetooth RFCOMM client transport.

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::Address;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{DeviceRef, SplitHandle, StreamHandle, Transport, TransportError};
use crate::config::LinkConfig;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// How long to wait for a foreign inquiry to finish before connecting.
const DISCOVERY_SETTLE: Duration = Duration::from_secs(3);

/// Poll interval while waiting for an inquiry to finish.
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// RFCOMM transport backed by the BlueZ default adapter.
pub struct RfcommTransport {
    adapter: bluer::Adapter,
    channel: u8,
    connect_timeout: Duration,
    power_on: bool,
}

impl RfcommTransport {
    /// Connect to BlueZ and pick the default adapter.
    ///
    /// Fails with [`TransportError::Unavailable`] when there is no usable
    /// adapter on this machine.
    pub async fn new(config: &LinkConfig) -> Result<Self, TransportError> {
        info!("Initializing Bluetooth transport...");

        let session = bluer::Session::new()
            .await
            .map_err(|e| TransportError::Unavailable(format!("BlueZ session: {}", e)))?;
        debug!("BlueZ session created");

        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| TransportError::Unavailable(format!("no adapter: {}", e)))?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            adapter,
            channel: config.rfcomm_channel,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            power_on: config.power_on_adapter,
        })
    }

    /// List bonded devices that report a name.
    pub async fn paired_devices(&self) -> Result<Vec<DeviceRef>, TransportError> {
        let mut devices = Vec::new();

        if !self.is_powered().await? {
            return Ok(devices);
        }

        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        for addr in addresses {
            let Ok(device) = self.adapter.device(addr) else {
                continue;
            };
            if !device.is_paired().await.unwrap_or(false) {
                continue;
            }
            if let Ok(Some(name)) = device.name().await {
                devices.push(DeviceRef::new(name, addr.to_string()));
            }
        }

        debug!("Found {} paired devices", devices.len());
        Ok(devices)
    }

    async fn is_powered(&self) -> Result<bool, TransportError> {
        self.adapter
            .is_powered()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }

    /// Make sure the radio is on.
    async fn ensure_powered(&self) -> Result<(), TransportError> {
        if self.is_powered().await? {
            return Ok(());
        }

        if !self.power_on {
            return Err(TransportError::Unavailable(
                "adapter is powered off".to_string(),
            ));
        }

        info!("Powering on Bluetooth adapter...");
        self.adapter
            .set_powered(true)
            .await
            .map_err(|e| TransportError::Unavailable(format!("power on failed: {}", e)))
    }

    /// Keep an inquiry from competing with the connection attempt.
    ///
    /// BlueZ only lets the client that started discovery stop it, and this
    /// process never starts one, so an inquiry seen here belongs to someone
    /// else. Give it a bounded window to finish before opening.
    async fn suppress_discovery(&self) {
        let mut waited = Duration::ZERO;

        while self.adapter.is_discovering().await.unwrap_or(false) {
            if waited >= DISCOVERY_SETTLE {
                warn!("Inquiry still active, connecting anyway");
                return;
            }
            if waited.is_zero() {
                debug!("Inquiry active, waiting for it to finish");
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
            waited += DISCOVERY_POLL;
        }
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    async fn open(&self, device: &DeviceRef) -> Result<Arc<dyn StreamHandle>, TransportError> {
        let address: Address = device
            .address
            .parse()
            .map_err(|_| TransportError::ConnectFailed(format!("bad address {}", device.address)))?;

        self.ensure_powered().await?;
        self.suppress_discovery().await;

        info!(
            "Opening RFCOMM channel {} to {} (SPP {})",
            self.channel, device, SPP_UUID
        );
        let target = SocketAddr::new(address, self.channel);

        let stream = match tokio::time::timeout(self.connect_timeout, Stream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(TransportError::PermissionDenied);
            }
            Ok(Err(e)) => return Err(TransportError::ConnectFailed(e.to_string())),
            Err(_) => {
                return Err(TransportError::ConnectFailed(format!(
                    "timed out after {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        };

        info!("RFCOMM link to {} established", device);
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(SplitHandle::new(reader, writer)))
    }
}
