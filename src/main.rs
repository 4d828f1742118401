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

//! SPP query command-line client.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spp_query::bluetooth::RfcommTransport;
use spp_query::config::Config;
use spp_query::{DeviceRef, LogLine, LogSink, Session, StaticCapability};

/// How long to let the log printer drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spp_query=info".parse()?),
        )
        .init();

    info!("Starting SPP query v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let (sink, lines) = LogSink::channel();
    let printer = tokio::spawn(print_lines(lines));

    let transport = match RfcommTransport::new(&config.link).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            // No usable hardware: report once and stop accepting commands.
            error!("Bluetooth unavailable: {}", e);
            sink.error(format!("This machine has no usable Bluetooth adapter: {}", e));
            drop(sink);
            let _ = printer.await;
            std::process::exit(1);
        }
    };

    let device = resolve_device(&transport, &config, &sink).await;

    let session = Arc::new(Session::new(
        transport,
        Arc::new(StaticCapability(config.link.connect_allowed)),
        sink.clone(),
        config.link.read_buffer_size,
    ));

    // Failures are already reported to the log by the session.
    spawn_connect(&session, device.clone());

    sink.info("Enter: send request, c: connect, q: quit");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(input)) => match input.trim() {
                    "q" => break,
                    "c" => spawn_connect(&session, device.clone()),
                    _ => {
                        let session = session.clone();
                        tokio::spawn(async move {
                            let _ = session.send_request().await;
                        });
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!("stdin error: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.teardown().await;
    drop(session);
    drop(sink);
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, printer).await;

    info!("SPP query stopped");
    Ok(())
}

/// Pick the configured device, by explicit address or by paired name.
async fn resolve_device(
    transport: &RfcommTransport,
    config: &Config,
    sink: &LogSink,
) -> Option<DeviceRef> {
    if let Some(address) = &config.device.address {
        return Some(DeviceRef::new(config.device.name.clone(), address.clone()));
    }

    match transport.paired_devices().await {
        Ok(devices) => {
            let found = devices.into_iter().find(|d| d.name == config.device.name);
            if found.is_none() {
                sink.error(format!("Paired device '{}' not found", config.device.name));
            }
            found
        }
        Err(e) => {
            sink.error(format!("Listing paired devices failed: {}", e));
            None
        }
    }
}

fn spawn_connect(session: &Arc<Session>, device: Option<DeviceRef>) {
    let session = session.clone();
    tokio::spawn(async move {
        let _ = session.ensure_connected(device.as_ref()).await;
    });
}

/// Foreground consumer of the event log.
async fn print_lines(mut lines: mpsc::UnboundedReceiver<LogLine>) {
    while let Some(line) = lines.recv().await {
        println!("{} {}", line.timestamp.format("%H:%M:%S%.3f"), line);
    }
}
