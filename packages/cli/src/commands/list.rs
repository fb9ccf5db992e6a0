//! `boardlink list`

use std::time::Duration;

use anyhow::Result;
use boardlink_client::DeviceList;
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use crate::config::Config;

/// How long to wait for the first device list after the channel opens.
const FIRST_LIST_WINDOW: Duration = Duration::from_secs(5);

pub async fn run(config: &Config, watch: bool) -> Result<()> {
    let daemon = super::connect(config).await?;
    let mut updates = daemon.devices.subscribe();

    let devices = timeout(
        FIRST_LIST_WINDOW,
        daemon
            .devices
            .wait_for(|d| !d.serial.is_empty() || !d.network.is_empty()),
    )
    .await
    .unwrap_or_else(|_| daemon.devices.get());
    print_devices(&devices);

    if watch {
        loop {
            match updates.recv().await {
                Ok(devices) => {
                    println!();
                    print_devices(&devices);
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

fn print_devices(devices: &DeviceList) {
    if devices.serial.is_empty() && devices.network.is_empty() {
        println!("{}", "No boards found".yellow());
        return;
    }

    if !devices.serial.is_empty() {
        println!("{}", "Serial boards".bold());
        for port in &devices.serial {
            let state = if port.is_open {
                "open".green()
            } else {
                "closed".dimmed()
            };
            let id = match (&port.vendor_id, &port.product_id) {
                (Some(vid), Some(pid)) => format!(" [{vid}:{pid}]"),
                _ => String::new(),
            };
            println!("  {} ({}){}", port.name, state, id.dimmed());
        }
    }
    if !devices.network.is_empty() {
        println!("{}", "Network boards".bold());
        for port in &devices.network {
            println!("  {}", port.name);
        }
    }
}
