//! `boardlink monitor`

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use crate::config::Config;

const PORT_DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

pub async fn run(config: &Config, port: &str, baudrate: u32) -> Result<()> {
    let daemon = super::connect(config).await?;

    // Give the agent a moment to report the port before opening it.
    let port_name = port.to_string();
    let _ = timeout(
        PORT_DISCOVERY_WINDOW,
        daemon
            .devices
            .wait_for(move |d| d.serial.iter().any(|p| p.name == port_name)),
    )
    .await;

    let mut serial = daemon.serial_data_stream();
    daemon
        .open_serial_monitor(port, baudrate)
        .await
        .with_context(|| format!("could not open {}", port))?;
    eprintln!(
        "{}",
        format!("Monitoring {} at {} baud (ctrl-c to stop)", port, baudrate).dimmed()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            chunk = serial.recv() => match chunk {
                Ok(chunk) => {
                    print!("{}", chunk);
                    std::io::stdout().flush().ok();
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    daemon.close_serial_monitor(port).await.ok();
    Ok(())
}
