//! `boardlink provision`

use anyhow::{bail, Result};
use boardlink_client::{BoardProvisioner, ConfigureState, ProvisionBoard};
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::registry::HttpRegistry;

pub async fn run(config: &Config, fqbn: String, port: String, device_id: String) -> Result<()> {
    let daemon = super::connect(config).await?;
    let registry = HttpRegistry::from_config(&config.registry)?;
    let provisioner = BoardProvisioner::new(daemon);

    let board = ProvisionBoard {
        fqbn,
        port,
        device_id,
        upload: config.upload_spec(),
    };

    let mut states = provisioner.configuring.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(ConfigureState::InProgress(msg)) => eprintln!("{}", msg.dimmed()),
                Ok(_) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    });

    provisioner.begin();
    let result = provisioner.configure(&board, &registry).await;
    progress.abort();

    match result {
        Ok(()) => {
            println!("{}", "Board provisioned".green().bold());
            Ok(())
        }
        Err(err) => bail!("provisioning failed: {}", err),
    }
}
