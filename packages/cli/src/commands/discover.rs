//! `boardlink discover`

use anyhow::{Context, Result};
use boardlink_client::Scheme;
use colored::Colorize;

use crate::config::Config;

pub async fn run(config: &Config) -> Result<()> {
    let daemon = super::connect(config).await?;
    let endpoint = daemon
        .endpoint()
        .context("agent endpoint missing after discovery")?;

    println!("{}", "Agent found".green().bold());
    println!("  base:    {}", endpoint.base);
    println!("  socket:  {}", endpoint.socket);
    println!("  version: {}", endpoint.version);
    println!(
        "  scheme:  {}",
        match endpoint.scheme {
            Scheme::Secure => "secure",
            Scheme::Insecure => "insecure",
        }
    );
    Ok(())
}
