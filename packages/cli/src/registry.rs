//! HTTP device registry
//!
//! The CLI's implementation of the registration collaborator: POSTs the CSR
//! to the configured endpoint and returns the compressed certificate.

use anyhow::Result;
use async_trait::async_trait;
use boardlink_client::{DeviceRegistry, RegisteredDevice, RegistryError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::RegistryConfig;

pub struct HttpRegistry {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistry {
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl DeviceRegistry for HttpRegistry {
    async fn register_device(&self, csr: &str) -> Result<RegisteredDevice, RegistryError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "csr": csr }))
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected(format!("{}: {}", status, body)));
        }

        response
            .json::<RegisteredDevice>()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))
    }
}
