use serde_derive::Deserialize;
use std::{future::Future, time::Duration};
use thiserror::Error;

/// Auxiliary reads must stay well inside one update period.
pub const BUS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no property bus connection")]
    NotConnected,
    #[error("{service}{path} does not exist")]
    NotFound { service: String, path: String },
    #[error("property bus request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Read access to values other devices publish on the bus.
pub trait PropertyBus {
    /// `Ok(None)` means the path exists but currently holds no value.
    fn read_value(
        &self,
        service: &str,
        path: &str,
    ) -> impl Future<Output = Result<Option<f64>, BusError>>;
}

#[derive(Debug, Deserialize)]
struct BusValue {
    value: Option<f64>,
}

/// Reaches the bus through its HTTP bridge: `GET {base}/value/{service}{path}`.
pub struct HttpPropertyBus {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPropertyBus {
    pub fn new(base_url: &str) -> Result<Self, BusError> {
        let client = reqwest::Client::builder().timeout(BUS_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl PropertyBus for HttpPropertyBus {
    async fn read_value(&self, service: &str, path: &str) -> Result<Option<f64>, BusError> {
        if self.base_url.is_empty() {
            return Err(BusError::NotConnected);
        }
        let response = self
            .client
            .get(format!("{}/value/{}{}", self.base_url, service, path))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BusError::NotFound {
                service: service.to_string(),
                path: path.to_string(),
            });
        }
        let value: BusValue = response.error_for_status()?.json().await?;
        Ok(value.value)
    }
}
