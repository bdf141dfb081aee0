use crate::config::MeterConfig;
use serde_derive::Deserialize;
use std::{future::Future, time::Duration};
use thiserror::Error;

/// The meter answers within a few hundred ms when healthy; anything slower
/// would stall the update loop.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("no response from Shelly EM at {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("Shelly EM at {0} timed out")]
    Timeout(String),
    #[error("Shelly EM returned HTTP {0}")]
    Status(u16),
    #[error("converting response to JSON failed: {0}")]
    MalformedResponse(String),
    #[error("response has no emeter channel {0}")]
    MissingChannel(usize),
    #[error("response does not contain 'mac' attribute")]
    Identity,
    #[error("cannot set up HTTP client: {0}")]
    Client(reqwest::Error),
}

/// One channel of the Shelly `/status` document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmeterStatus {
    pub power: f64,
    pub voltage: f64,
    /// Imported energy in Wh.
    pub total: f64,
    /// Exported energy in Wh.
    pub total_returned: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    mac: Option<String>,
    emeters: Vec<EmeterStatus>,
}

/// A single validated reading of the configured channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub voltage: f64,
    pub power: f64,
    pub forward_wh: f64,
    pub reverse_wh: f64,
    pub mac: Option<String>,
}

impl MeterReading {
    /// Line current as the meter does not report it on this endpoint.
    pub fn current(&self) -> f64 {
        self.power / self.voltage
    }
}

/// Anything that can produce a meter reading for the update cycle.
pub trait MeterSource {
    fn fetch(&self) -> impl Future<Output = Result<MeterReading, MeterError>>;
}

pub struct ShellyEmClient {
    status_url: String,
    username: String,
    password: String,
    emeter: usize,
    timeout: Duration,
    client: reqwest::Client,
}

impl ShellyEmClient {
    pub fn new(config: &MeterConfig) -> Result<Self, MeterError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(MeterError::Client)?;
        Ok(Self {
            status_url: config.status_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            emeter: config.emeter,
            timeout: FETCH_TIMEOUT,
            client,
        })
    }

    /// Bound on one whole request, connect through body. Defaults to
    /// [`FETCH_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    /// Reads the device serial (its MAC). Called once at startup, the value
    /// is part of the published identity and never refreshed.
    pub async fn fetch_serial(&self) -> Result<String, MeterError> {
        let status = self.fetch_status().await?;
        match status.mac {
            Some(mac) if !mac.trim().is_empty() => Ok(mac),
            _ => Err(MeterError::Identity),
        }
    }

    async fn fetch_status(&self) -> Result<StatusResponse, MeterError> {
        let mut request = self.client.get(&self.status_url).timeout(self.timeout);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let response = request.send().await.map_err(|e| self.map_transport(e))?;
        if !response.status().is_success() {
            return Err(MeterError::Status(response.status().as_u16()));
        }
        let body = response.bytes().await.map_err(|e| self.map_transport(e))?;
        serde_json::from_slice(&body).map_err(|e| MeterError::MalformedResponse(e.to_string()))
    }

    fn map_transport(&self, e: reqwest::Error) -> MeterError {
        if e.is_timeout() {
            MeterError::Timeout(self.status_url.clone())
        } else {
            MeterError::Unreachable {
                url: self.status_url.clone(),
                reason: e.to_string(),
            }
        }
    }
}

impl MeterSource for ShellyEmClient {
    async fn fetch(&self) -> Result<MeterReading, MeterError> {
        let status = self.fetch_status().await?;
        let channel = status
            .emeters
            .get(self.emeter)
            .ok_or(MeterError::MissingChannel(self.emeter))?;
        Ok(MeterReading {
            voltage: channel.voltage,
            power: channel.power,
            forward_wh: channel.total,
            reverse_wh: channel.total_returned,
            mac: status.mac.clone(),
        })
    }
}
