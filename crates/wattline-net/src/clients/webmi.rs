//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device protocol clients and the uniform read contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, trace, warn};
use wattline_common::config::ProtocolConfig;
use wattline_schema::{Device, ProtocolKind};

use crate::clients::ProtocolClient;
use crate::ProtocolError;

/// Well-known address used for connectivity probes; line frequency is
/// published by every supported meter.
const PROBE_ADDRESS: &str = "F_255";

/// WebMI HTTP/JSON polling client.
///
/// One batched POST per poll cycle carries every requested address as a
/// repeated `address[]` form field; the device answers with a positionally
/// aligned result array. Whole-request transport failures and non-2xx
/// statuses are retried with bounded exponential backoff; a malformed body
/// is not, and a device-reported per-item error code never fails the call.
pub struct WebMiClient {
    http: reqwest::Client,
    config: ProtocolConfig,
}

/// Batched-read response envelope.
#[derive(Debug, Deserialize)]
struct WebMiResponse {
    #[serde(default)]
    result: Vec<WebMiResult>,
    #[serde(default)]
    error: i32,
}

/// One entry of the positionally ordered result array.
#[derive(Debug, Deserialize)]
struct WebMiResult {
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    error: i32,
    #[serde(default)]
    status: i32,
    #[serde(default)]
    timestamp: i64,
}

impl WebMiResult {
    fn has_error(&self) -> bool {
        self.error != 0
    }

    fn error_description(&self) -> String {
        match self.error {
            0 => "OK".to_owned(),
            1 => "invalid address".to_owned(),
            2 => "device not found".to_owned(),
            3 => "communication error".to_owned(),
            4 => "timeout".to_owned(),
            other => format!("unknown error {other}"),
        }
    }
}

impl WebMiClient {
    /// Build a client with the configured hard per-request timeout.
    pub fn new(config: ProtocolConfig) -> Result<Self, ProtocolError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ProtocolError::Transport(err.to_string()))?;
        Ok(Self { http, config })
    }

    async fn send_once(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<reqwest::Response, ProtocolError> {
        let response = self
            .http
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(|err| ProtocolError::from_reqwest(err, self.config.request_timeout()))?;
        if !response.status().is_success() {
            return Err(ProtocolError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    async fn read_with_retry(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<WebMiResponse, ProtocolError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(endpoint, params).await {
                Ok(response) => {
                    return response
                        .json::<WebMiResponse>()
                        .await
                        .map_err(|err| ProtocolError::Malformed(err.to_string()));
                }
                Err(err) if attempt < self.config.retry_attempts => {
                    let delay = self.config.retry_backoff_base() * 2u32.pow(attempt - 1);
                    warn!(
                        endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "webmi request failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for WebMiClient {
    async fn read(
        &self,
        device: &Device,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<f64>>, ProtocolError> {
        if addresses.is_empty() {
            warn!(device_id = device.device_id, "no addresses provided for webmi read");
            return Ok(HashMap::new());
        }

        let endpoint = device.webmi_endpoint();
        let params: Vec<(&str, &str)> = addresses
            .iter()
            .map(|address| ("address[]", address.as_str()))
            .collect();

        debug!(
            device_id = device.device_id,
            endpoint = %endpoint,
            count = addresses.len(),
            "reading webmi addresses"
        );
        let response = self.read_with_retry(&endpoint, &params).await?;
        if response.error != 0 {
            warn!(
                device_id = device.device_id,
                code = response.error,
                "webmi endpoint reported a request-level error code"
            );
        }

        // Results align to the request's address order, not by key.
        let mut values = HashMap::with_capacity(addresses.len());
        for (address, item) in addresses.iter().zip(response.result.iter()) {
            if item.has_error() {
                warn!(
                    device_id = device.device_id,
                    address = %address,
                    error = %item.error_description(),
                    "webmi address error"
                );
                values.insert(address.clone(), None);
            } else {
                trace!(
                    device_id = device.device_id,
                    address = %address,
                    value = ?item.value,
                    status = item.status,
                    device_ts = item.timestamp,
                    "webmi address read"
                );
                values.insert(address.clone(), item.value);
            }
        }
        // A short result array leaves trailing addresses absent.
        for address in addresses.iter().skip(response.result.len()) {
            values.insert(address.clone(), None);
        }

        debug!(
            device_id = device.device_id,
            ok = values.values().filter(|v| v.is_some()).count(),
            total = addresses.len(),
            "webmi read complete"
        );
        Ok(values)
    }

    async fn test_connectivity(&self, device: &Device) -> bool {
        match self.read(device, &[PROBE_ADDRESS.to_owned()]).await {
            Ok(values) => values.values().any(|value| value.is_some()),
            Err(err) => {
                debug!(device_id = device.device_id, error = %err, "webmi connectivity test failed");
                false
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WebMi
    }
}
