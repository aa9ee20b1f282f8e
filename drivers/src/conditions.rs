//! Environmental conditions source
//!
//! The parsing of weather-station, radar, and satellite data into a
//! go/no-go verdict lives behind [`ConditionsSource`]; the
//! orchestration layer only ever sees the boolean alert.

use crate::DriverResult;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Source of the environmental go/no-go verdict.
#[async_trait]
pub trait ConditionsSource: Send + Sync {
    /// True when conditions are too poor for the shutter to stay open
    /// (humidity, wind, rain, nearby radar returns, cloud cover).
    async fn is_alert_active(&self) -> DriverResult<bool>;
}

/// Response envelope used by Alpaca-style safety monitor endpoints.
#[derive(Debug, Deserialize)]
struct SafetyResponse {
    #[serde(rename = "Value")]
    value: bool,
    #[serde(rename = "ErrorMessage", default)]
    error_message: String,
}

/// Network safety monitor speaking an Alpaca-style REST surface.
///
/// `GET {base_url}/issafe` returning `{"Value": bool}`. A transport
/// or decode failure is reported as an error, not as "safe".
pub struct HttpSafetyMonitor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSafetyMonitor {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn is_safe(&self) -> DriverResult<bool> {
        let url = format!("{}/issafe", self.base_url.trim_end_matches('/'));
        let resp: SafetyResponse = self.client.get(&url).send().await?.json().await?;
        if !resp.error_message.is_empty() {
            tracing::warn!("safety monitor reported: {}", resp.error_message);
        }
        Ok(resp.value)
    }
}

#[async_trait]
impl ConditionsSource for HttpSafetyMonitor {
    async fn is_alert_active(&self) -> DriverResult<bool> {
        self.is_safe().await.map(|safe| !safe)
    }
}
