use std::time::Duration;

use agentrun_core::batch::StatsSink;
use agentrun_core::config::StatsConfig;
use agentrun_core::errors::StatsError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchStatsPayload {
    runs_completed: u32,
}

/// Posts aggregate batch statistics as JSON.
pub struct HttpStatsSink {
    client: Client,
    endpoint: String,
}

impl HttpStatsSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, StatsError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| StatsError::Request(format!("could not build http client: {error}")))?;
        Ok(Self { client, endpoint: endpoint.into() })
    }

    pub fn from_config(config: &StatsConfig) -> Result<Self, StatsError> {
        let endpoint = config.endpoint.clone().ok_or(StatsError::NotConfigured)?;
        Self::new(endpoint, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl StatsSink for HttpStatsSink {
    async fn record_batch(&self, runs_completed: u32) -> Result<(), StatsError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&BatchStatsPayload { runs_completed })
            .send()
            .await
            .map_err(|error| StatsError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StatsError::Request(format!("endpoint responded with {status}")));
        }

        debug!(event_name = "agent.stats.recorded", runs_completed, "batch statistics recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use agentrun_core::config::StatsConfig;
    use agentrun_core::errors::StatsError;

    use super::{BatchStatsPayload, HttpStatsSink};

    #[test]
    fn payload_uses_camel_case_field() {
        let payload = serde_json::to_value(BatchStatsPayload { runs_completed: 4 }).expect("json");

        assert_eq!(payload, serde_json::json!({"runsCompleted": 4}));
    }

    #[test]
    fn missing_endpoint_is_not_configured() {
        let config = StatsConfig { endpoint: None, timeout_secs: 5 };

        assert!(matches!(HttpStatsSink::from_config(&config), Err(StatsError::NotConfigured)));
    }
}
