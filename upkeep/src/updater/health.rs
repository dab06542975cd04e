use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("could not reach health endpoint; {0}")]
    Unreachable(String),

    #[error("health endpoint responded with status {0}")]
    Status(u16),

    #[error("could not decode health response; {0}")]
    Decode(String),
}

/// What the running application reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Version the application is serving.
    pub version: String,

    /// "ok" when the application can reach its database.
    pub database: String,
}

impl HealthStatus {
    pub fn database_connected(&self) -> bool {
        self.database.eq_ignore_ascii_case("ok")
    }
}

#[async_trait]
pub trait HealthProbe: Debug + Send + Sync + 'static {
    async fn status(&self) -> Result<HealthStatus, HealthError>;
}

/// Asks the application's health endpoint for its running version and database state.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn status(&self) -> Result<HealthStatus, HealthError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HealthError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HealthError::Status(status.as_u16()));
        }

        response
            .json::<HealthStatus>()
            .await
            .map_err(|e| HealthError::Decode(e.to_string()))
    }
}
