//! HTTP implementation of the timer service client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::telemetry::health::CommMonitor;

use super::{TimerError, TimerRequest, TimerService};

/// Timer service client over HTTP.
pub struct HttpTimerService {
    http: reqwest::Client,
    base_url: String,
    callback_host: String,
    monitor: Arc<CommMonitor>,
}

impl HttpTimerService {
    pub fn new(
        base_url: impl Into<String>,
        callback_host: impl Into<String>,
        request_timeout: Duration,
        monitor: Arc<CommMonitor>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            callback_host: callback_host.into(),
            monitor,
        }
    }

    fn body(&self, request: &TimerRequest) -> serde_json::Value {
        let tag_info: Vec<serde_json::Value> = request
            .tags
            .iter()
            .map(|(tag, count)| json!({ "type": tag, "count": count }))
            .collect();

        json!({
            "timing": {
                "interval": request.interval,
                "repeat-for": request.repeat_for,
            },
            "callback": {
                "http": {
                    "uri": format!("http://{}{}", self.callback_host, request.callback_path),
                    "opaque": request.opaque,
                }
            },
            "statistics": { "tag-info": tag_info },
        })
    }

    /// Pull the timer id out of a Location-style header.
    fn id_from_response(response: &reqwest::Response) -> Option<String> {
        let location = response.headers().get("location")?.to_str().ok()?;
        let id = location.rsplit('/').next()?;
        if id.is_empty() {
            return None;
        }
        Some(id.to_string())
    }

    fn track<T>(&self, result: Result<T, TimerError>) -> Result<T, TimerError> {
        match &result {
            Ok(_) => self.monitor.success(),
            Err(_) => self.monitor.failure(),
        }
        result
    }
}

#[async_trait]
impl TimerService for HttpTimerService {
    async fn create(&self, request: &TimerRequest) -> Result<String, TimerError> {
        let url = format!("{}/timers", self.base_url);
        debug!(url = %url, interval = request.interval, "creating timer");

        let result = async {
            let response = self
                .http
                .post(&url)
                .json(&self.body(request))
                .send()
                .await
                .map_err(|e| TimerError::Unreachable(e.to_string()))?;

            if !response.status().is_success() {
                warn!(status = %response.status(), "timer create failed");
                return Err(TimerError::Status(response.status().as_u16()));
            }

            Self::id_from_response(&response).ok_or(TimerError::MissingId)
        }
        .await;

        self.track(result)
    }

    async fn refresh(&self, timer_id: &str, request: &TimerRequest) -> Result<String, TimerError> {
        let url = format!("{}/timers/{}", self.base_url, timer_id);
        debug!(url = %url, interval = request.interval, "refreshing timer");

        let result = async {
            let response = self
                .http
                .put(&url)
                .json(&self.body(request))
                .send()
                .await
                .map_err(|e| TimerError::Unreachable(e.to_string()))?;

            if !response.status().is_success() {
                warn!(status = %response.status(), timer_id, "timer refresh failed");
                return Err(TimerError::Status(response.status().as_u16()));
            }

            // A replacement id arrives when the original timer no longer
            // exists on the service.
            Ok(Self::id_from_response(&response).unwrap_or_else(|| timer_id.to_string()))
        }
        .await;

        self.track(result)
    }

    async fn cancel(&self, timer_id: &str) -> Result<(), TimerError> {
        let url = format!("{}/timers/{}", self.base_url, timer_id);
        debug!(url = %url, "cancelling timer");

        let result = async {
            let response = self
                .http
                .delete(&url)
                .send()
                .await
                .map_err(|e| TimerError::Unreachable(e.to_string()))?;

            // A timer the service has already forgotten is gone either way.
            if !response.status().is_success() && response.status().as_u16() != 404 {
                warn!(status = %response.status(), timer_id, "timer cancel failed");
                return Err(TimerError::Status(response.status().as_u16()));
            }

            Ok(())
        }
        .await;

        self.track(result)
    }
}
