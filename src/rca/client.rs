//! LLM collaborator client.
//!
//! HTTP POST of the evidence payload with a per-request timeout and a
//! bounded retry budget. Retries apply to transport failures and 5xx
//! replies only; a 4xx reply is fatal for the incident, and a reply that
//! fails schema validation is rejected without retrying.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RcaConfig;
use crate::incident::RcaReport;
use crate::rank::RankOutcome;

use super::evidence::{self, EvidencePayload};

/// Jitter applied to each backoff sleep, in milliseconds.
const BACKOFF_JITTER_MS: i64 = 500;

/// Errors from the collaborator exchange.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("no endpoint configured")]
    NotConfigured,

    #[error("request timed out")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("endpoint returned status {status}")]
    Status { status: u16 },

    #[error("reply failed schema validation: {0}")]
    Schema(String),
}

impl LlmError {
    /// Whether the retry budget applies to this failure.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status } => *status >= 500,
            Self::NotConfigured | Self::Schema(_) => false,
        }
    }

    /// Short reason tag used in `<unavailable: ...>` summaries.
    pub fn reason(&self) -> String {
        match self {
            Self::NotConfigured => "no endpoint configured".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::Transport(_) => "transport error".to_string(),
            Self::Status { status } => format!("status {status}"),
            Self::Schema(_) => "schema".to_string(),
        }
    }
}

/// The RCA analysis backend seam; the worker is generic over it.
pub trait RcaBackend: Send + Sync {
    /// Analyze one incident's evidence. `incident_id` doubles as the
    /// idempotency key so retries are safe.
    fn analyze(
        &self,
        payload: &EvidencePayload,
        outcome: &RankOutcome,
        incident_id: u64,
    ) -> impl std::future::Future<Output = Result<RcaReport, LlmError>> + Send;
}

/// HTTP-based collaborator client.
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    retries: u32,
    backoff_base: Duration,
}

impl HttpLlmClient {
    pub fn new(cfg: &RcaConfig) -> anyhow::Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(20)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building HTTP client: {e}"))?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            retries: cfg.retries,
            backoff_base: cfg.backoff_base,
        })
    }

    /// One POST attempt, classified into [`LlmError`] kinds.
    async fn attempt(
        &self,
        payload: &EvidencePayload,
        incident_id: u64,
    ) -> Result<serde_json::Value, LlmError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Idempotency-Key", incident_id.to_string())
            .json(payload)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(classify_reqwest)
    }

    /// Backoff before retry `attempt` (1-based): base · 2^(attempt−1)
    /// plus ±500 ms jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.backoff_base.as_millis() as i64;
        let exp_ms = base_ms.saturating_mul(1 << (attempt - 1).min(16));
        let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_MS..=BACKOFF_JITTER_MS);
        Duration::from_millis(exp_ms.saturating_add(jitter).max(0) as u64)
    }
}

fn classify_reqwest(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Transport(e.to_string())
    }
}

impl RcaBackend for HttpLlmClient {
    async fn analyze(
        &self,
        payload: &EvidencePayload,
        outcome: &RankOutcome,
        incident_id: u64,
    ) -> Result<RcaReport, LlmError> {
        if self.endpoint.is_empty() {
            return Err(LlmError::NotConfigured);
        }

        let mut last_err = LlmError::NotConfigured;

        for attempt in 1..=self.retries + 1 {
            debug!(incident_id, attempt, "rca analysis request");

            match self.attempt(payload, incident_id).await {
                Ok(raw) => {
                    return evidence::validate_reply(raw, payload, outcome, Utc::now())
                        .map_err(LlmError::Schema);
                }
                Err(e) => {
                    if !e.retryable() || attempt == self.retries + 1 {
                        return Err(e);
                    }
                    let pause = self.backoff(attempt);
                    warn!(
                        incident_id,
                        attempt,
                        error = %e,
                        pause_ms = pause.as_millis() as u64,
                        "rca request failed, backing off",
                    );
                    last_err = e;
                    tokio::time::sleep(pause).await;
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Timeout.retryable());
        assert!(LlmError::Transport("reset".to_string()).retryable());
        assert!(LlmError::Status { status: 500 }.retryable());
        assert!(LlmError::Status { status: 503 }.retryable());

        assert!(!LlmError::Status { status: 400 }.retryable());
        assert!(!LlmError::Status { status: 404 }.retryable());
        assert!(!LlmError::Schema("bad".to_string()).retryable());
        assert!(!LlmError::NotConfigured.retryable());
    }

    #[test]
    fn test_reason_tags() {
        assert_eq!(LlmError::Timeout.reason(), "timeout");
        assert_eq!(LlmError::Status { status: 503 }.reason(), "status 503");
        assert_eq!(LlmError::Schema("x".to_string()).reason(), "schema");
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let client = HttpLlmClient::new(&crate::config::RcaConfig {
            endpoint: "http://localhost:1/analyze".to_string(),
            ..Default::default()
        })
        .expect("client");

        // Base 2 s: first retry sleeps ~2 s, second ~4 s, within jitter.
        let b1 = client.backoff(1).as_millis() as i64;
        let b2 = client.backoff(2).as_millis() as i64;
        assert!((b1 - 2000).abs() <= BACKOFF_JITTER_MS + 1);
        assert!((b2 - 4000).abs() <= BACKOFF_JITTER_MS + 1);
    }
}
