//! HTTP mediator: delivers one message to its downstream endpoint and
//! classifies the response.
//!
//! The mediator never fails out: every fault, including an open circuit
//! breaker, reduces to a [`MediationOutcome`] that the pool turns into an
//! ack or nack. Transient faults are retried here with exponential backoff;
//! deterministic outcomes (2xx, 4xx, deferrals) return immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use courier_core::{MediationOutcome, MediationResult, QueueMessage, WarningCategory, WarningSeverity};

use crate::breaker::BreakerRegistry;
use crate::warning::WarningService;

pub const HEADER_MESSAGE_ID: &str = "X-Message-Id";
pub const HEADER_BROKER_MESSAGE_ID: &str = "X-Broker-Message-Id";
pub const HEADER_POOL_CODE: &str = "X-Pool-Code";

/// Trait for message mediation. The routing engine only ever sees this.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn process(&self, message: &QueueMessage) -> MediationOutcome;
}

/// Downstream response body. Anything unparseable counts as a plain ack.
#[derive(Debug, Deserialize)]
struct MediationResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub connect_timeout: Duration,
    pub headers_timeout: Duration,
    pub body_timeout: Duration,
    /// Retries after the first attempt; 0 means a single attempt.
    pub retries: u32,
    pub retry_delay: Duration,
    pub http2: bool,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            headers_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(300),
            retries: 2,
            retry_delay: Duration::from_secs(1),
            http2: false,
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: Arc<BreakerRegistry>,
    warnings: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig, breakers: Arc<BreakerRegistry>) -> Self {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10);

        if !config.http2 {
            builder = builder.http1_only();
        }
        // With http2 enabled, ALPN negotiates the version over TLS.

        let client = builder.build().expect("reqwest client construction cannot fail");

        info!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            headers_timeout_ms = config.headers_timeout.as_millis() as u64,
            body_timeout_ms = config.body_timeout.as_millis() as u64,
            retries = config.retries,
            http2 = config.http2,
            "HttpMediator initialized"
        );

        Self {
            client,
            config,
            breakers,
            warnings: None,
        }
    }

    pub fn with_warning_service(mut self, warnings: Arc<WarningService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    fn warn_config(&self, message: &QueueMessage, status_code: u16) {
        if let Some(ref warnings) = self.warnings {
            warnings.add_warning(
                WarningCategory::Configuration,
                WarningSeverity::Error,
                format!(
                    "HTTP {status_code} for message {} at {}",
                    message.message_id, message.pointer.callback_url
                ),
                "HttpMediator",
            );
        }
    }

    async fn attempt(&self, message: &QueueMessage) -> MediationOutcome {
        let request = self
            .client
            .post(&message.pointer.callback_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header(HEADER_MESSAGE_ID, &message.message_id)
            .header(HEADER_BROKER_MESSAGE_ID, &message.broker_message_id)
            .header(HEADER_POOL_CODE, &message.pointer.pool_code)
            .timeout(self.config.headers_timeout + self.config.body_timeout)
            .json(&message.pointer.payload);

        let request = match &message.pointer.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(
                    message_id = %message.message_id,
                    target = %message.pointer.callback_url,
                    error = %e,
                    "Mediation timed out"
                );
                return MediationOutcome::error_process(None, format!("timeout: {e}"));
            }
            Err(e) if e.is_connect() => {
                warn!(
                    message_id = %message.message_id,
                    target = %message.pointer.callback_url,
                    error = %e,
                    "Mediation connection failed"
                );
                return MediationOutcome::error_connection(format!("connect: {e}"));
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    target = %message.pointer.callback_url,
                    error = %e,
                    "Mediation request failed"
                );
                return MediationOutcome::error_connection(format!("request: {e}"));
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            // Body read faults on a 2xx are treated as a plain ack.
            let body = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<MediationResponse>(&body) {
                if !parsed.ack {
                    let delay = parsed.delay_seconds.unwrap_or(30);
                    debug!(
                        message_id = %message.message_id,
                        delay_seconds = delay,
                        "Downstream deferred the message"
                    );
                    return MediationOutcome::deferred(delay, parsed.message);
                }
            }
            debug!(message_id = %message.message_id, status_code, "Message delivered");
            return MediationOutcome::success(status_code);
        }

        if status.is_client_error() {
            warn!(
                message_id = %message.message_id,
                status_code,
                "Permanent protocol error from downstream"
            );
            self.warn_config(message, status_code);
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            return MediationOutcome::error_config(status_code, snippet);
        }

        if status.is_server_error() {
            warn!(
                message_id = %message.message_id,
                status_code,
                "Server error from downstream, will retry"
            );
            return MediationOutcome::error_process(
                Some(status_code),
                format!("HTTP {status_code}"),
            );
        }

        warn!(message_id = %message.message_id, status_code, "Unexpected status from downstream");
        MediationOutcome::error_process(Some(status_code), format!("HTTP {status_code}"))
    }

    fn is_retriable(outcome: &MediationOutcome) -> bool {
        matches!(
            outcome.result,
            MediationResult::ErrorProcess | MediationResult::ErrorConnection
        )
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn process(&self, message: &QueueMessage) -> MediationOutcome {
        let target = message.pointer.callback_url.as_str();

        if !self.breakers.allow_request(target) {
            debug!(
                message_id = %message.message_id,
                target = %target,
                "Circuit open, rejecting without I/O"
            );
            return MediationOutcome::circuit_open(target);
        }

        let mut outcome = self.attempt(message).await;
        self.report_to_breaker(target, &outcome);

        for attempt in 1..=self.config.retries {
            if !Self::is_retriable(&outcome) {
                return outcome;
            }

            let backoff = self.config.retry_delay * 2u32.pow(attempt - 1);
            debug!(
                message_id = %message.message_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying mediation"
            );
            tokio::time::sleep(backoff).await;

            outcome = self.attempt(message).await;
            self.report_to_breaker(target, &outcome);
        }

        outcome
    }
}

impl HttpMediator {
    fn report_to_breaker(&self, target: &str, outcome: &MediationOutcome) {
        // Deterministic outcomes count as contact with a live downstream;
        // only infrastructure faults feed the breaker.
        match outcome.result {
            MediationResult::Success
            | MediationResult::Deferred
            | MediationResult::ErrorConfig => self.breakers.record_success(target),
            MediationResult::ErrorProcess | MediationResult::ErrorConnection => {
                self.breakers.record_failure(target)
            }
        }
    }
}
