//! Assignment delivery to load balancer agents
//!
//! Every target gets the full assignment map in its own request, all
//! requests run concurrently and each one is bounded by the target's
//! timeout. A failing target never affects the others and failures are
//! only logged: there is no retry, the next cycle sends a fresh map anyway.

use std::time::Duration;

use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::assignment::AssignmentMap;
use crate::stream::{Disposition, ReconcileResult};

/// Content type used for assignment delivery
pub const ASSIGNMENT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Default per-target delivery timeout in seconds
pub const DEFAULT_TARGET_TIMEOUT_SECS: u64 = 10;

/// A downstream load balancer agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerTarget {
    pub url: String,
    pub timeout: Duration,
}

impl LoadBalancerTarget {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Errors delivering to a single target
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to encode assignments: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[source] reqwest::Error),

    #[error("Load balancer returned {status}: {message}")]
    ServerError { status: u16, message: String },
}

/// Successful delivery to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub status: u16,
    /// Number of per-service results the agent reported, if readable
    pub results: Option<usize>,
}

/// What happened to one target during a publish
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub url: String,
    pub result: Result<Delivered, PublishError>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fans the assignment map out to every configured target
#[derive(Clone)]
pub struct AssignmentPublisher {
    http_client: Client,
}

impl AssignmentPublisher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .user_agent(concat!("flipbit/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http_client))
    }

    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }

    /// Deliver `assignments` to every target concurrently.
    ///
    /// Returns once every request has finished or hit its own timeout. The
    /// outcomes are for observability only; nothing here is an error for
    /// the caller.
    pub async fn publish(
        &self,
        assignments: &AssignmentMap,
        targets: &[LoadBalancerTarget],
    ) -> Vec<DeliveryOutcome> {
        let deliveries = targets.iter().map(|target| async move {
            let result = self.deliver(assignments, target).await;
            match &result {
                Ok(delivered) => debug!(
                    target = %target.url,
                    status = delivered.status,
                    results = ?delivered.results,
                    "Delivered assignments"
                ),
                Err(e) => warn!(target = %target.url, error = %e, "Failed to deliver assignments"),
            }
            DeliveryOutcome {
                url: target.url.clone(),
                result,
            }
        });

        let outcomes = join_all(deliveries).await;
        let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
        info!(
            delivered,
            failed = outcomes.len() - delivered,
            services = assignments.len(),
            "Published assignments"
        );
        outcomes
    }

    async fn deliver(
        &self,
        assignments: &AssignmentMap,
        target: &LoadBalancerTarget,
    ) -> Result<Delivered, PublishError> {
        let body = serde_json::to_vec(assignments)?;

        let response = self
            .http_client
            .post(&target.url)
            .header(CONTENT_TYPE, ASSIGNMENT_CONTENT_TYPE)
            .timeout(target.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| request_error(e, target.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PublishError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        let results = match response.json::<Vec<ReconcileResult>>().await {
            Ok(results) => {
                report_rejections(&target.url, &results);
                Some(results.len())
            }
            Err(e) if e.is_timeout() => return Err(PublishError::Timeout(target.timeout)),
            Err(e) => {
                debug!(target = %target.url, error = %e, "Unreadable reconciliation report");
                None
            }
        };

        Ok(Delivered {
            status: status.as_u16(),
            results,
        })
    }
}

fn request_error(error: reqwest::Error, timeout: Duration) -> PublishError {
    if error.is_timeout() {
        PublishError::Timeout(timeout)
    } else {
        PublishError::RequestFailed(error)
    }
}

fn report_rejections(url: &str, results: &[ReconcileResult]) {
    for result in results {
        match result.status {
            Disposition::CannotAssign => warn!(
                target = %url,
                service = %result.service,
                "Load balancer has no free address for service"
            ),
            Disposition::Failed => warn!(
                target = %url,
                service = %result.service,
                error = ?result.error,
                "Load balancer failed to apply service"
            ),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_timeout() {
        let target = LoadBalancerTarget::new("http://lb:8080/update", 10);
        assert_eq!(target.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_publish_without_targets() {
        let publisher = AssignmentPublisher::new().unwrap();
        let outcomes = publisher.publish(&AssignmentMap::new(), &[]).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_reported_not_raised() {
        let publisher = AssignmentPublisher::new().unwrap();
        // Port 9 on localhost is discard; nothing listens there in CI.
        let targets = vec![LoadBalancerTarget::new("http://127.0.0.1:9/update", 1)];

        let outcomes = publisher.publish(&AssignmentMap::new(), &targets).await;

        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_delivered());
    }
}
