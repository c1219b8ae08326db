use std::{fmt, sync::Arc, time::Duration};

use anyhow::anyhow;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

pub type Validator = Arc<dyn Fn(u16, &str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ProbeSpec {
    pub url: String,
    pub retries: u32,
    pub sleep: Duration,
    pub timeout: Duration,
    validator: Validator,
}

impl ProbeSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retries: 5,
            sleep: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            validator: status_is(200),
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(mut self, validator: impl Fn(u16, &str) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }
}

impl fmt::Debug for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSpec")
            .field("url", &self.url)
            .field("retries", &self.retries)
            .field("sleep", &self.sleep)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub fn status_is(code: u16) -> Validator {
    Arc::new(move |status, _body| status == code)
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{url} failed validation after {attempts} attempt(s); last: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },
}

/// GET `spec.url` until the validator accepts the response or the attempts run out.
pub async fn http_get_with_retry(spec: &ProbeSpec) -> Result<ProbeOutcome, ProbeError> {
    let mut last = String::from("no attempt made");
    for attempt in 1..=spec.retries {
        match get_once(&spec.url, spec.timeout).await {
            Ok((status, body)) => {
                if (spec.validator)(status, &body) {
                    info!(url = %spec.url, status, attempt, "probe passed");
                    return Ok(ProbeOutcome {
                        url: spec.url.clone(),
                        status,
                        body,
                        attempts: attempt,
                    });
                }
                last = format!("response with status {status} rejected");
            }
            Err(err) => last = format!("{err:#}"),
        }
        warn!(url = %spec.url, attempt, max = spec.retries, reason = %last, "probe attempt failed");
        if attempt < spec.retries {
            sleep(spec.sleep).await;
        }
    }
    Err(ProbeError::Exhausted {
        url: spec.url.clone(),
        attempts: spec.retries,
        last,
    })
}

async fn get_once(url: &str, timeout: Duration) -> anyhow::Result<(u16, String)> {
    let url = url.to_string();
    tokio::task::spawn_blocking(move || -> anyhow::Result<(u16, String)> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        let mut resp = agent
            .get(&url)
            .call()
            .map_err(|err| anyhow!("failed to GET {url}: {err}"))?;
        let status = resp.status().as_u16();
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|err| anyhow!("failed to read body from {url}: {err}"))?;
        Ok((status, body))
    })
    .await
    .map_err(|err| anyhow!("probe task join error: {err}"))?
}

/// Append `path` to a service endpoint; an empty or `/` path probes the endpoint itself.
pub fn join_endpoint(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{path}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_without_doubling_slashes() {
        assert_eq!(join_endpoint("http://lb", "/"), "http://lb");
        assert_eq!(join_endpoint("http://lb/", ""), "http://lb/");
        assert_eq!(
            join_endpoint("http://lb/", "/feature-flags"),
            "http://lb/feature-flags"
        );
        assert_eq!(join_endpoint("http://lb", "health"), "http://lb/health");
    }

    #[test]
    fn status_validator_ignores_body() {
        let check = status_is(204);
        assert!(check(204, "anything"));
        assert!(!check(200, ""));
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_attempts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let spec = ProbeSpec::new(format!("http://127.0.0.1:{port}/"))
            .retries(2)
            .sleep(Duration::ZERO)
            .timeout(Duration::from_secs(2));
        let err = http_get_with_retry(&spec).await.unwrap_err();
        let ProbeError::Exhausted { attempts, last, .. } = err;
        assert_eq!(attempts, 2);
        assert!(last.contains("failed to GET"), "unexpected reason: {last}");
    }
}
