//! HTTP readiness probing

use std::time::Duration;

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Poll interval used when a health check is configured with zero
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An HTTP(S) endpoint that answers 200 once the process is ready
#[derive(Clone, Debug)]
pub struct HealthCheck {
    /// Full URL of the health endpoint
    pub url: Url,
    /// Delay between probes; zero means [`DEFAULT_POLL_INTERVAL`]
    pub poll_interval: Duration,
}

impl HealthCheck {
    /// Create a health check with the default poll interval
    pub fn new(url: Url) -> Self {
        Self {
            url,
            poll_interval: Duration::ZERO,
        }
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The interval actually used between probes
    pub fn effective_poll_interval(&self) -> Duration {
        if self.poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            self.poll_interval
        }
    }

    /// Probe until the endpoint answers 200 OK
    ///
    /// Returns `true` on success and `false` if `stop` fired first. Transport
    /// errors and non-200 answers are retried. Server certificates are not
    /// verified: the endpoints are local and serve self-signed certificates.
    pub async fn wait_ready(&self, stop: &CancellationToken) -> bool {
        let client = match reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "failed to build health check client");
                return false;
            }
        };
        let interval = self.effective_poll_interval();

        loop {
            let probe = client.get(self.url.clone()).send();
            tokio::select! {
                _ = stop.cancelled() => return false,
                res = probe => match res {
                    Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                        debug!(url = %self.url, "health check passed");
                        return true;
                    }
                    Ok(resp) => trace!(url = %self.url, status = %resp.status(), "health check not ready"),
                    Err(e) => trace!(url = %self.url, error = %e, "health check failed"),
                },
            }

            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_falls_back_to_default() {
        let check = HealthCheck::new(Url::parse("http://127.0.0.1:1/healthz").unwrap());
        assert_eq!(check.effective_poll_interval(), DEFAULT_POLL_INTERVAL);

        let check = check.with_poll_interval(Duration::from_secs(2));
        assert_eq!(check.effective_poll_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancelled_probe_returns_false() {
        let check = HealthCheck::new(Url::parse("http://127.0.0.1:1/healthz").unwrap());
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!check.wait_ready(&stop).await);
    }
}
