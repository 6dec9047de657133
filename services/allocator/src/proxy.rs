//! Proxy endpoint discovery.
//!
//! The farm publishes an ADB and a Marionette proxy for every running
//! session, but only some time after the session starts. Until then the
//! discovery query answers with an empty list.

use std::sync::Arc;
use std::time::Duration;

use devlease_farm_api::{FarmApi, ProxyKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::error::ProxyError;

/// A published proxy for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyEndpoint {
    pub kind: ProxyKind,
    pub port: u16,
    /// Device serial as reported by the proxy; empty when not reported.
    pub host_identity: String,
    pub session_id: i64,
}

/// Polls for proxy entries.
#[derive(Clone)]
pub struct ProxyResolver {
    api: Arc<dyn FarmApi>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ProxyResolver {
    pub fn new(api: Arc<dyn FarmApi>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            api,
            timeout,
            poll_interval,
        }
    }

    /// Wait until a `kind` proxy is published for `session_id`.
    ///
    /// Waiting is measured as the sum of poll intervals slept. Once that sum
    /// reaches the timeout and the last query was still empty, discovery
    /// fails. The first entry of a non-empty answer wins.
    pub async fn resolve(
        &self,
        session_id: i64,
        kind: ProxyKind,
        cancel: &Cancellation,
    ) -> Result<ProxyEndpoint, ProxyError> {
        let mut waited = Duration::ZERO;

        loop {
            let entries = self
                .api
                .proxies(kind, session_id)
                .await
                .map_err(|source| ProxyError::Api { kind, source })?;

            if let Some(entry) = entries.into_iter().next() {
                let endpoint = ProxyEndpoint {
                    kind,
                    port: entry.port,
                    host_identity: entry.serial_id.unwrap_or_default(),
                    session_id,
                };
                info!(
                    session_id,
                    %kind,
                    port = endpoint.port,
                    serial = %endpoint.host_identity,
                    waited = ?waited,
                    "Proxy published"
                );
                return Ok(endpoint);
            }

            if waited >= self.timeout {
                return Err(ProxyError::Timeout {
                    kind,
                    session_id,
                    waited,
                });
            }

            debug!(session_id, %kind, waited = ?waited, "Proxy not published yet");
            cancel.sleep(self.poll_interval).await?;
            waited += self.poll_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use devlease_testing::{FakeFarm, ProxyPlan};
    use tokio::time::Instant;

    fn resolver(farm: &Arc<FakeFarm>) -> ProxyResolver {
        ProxyResolver::new(
            farm.clone(),
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_after_three_empty_polls() {
        let farm = FakeFarm::new();
        farm.set_proxy_plan(
            ProxyKind::Adb,
            ProxyPlan::After {
                empty_polls: 3,
                port: 15001,
            },
        );

        let start = Instant::now();
        let endpoint = resolver(&farm)
            .resolve(9, ProxyKind::Adb, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(endpoint.port, 15001);
        assert_eq!(endpoint.kind, ProxyKind::Adb);
        assert_eq!(endpoint.session_id, 9);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(farm.proxy_polls(ProxyKind::Adb), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let farm = FakeFarm::new();
        farm.set_proxy_plan(ProxyKind::Marionette, ProxyPlan::Never);

        let err = resolver(&farm)
            .resolve(9, ProxyKind::Marionette, &Cancellation::never())
            .await
            .unwrap_err();

        match err {
            ProxyError::Timeout { kind, waited, .. } => {
                assert_eq!(kind, ProxyKind::Marionette);
                assert_eq!(waited, Duration::from_secs(60));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(farm.proxy_polls(ProxyKind::Marionette), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failure() {
        let farm = FakeFarm::new();
        farm.set_proxy_plan(ProxyKind::Adb, ProxyPlan::Error);

        let err = resolver(&farm)
            .resolve(9, ProxyKind::Adb, &Cancellation::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Api { kind: ProxyKind::Adb, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_polling() {
        let farm = FakeFarm::new();
        farm.set_proxy_plan(ProxyKind::Adb, ProxyPlan::Never);
        let (handle, cancel) = cancellation();
        handle.cancel();

        let err = resolver(&farm)
            .resolve(9, ProxyKind::Adb, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled));
        assert_eq!(farm.proxy_polls(ProxyKind::Adb), 1);
    }
}
