use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const RENEW_FAILURE_BUDGET: u32 = 3;

/* ============================= ELECTOR ============================= */

/// Lease-based leader election on `coordination.k8s.io/v1`.
///
/// Only the holder runs pipelines; secondaries park on the lease and take
/// over when it expires. Losing the lease after repeated renewal failures
/// cancels the handed-out token so the process can step down cleanly.
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str) -> Self {
        let identity = format!(
            "{}-{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "kube-rbac-watch".to_string()),
            std::process::id()
        );
        LeaderElector {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity,
        }
    }

    /// Block until leadership is acquired, then keep renewing in the
    /// background. The returned token is cancelled if leadership is lost.
    pub async fn acquire(self, cancel: CancellationToken) -> Result<CancellationToken> {
        loop {
            if cancel.is_cancelled() {
                anyhow::bail!("shutdown requested before leadership was acquired");
            }
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!(lease = %self.lease_name, "lease_held_by_another_instance");
                }
                Err(e) => warn!(lease = %self.lease_name, error = %e, "lease_acquire_failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    anyhow::bail!("shutdown requested before leadership was acquired")
                }
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }

        info!(lease = %self.lease_name, identity = %self.identity, "leadership_acquired");

        let lost = CancellationToken::new();
        let renew_lost = lost.clone();
        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RENEW_INTERVAL) => {}
                }
                match self.try_acquire().await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        warn!(lease = %self.lease_name, "leadership_taken_by_another_instance");
                        renew_lost.cancel();
                        return;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(lease = %self.lease_name, error = %e, failures, "lease_renew_failed");
                        if failures >= RENEW_FAILURE_BUDGET {
                            renew_lost.cancel();
                            return;
                        }
                    }
                }
            }
        });

        Ok(lost)
    }

    /// One acquire-or-renew attempt. Returns false when another live
    /// holder owns the lease.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());

        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        let expired = lease_expired(&spec, Utc::now());
        if !held_by_us && !expired {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(!held_by_us);
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: if held_by_us { spec.acquire_time } else { Some(now.clone()) },
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        });

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// A lease without a renew time counts as expired.
fn lease_expired(spec: &LeaseSpec, now: chrono::DateTime<Utc>) -> bool {
    let Some(renew_time) = &spec.renew_time else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .unwrap_or(LEASE_DURATION.as_secs() as i32);
    now - renew_time.0 > chrono::Duration::seconds(i64::from(duration))
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_seconds_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_seconds_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_lease_is_not_expired() {
        assert!(!lease_expired(&spec(1, 15), Utc::now()));
    }

    #[test]
    fn test_stale_lease_is_expired() {
        assert!(lease_expired(&spec(60, 15), Utc::now()));
    }

    #[test]
    fn test_lease_without_renew_time_is_expired() {
        assert!(lease_expired(&LeaseSpec::default(), Utc::now()));
    }

    #[test]
    fn test_lease_at_exact_boundary_is_not_expired() {
        let s = spec(15, 15);
        // Within a second of the boundary either way; the check is strict
        // "greater than", so exactly-at-duration still counts as held.
        assert!(!lease_expired(&s, s.renew_time.clone().unwrap().0 + chrono::Duration::seconds(15)));
    }
}
