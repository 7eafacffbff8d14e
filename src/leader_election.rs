//! Leader election over the coordination.k8s.io Lease API.
//!
//! Deployments of this controller may run several replicas, but only one of
//! them is allowed to drain the work queues at a time: the one holding the
//! `<controller-name>-lock` Lease in the system namespace.  Everyone else
//! parks in [`LeaderElector::acquire`] as a hot standby.
//!
//! The timing is deliberately asymmetric — a 30s lease renewed every 10s —
//! so a deposed leader notices the loss and stops reconciling well before a
//! standby can take over the expired lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::helpers::FIELD_MANAGER;
use crate::error::Result;

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Lease name for a controller: `<controller-name>-lock`.
pub fn lease_name(controller_name: &str) -> String {
    format!("{controller_name}-lock")
}

// ── Elector ───────────────────────────────────────────────────────────────────

/// Competes for the controller lock and keeps it renewed once won.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Park until this replica holds the lock, then return a [`LeaderGuard`]
    /// that renews it in the background.  API errors are retried in place —
    /// a standby that cannot reach the apiserver just keeps waiting.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard> {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for controller lock");

        loop {
            match self.try_claim().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired controller lock");
                    return Ok(self.spawn_guard());
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "lock held elsewhere, standing by");
                }
                Err(e) => {
                    warn!(identity = %self.identity, %e, "lock check failed, retrying");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn spawn_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renew_until_lost(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One claim attempt. Creates the Lease if absent, renews it if we
    /// already hold it, takes it over if the holder let it expire.
    async fn try_claim(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let lease = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return self.create(&api, now).await,
            Err(e) => return Err(e.into()),
        };

        let spec = lease.spec.as_ref();
        if spec.and_then(|s| s.holder_identity.as_ref()) == Some(&self.identity) {
            return self.renew(&api, now).await;
        }

        // Someone else holds it; only an expired lease is up for grabs.
        let expired = match (
            spec.and_then(|s| s.renew_time.as_ref()),
            spec.and_then(|s| s.lease_duration_seconds),
        ) {
            (Some(renewed), Some(duration)) => {
                now > renewed.0 + chrono::Duration::seconds(duration as i64)
            }
            // A lease without renewal bookkeeping counts as abandoned.
            _ => true,
        };
        if !expired {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        self.take_over(&api, now, transitions).await
    }

    async fn create(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Another replica created it first; back to standby.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool> {
        let patch = json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(now),
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        debug!(identity = %self.identity, "renewed controller lock");
        Ok(true)
    }

    async fn take_over(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool> {
        let patch = json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "took over expired controller lock"
                );
                Ok(true)
            }
            // Raced another standby for the expired lease and lost.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keeps the lock fresh; signals `lost_tx` the first time a renewal
    /// fails or finds the lock in someone else's hands.
    async fn renew_until_lost(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_claim().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "controller lock lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }
}

// ── Guard ─────────────────────────────────────────────────────────────────────

/// Held by the leading replica. Renewal runs in a background task for as
/// long as the guard lives; `lost()` resolves if the lock slips away.
/// Dropping the guard stops renewing, letting the lease expire for the next
/// standby.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "released controller lock");
    }
}
