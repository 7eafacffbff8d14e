//! Label-driven object-set apply.
//!
//! Every object the controller writes is stamped with a set-ID label (scoped
//! to this controller instance) and an applied-hash annotation carrying the
//! digest of its desired form.  Applying a set converges the cluster:
//! missing objects are created, objects whose applied-hash differs are
//! rewritten via server-side apply, and set members absent from the desired
//! set are deleted.  Applying an empty set therefore garbage-collects
//! everything the set owns.
//!
//! Jobs are the exception: their pod template is immutable, so a changed Job
//! is foreground-deleted and the apply fails with a "create or replace job"
//! error.  The requeued reconcile finds the Job gone and recreates it.

use std::collections::BTreeSet;
use std::fmt::Debug;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::controller::child_resources::DesiredSet;
use crate::controller::helpers::{controller_owner_ref, FIELD_MANAGER};
use crate::crd::HelmChart;
use crate::error::{Error, Result};
use crate::helpers::CHART_LABEL;

/// Label tying an object to one controller's logical set.
pub const SET_ID_LABEL: &str = "objectset.helm.cattle.io/id";
/// Digest of the object as last applied; unchanged digest means no write.
pub const APPLIED_HASH_ANNOTATION: &str = "objectset.helm.cattle.io/applied-hash";

/// The typed members of one HelmChart's apply set.
#[derive(Default)]
pub struct ObjectSet {
    pub jobs: Vec<Job>,
    pub secrets: Vec<Secret>,
    pub config_maps: Vec<ConfigMap>,
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
}

impl ObjectSet {
    /// An empty desired set: applying it prunes every set member.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<DesiredSet> for ObjectSet {
    fn from(desired: DesiredSet) -> Self {
        Self {
            jobs: vec![desired.job],
            secrets: vec![desired.values_secret],
            config_maps: vec![desired.content_config_map],
            service_accounts: vec![desired.service_account],
            cluster_role_bindings: vec![desired.cluster_role_binding],
        }
    }
}

#[derive(Clone)]
pub struct ObjectSetApply {
    client: Client,
    set_id: String,
}

impl ObjectSetApply {
    /// The set ID is prefixed with the controller name so that two
    /// controllers sharing a cluster never treat each other's sets as
    /// leftovers to prune.
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            set_id: format!("{controller_name}-chart-registration"),
        }
    }

    pub fn set_id(&self) -> &str {
        &self.set_id
    }

    /// Converge the chart's owned objects to `set`. Namespaced members get a
    /// controller owner reference; the ClusterRoleBinding is cluster-scoped
    /// and relies on the set labels alone.
    pub async fn apply(&self, chart: &HelmChart, mut set: ObjectSet) -> Result<()> {
        let namespace = chart.namespace().unwrap_or_default();
        let chart_name = chart.name_any();
        let selector = format!("{SET_ID_LABEL}={},{CHART_LABEL}={chart_name}", self.set_id);

        for secret in &mut set.secrets {
            self.prepare(secret, true, chart)?;
        }
        for cm in &mut set.config_maps {
            self.prepare(cm, true, chart)?;
        }
        for sa in &mut set.service_accounts {
            self.prepare(sa, true, chart)?;
        }
        for crb in &mut set.cluster_role_bindings {
            self.prepare(crb, false, chart)?;
        }
        for job in &mut set.jobs {
            self.prepare(job, true, chart)?;
        }

        // Data objects first so a freshly created Job never starts without
        // its mounts; the Job itself goes last.
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        self.sync(&secrets, &set.secrets, &selector).await?;

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        self.sync(&config_maps, &set.config_maps, &selector).await?;

        let service_accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &namespace);
        self.sync(&service_accounts, &set.service_accounts, &selector)
            .await?;

        self.sync_cluster_role_bindings(&namespace, &set.cluster_role_bindings, &selector)
            .await?;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        self.sync_jobs(&jobs, &set.jobs, &selector).await
    }

    /// Stamp set membership onto a desired object: set labels, the owner
    /// reference (namespaced kinds only), and the applied-hash annotation
    /// computed over everything but the annotation itself.
    fn prepare<K>(&self, obj: &mut K, owned: bool, chart: &HelmChart) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        obj.labels_mut()
            .insert(SET_ID_LABEL.to_string(), self.set_id.clone());
        if owned {
            obj.meta_mut()
                .owner_references
                .get_or_insert_with(Vec::new)
                .push(controller_owner_ref(chart));
        }
        let hash = applied_hash(obj)?;
        obj.annotations_mut()
            .insert(APPLIED_HASH_ANNOTATION.to_string(), hash);
        Ok(())
    }

    async fn sync<K>(&self, api: &Api<K>, desired: &[K], selector: &str) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    {
        let mut keep = BTreeSet::new();
        for obj in desired {
            let name = obj.name_any();
            keep.insert(name.clone());
            match api.get_opt(&name).await? {
                None => {
                    debug!(%name, "creating set member");
                    api.create(&PostParams::default(), obj).await?;
                }
                Some(live) if up_to_date(&live, obj) => {}
                Some(_) => {
                    debug!(%name, "updating set member");
                    api.patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(obj),
                    )
                    .await?;
                }
            }
        }

        for live in api.list(&ListParams::default().labels(selector)).await? {
            let name = live.name_any();
            if !keep.contains(&name) {
                debug!(%name, "pruning set member");
                ignore_not_found(api.delete(&name, &DeleteParams::default()).await)?;
            }
        }
        Ok(())
    }

    /// Jobs are never patched in place: a stale Job is foreground-deleted
    /// and the apply fails so the requeued reconcile recreates it.
    async fn sync_jobs(&self, api: &Api<Job>, desired: &[Job], selector: &str) -> Result<()> {
        let mut keep = BTreeSet::new();
        for job in desired {
            let name = job.name_any();
            keep.insert(name.clone());
            match api.get_opt(&name).await? {
                None => {
                    debug!(%name, "creating job");
                    api.create(&PostParams::default(), job).await?;
                }
                Some(live) if up_to_date(&live, job) => {}
                Some(_) => {
                    debug!(%name, "job changed, deleting for recreation");
                    ignore_not_found(api.delete(&name, &DeleteParams::foreground()).await)?;
                    return Err(Error::ReplaceJob(name));
                }
            }
        }

        for live in api.list(&ListParams::default().labels(selector)).await? {
            let name = live.name_any();
            if !keep.contains(&name) {
                debug!(%name, "pruning job");
                ignore_not_found(api.delete(&name, &DeleteParams::foreground()).await)?;
            }
        }
        Ok(())
    }

    /// ClusterRoleBindings are cluster-scoped, so the prune pass additionally
    /// filters on the ServiceAccount subject namespace to avoid touching the
    /// set of a same-named chart in another namespace.
    async fn sync_cluster_role_bindings(
        &self,
        chart_namespace: &str,
        desired: &[ClusterRoleBinding],
        selector: &str,
    ) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let mut keep = BTreeSet::new();
        for crb in desired {
            let name = crb.name_any();
            keep.insert(name.clone());
            match api.get_opt(&name).await? {
                None => {
                    api.create(&PostParams::default(), crb).await?;
                }
                Some(live) if up_to_date(&live, crb) => {}
                Some(_) => {
                    api.patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(crb),
                    )
                    .await?;
                }
            }
        }

        for live in api.list(&ListParams::default().labels(selector)).await? {
            let subject_namespace = live
                .subjects
                .as_ref()
                .and_then(|s| s.first())
                .and_then(|s| s.namespace.as_deref());
            if subject_namespace != Some(chart_namespace) {
                continue;
            }
            let name = live.name_any();
            if !keep.contains(&name) {
                ignore_not_found(api.delete(&name, &DeleteParams::default()).await)?;
            }
        }
        Ok(())
    }
}

/// Digest of the object's desired form, stored in the applied-hash
/// annotation. Unchanged inputs produce the same digest, so a repeat
/// reconcile of an unchanged chart performs zero writes.
fn applied_hash<K: Serialize>(obj: &K) -> Result<String> {
    let bytes = serde_json::to_vec(obj)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn up_to_date<K: Resource<DynamicType = ()>>(live: &K, desired: &K) -> bool {
    live.annotations().get(APPLIED_HASH_ANNOTATION)
        == desired.annotations().get(APPLIED_HASH_ANNOTATION)
}

fn ignore_not_found<T>(res: kube::Result<T>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
