//! HelmChart controller — the main reconciler.
//!
//! Watches HelmChart and its overlay HelmChartConfig, claims unowned charts
//! via the managed-by annotation, projects each chart into its owned-object
//! set and hands the set to the apply engine.  Uninstall runs under a
//! finalizer: the install Job is swapped for a delete Job, and only once the
//! delete Job succeeds is the set pruned and the finalizer released.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        events::{Event as KubeEvent, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Client, Resource,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::crd::{
    HelmChart, HelmChartCondition, HelmChartConditionType, HelmChartConfig, HelmChartStatus,
};
use crate::error::{Error, Result};
use crate::helpers::{
    OperatorDefaults, CHART_LABEL, FAILURE_POLICY_ABORT, MANAGED_BY_ANNOTATION,
    UNMANAGED_ANNOTATION,
};

use super::apply::{ObjectSet, ObjectSetApply};
use super::child_resources::{desired_set, effective_failure_policy, ResolvedValuesSecret};

const FINALIZER: &str = "helm.cattle.io/chart-removal";

/// Pause between applying the delete Job and first checking its status,
/// giving the runner a chance to finish small uninstalls in one pass.
const UNINSTALL_SETTLE: Duration = Duration::from_secs(3);

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Publish a Kubernetes event attached to the given resource.
/// Errors are logged but never block reconciliation.
pub async fn publish_event<K: Resource<DynamicType = ()>>(
    ctx: &Context,
    obj: &K,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let rec = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let oref = kube_object_ref(obj);
    if let Err(e) = rec
        .publish(
            &KubeEvent {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            },
            &oref,
        )
        .await
    {
        warn!(%e, "failed to publish event");
    }
}

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context {
    pub client: Client,
    pub defaults: OperatorDefaults,
    /// Namespace this controller is scoped to; empty means all namespaces.
    pub system_namespace: String,
    /// Identity written into the managed-by claim annotation.
    pub controller_name: String,
    pub apply: ObjectSetApply,
    pub reporter: Reporter,
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the HelmChart controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>, workers: u16) {
    let client = ctx.client.clone();
    let ns = ctx.system_namespace.clone();

    let charts: Api<HelmChart> = scoped(&client, &ns);
    let configs: Api<HelmChartConfig> = scoped(&client, &ns);
    let jobs: Api<Job> = scoped(&client, &ns);
    let secrets: Api<Secret> = scoped(&client, &ns);
    let config_maps: Api<ConfigMap> = scoped(&client, &ns);
    let service_accounts: Api<ServiceAccount> = scoped(&client, &ns);
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());

    // Owned kinds are watched with a chart-label selector so we never cache
    // unrelated Secrets or Jobs.
    let owned = WatcherConfig::default().labels(CHART_LABEL);

    Controller::new(charts, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(workers))
        .shutdown_on_signal()
        .owns(jobs, owned.clone())
        .owns(secrets, owned.clone())
        .owns(config_maps, owned.clone())
        .owns(service_accounts, owned.clone())
        // The overlay has the same namespace/name as its chart.
        .watches(configs, WatcherConfig::default(), map_config_to_chart)
        // ClusterRoleBindings are cluster-scoped and cannot carry an owner
        // reference to a namespaced chart; map them back via the chart label
        // and the ServiceAccount subject namespace.
        .watches(bindings, owned, map_binding_to_chart)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((_obj, _action)) => {}
                Err(e) => {
                    let msg = format!("{e:?}");
                    if msg.contains("ObjectNotFound") {
                        debug!("reconcile: object already deleted");
                    } else {
                        warn!("reconcile failed: {msg}");
                    }
                }
            }
        })
        .await;
}

fn scoped<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

// ── Watch mappers ─────────────────────────────────────────────────────────────

fn map_config_to_chart(config: HelmChartConfig) -> Option<ObjectRef<HelmChart>> {
    let ns = config.metadata.namespace.clone()?;
    Some(ObjectRef::new(&config.name_any()).within(&ns))
}

fn map_binding_to_chart(binding: ClusterRoleBinding) -> Option<ObjectRef<HelmChart>> {
    let chart_name = binding.labels().get(CHART_LABEL)?.clone();
    let ns = binding
        .subjects
        .as_ref()
        .and_then(|s| s.first())
        .and_then(|s| s.namespace.clone())?;
    Some(ObjectRef::new(&chart_name).within(&ns))
}

// ── Manageability ─────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum Manageability {
    /// Ours: reconcile it.
    Manage,
    /// Nobody's yet: write the claim annotation and wait for the re-enqueue.
    Claim,
    /// Out of scope, opted out, or claimed by another controller.
    Skip,
}

/// Decide whether this controller touches the chart at all. Claiming before
/// reconciling keeps two controllers from fighting over one chart.
pub fn manageability(
    chart: &HelmChart,
    system_namespace: &str,
    controller_name: &str,
) -> Manageability {
    if !system_namespace.is_empty() && chart.namespace().as_deref() != Some(system_namespace) {
        return Manageability::Skip;
    }
    if chart.spec.chart.is_empty() && chart.spec.chart_content.is_empty() {
        return Manageability::Skip;
    }
    let annotations = chart.annotations();
    if annotations.contains_key(UNMANAGED_ANNOTATION) {
        return Manageability::Skip;
    }
    match annotations.get(MANAGED_BY_ANNOTATION) {
        Some(owner) if owner == controller_name => Manageability::Manage,
        Some(_) => Manageability::Skip,
        None => Manageability::Claim,
    }
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

async fn reconcile(chart: Arc<HelmChart>, ctx: Arc<Context>) -> Result<Action> {
    let ns = chart.namespace().unwrap_or_default();
    let name = chart.name_any();
    let api: Api<HelmChart> = Api::namespaced(ctx.client.clone(), &ns);

    match manageability(&chart, &ctx.system_namespace, &ctx.controller_name) {
        Manageability::Skip => return Ok(Action::await_change()),
        Manageability::Claim => {
            info!(%name, %ns, controller = %ctx.controller_name, "claiming chart");
            let patch = json!({
                "metadata": {
                    "annotations": { MANAGED_BY_ANNOTATION: ctx.controller_name }
                }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            // The annotation write re-enqueues the key; reconcile then.
            return Ok(Action::await_change());
        }
        Manageability::Manage => {}
    }

    // The finalizer helper adds/removes the finalizer and routes deletion to
    // the cleanup branch. Only managed charts ever reach it, so unmanaged
    // charts never grow a finalizer.
    finalizer(&api, FINALIZER, chart, |event| async {
        match event {
            FinalizerEvent::Apply(chart) => on_change(&chart, &ctx).await,
            FinalizerEvent::Cleanup(chart) => on_remove(&chart, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(chart: Arc<HelmChart>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = chart.name_any();
    // Finalizer helper returns ObjectNotFound when the object was deleted
    // between the watch event and the reconcile — harmless.
    if matches!(error, Error::Finalizer(e) if e.to_string().contains("ObjectNotFound")) {
        debug!(%name, "object already deleted, skipping requeue");
        return Action::await_change();
    }
    let inner = match error {
        Error::Finalizer(e) => match e.as_ref() {
            kube::runtime::finalizer::Error::ApplyFailed(err)
            | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
            _ => {
                warn!(%name, %error, "finalizer error, requeuing in 30s");
                return Action::requeue(Duration::from_secs(30));
            }
        },
        other => other,
    };
    match inner {
        // The spec itself is bad; retrying cannot help until it changes.
        Error::InvalidChart { .. } => Action::await_change(),
        // The apply deleted a stale Job; recreate promptly.
        Error::ReplaceJob(_) => Action::requeue(Duration::from_secs(1)),
        // Uninstall in flight; poll the delete Job.
        Error::UninstallPending(_, _) => Action::requeue(Duration::from_secs(5)),
        _ => {
            warn!(%name, %error, "reconcile error, requeuing in 30s");
            Action::requeue(Duration::from_secs(30))
        }
    }
}

// ── OnChange (install / upgrade) ──────────────────────────────────────────────

async fn on_change(chart: &HelmChart, ctx: &Context) -> Result<Action> {
    let ns = chart.namespace().unwrap_or_default();
    let name = chart.name_any();
    debug!(%name, %ns, "reconciling HelmChart");

    let config = paired_config(chart, ctx).await?;
    let resolved = resolve_values_secrets(chart, config.as_ref(), ctx).await?;

    let desired = match desired_set(chart, config.as_ref(), &resolved, &ctx.defaults) {
        Ok(desired) => desired,
        Err(err @ Error::InvalidChart { .. }) => {
            surface_rejection(chart, ctx, &err).await?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    let job_name = desired.job.name_any();
    publish_event(
        ctx,
        chart,
        EventType::Normal,
        "ApplyJob",
        "Reconcile",
        Some(format!("Applying HelmChart using Job {ns}/{job_name}")),
    )
    .await;

    ctx.apply.apply(chart, ObjectSet::from(desired)).await?;

    let mut status = chart.status.clone().unwrap_or_default();
    status.job_name = Some(job_name.clone());
    status.set_condition(HelmChartCondition {
        type_: HelmChartConditionType::JobCreated,
        status: "True".to_string(),
        reason: String::new(),
        message: String::new(),
    });
    status
        .conditions
        .retain(|c| c.type_ != HelmChartConditionType::Failed);

    // A failed Job under the abort policy is surfaced and then left alone;
    // nothing gets replaced until the spec (and thus the applied hash)
    // changes.
    if effective_failure_policy(chart, config.as_ref()) == FAILURE_POLICY_ABORT {
        let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
        if let Some(job) = jobs.get_opt(&job_name).await? {
            if job_failed(&job) {
                status.set_condition(HelmChartCondition {
                    type_: HelmChartConditionType::Failed,
                    status: "True".to_string(),
                    reason: "JobFailed".to_string(),
                    message: format!("Job {ns}/{job_name} failed and failure policy is abort"),
                });
            }
        }
    }

    update_status(chart, ctx, status).await?;
    Ok(Action::await_change())
}

// ── OnRemove (uninstall) ──────────────────────────────────────────────────────

async fn on_remove(chart: &HelmChart, ctx: &Context) -> Result<Action> {
    let ns = chart.namespace().unwrap_or_default();
    let name = chart.name_any();
    info!(%name, %ns, "uninstalling HelmChart");

    let config = paired_config(chart, ctx).await?;
    let resolved = resolve_values_secrets(chart, config.as_ref(), ctx).await?;

    // A chart whose spec was never valid has no release to uninstall; prune
    // whatever set members exist and let the finalizer go.
    let desired = match desired_set(chart, config.as_ref(), &resolved, &ctx.defaults) {
        Ok(desired) => desired,
        Err(err) if err.is_terminal() => {
            ctx.apply.apply(chart, ObjectSet::empty()).await?;
            return Ok(Action::await_change());
        }
        Err(err) => return Err(err),
    };
    let delete_job_name = desired.job.name_any();

    // Applying the set swaps the install Job for the delete Job: the stale
    // install Job is pruned by name and the delete Job created in its place,
    // so two Jobs never run concurrently.
    ctx.apply.apply(chart, ObjectSet::from(desired)).await?;

    // Give the runner a moment before polling.
    tokio::time::sleep(UNINSTALL_SETTLE).await;

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let job = jobs.get_opt(&delete_job_name).await?.ok_or_else(|| {
        Error::UninstallPending(format!("{ns}/{name}"), delete_job_name.clone())
    })?;

    if job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) <= 0 {
        // Record which Job is doing the uninstall, then requeue until it
        // reports success.
        let mut status = chart.status.clone().unwrap_or_default();
        status.job_name = Some(delete_job_name.clone());
        update_status(chart, ctx, status).await?;
        return Err(Error::UninstallPending(
            format!("{ns}/{name}"),
            delete_job_name,
        ));
    }

    publish_event(
        ctx,
        chart,
        EventType::Normal,
        "RemoveJob",
        "Uninstall",
        Some(format!(
            "Uninstalled HelmChart using Job {ns}/{delete_job_name}, removing resources"
        )),
    )
    .await;

    // An empty apply prunes every object in the chart's set, the finished
    // delete Job included.
    ctx.apply.apply(chart, ObjectSet::empty()).await?;

    Ok(Action::await_change())
}

// ── Shared lookups ────────────────────────────────────────────────────────────

async fn paired_config(chart: &HelmChart, ctx: &Context) -> Result<Option<HelmChartConfig>> {
    let ns = chart.namespace().unwrap_or_default();
    let api: Api<HelmChartConfig> = Api::namespaced(ctx.client.clone(), &ns);
    Ok(api.get_opt(&chart.name_any()).await?)
}

/// Fetch the contents of every Secret referenced through `valuesSecrets`,
/// chart-level references first so config-level entries sort later and win
/// the values merge. Missing Secrets or keys are skipped with a warning; the
/// next edit to them re-enqueues nothing, but the next chart reconcile picks
/// them up.
async fn resolve_values_secrets(
    chart: &HelmChart,
    config: Option<&HelmChartConfig>,
    ctx: &Context,
) -> Result<Vec<ResolvedValuesSecret>> {
    let ns = chart.namespace().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);

    let mut refs = chart.spec.values_secrets.iter().collect::<Vec<_>>();
    if let Some(config) = config {
        refs.extend(config.spec.values_secrets.iter());
    }

    let mut resolved = Vec::new();
    for spec in refs {
        let Some(secret) = api.get_opt(&spec.name).await? else {
            warn!(secret = %spec.name, %ns, "values secret not found, skipping");
            continue;
        };
        let data = secret.data.unwrap_or_default();
        let keys: Vec<String> = if spec.keys.is_empty() {
            data.keys().cloned().collect()
        } else {
            spec.keys.clone()
        };
        for key in keys {
            let Some(value) = data.get(&key) else {
                warn!(secret = %spec.name, %key, "values secret key missing, skipping");
                continue;
            };
            resolved.push(ResolvedValuesSecret {
                secret_name: spec.name.clone(),
                key,
                content: String::from_utf8_lossy(&value.0).into_owned(),
            });
        }
    }
    Ok(resolved)
}

fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Failed" && c.status == "True")
        })
}

/// Record a configuration rejection on the chart's status and as a warning
/// event. The error itself is terminal: the queue does not retry it.
async fn surface_rejection(chart: &HelmChart, ctx: &Context, err: &Error) -> Result<()> {
    let Error::InvalidChart { reason, message } = err else {
        return Ok(());
    };
    publish_event(
        ctx,
        chart,
        EventType::Warning,
        "Failed",
        "Reconcile",
        Some(message.clone()),
    )
    .await;

    let mut status = chart.status.clone().unwrap_or_default();
    status.set_condition(HelmChartCondition {
        type_: HelmChartConditionType::Failed,
        status: "True".to_string(),
        reason: reason.clone(),
        message: message.clone(),
    });
    update_status(chart, ctx, status).await
}

/// Patch `.status` only when it actually changed, avoiding spurious etcd
/// writes and watch-event hot loops.
async fn update_status(chart: &HelmChart, ctx: &Context, status: HelmChartStatus) -> Result<()> {
    if chart.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let ns = chart.namespace().unwrap_or_default();
    let api: Api<HelmChart> = Api::namespaced(ctx.client.clone(), &ns);
    api.patch_status(
        &chart.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}
