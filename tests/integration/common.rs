//! Shared test harness and helpers for envtest-based integration tests.
//!
//! A single envtest server + controller is shared across all tests in this
//! binary.  Each test gets its own Kubernetes namespace for isolation, so
//! tests can run in parallel.
//!
//! envtest runs only the apiserver and etcd: there is no kubelet, so Job
//! completion is faked by patching status subresources, and there is no
//! garbage collector, so a background task clears finalizers from
//! foreground-deleted Jobs to let their deletion complete.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use envtest::Environment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::runtime::events::Reporter;
use kube::{Client, Config, CustomResourceExt};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use helm_chart_operator::controller::apply::ObjectSetApply;
use helm_chart_operator::controller::helm_chart::{self, Context};
use helm_chart_operator::controller::helpers::FIELD_MANAGER;
use helm_chart_operator::crd::{HelmChart, HelmChartConfig};
use helm_chart_operator::helpers::OperatorDefaults;

pub const TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL: Duration = Duration::from_millis(500);

/// The managed-by identity the test controller claims charts with.
pub const TEST_CONTROLLER: &str = "helm-controller-test";

/// Counter for generating unique namespace names.
static NS_COUNTER: AtomicU32 = AtomicU32::new(0);

// ═══════════════════════════════════════════════════════════════════════════════
// Shared environment (one envtest server + controller per test binary)
// ═══════════════════════════════════════════════════════════════════════════════

/// Holds the envtest server, a kube Client, and the tokio runtime that drives
/// the controller.  All three live for the entire process.
struct SharedEnv {
    client: Client,
    // The runtime keeps the controller task and kube HTTP connections alive
    // across individual `#[tokio::test]` runtimes.
    _runtime: tokio::runtime::Runtime,
    _server: envtest::Server,
}

// SAFETY: envtest::Server is just a String wrapper (kubeconfig) — Send+Sync.
unsafe impl Send for SharedEnv {}
unsafe impl Sync for SharedEnv {}

/// Singleton — initialised on first use, never torn down (process exit cleans up).
static SHARED: OnceLock<SharedEnv> = OnceLock::new();

fn init_shared() -> SharedEnv {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn,helm_chart_operator=debug"))
        .try_init();

    // Build a multi-threaded runtime that outlives every `#[tokio::test]`.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build shared runtime");

    let (client, server) = rt.block_on(async {
        let mut env = Environment::default();
        let env = env
            .with_crds(vec![HelmChart::crd(), HelmChartConfig::crd()])
            .expect("failed to configure CRDs");

        let server = env.create().expect("failed to start envtest server");
        let kubeconfig = server.kubeconfig().expect("failed to get kubeconfig");
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .expect("failed to build config");
        let client = Client::try_from(config).expect("failed to create client");
        (client, server)
    });

    // Spawn the controller on the shared runtime so it outlives test runtimes.
    let ctx = test_context(client.clone());
    rt.spawn(async move {
        helm_chart::run(ctx, 2).await;
    });

    // envtest has no kube-controller-manager, so foreground-deleted Jobs
    // would hang on the foregroundDeletion finalizer forever. Stand in for
    // the garbage collector: strip finalizers from terminating Jobs.
    let gc_client = client.clone();
    rt.spawn(async move {
        let all_jobs: Api<Job> = Api::all(gc_client.clone());
        loop {
            if let Ok(list) = all_jobs.list(&ListParams::default()).await {
                for job in list {
                    let terminating = job.metadata.deletion_timestamp.is_some()
                        && job
                            .metadata
                            .finalizers
                            .as_ref()
                            .is_some_and(|f| !f.is_empty());
                    if terminating {
                        let ns = job.metadata.namespace.clone().unwrap_or_default();
                        let name = job.metadata.name.clone().unwrap_or_default();
                        let api: Api<Job> = Api::namespaced(gc_client.clone(), &ns);
                        let patch = json!({ "metadata": { "finalizers": null } });
                        let _ = api
                            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                            .await;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    SharedEnv {
        client,
        _runtime: rt,
        _server: server,
    }
}

/// Get (or create) the shared envtest environment.
///
/// Initialization runs on a dedicated OS thread to avoid the "cannot start a
/// runtime from within a runtime" panic that would occur if `block_on` were
/// called from inside a `#[tokio::test]` context.
fn shared() -> &'static SharedEnv {
    SHARED.get_or_init(|| {
        std::thread::spawn(init_shared)
            .join()
            .expect("shared env init thread panicked")
    })
}

fn test_context(client: Client) -> Arc<Context> {
    Arc::new(Context {
        client: client.clone(),
        defaults: OperatorDefaults {
            job_image: String::new(),
            job_cluster_role: String::new(),
            api_server_port: "6443".into(),
            proxy_env: vec![],
        },
        // Empty scope: the controller watches every test namespace.
        system_namespace: String::new(),
        controller_name: TEST_CONTROLLER.into(),
        apply: ObjectSetApply::new(client, TEST_CONTROLLER),
        reporter: Reporter {
            controller: TEST_CONTROLLER.into(),
            instance: None,
        },
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-test context
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-test context: owns a unique namespace and provides a kube Client.
pub struct TestContext {
    pub client: Client,
    pub ns: String,
}

impl TestContext {
    /// Create a fresh namespace and a HelmChart named `chart_name` in it.
    pub async fn new(chart_name: &str) -> Self {
        let ctx = Self::empty().await;
        ctx.create_chart(chart_name, json!({ "chart": "stable/traefik" }))
            .await;
        ctx
    }

    /// Create a fresh namespace without any chart.
    pub async fn empty() -> Self {
        let env = shared();
        let client = env.client.clone();

        let id = NS_COUNTER.fetch_add(1, Ordering::SeqCst);
        let ns = format!("test-{id}");

        let ns_api: Api<Namespace> = Api::all(client.clone());
        let ns_obj: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": &ns }
        }))
        .unwrap();
        ns_api
            .create(&PostParams::default(), &ns_obj)
            .await
            .expect("failed to create test namespace");

        Self { client, ns }
    }

    /// Create a HelmChart with the given spec fields.
    pub async fn create_chart(&self, name: &str, spec: serde_json::Value) {
        let api: Api<HelmChart> = Api::namespaced(self.client.clone(), &self.ns);
        let chart: HelmChart = serde_json::from_value(json!({
            "apiVersion": "helm.cattle.io/v1",
            "kind": "HelmChart",
            "metadata": { "name": name, "namespace": self.ns },
            "spec": spec,
        }))
        .unwrap();
        api.create(&PostParams::default(), &chart)
            .await
            .expect("failed to create HelmChart");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Poll until a condition is true, or timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Merge-patch spec fields on an existing HelmChart.
pub async fn patch_chart_spec(client: &Client, ns: &str, name: &str, spec: serde_json::Value) {
    let api: Api<HelmChart> = Api::namespaced(client.clone(), ns);
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({ "spec": spec })),
    )
    .await
    .expect("failed to patch HelmChart spec");
}

/// Wait for a Job to exist, then patch its status to report success. There
/// is no kubelet in envtest, so this stands in for the helm runner finishing.
pub async fn fake_job_succeeded(client: &Client, ns: &str, name: &str) {
    let jobs: Api<Job> = Api::namespaced(client.clone(), ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = jobs.clone();
            let n = name.to_string();
            async move { api.get(&n).await.is_ok() }
        })
        .await,
        "job {name} never appeared"
    );
    let patch = json!({ "status": { "succeeded": 1 } });
    jobs.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .expect("failed to patch job status");
}

/// Read the configHash pod-template annotation off a Job, if present.
pub async fn job_config_hash(client: &Client, ns: &str, name: &str) -> Option<String> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), ns);
    let job = jobs.get(name).await.ok()?;
    job.spec?
        .template
        .metadata?
        .annotations?
        .get(helm_chart_operator::helpers::CONFIG_HASH_ANNOTATION)
        .cloned()
}
