use std::sync::OnceLock;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

// ── Labels and annotations owned by the controller ────────────────────────────

/// Label stamped on every object owned by a HelmChart.
pub const CHART_LABEL: &str = "helmcharts.helm.cattle.io/chart";
/// Pod-template annotation carrying the values/content digest.
pub const CONFIG_HASH_ANNOTATION: &str = "helmcharts.helm.cattle.io/configHash";
/// User opt-out: charts carrying this annotation are never reconciled.
pub const UNMANAGED_ANNOTATION: &str = "helmcharts.helm.cattle.io/unmanaged";
/// First-writer-wins claim binding a chart to one controller instance.
pub const MANAGED_BY_ANNOTATION: &str = "helmcharts.cattle.io/managed-by";

pub const FAILURE_POLICY_REINSTALL: &str = "reinstall";
pub const FAILURE_POLICY_ABORT: &str = "abort";

pub const DEFAULT_JOB_IMAGE: &str = "rancher/klipper-helm:v0.8.2-build20230815";
pub const DEFAULT_BACKOFF_LIMIT: i32 = 1000;
pub const DEFAULT_API_SERVER_PORT: &str = "6443";

// ── Operator defaults (injected via CLI flags / env) ──────────────────────────

/// Cluster-specific configuration injected at startup. Read-only once the
/// workers are running.
#[derive(Clone, Debug, Default)]
pub struct OperatorDefaults {
    pub job_image: String,
    pub job_cluster_role: String,
    pub api_server_port: String,
    /// Proxy variables captured from the controller's own environment,
    /// forwarded into every Job.
    pub proxy_env: Vec<(String, String)>,
}

/// Capture the proxy variables the helm runner should inherit.
pub fn proxy_env() -> Vec<(String, String)> {
    const PROXY_VARS: [&str; 8] = [
        "all_proxy",
        "ALL_PROXY",
        "http_proxy",
        "HTTP_PROXY",
        "https_proxy",
        "HTTPS_PROXY",
        "no_proxy",
        "NO_PROXY",
    ];
    PROXY_VARS
        .iter()
        .filter_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (name.to_string(), v))
        })
        .collect()
}

// ── Naming helpers ────────────────────────────────────────────────────────────

pub fn install_job_name(chart_name: &str) -> String {
    format!("helm-install-{chart_name}")
}

pub fn delete_job_name(chart_name: &str) -> String {
    format!("helm-delete-{chart_name}")
}

pub fn values_secret_name(chart_name: &str) -> String {
    format!("chart-values-{chart_name}")
}

pub fn content_config_map_name(chart_name: &str) -> String {
    format!("chart-content-{chart_name}")
}

pub fn service_account_name(chart_name: &str) -> String {
    format!("helm-{chart_name}")
}

pub fn cluster_role_binding_name(namespace: &str, chart_name: &str) -> String {
    format!("helm-{namespace}-{chart_name}")
}

// ── Change detection ──────────────────────────────────────────────────────────

/// Digest of the Job's configuration inputs: the content ConfigMap then the
/// values Secret, each contributing its populated data fields in sorted key
/// order as key bytes followed by value bytes. Any change to either object
/// changes the digest, which forces the (immutable) Job to be replaced.
pub fn config_hash(content: &ConfigMap, values: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &content.data {
        for (k, v) in data {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
    }
    if let Some(data) = &content.binary_data {
        for (k, v) in data {
            hasher.update(k.as_bytes());
            hasher.update(&v.0);
        }
    }
    if let Some(data) = &values.data {
        for (k, v) in data {
            hasher.update(k.as_bytes());
            hasher.update(&v.0);
        }
    }
    if let Some(data) = &values.string_data {
        for (k, v) in data {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
    }
    format!("SHA256={}", hex::encode_upper(hasher.finalize()))
}

// ── --set value handling ──────────────────────────────────────────────────────

/// Whether helm's own parser would treat the value as typed (integer,
/// boolean, or null). Typed values go through `--set`; everything else is
/// passed verbatim with `--set-string`.
pub fn typed_val(val: &IntOrString) -> bool {
    match val {
        IntOrString::Int(_) => true,
        IntOrString::String(s) => {
            matches!(s.to_lowercase().as_str(), "true" | "false" | "null")
        }
    }
}

pub fn int_or_string_value(val: &IntOrString) -> String {
    match val {
        IntOrString::Int(i) => i.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}

static COMMA_RE: OnceLock<Regex> = OnceLock::new();

/// Escape unescaped commas in a --set-string value. Helm splits on commas,
/// honouring backslash escapes: a comma preceded by an even run of
/// backslashes is a separator, an odd run escapes it. Odd-length matches of
/// `\*,` (even backslash count + comma) gain one more backslash.
pub fn escape_commas(val: &str) -> String {
    let re = COMMA_RE.get_or_init(|| Regex::new(r"\\*,").expect("static pattern"));
    re.replace_all(val, |caps: &Captures| {
        let m = &caps[0];
        if m.len() % 2 == 1 {
            format!("\\{m}")
        } else {
            m.to_string()
        }
    })
    .into_owned()
}
