use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, PodSecurityContext, SecurityContext};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// Reference to a Secret whose keys are projected into the chart values.
/// An empty `keys` list projects every key of the Secret in sorted order.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// HelmChart is the user-authored request for a chart installation. The
/// controller materialises it as a helm-runner Job plus its supporting
/// Secret/ConfigMap/ServiceAccount/ClusterRoleBinding set.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm.cattle.io",
    version = "v1",
    kind = "HelmChart",
    namespaced,
    status = "HelmChartStatus",
    printcolumn = r#"{"name": "Job", "type": "string", "jsonPath": ".status.jobName"}"#,
    printcolumn = r#"{"name": "Chart", "type": "string", "jsonPath": ".spec.chart"}"#,
    printcolumn = r#"{"name": "Target Namespace", "type": "string", "jsonPath": ".spec.targetNamespace"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Repo", "type": "string", "jsonPath": ".spec.repo"}"#,
    printcolumn = r#"{"name": "Helm Version", "type": "string", "jsonPath": ".spec.helmVersion"}"#,
    printcolumn = r#"{"name": "Bootstrap", "type": "boolean", "jsonPath": ".spec.bootstrap"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    /// Namespace helm installs the release into. Defaults to the chart's
    /// own namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,

    #[serde(default)]
    pub create_namespace: bool,

    /// Chart name within the repo, or an HTTPS URL to a chart tgz.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    /// Inline PEM bundle used to verify the chart repository.
    #[serde(default, rename = "repoCA", skip_serializing_if = "String::is_empty")]
    pub repo_ca: String,

    /// ConfigMap holding additional CA files for the chart repository.
    #[serde(
        default,
        rename = "repoCAConfigMap",
        skip_serializing_if = "Option::is_none"
    )]
    pub repo_ca_config_map: Option<LocalObjectReference>,

    /// Values passed as individual --set/--set-string flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, IntOrString>,

    /// Inline values YAML, merged below any HelmChartConfig overrides.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values_content: String,

    /// Secrets whose contents are merged into the values, above
    /// `valuesContent`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_secrets: Vec<SecretSpec>,

    /// Must be empty or "v3".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helm_version: String,

    /// Bootstrap charts run on a control-plane node with host networking,
    /// before the cluster network is up.
    #[serde(default)]
    pub bootstrap: bool,

    /// Base64-encoded chart tgz. Overrides `chart` and `version`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart_content: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_off_limit: Option<i32>,

    /// Helm operation timeout, e.g. "300s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// "reinstall" (default) or "abort".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_policy: String,

    /// Basic-auth Secret mounted into the Job at /auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<LocalObjectReference>,

    #[serde(default)]
    pub auth_pass_credentials: bool,

    #[serde(
        default,
        rename = "insecureSkipTLSVerify",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub insecure_skip_tls_verify: bool,

    #[serde(default, rename = "plainHTTP", skip_serializing_if = "std::ops::Not::not")]
    pub plain_http: bool,

    /// Registry-auth Secret mounted as the helm runner's docker config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_registry_secret: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartStatus {
    /// Name of the Job most recently applied for this chart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HelmChartCondition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HelmChartConditionType {
    JobCreated,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HelmChartCondition {
    #[serde(rename = "type")]
    pub type_: HelmChartConditionType,
    /// One of True, False, Unknown.
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl HelmChartStatus {
    /// Insert or replace the condition with the same type.
    pub fn set_condition(&mut self, condition: HelmChartCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}
