use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::helm_chart::SecretSpec;

/// HelmChartConfig overlays values and failure policy onto the HelmChart of
/// the same namespace and name, without touching the chart resource itself.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm.cattle.io",
    version = "v1",
    kind = "HelmChartConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartConfigSpec {
    /// Values YAML applied on top of the HelmChart's own values.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values_content: String,

    /// Additional values Secrets, projected after the HelmChart's own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_secrets: Vec<SecretSpec>,

    /// Overrides the HelmChart's failure policy when set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_policy: String,
}
