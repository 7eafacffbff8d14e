//! Desired-object builder for a HelmChart.
//!
//! Projects a HelmChart (plus its optional HelmChartConfig overlay and any
//! resolved values Secrets) into the full owned-object set: the helm-runner
//! Job, the values Secret, the chart-content ConfigMap, the ServiceAccount
//! and the ClusterRoleBinding.  Pure functions of their inputs — all cluster
//! reads happen in the reconciler, all writes in the apply engine.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EnvVar, KeyToPath,
    PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile, Secret, SecretVolumeSource,
    SecurityContext, ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{HelmChart, HelmChartConfig};
use crate::error::{Error, Result};
use crate::helpers::{
    cluster_role_binding_name, config_hash, content_config_map_name, delete_job_name,
    escape_commas, install_job_name, int_or_string_value, service_account_name, typed_val,
    values_secret_name, OperatorDefaults, CHART_LABEL, CONFIG_HASH_ANNOTATION,
    DEFAULT_BACKOFF_LIMIT, DEFAULT_JOB_IMAGE, FAILURE_POLICY_ABORT, FAILURE_POLICY_REINSTALL,
};

const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane";
const ETCD_TAINT: &str = "node-role.kubernetes.io/etcd";
const EXTERNAL_CLOUD_PROVIDER_TAINT: &str = "node.cloudprovider.kubernetes.io/uninitialized";

/// Contents of one key of a Secret referenced via `valuesSecrets`, fetched
/// by the reconciler before building.
#[derive(Clone, Debug)]
pub struct ResolvedValuesSecret {
    pub secret_name: String,
    pub key: String,
    pub content: String,
}

/// The full owned-object set for one HelmChart.
pub struct DesiredSet {
    pub job: Job,
    pub values_secret: Secret,
    pub content_config_map: ConfigMap,
    pub service_account: ServiceAccount,
    pub cluster_role_binding: ClusterRoleBinding,
}

/// Build the owned-object set. Fails with an InvalidChart error (surfaced as
/// a Failed condition, never retried) when the spec itself is unacceptable.
pub fn desired_set(
    chart: &HelmChart,
    config: Option<&HelmChartConfig>,
    values_secrets: &[ResolvedValuesSecret],
    defaults: &OperatorDefaults,
) -> Result<DesiredSet> {
    validate(chart, config)?;

    let values_secret = values_secret(chart, config, values_secrets);
    let content_config_map = content_config_map(chart);
    let mut job = job(chart, config, defaults);

    // The pod template is immutable once the Job exists; stamping the digest
    // of both data objects onto it turns any values/content edit into a Job
    // replacement on the next apply.
    if let Some(annotations) = job
        .spec
        .as_mut()
        .and_then(|s| s.template.metadata.as_mut())
        .and_then(|m| m.annotations.as_mut())
    {
        annotations.insert(
            CONFIG_HASH_ANNOTATION.to_string(),
            config_hash(&content_config_map, &values_secret),
        );
    }

    Ok(DesiredSet {
        job,
        values_secret,
        content_config_map,
        service_account: service_account(chart),
        cluster_role_binding: cluster_role_binding(chart, defaults),
    })
}

fn validate(chart: &HelmChart, config: Option<&HelmChartConfig>) -> Result<()> {
    let version = chart.spec.helm_version.as_str();
    if !version.is_empty() && version != "v3" {
        return Err(Error::invalid_chart(
            "Unsupported version",
            format!("helm version {version} is not supported, only v3"),
        ));
    }

    let policies = [
        chart.spec.failure_policy.as_str(),
        config.map(|c| c.spec.failure_policy.as_str()).unwrap_or(""),
    ];
    for policy in policies {
        if !matches!(policy, "" | FAILURE_POLICY_REINSTALL | FAILURE_POLICY_ABORT) {
            return Err(Error::invalid_chart(
                "Invalid failure policy",
                format!("failure policy {policy} is not reinstall or abort"),
            ));
        }
    }
    Ok(())
}

/// Failure policy after applying the HelmChartConfig override.
pub fn effective_failure_policy(chart: &HelmChart, config: Option<&HelmChartConfig>) -> String {
    if let Some(config) = config {
        if !config.spec.failure_policy.is_empty() {
            return config.spec.failure_policy.clone();
        }
    }
    if chart.spec.failure_policy.is_empty() {
        FAILURE_POLICY_REINSTALL.to_string()
    } else {
        chart.spec.failure_policy.clone()
    }
}

// ── Job ───────────────────────────────────────────────────────────────────────

/// Name the Job carries for the chart's current intent.
pub fn job_name(chart: &HelmChart) -> String {
    if chart.metadata.deletion_timestamp.is_some() {
        delete_job_name(&chart.name_any())
    } else {
        install_job_name(&chart.name_any())
    }
}

fn job(chart: &HelmChart, config: Option<&HelmChartConfig>, defaults: &OperatorDefaults) -> Job {
    let name = chart.name_any();
    let namespace = chart.namespace().unwrap_or_default();

    let job_image = match chart.spec.job_image.trim() {
        "" if defaults.job_image.is_empty() => DEFAULT_JOB_IMAGE.to_string(),
        "" => defaults.job_image.clone(),
        image => image.to_string(),
    };

    let target_namespace = if chart.spec.target_namespace.is_empty() {
        namespace.clone()
    } else {
        chart.spec.target_namespace.clone()
    };

    // Repo charts are fetched through a repo alias named after the chart.
    let chart_ref = if chart.spec.repo.is_empty() {
        chart.spec.chart.clone()
    } else {
        format!("{}/{}", name, chart.spec.chart)
    };

    let mut env = vec![
        env("NAME", name.clone()),
        env("VERSION", chart.spec.version.clone()),
        env("REPO", chart.spec.repo.clone()),
        env("HELM_DRIVER", "secret"),
        env("CHART_NAMESPACE", namespace.clone()),
        env("CHART", chart_ref),
        env("HELM_VERSION", chart.spec.helm_version.clone()),
        env("TARGET_NAMESPACE", target_namespace),
        env(
            "AUTH_PASS_CREDENTIALS",
            chart.spec.auth_pass_credentials.to_string(),
        ),
        env(
            "INSECURE_SKIP_TLS_VERIFY",
            chart.spec.insecure_skip_tls_verify.to_string(),
        ),
        env("PLAIN_HTTP", chart.spec.plain_http.to_string()),
        env("FAILURE_POLICY", effective_failure_policy(chart, config)),
    ];
    if let Some(timeout) = &chart.spec.timeout {
        env.push(self::env("TIMEOUT", timeout.clone()));
    }

    let mut node_selector = BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())]);
    let mut tolerations: Option<Vec<Toleration>> = None;
    let host_network = chart.spec.bootstrap;

    if chart.spec.bootstrap {
        node_selector.insert(CONTROL_PLANE_TAINT.to_string(), "true".to_string());
        tolerations = Some(bootstrap_tolerations());
        env.extend([
            self::env("KUBERNETES_SERVICE_HOST", "127.0.0.1"),
            self::env("KUBERNETES_SERVICE_PORT", defaults.api_server_port.clone()),
            self::env("BOOTSTRAP", "true"),
        ]);
    }

    for (proxy_name, proxy_value) in &defaults.proxy_env {
        env.push(self::env(proxy_name, proxy_value.clone()));
    }

    let mut volumes = vec![
        Volume {
            name: "values".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(values_secret_name(&name)),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "content".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: content_config_map_name(&name),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut volume_mounts = vec![
        VolumeMount {
            name: "values".to_string(),
            mount_path: "/config".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "content".to_string(),
            mount_path: "/chart".to_string(),
            ..Default::default()
        },
    ];

    if let Some(secret) = &chart.spec.auth_secret {
        volumes.push(Volume {
            name: "auth".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "auth".to_string(),
            mount_path: "/auth".to_string(),
            ..Default::default()
        });
    }

    if let Some(secret) = &chart.spec.docker_registry_secret {
        volumes.push(Volume {
            name: "dockerconfig".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                items: Some(vec![KeyToPath {
                    key: ".dockerconfigjson".to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "dockerconfig".to_string(),
            mount_path: "/home/klipper-helm/.docker".to_string(),
            ..Default::default()
        });
    }

    if let Some(cm) = &chart.spec.repo_ca_config_map {
        volumes.push(Volume {
            name: "ca-files".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "ca-files".to_string(),
            mount_path: "/ca-files".to_string(),
            ..Default::default()
        });
    }

    let chart_labels = BTreeMap::from([(CHART_LABEL.to_string(), name.clone())]);

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(chart)),
            namespace: Some(namespace),
            labels: Some(chart_labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(chart.spec.back_off_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(chart_labels),
                    annotations: Some(BTreeMap::new()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".to_string()),
                    service_account_name: Some(service_account_name(&name)),
                    node_selector: Some(node_selector),
                    host_network: if host_network { Some(true) } else { None },
                    tolerations,
                    security_context: Some(
                        chart
                            .spec
                            .pod_security_context
                            .clone()
                            .unwrap_or_else(default_pod_security_context),
                    ),
                    containers: vec![Container {
                        name: "helm".to_string(),
                        image: Some(job_image),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(args(chart)),
                        env: Some(env),
                        volume_mounts: Some(volume_mounts),
                        security_context: Some(
                            chart
                                .spec
                                .security_context
                                .clone()
                                .unwrap_or_else(default_container_security_context),
                        ),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The taints a bootstrap Job must tolerate to land on a not-yet-ready
/// control-plane node.
fn bootstrap_tolerations() -> Vec<Toleration> {
    vec![
        Toleration {
            key: Some("node.kubernetes.io/not-ready".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some(EXTERNAL_CLOUD_PROVIDER_TAINT.to_string()),
            operator: Some("Equal".to_string()),
            value: Some("true".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some("CriticalAddonsOnly".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some(ETCD_TAINT.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoExecute".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some(CONTROL_PLANE_TAINT.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
    ]
}

fn default_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn default_container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Args ──────────────────────────────────────────────────────────────────────

/// Arguments handed to the helm runner. Deletion always reduces to a bare
/// `delete`; installs carry namespace/version flags plus the sorted `set`
/// entries.
pub fn args(chart: &HelmChart) -> Vec<String> {
    if chart.metadata.deletion_timestamp.is_some() {
        return vec!["delete".to_string()];
    }

    let spec = &chart.spec;
    let mut args = vec!["install".to_string()];

    if !spec.target_namespace.is_empty() {
        args.push("--namespace".to_string());
        args.push(spec.target_namespace.clone());
    }
    if spec.create_namespace {
        args.push("--create-namespace".to_string());
    }
    if !spec.version.is_empty() {
        args.push("--version".to_string());
        args.push(spec.version.clone());
    }

    for (key, value) in &spec.set {
        if typed_val(value) {
            args.push("--set".to_string());
            args.push(format!("{key}={}", int_or_string_value(value)));
        } else {
            args.push("--set-string".to_string());
            args.push(format!(
                "{key}={}",
                escape_commas(&int_or_string_value(value))
            ));
        }
    }

    args
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

// ── Values Secret ─────────────────────────────────────────────────────────────

/// All values fragments for the chart, keyed so that helm's lexicographic
/// multi-file merge applies them in precedence order: chart values first,
/// HelmChartConfig overrides second, referenced Secrets last.
fn values_secret(
    chart: &HelmChart,
    config: Option<&HelmChartConfig>,
    resolved: &[ResolvedValuesSecret],
) -> Secret {
    let name = chart.name_any();
    let mut string_data = BTreeMap::new();

    if !chart.spec.values_content.is_empty() {
        string_data.insert(
            "values-01_HelmChart.yaml".to_string(),
            chart.spec.values_content.clone(),
        );
    }
    if !chart.spec.repo_ca.is_empty() {
        string_data.insert("ca-file.pem".to_string(), chart.spec.repo_ca.clone());
    }
    if let Some(config) = config {
        if !config.spec.values_content.is_empty() {
            string_data.insert(
                "values-10_HelmChartConfig.yaml".to_string(),
                config.spec.values_content.clone(),
            );
        }
    }
    for (index, vs) in resolved.iter().enumerate() {
        string_data.insert(
            format!(
                "values-20_ValuesSecret_{index:02}_{}_{}.yaml",
                vs.secret_name, vs.key
            ),
            vs.content.clone(),
        );
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(values_secret_name(&name)),
            namespace: chart.namespace(),
            labels: Some(BTreeMap::from([(CHART_LABEL.to_string(), name)])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

// ── Content ConfigMap ─────────────────────────────────────────────────────────

fn content_config_map(chart: &HelmChart) -> ConfigMap {
    let name = chart.name_any();
    let mut data = BTreeMap::new();
    if !chart.spec.chart_content.is_empty() {
        data.insert(
            format!("{name}.tgz.base64"),
            chart.spec.chart_content.clone(),
        );
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(content_config_map_name(&name)),
            namespace: chart.namespace(),
            labels: Some(BTreeMap::from([(CHART_LABEL.to_string(), name)])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

// ── ServiceAccount / ClusterRoleBinding ───────────────────────────────────────

fn service_account(chart: &HelmChart) -> ServiceAccount {
    let name = chart.name_any();
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(service_account_name(&name)),
            namespace: chart.namespace(),
            labels: Some(BTreeMap::from([(CHART_LABEL.to_string(), name)])),
            ..Default::default()
        },
        automount_service_account_token: Some(true),
        ..Default::default()
    }
}

fn cluster_role_binding(chart: &HelmChart, defaults: &OperatorDefaults) -> ClusterRoleBinding {
    let name = chart.name_any();
    let namespace = chart.namespace().unwrap_or_default();
    let cluster_role = if defaults.job_cluster_role.is_empty() {
        "cluster-admin".to_string()
    } else {
        defaults.job_cluster_role.clone()
    };

    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_role_binding_name(&namespace, &name)),
            labels: Some(BTreeMap::from([(CHART_LABEL.to_string(), name.clone())])),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(&name),
            namespace: Some(namespace),
            ..Default::default()
        }]),
    }
}
