use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use serde_json::json;

use super::common::*;
use helm_chart_operator::crd::HelmChart;
use helm_chart_operator::helpers::{MANAGED_BY_ANNOTATION, UNMANAGED_ANNOTATION};

/// An unannotated chart gets claimed: the controller writes its own name
/// into the managed-by annotation before doing anything else.
#[tokio::test]
async fn chart_is_claimed_before_reconciling() {
    let ctx = TestContext::new("claimed").await;
    let (c, ns) = (&ctx.client, ctx.ns.clone());

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = charts.clone();
            async move {
                api.get("claimed")
                    .await
                    .ok()
                    .and_then(|chart| {
                        chart
                            .metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(MANAGED_BY_ANNOTATION).cloned())
                    })
                    .as_deref()
                    == Some(TEST_CONTROLLER)
            }
        })
        .await,
        "managed-by annotation never written"
    );
}

/// A chart claimed by a different controller is left entirely alone.
#[tokio::test]
async fn foreign_chart_is_ignored() {
    let ctx = TestContext::empty().await;
    let (c, ns) = (&ctx.client, ctx.ns.clone());

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ns);
    let chart: HelmChart = serde_json::from_value(json!({
        "apiVersion": "helm.cattle.io/v1",
        "kind": "HelmChart",
        "metadata": {
            "name": "foreign",
            "namespace": ns,
            "annotations": { MANAGED_BY_ANNOTATION: "some-other-controller" },
        },
        "spec": { "chart": "stable/traefik" },
    }))
    .unwrap();
    charts
        .create(&kube::api::PostParams::default(), &chart)
        .await
        .unwrap();

    // Give the controller a chance to (wrongly) act, then check nothing
    // happened: no Job, no finalizer.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    let jobs: Api<Job> = Api::namespaced(c.clone(), &ns);
    assert!(jobs.get("helm-install-foreign").await.is_err());
    let live = charts.get("foreign").await.unwrap();
    assert!(live.metadata.finalizers.unwrap_or_default().is_empty());
}

/// The unmanaged annotation opts a chart out completely.
#[tokio::test]
async fn unmanaged_chart_is_skipped() {
    let ctx = TestContext::empty().await;
    let (c, ns) = (&ctx.client, ctx.ns.clone());

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ns);
    let chart: HelmChart = serde_json::from_value(json!({
        "apiVersion": "helm.cattle.io/v1",
        "kind": "HelmChart",
        "metadata": {
            "name": "optout",
            "namespace": ns,
            "annotations": { UNMANAGED_ANNOTATION: "true" },
        },
        "spec": { "chart": "stable/traefik" },
    }))
    .unwrap();
    charts
        .create(&kube::api::PostParams::default(), &chart)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    let jobs: Api<Job> = Api::namespaced(c.clone(), &ns);
    assert!(jobs.get("helm-install-optout").await.is_err());
    let live = charts.get("optout").await.unwrap();
    // Not even claimed.
    assert!(live
        .metadata
        .annotations
        .unwrap_or_default()
        .get(MANAGED_BY_ANNOTATION)
        .is_none());
}
