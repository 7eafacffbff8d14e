use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use serde_json::json;

use super::common::*;
use helm_chart_operator::crd::{HelmChart, HelmChartConditionType};

/// helm v2 is not supported: the chart gets a Failed condition and no Job.
#[tokio::test]
async fn unsupported_helm_version_surfaces_failed_condition() {
    let ctx = TestContext::empty().await;
    let (c, ns) = (&ctx.client, ctx.ns.clone());

    ctx.create_chart(
        "legacy",
        json!({ "chart": "stable/traefik", "helmVersion": "v2" }),
    )
    .await;

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = charts.clone();
            async move {
                let Ok(chart) = api.get_status("legacy").await else {
                    return false;
                };
                chart.status.is_some_and(|status| {
                    status.conditions.iter().any(|cond| {
                        cond.type_ == HelmChartConditionType::Failed
                            && cond.status == "True"
                            && cond.reason == "Unsupported version"
                    })
                })
            }
        })
        .await,
        "Failed condition never surfaced"
    );

    let jobs: Api<Job> = Api::namespaced(c.clone(), &ns);
    assert!(jobs.get("helm-install-legacy").await.is_err(), "no job expected");
}

/// Fixing the spec clears the rejection and the install proceeds.
#[tokio::test]
async fn fixed_spec_recovers_from_rejection() {
    let ctx = TestContext::empty().await;
    let (c, ns) = (&ctx.client, ctx.ns.clone());

    ctx.create_chart(
        "recovering",
        json!({ "chart": "stable/traefik", "helmVersion": "v2" }),
    )
    .await;

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = charts.clone();
            async move {
                api.get_status("recovering").await.is_ok_and(|chart| {
                    chart.status.is_some_and(|s| !s.conditions.is_empty())
                })
            }
        })
        .await,
        "rejection never recorded"
    );

    patch_chart_spec(c, &ns, "recovering", json!({ "helmVersion": "v3" })).await;

    let jobs: Api<Job> = Api::namespaced(c.clone(), &ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = jobs.clone();
            async move { api.get("helm-install-recovering").await.is_ok() }
        })
        .await,
        "install job missing after fix"
    );
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = charts.clone();
            async move {
                api.get_status("recovering").await.is_ok_and(|chart| {
                    chart.status.is_some_and(|status| {
                        !status
                            .conditions
                            .iter()
                            .any(|c| c.type_ == HelmChartConditionType::Failed)
                    })
                })
            }
        })
        .await,
        "Failed condition never cleared"
    );
}
