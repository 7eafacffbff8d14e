use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams};
use serde_json::json;

use super::common::*;
use helm_chart_operator::crd::HelmChart;

/// Deleting a chart swaps the install Job for a delete Job; once the delete
/// Job succeeds, every owned object is pruned and the finalizer releases the
/// chart.
#[tokio::test]
async fn uninstall_lifecycle() {
    let ctx = TestContext::new("doomed").await;
    let (c, ns) = (&ctx.client, ctx.ns.clone());

    let jobs: Api<Job> = Api::namespaced(c.clone(), &ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = jobs.clone();
            async move { api.get("helm-install-doomed").await.is_ok() }
        })
        .await,
        "install job missing"
    );

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ns);
    charts
        .delete("doomed", &DeleteParams::default())
        .await
        .expect("failed to delete chart");

    // The delete Job replaces the install Job (the finalizer keeps the chart
    // alive meanwhile).
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = jobs.clone();
            async move { api.get("helm-delete-doomed").await.is_ok() }
        })
        .await,
        "delete job never created"
    );
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = jobs.clone();
            async move { api.get("helm-install-doomed").await.is_err() }
        })
        .await,
        "install job never pruned"
    );

    // While the delete Job runs, status points at it.
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = charts.clone();
            async move {
                api.get_status("doomed").await.is_ok_and(|chart| {
                    chart
                        .status
                        .is_some_and(|s| s.job_name.as_deref() == Some("helm-delete-doomed"))
                })
            }
        })
        .await,
        "status never switched to the delete job"
    );

    // Simulate the helm runner finishing the uninstall.
    fake_job_succeeded(c, &ns, "helm-delete-doomed").await;

    // The chart disappears (finalizer released) and the owned objects with it.
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = charts.clone();
            async move { api.get("doomed").await.is_err() }
        })
        .await,
        "chart never released"
    );

    let secrets: Api<Secret> = Api::namespaced(c.clone(), &ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = secrets.clone();
            async move { api.get("chart-values-doomed").await.is_err() }
        })
        .await,
        "values secret never pruned"
    );

    let crbs: Api<ClusterRoleBinding> = Api::all(c.clone());
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = crbs.clone();
            let name = format!("helm-{ns}-doomed");
            async move { api.get(&name).await.is_err() }
        })
        .await,
        "cluster role binding never pruned"
    );

    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = jobs.clone();
            async move { api.get("helm-delete-doomed").await.is_err() }
        })
        .await,
        "delete job never pruned"
    );
}

/// Two charts with the same name in different namespaces keep separate
/// ClusterRoleBindings; uninstalling one leaves the other's binding alone.
#[tokio::test]
async fn uninstall_does_not_touch_other_namespaces() {
    let ctx_a = TestContext::new("shared-name").await;
    let ctx_b = TestContext::new("shared-name").await;
    let c = &ctx_a.client;

    let crbs: Api<ClusterRoleBinding> = Api::all(c.clone());
    for ns in [&ctx_a.ns, &ctx_b.ns] {
        assert!(
            wait_for(TIMEOUT, POLL, || {
                let api = crbs.clone();
                let name = format!("helm-{ns}-shared-name");
                async move { api.get(&name).await.is_ok() }
            })
            .await,
            "binding for {ns} missing"
        );
    }

    let charts: Api<HelmChart> = Api::namespaced(c.clone(), &ctx_a.ns);
    charts
        .delete("shared-name", &DeleteParams::default())
        .await
        .unwrap();
    fake_job_succeeded(c, &ctx_a.ns, "helm-delete-shared-name").await;

    let gone = format!("helm-{}-shared-name", ctx_a.ns);
    assert!(
        wait_for(TIMEOUT, POLL, || {
            let api = crbs.clone();
            let name = gone.clone();
            async move { api.get(&name).await.is_err() }
        })
        .await,
        "deleted chart's binding still present"
    );

    // The sibling's binding survives.
    let kept = format!("helm-{}-shared-name", ctx_b.ns);
    assert!(crbs.get(&kept).await.is_ok(), "sibling binding was pruned");
}
