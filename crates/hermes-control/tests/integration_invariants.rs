//! Integration tests for exclusivity guarantees under concurrent load.

mod common;

use std::time::Duration;

use common::TestControlPlane;
use hermes_control::error::ErrorKind;
use hermes_control::runner::MockRunner;
use hermes_control::store::{DeploymentStore, VmStore};
use hermes_control::types::{DeploymentStatus, VmStatus};
use hermes_control::{DeploymentFilter, DeploymentRequest};

#[tokio::test]
async fn vms_are_never_shared() {
    let plane =
        TestControlPlane::with_runner(4, MockRunner::with_delay(Duration::from_millis(30))).await;
    plane.add_vm("i-1").await;
    plane.add_vm("i-2").await;
    let project = plane.project("site").await;

    let mut ids = Vec::new();
    for i in 0..6 {
        let branch = format!("env-{i}");
        plane
            .environment(&project, &format!("preview-{i}"), &branch, false)
            .await;
        ids.push(plane.deploy(&project, &branch, &format!("abc000{i}")).await.data.id);
    }

    for id in &ids {
        plane.wait_for(id, DeploymentStatus::Success).await;
    }
    plane.wait_idle().await;

    assert_eq!(plane.runner.peak_per_vm(), 1);
    assert_eq!(plane.runner.calls().await.len(), 6);

    let vms = plane.store.list_vms().await.unwrap();
    assert!(vms.iter().all(|vm| vm.status == VmStatus::Available && vm.lease.is_none()));

    plane.shutdown().await;
}

#[tokio::test]
async fn environment_runs_one_job_at_a_time() {
    let plane =
        TestControlPlane::with_runner(4, MockRunner::with_delay(Duration::from_millis(30))).await;
    plane.add_vm("i-1").await;
    plane.add_vm("i-2").await;
    plane.add_vm("i-3").await;
    let project = plane.project("site").await;
    plane.environment(&project, "production", "main", true).await;

    let first = plane.deploy(&project, "main", "abc1234").await;
    plane.wait_for(&first.data.id, DeploymentStatus::Success).await;
    plane.wait_idle().await;

    // A promotion and a new deployment of the same environment race for workers
    plane.promotion.promote(&project.id, &first.data.id).await.unwrap();
    let second = plane.deploy(&project, "main", "def5678").await;

    plane.wait_for(&first.data.id, DeploymentStatus::Promoted).await;
    plane.wait_for(&second.data.id, DeploymentStatus::Success).await;
    plane.wait_idle().await;

    assert_eq!(plane.runner.peak_per_environment(), 1);
    assert_eq!(plane.runner.peak_per_vm(), 1);

    plane.shutdown().await;
}

#[tokio::test]
async fn second_in_flight_deployment_is_a_conflict() {
    let plane = TestControlPlane::new(1).await;
    let project = plane.project("site").await;
    plane.environment(&project, "staging", "develop", false).await;

    // No VM, so the first deployment stays queued
    let first = plane.deploy(&project, "develop", "abc1234").await;

    let err = plane
        .deployments
        .create(DeploymentRequest {
            project_id: project.id.clone(),
            branch: "develop".to_owned(),
            commit_hash: "def5678".to_owned(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let all = plane.store.list(&DeploymentFilter::new()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].data.id, first.data.id);

    plane.shutdown().await;
}

#[tokio::test]
async fn busy_vm_always_has_a_running_deployment() {
    let plane =
        TestControlPlane::with_runner(2, MockRunner::with_delay(Duration::from_millis(50))).await;
    plane.add_vm("i-1").await;
    let project = plane.project("site").await;
    plane.environment(&project, "staging", "develop", false).await;

    let record = plane.deploy(&project, "develop", "abc1234").await;
    let running = plane.wait_for(&record.data.id, DeploymentStatus::Running).await;

    let vm_id = running.data.vm_id.clone().unwrap();
    let vm = plane.pool.get(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Busy);
    assert_eq!(vm.current_deployment_id(), Some(&record.data.id));

    // A busy VM cannot be unregistered
    let err = plane.pool.unregister(&vm_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let done = plane.wait_for(&record.data.id, DeploymentStatus::Success).await;
    plane.wait_idle().await;
    assert!(done.data.vm_id.is_none());
    let vm = plane.pool.get(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Available);

    plane.shutdown().await;
}
