//! VM pool manager.
//!
//! The pool owns every registered executor and its availability. All
//! mutations go through one async mutex and are written through to the
//! store before the lock is released, so two acquirers can never be handed
//! the same VM and the persisted view never runs ahead of the in-memory one.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult, ResourceKind};
use crate::inventory::CloudInventory;
use crate::store::Store;
use crate::types::{DeploymentId, VmId, VmLease, VmRecord, VmStatus};

/// Counts of VMs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolCounts {
    /// VMs free to be acquired.
    pub available: usize,
    /// VMs bound to a job.
    pub busy: usize,
    /// VMs excluded until re-registered.
    pub unreachable: usize,
}

/// Outcome of one inventory sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// VMs whose instance was looked up.
    pub checked: usize,
    /// VMs newly marked unreachable.
    pub marked_unreachable: usize,
    /// Lookups that failed and were left for the next sweep.
    pub errors: usize,
}

/// Pool of reusable VM executors.
pub struct VmPool {
    vms: Mutex<Vec<VmRecord>>,
    store: Arc<dyn Store>,
    inventory: Arc<dyn CloudInventory>,
}

impl VmPool {
    /// Load the pool from the store.
    pub async fn load(
        store: Arc<dyn Store>,
        inventory: Arc<dyn CloudInventory>,
    ) -> ControlResult<Self> {
        let vms = store.list_vms().await?;
        info!(count = vms.len(), "VM pool loaded");

        Ok(Self {
            vms: Mutex::new(vms),
            store,
            inventory,
        })
    }

    /// Acquire the first available VM in a region.
    ///
    /// Returns `None` when the region has no available VM; callers treat that
    /// as a transient condition. Fails with `Conflict` if the job already
    /// holds a VM.
    pub async fn acquire(&self, region: &str, lease: VmLease) -> ControlResult<Option<VmRecord>> {
        let mut vms = self.vms.lock().await;

        if let Some(held) = vms.iter().find(|vm| vm.lease.as_ref() == Some(&lease)) {
            return Err(ControlError::conflict(format!(
                "{} job for deployment {} already holds VM {}",
                lease.kind, lease.deployment_id, held.id
            )));
        }

        let Some(index) = vms
            .iter()
            .position(|vm| vm.region == region && vm.status == VmStatus::Available)
        else {
            debug!(region, "no available VM");
            return Ok(None);
        };

        let mut updated = vms[index].clone();
        updated.status = VmStatus::Busy;
        updated.lease = Some(lease);
        updated.updated_at = Utc::now();

        self.store.upsert_vm(&updated).await?;
        vms[index] = updated.clone();

        info!(
            vm_id = %updated.id,
            region,
            deployment_id = %updated.current_deployment_id().map_or("", DeploymentId::as_str),
            "VM acquired"
        );
        Ok(Some(updated))
    }

    /// Return a VM to the pool.
    ///
    /// The release only applies if the VM is still leased to `deployment_id`.
    /// A VM marked unreachable while leased stays unreachable.
    pub async fn release(&self, vm_id: &VmId, deployment_id: &DeploymentId) -> ControlResult<()> {
        let mut vms = self.vms.lock().await;

        let index = vms
            .iter()
            .position(|vm| &vm.id == vm_id)
            .ok_or_else(|| ControlError::not_found(ResourceKind::Vm, vm_id))?;

        if vms[index].current_deployment_id() != Some(deployment_id) {
            warn!(
                vm_id = %vm_id,
                deployment_id = %deployment_id,
                "ignoring release from a job that does not hold the VM"
            );
            return Ok(());
        }

        let mut updated = vms[index].clone();
        if updated.status == VmStatus::Busy {
            updated.status = VmStatus::Available;
        }
        updated.lease = None;
        updated.updated_at = Utc::now();

        self.store.upsert_vm(&updated).await?;
        vms[index] = updated;

        info!(vm_id = %vm_id, deployment_id = %deployment_id, "VM released");
        Ok(())
    }

    /// Register a cloud instance as an executor.
    ///
    /// The instance must be known to the inventory. Registering an instance
    /// that is already pooled refreshes its details and, if it was marked
    /// unreachable, returns it to service.
    pub async fn register(&self, instance_id: &str, region: &str) -> ControlResult<VmRecord> {
        let details = self
            .inventory
            .describe_instance(instance_id, region)
            .await?
            .ok_or_else(|| {
                ControlError::not_found(ResourceKind::Instance, format!("{region}/{instance_id}"))
            })?;
        let usable = details.state.is_usable();

        let mut vms = self.vms.lock().await;

        let existing = vms
            .iter()
            .position(|vm| vm.instance_id == instance_id && vm.region == region);

        let record = match existing {
            Some(index) => {
                let mut updated = vms[index].clone();
                if updated.status == VmStatus::Unreachable && usable {
                    updated.status = if updated.lease.is_some() {
                        VmStatus::Busy
                    } else {
                        VmStatus::Available
                    };
                } else if !usable && updated.lease.is_none() {
                    updated.status = VmStatus::Unreachable;
                }
                updated.instance = Some(details);
                updated.updated_at = Utc::now();

                self.store.upsert_vm(&updated).await?;
                vms[index] = updated.clone();
                info!(vm_id = %updated.id, instance_id, region, status = %updated.status, "VM re-registered");
                updated
            }
            None => {
                let mut record = VmRecord::new(instance_id, region, Some(details))?;
                if !usable {
                    record.status = VmStatus::Unreachable;
                }

                self.store.upsert_vm(&record).await?;
                vms.push(record.clone());
                info!(vm_id = %record.id, instance_id, region, status = %record.status, "VM registered");
                record
            }
        };

        Ok(record)
    }

    /// Remove a VM from the pool.
    ///
    /// Fails with `Conflict` while the VM is busy.
    pub async fn unregister(&self, vm_id: &VmId) -> ControlResult<VmRecord> {
        let mut vms = self.vms.lock().await;

        let index = vms
            .iter()
            .position(|vm| &vm.id == vm_id)
            .ok_or_else(|| ControlError::not_found(ResourceKind::Vm, vm_id))?;

        if let Some(deployment_id) = vms[index].current_deployment_id() {
            return Err(ControlError::conflict(format!(
                "VM {vm_id} is executing deployment {deployment_id}"
            )));
        }

        self.store.delete_vm(vm_id).await?;
        let removed = vms.remove(index);

        info!(vm_id = %vm_id, instance_id = %removed.instance_id, "VM unregistered");
        Ok(removed)
    }

    /// Exclude a VM from acquisition until it is re-registered.
    pub async fn mark_unreachable(&self, vm_id: &VmId) -> ControlResult<()> {
        let mut vms = self.vms.lock().await;

        let index = vms
            .iter()
            .position(|vm| &vm.id == vm_id)
            .ok_or_else(|| ControlError::not_found(ResourceKind::Vm, vm_id))?;

        if vms[index].status == VmStatus::Unreachable {
            return Ok(());
        }

        let mut updated = vms[index].clone();
        updated.status = VmStatus::Unreachable;
        updated.updated_at = Utc::now();

        self.store.upsert_vm(&updated).await?;
        vms[index] = updated;

        warn!(vm_id = %vm_id, "VM marked unreachable");
        Ok(())
    }

    /// Poll the inventory for every idle VM and refresh cached details.
    ///
    /// VMs whose instance is missing or no longer running are marked
    /// unreachable. Busy VMs are skipped and checked once released.
    pub async fn health_check(&self) -> HealthReport {
        let targets: Vec<(VmId, String, String)> = {
            let vms = self.vms.lock().await;
            vms.iter()
                .filter(|vm| vm.status == VmStatus::Available)
                .map(|vm| (vm.id.clone(), vm.instance_id.clone(), vm.region.clone()))
                .collect()
        };

        let mut report = HealthReport::default();

        for (vm_id, instance_id, region) in targets {
            let lookup = self.inventory.describe_instance(&instance_id, &region).await;
            report.checked += 1;

            let details = match lookup {
                Ok(details) => details,
                Err(e) => {
                    warn!(vm_id = %vm_id, instance_id = %instance_id, error = %e, "inventory lookup failed");
                    report.errors += 1;
                    continue;
                }
            };

            let mut vms = self.vms.lock().await;
            let Some(index) = vms.iter().position(|vm| vm.id == vm_id) else {
                continue;
            };
            // Acquired or unregistered while the lookup was in flight.
            if vms[index].status != VmStatus::Available {
                continue;
            }

            let mut updated = vms[index].clone();
            let healthy = details.as_ref().is_some_and(|d| d.state.is_usable());
            if let Some(details) = details {
                updated.instance = Some(details);
            }
            if !healthy {
                updated.status = VmStatus::Unreachable;
                report.marked_unreachable += 1;
                warn!(
                    vm_id = %vm_id,
                    instance_id = %instance_id,
                    region = %region,
                    "instance gone, VM marked unreachable"
                );
            }
            updated.updated_at = Utc::now();

            if let Err(e) = self.store.upsert_vm(&updated).await {
                warn!(vm_id = %vm_id, error = %e, "failed to persist VM health");
                report.errors += 1;
                continue;
            }
            vms[index] = updated;
        }

        debug!(
            checked = report.checked,
            marked_unreachable = report.marked_unreachable,
            errors = report.errors,
            "VM health sweep complete"
        );
        report
    }

    /// Free every leased VM.
    ///
    /// Called on startup, when no job from a previous process can still be
    /// running. Returns the number of VMs freed.
    pub async fn release_stale_leases(&self) -> ControlResult<usize> {
        let mut vms = self.vms.lock().await;
        let mut freed = 0;

        for vm in vms.iter_mut() {
            if vm.lease.is_none() {
                continue;
            }

            let mut updated = vm.clone();
            if updated.status == VmStatus::Busy {
                updated.status = VmStatus::Available;
            }
            updated.lease = None;
            updated.updated_at = Utc::now();

            self.store.upsert_vm(&updated).await?;
            warn!(vm_id = %updated.id, "released VM leased by a previous process");
            *vm = updated;
            freed += 1;
        }

        Ok(freed)
    }

    /// List all VMs with their cached instance details.
    pub async fn list(&self) -> Vec<VmRecord> {
        self.vms.lock().await.clone()
    }

    /// Get a VM by ID.
    pub async fn get(&self, vm_id: &VmId) -> Option<VmRecord> {
        self.vms
            .lock()
            .await
            .iter()
            .find(|vm| &vm.id == vm_id)
            .cloned()
    }

    /// Count VMs by status.
    pub async fn counts(&self) -> PoolCounts {
        let vms = self.vms.lock().await;
        let mut counts = PoolCounts::default();
        for vm in vms.iter() {
            match vm.status {
                VmStatus::Available => counts.available += 1,
                VmStatus::Busy => counts.busy += 1,
                VmStatus::Unreachable => counts.unreachable += 1,
            }
        }
        counts
    }
}

impl std::fmt::Debug for VmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmPool").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::inventory::StaticInventory;
    use crate::store::{MemoryStore, VmStore};
    use crate::types::{InstanceState, JobKind};

    fn lease(id: &str) -> VmLease {
        VmLease {
            deployment_id: DeploymentId::new(id),
            kind: JobKind::Deploy,
        }
    }

    async fn pool_with(instances: &[(&str, &str)]) -> (VmPool, Arc<StaticInventory>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let inventory = Arc::new(StaticInventory::new());
        for (id, region) in instances {
            inventory.add_running(id, region, None);
        }

        let pool = VmPool::load(store.clone(), inventory.clone()).await.unwrap();
        for (id, region) in instances {
            pool.register(id, region).await.unwrap();
        }
        (pool, inventory, store)
    }

    #[tokio::test]
    async fn acquire_first_available_in_region() {
        let (pool, _, _) = pool_with(&[("i-1", "us-east-1"), ("i-2", "eu-west-1")]).await;

        let vm = pool
            .acquire("eu-west-1", lease("d1"))
            .await
            .unwrap()
            .expect("VM available");
        assert_eq!(vm.instance_id, "i-2");
        assert_eq!(vm.status, VmStatus::Busy);
        assert_eq!(vm.current_deployment_id(), Some(&DeploymentId::new("d1")));

        assert!(pool.acquire("eu-west-1", lease("d2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_job_cannot_hold_two_vms() {
        let (pool, _, _) = pool_with(&[("i-1", "us-east-1"), ("i-2", "us-east-1")]).await;

        pool.acquire("us-east-1", lease("d1")).await.unwrap().unwrap();
        let err = pool.acquire("us-east-1", lease("d1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_share_a_vm() {
        let (pool, _, _) = pool_with(&[("i-1", "us-east-1"), ("i-2", "us-east-1")]).await;
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire("us-east-1", lease(&format!("d{i}"))).await })
            })
            .collect();

        let mut acquired = Vec::new();
        for handle in handles {
            if let Some(vm) = handle.await.unwrap().unwrap() {
                acquired.push(vm.id);
            }
        }

        assert_eq!(acquired.len(), 2);
        assert_ne!(acquired[0], acquired[1]);
        assert_eq!(pool.counts().await.busy, 2);
    }

    #[tokio::test]
    async fn release_returns_vm_and_persists() {
        let (pool, _, store) = pool_with(&[("i-1", "us-east-1")]).await;

        let vm = pool.acquire("us-east-1", lease("d1")).await.unwrap().unwrap();

        // A stale release from another job is ignored.
        pool.release(&vm.id, &DeploymentId::new("other")).await.unwrap();
        assert_eq!(pool.get(&vm.id).await.unwrap().status, VmStatus::Busy);

        pool.release(&vm.id, &DeploymentId::new("d1")).await.unwrap();
        let released = pool.get(&vm.id).await.unwrap();
        assert_eq!(released.status, VmStatus::Available);
        assert!(released.lease.is_none());

        let persisted = store.list_vms().await.unwrap();
        assert_eq!(persisted[0].status, VmStatus::Available);
    }

    #[tokio::test]
    async fn register_requires_known_instance() {
        let (pool, _, _) = pool_with(&[]).await;
        let err = pool.register("i-ghost", "us-east-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(pool.list().await.is_empty());
    }

    #[tokio::test]
    async fn unregister_busy_vm_conflicts() {
        let (pool, _, _) = pool_with(&[("i-1", "us-east-1")]).await;
        let vm = pool.acquire("us-east-1", lease("d1")).await.unwrap().unwrap();

        let err = pool.unregister(&vm.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        pool.release(&vm.id, &DeploymentId::new("d1")).await.unwrap();
        pool.unregister(&vm.id).await.unwrap();
        assert!(pool.list().await.is_empty());
    }

    #[tokio::test]
    async fn health_check_marks_gone_instances_until_reregistered() {
        let (pool, inventory, _) = pool_with(&[("i-1", "us-east-1"), ("i-2", "us-east-1")]).await;

        inventory.set_state("i-1", "us-east-1", InstanceState::Terminated);
        inventory.remove("i-2", "us-east-1");

        let report = pool.health_check().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.marked_unreachable, 2);
        assert!(pool.acquire("us-east-1", lease("d1")).await.unwrap().is_none());

        // The instance coming back is not enough on its own.
        inventory.set_state("i-1", "us-east-1", InstanceState::Running);
        pool.health_check().await;
        assert!(pool.acquire("us-east-1", lease("d1")).await.unwrap().is_none());

        let vm = pool.register("i-1", "us-east-1").await.unwrap();
        assert_eq!(vm.status, VmStatus::Available);
        assert!(pool.acquire("us-east-1", lease("d1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reregistering_a_terminated_instance_takes_it_out_of_service() {
        let (pool, inventory, store) =
            pool_with(&[("i-1", "us-east-1"), ("i-2", "us-east-1")]).await;
        let busy = pool.acquire("us-east-1", lease("d1")).await.unwrap().unwrap();

        inventory.set_state("i-1", "us-east-1", InstanceState::Terminated);
        inventory.set_state("i-2", "us-east-1", InstanceState::Terminated);

        let idle = pool.register("i-2", "us-east-1").await.unwrap();
        assert_eq!(idle.status, VmStatus::Unreachable);
        let stored = store.list_vms().await.unwrap();
        let stored = stored.iter().find(|vm| vm.id == idle.id).unwrap();
        assert_eq!(stored.status, VmStatus::Unreachable);
        assert!(pool.acquire("us-east-1", lease("d2")).await.unwrap().is_none());

        let leased = pool.register(&busy.instance_id, "us-east-1").await.unwrap();
        assert_eq!(leased.status, VmStatus::Busy);
        assert_eq!(leased.current_deployment_id(), Some(&DeploymentId::new("d1")));
    }

    #[tokio::test]
    async fn health_check_skips_busy_vms() {
        let (pool, inventory, _) = pool_with(&[("i-1", "us-east-1")]).await;
        let vm = pool.acquire("us-east-1", lease("d1")).await.unwrap().unwrap();

        inventory.remove("i-1", "us-east-1");
        let report = pool.health_check().await;
        assert_eq!(report.checked, 0);
        assert_eq!(pool.get(&vm.id).await.unwrap().status, VmStatus::Busy);
    }

    #[tokio::test]
    async fn stale_leases_are_released_on_load() {
        let (pool, _, store) = pool_with(&[("i-1", "us-east-1")]).await;
        pool.acquire("us-east-1", lease("d1")).await.unwrap().unwrap();
        drop(pool);

        let reloaded = VmPool::load(store, Arc::new(StaticInventory::new()))
            .await
            .unwrap();
        assert_eq!(reloaded.counts().await.busy, 1);
        assert_eq!(reloaded.release_stale_leases().await.unwrap(), 1);
        assert_eq!(reloaded.counts().await.available, 1);
    }
}
