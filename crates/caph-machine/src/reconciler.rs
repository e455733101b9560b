//! Lifecycle state machine for a single HarvesterMachine.
//!
//! A pass picks exactly one [`Step`] from the current objects, performs it on
//! a working copy of the machine, and persists whatever changed. Every side
//! effect on the platform is idempotent on its own, so an interrupted pass is
//! completed by the next one.

use std::sync::Arc;
use std::time::Duration;

use caph_api::{Cluster, HarvesterMachine, HarvesterMachineStatus, Machine, VirtualMachine};
use kube::ResourceExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::scope::{self, Resolution};
use crate::vmspec::{self, VmOptions};
use crate::{
    Action, Error, ManagementStore, ObjectKey, PlatformConnector, Result, Scope, address, claim,
    image,
};

pub const MACHINE_FINALIZER: &str = "harvestermachine.infrastructure.cluster.x-k8s.io";
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Delay before re-checking a machine whose VM is not reporting addresses yet.
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// The single transition a pass performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Delete,
    Paused,
    AddFinalizer,
    AwaitInfrastructure,
    AwaitBootstrapData,
    Provision,
}

/// Decide the step for the given objects. Earlier conditions take precedence.
pub fn next_step(harvester_machine: &HarvesterMachine, machine: &Machine, cluster: &Cluster) -> Step {
    let metadata = &harvester_machine.metadata;

    if metadata.deletion_timestamp.is_some() {
        Step::Delete
    } else if cluster.spec.paused || harvester_machine.annotations().contains_key(PAUSED_ANNOTATION)
    {
        Step::Paused
    } else if !harvester_machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER) {
        Step::AddFinalizer
    } else if !cluster
        .status
        .as_ref()
        .is_some_and(|s| s.infrastructure_ready)
    {
        Step::AwaitInfrastructure
    } else if machine.spec.bootstrap.data_secret_name.is_none() {
        Step::AwaitBootstrapData
    } else {
        Step::Provision
    }
}

/// Run one pass over a resolved scope. Changes to the machine are left on
/// `scope.harvester_machine` for the caller to persist.
pub async fn reconcile_scope(scope: &mut Scope) -> Result<Action> {
    let step = next_step(&scope.harvester_machine, &scope.machine, &scope.cluster);
    debug!(?step, "selected step");

    match step {
        Step::Delete => reconcile_delete(scope).await,
        Step::Paused => {
            info!("reconciliation is paused for this object");
            Ok(Action::await_change())
        }
        Step::AddFinalizer => {
            scope
                .harvester_machine
                .finalizers_mut()
                .push(MACHINE_FINALIZER.to_string());
            info!(finalizer = MACHINE_FINALIZER, "added finalizer");
            Ok(Action::requeue(Duration::ZERO))
        }
        Step::AwaitInfrastructure => {
            info!("waiting for cluster infrastructure to be ready");
            Ok(Action::await_change())
        }
        Step::AwaitBootstrapData => {
            info!("waiting for the Machine's bootstrap data secret");
            Ok(Action::await_change())
        }
        Step::Provision => provision(scope).await,
    }
}

/// Remove the platform resources, then release the finalizer.
pub async fn reconcile_delete(scope: &mut Scope) -> Result<Action> {
    info!("deleting HarvesterMachine");
    let namespace = scope.target_namespace().to_string();
    let name = scope.name().to_string();

    let secret = scope.cloud_init_secret_name();
    scope.ensure_active()?;
    match scope.platform.delete_secret(&namespace, &secret).await {
        Ok(()) => info!(secret = %secret, "cloud-init secret deleted"),
        Err(e) if e.is_not_found() => info!(secret = %secret, "cloud-init secret not found, skipping"),
        Err(e) => return Err(e),
    }

    scope.ensure_active()?;
    match scope.platform.delete_vm(&namespace, &name).await {
        Ok(()) => info!(vm = %name, "virtual machine deleted"),
        Err(e) if e.is_not_found() => info!(vm = %name, "virtual machine not found, skipping"),
        Err(e) => return Err(e),
    }

    let finalizers = scope.harvester_machine.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != MACHINE_FINALIZER);
    if finalizers.len() == before {
        return Err(Error::FinalizerMissing {
            finalizer: MACHINE_FINALIZER.to_string(),
            machine: scope.key().to_string(),
        });
    }

    info!("released finalizer");
    Ok(Action::await_change())
}

async fn provision(scope: &mut Scope) -> Result<Action> {
    scope.ensure_active()?;
    let existing = scope
        .platform
        .get_vm(scope.target_namespace(), scope.name())
        .await?;

    match existing {
        Some(vm) => observe(scope, &vm).await,
        None => {
            create_vm(scope).await?;
            Ok(Action::requeue(NOT_READY_REQUEUE))
        }
    }
}

async fn create_vm(scope: &Scope) -> Result<()> {
    scope.ensure_active()?;
    let (volume, resolved) =
        image::resolve_volume_image(scope.platform.as_ref(), &scope.harvester_machine.spec.volumes)
            .await?;

    let claim_name = claim::claim_name(scope.name());
    let claim = claim::boot_claim(volume, &claim_name, scope.target_namespace(), &resolved)?;
    let annotation = claim::claim_templates_annotation(&[claim])?;

    let vm = vmspec::synthesize(scope, &claim_name, annotation).await?;

    scope.ensure_active()?;
    scope.platform.create_vm(&vm).await?;
    info!(
        vm = %vm.name_any(),
        namespace = %scope.target_namespace(),
        image = %resolved.id(),
        claim = %claim_name,
        "virtual machine created"
    );
    Ok(())
}

/// Project a running VM's instance addresses into the machine status.
async fn observe(scope: &mut Scope, vm: &VirtualMachine) -> Result<Action> {
    let was_ready = scope
        .harvester_machine
        .status
        .as_ref()
        .is_some_and(|s| s.ready);
    let settled = if was_ready {
        Action::await_change()
    } else {
        Action::requeue(NOT_READY_REQUEUE)
    };

    if !vm.is_running() {
        debug!(vm = %vm.name_any(), "virtual machine is not running");
        return Ok(settled);
    }

    scope.ensure_active()?;
    let addresses = match address::extract_addresses(scope.platform.as_ref(), vm).await {
        Ok(addresses) => addresses,
        Err(Error::NoInstancesFound(key)) => {
            debug!(vm = %key, "no instance reported yet");
            return Ok(settled);
        }
        Err(e) => return Err(e),
    };

    if addresses.is_empty() {
        debug!(vm = %vm.name_any(), "instance has no addresses yet");
        return Ok(settled);
    }

    let status = scope
        .harvester_machine
        .status
        .get_or_insert_with(HarvesterMachineStatus::default);
    if !status.ready || status.addresses != addresses {
        info!(vm = %vm.name_any(), addresses = ?addresses, "machine is ready");
    }
    status.addresses = addresses;
    status.ready = true;
    Ok(Action::await_change())
}

/// Drives passes for machines looked up by key.
pub struct MachineReconciler {
    store: Arc<dyn ManagementStore>,
    connector: Arc<dyn PlatformConnector>,
    options: VmOptions,
}

impl MachineReconciler {
    pub fn new(
        store: Arc<dyn ManagementStore>,
        connector: Arc<dyn PlatformConnector>,
        options: VmOptions,
    ) -> Self {
        Self {
            store,
            connector,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ManagementStore> {
        &self.store
    }

    /// Reconcile the machine named by `key`.
    ///
    /// The machine is persisted after the pass whenever it changed. A failed
    /// write turns a successful pass into an error; when the pass already
    /// failed, its error is returned and the write failure is only logged.
    #[instrument(skip(self, cancel), fields(machine = %key.name, namespace = %key.namespace))]
    pub async fn reconcile(&self, key: &ObjectKey, cancel: CancellationToken) -> Result<Action> {
        debug!("reconciling HarvesterMachine");

        let Some(original) = self
            .store
            .get_harvester_machine(&key.namespace, &key.name)
            .await?
        else {
            debug!("HarvesterMachine not found, nothing to do");
            return Ok(Action::await_change());
        };

        let resolution = scope::resolve(
            original.clone(),
            self.store.clone(),
            self.connector.as_ref(),
            self.options.clone(),
            cancel,
        )
        .await?;

        let mut scope = match resolution {
            Resolution::Ready(scope) => scope,
            Resolution::Waiting(reason) => {
                info!(reason, "owner chain incomplete");
                return Ok(Action::await_change());
            }
        };

        let outcome = reconcile_scope(&mut scope).await;
        let persisted = self.persist(&original, &scope.harvester_machine).await;

        match (outcome, persisted) {
            (Ok(action), Ok(())) => Ok(action),
            (Ok(_), Err(e)) => {
                error!(error = %e, "failed to persist HarvesterMachine");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(persist_err)) => {
                error!(error = %persist_err, "failed to persist HarvesterMachine");
                Err(e)
            }
        }
    }

    /// Write back the finalizers, then the status, each only when it changed.
    async fn persist(&self, original: &HarvesterMachine, current: &HarvesterMachine) -> Result<()> {
        let namespace = current.namespace().unwrap_or_default();
        let name = current.name_any();

        if current.finalizers() != original.finalizers() {
            self.store
                .patch_harvester_machine(&namespace, &name, &finalizer_patch(original, current))
                .await?;
            debug!("HarvesterMachine finalizers patched");
        }

        if current.status != original.status {
            if current.metadata.deletion_timestamp.is_some() && current.finalizers().is_empty() {
                warn!("skipping status patch for a released HarvesterMachine");
                return Ok(());
            }
            let status = current.status.clone().unwrap_or_default();
            self.store
                .patch_harvester_machine_status(&namespace, &name, &status_patch(&status))
                .await?;
            debug!("HarvesterMachine status patched");
        }

        Ok(())
    }
}

/// Merge patch replacing the finalizer list. The resource version read at
/// the start of the pass guards against racing writers.
pub fn finalizer_patch(original: &HarvesterMachine, current: &HarvesterMachine) -> Value {
    json!({
        "metadata": {
            "finalizers": current.finalizers(),
            "resourceVersion": original.resource_version(),
        }
    })
}

/// Merge patch for the status subresource carrying only the fields this
/// provider owns.
pub fn status_patch(status: &HarvesterMachineStatus) -> Value {
    json!({
        "status": {
            "ready": status.ready,
            "addresses": status.addresses,
        }
    })
}
