//! Machine reconciliation for the Harvester infrastructure provider.
//!
//! Keeps a `HarvesterMachine` in the management cluster in sync with a
//! KubeVirt `VirtualMachine` on Harvester: adds the finalizer, synthesizes and
//! creates the VM (boot disk claim, cloud-init secret), reports addresses
//! once the VM runs, and tears everything down on deletion.

pub mod address;
pub mod claim;
pub mod cloudinit;
pub mod harvester;
pub mod image;
pub mod reconciler;
pub mod scope;
pub mod store;
pub mod vmspec;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use caph_api::{
    Cluster, HarvesterCluster, HarvesterMachine, KeyPair, Machine, VirtualMachine,
    VirtualMachineImage, VirtualMachineInstance,
};
use k8s_openapi::api::core::v1::Secret;

#[cfg(test)]
use mockall::automock;

pub use kube::runtime::controller::Action;
pub use reconciler::{MachineReconciler, Step};
pub use scope::Scope;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to connect to Harvester: {0}")]
    Connect(#[from] caph_api::Error),

    #[error("image reference {0:?} is malformed, expecting <NAMESPACE>/<NAME>")]
    MalformedReference(String),

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("no volume references an image")]
    NoImageVolume,

    #[error("{0} volumes reference an image, exactly one is supported")]
    MultipleImageVolumes(usize),

    #[error("image volume has no volumeSize")]
    MissingVolumeSize,

    #[error("ssh key pair {0} not found")]
    SshKeyNotFound(String),

    #[error("bootstrap data secret {0} has no value")]
    BootstrapDataMissing(String),

    #[error("bootstrap data in secret {0} is not valid UTF-8")]
    BootstrapDataEncoding(String),

    #[error("cloud-init fragment {index} is not a mapping: {reason}")]
    FragmentParse { index: usize, reason: String },

    #[error("cloud-init section {key} already holds a non-list value")]
    AccumulatorType { key: String },

    #[error("cloud-init key {key} set to conflicting values")]
    ConflictingValue { key: String },

    #[error("failed to render cloud-init: {0}")]
    Render(serde_yaml::Error),

    #[error("unable to merge cloud-init for {machine}: {source}")]
    CloudInitMerge {
        machine: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to encode volume claim templates: {0}")]
    ClaimEncode(#[from] serde_json::Error),

    #[error("no VM instances found for VM {0}")]
    NoInstancesFound(String),

    #[error("finalizer {finalizer} is not set on HarvesterMachine {machine}")]
    FinalizerMissing { finalizer: String, machine: String },

    #[error("{kind} {key} not found")]
    ObjectMissing { kind: &'static str, key: String },

    #[error("identity secret {0} has no kubeconfig")]
    MissingIdentitySecret(String),

    #[error("reconciliation cancelled")]
    Cancelled,
}

impl Error {
    /// True when a platform or store call reported the object as absent.
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True when a create was refused because the object already exists.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Namespaced name of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Operations against the virtualization platform.
///
/// Deletes and creates report absence and pre-existence through
/// `Error::is_not_found` / `Error::is_conflict`; lookups return `None`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>>;

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_vm_instances(&self, namespace: &str) -> Result<Vec<VirtualMachineInstance>>;

    async fn list_images(&self, namespace: &str) -> Result<Vec<VirtualMachineImage>>;

    async fn get_keypair(&self, namespace: &str, name: &str) -> Result<Option<KeyPair>>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Operations against the management cluster holding the Cluster API objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementStore: Send + Sync {
    async fn get_harvester_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HarvesterMachine>>;

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    async fn get_harvester_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HarvesterCluster>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Apply a JSON merge patch to the machine object.
    async fn patch_harvester_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Apply a JSON merge patch to the machine's status subresource.
    async fn patch_harvester_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;
}

/// Builds a platform client from the credentials referenced by a
/// `HarvesterCluster`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn Platform>>;
}
