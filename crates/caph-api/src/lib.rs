//! Kubernetes resources the Harvester infrastructure provider reads and
//! writes, and client construction for the clusters it talks to.
//!
//! `HarvesterMachine` and `HarvesterCluster` are owned here and carry full
//! schemas. Cluster API, KubeVirt and Harvester types are declared with only
//! the fields the provider touches; their CRDs are installed by their own
//! projects.

pub mod capi;
pub mod client;
pub mod harvester;
pub mod infrastructure;
pub mod kubevirt;

pub use capi::{
    Bootstrap, Cluster, ClusterSpec, ClusterStatus, Machine, MachineAddress, MachineAddressType,
    MachineSpec,
};
pub use client::{Error, client_from_kubeconfig, create_client};
pub use harvester::{KeyPair, KeyPairSpec, VirtualMachineImage, VirtualMachineImageSpec};
pub use infrastructure::{
    HarvesterCluster, HarvesterClusterSpec, HarvesterMachine, HarvesterMachineSpec,
    HarvesterMachineStatus, MachineVolume, SecretKeyReference,
};
pub use kubevirt::{
    BridgeBinding, CloudInitNoCloudSource, Cpu, Devices, Disk, DiskTarget, DomainSpec, Input,
    Interface, MultusNetwork, Network, PersistentVolumeClaimVolumeSource, VirtualMachine,
    VirtualMachineInstance, VirtualMachineInstanceNetworkInterface, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VirtualMachineInstanceTemplateSpec, VirtualMachineSpec,
    VirtualMachineStatus, Volume,
};
