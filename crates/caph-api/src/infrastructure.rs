//! Provider resources (`infrastructure.cluster.x-k8s.io/v1alpha1`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::capi::MachineAddress;

/// A machine request fulfilled by a KubeVirt VM on Harvester.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "HarvesterMachine",
    plural = "harvestermachines",
    shortname = "hvm",
    status = "HarvesterMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetNamespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HarvesterMachineSpec {
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Harvester namespace the VM and its secrets live in.
    pub target_namespace: String,

    /// Used as cores, sockets and threads alike.
    pub cpu: u32,

    /// Memory request, as a Kubernetes quantity.
    pub memory: String,

    #[serde(default)]
    pub volumes: Vec<MachineVolume>,

    /// Name of a Harvester `KeyPair` in the target namespace.
    pub ssh_key_pair: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    /// `<namespace>/<display-name>` of the image the volume boots from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarvesterMachineStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "HarvesterCluster",
    plural = "harvesterclusters",
    shortname = "hvc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HarvesterClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default)]
    pub target_namespace: String,
    /// Secret holding a kubeconfig for the Harvester cluster under `kubeconfig`.
    pub identity_secret: SecretKeyReference,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretKeyReference {
    pub namespace: String,
    pub name: String,
}
