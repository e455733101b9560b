//! Synthesis of the KubeVirt `VirtualMachine` backing a HarvesterMachine.

use std::collections::BTreeMap;

use caph_api::{
    BridgeBinding, CloudInitNoCloudSource, Cpu, Devices, Disk, DiskTarget, DomainSpec,
    HarvesterMachine, Input, Interface, KeyPair, MultusNetwork, Network,
    PersistentVolumeClaimVolumeSource, VirtualMachine, VirtualMachineInstanceSpec,
    VirtualMachineInstanceTemplateSpec, VirtualMachineSpec, Volume,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    Affinity, LocalObjectReference, PodAffinityTerm, PodAntiAffinity, ResourceRequirements,
    Secret, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::claim::VOLUME_CLAIM_TEMPLATES_ANNOTATION;
use crate::cloudinit::CloudInitMerger;
use crate::scope::secret_value;
use crate::{Error, Result, Scope};

pub const CREATOR_LABEL: &str = "harvesterhci.io/creator";
pub const VM_NAME_LABEL: &str = "harvesterhci.io/vmName";
pub const VM_NAME_PREFIX_LABEL: &str = "harvesterhci.io/vmNamePrefix";

pub const NETWORK_IPS_ANNOTATION: &str = "networks.harvesterhci.io/ips";
pub const DISK_NAMES_ANNOTATION: &str = "harvesterhci.io/diskNames";
pub const SSH_NAMES_ANNOTATION: &str = "harvesterhci.io/sshNames";

/// Key holding the bootstrap provider's user data in its secret.
pub const BOOTSTRAP_DATA_KEY: &str = "value";
/// Key Harvester reads cloud-init user data from.
pub const USER_DATA_KEY: &str = "userData";

const BOOT_DISK: &str = "disk-0";
const CLOUD_INIT_DISK: &str = "cloudinitdisk";
const NIC_NAME: &str = "nic-1";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

const BASE_CLOUD_INIT: &str = r#"package_update: true
packages:
  - qemu-guest-agent
runcmd:
  - - systemctl
    - enable
    - --now
    - qemu-guest-agent.service
"#;

/// Site-level settings applied to every synthesized VM.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Multus network the VM's single NIC attaches to.
    pub network_name: String,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            network_name: "vlan1".into(),
        }
    }
}

/// Labels shared by the VM and its instance template.
pub fn vm_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CREATOR_LABEL.to_string(), "harvester".to_string()),
        (VM_NAME_LABEL.to_string(), name.to_string()),
        (VM_NAME_PREFIX_LABEL.to_string(), name.to_string()),
    ])
}

/// Build the complete VM for `scope`, creating its cloud-init secret on the
/// way. Nothing is submitted for the VM itself; the caller creates it.
pub async fn synthesize(
    scope: &Scope,
    claim_name: &str,
    claim_annotation: String,
) -> Result<VirtualMachine> {
    let key_pair = fetch_key_pair(scope).await?;
    let user_data = build_user_data(scope, &key_pair.spec.public_key).await?;
    ensure_cloud_init_secret(scope, &user_data).await?;

    Ok(vm_definition(
        &scope.harvester_machine,
        &scope.options,
        &key_pair.name_any(),
        claim_name,
        claim_annotation,
    ))
}

async fn fetch_key_pair(scope: &Scope) -> Result<KeyPair> {
    scope.ensure_active()?;
    let namespace = scope.target_namespace();
    let name = &scope.harvester_machine.spec.ssh_key_pair;

    match scope.platform.get_keypair(namespace, name).await? {
        Some(key) if !key.spec.public_key.trim().is_empty() => {
            debug!(key_pair = %name, "ssh key pair found");
            Ok(key)
        }
        _ => Err(Error::SshKeyNotFound(format!("{namespace}/{name}"))),
    }
}

/// User data from the bootstrap provider, referenced by the owning Machine.
async fn bootstrap_user_data(scope: &Scope) -> Result<String> {
    scope.ensure_active()?;
    let namespace = scope.machine.namespace().unwrap_or_default();
    let name = scope
        .machine
        .spec
        .bootstrap
        .data_secret_name
        .as_deref()
        .unwrap_or_default();
    let key = format!("{namespace}/{name}");

    let secret = scope
        .store
        .get_secret(&namespace, name)
        .await?
        .ok_or_else(|| Error::BootstrapDataMissing(key.clone()))?;

    let data = secret_value(&secret, BOOTSTRAP_DATA_KEY)
        .ok_or_else(|| Error::BootstrapDataMissing(key.clone()))?;
    String::from_utf8(data.to_vec()).map_err(|_| Error::BootstrapDataEncoding(key))
}

fn ssh_fragment(public_key: &str) -> String {
    serde_json::json!({ "ssh_authorized_keys": [public_key.trim()] }).to_string()
}

async fn build_user_data(scope: &Scope, public_key: &str) -> Result<String> {
    let bootstrap = bootstrap_user_data(scope).await?;
    let fragments = [BASE_CLOUD_INIT.to_string(), ssh_fragment(public_key), bootstrap];

    CloudInitMerger::default()
        .merge(&fragments)
        .and_then(|doc| doc.render())
        .map_err(|e| Error::CloudInitMerge {
            machine: scope.key().to_string(),
            source: Box::new(e),
        })
}

/// Create the cloud-init secret. An existing secret is left as is: the VM
/// only reads user data at first boot.
async fn ensure_cloud_init_secret(scope: &Scope, user_data: &str) -> Result<()> {
    scope.ensure_active()?;
    let name = scope.cloud_init_secret_name();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(scope.target_namespace().to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            USER_DATA_KEY.to_string(),
            ByteString(user_data.as_bytes().to_vec()),
        )])),
        ..Default::default()
    };

    match scope.platform.create_secret(&secret).await {
        Ok(_) => {
            info!(secret = %name, "cloud-init secret created");
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            info!(secret = %name, "cloud-init secret already exists, leaving it untouched");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Assemble the VM object.
///
/// CPU cores, sockets and threads all take the requested count.
pub fn vm_definition(
    machine: &HarvesterMachine,
    options: &VmOptions,
    key_pair_name: &str,
    claim_name: &str,
    claim_annotation: String,
) -> VirtualMachine {
    let name = machine.name_any();
    let name = name.as_str();
    let labels = vm_labels(name);
    let cpu = machine.spec.cpu;

    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(machine.spec.target_namespace.clone()),
        labels: Some(labels.clone()),
        annotations: Some(BTreeMap::from([
            (VOLUME_CLAIM_TEMPLATES_ANNOTATION.to_string(), claim_annotation),
            (NETWORK_IPS_ANNOTATION.to_string(), "[]".to_string()),
        ])),
        ..Default::default()
    };

    let template_metadata = ObjectMeta {
        labels: Some(labels),
        annotations: Some(BTreeMap::from([
            (DISK_NAMES_ANNOTATION.to_string(), json_list(claim_name)),
            (SSH_NAMES_ANNOTATION.to_string(), json_list(key_pair_name)),
        ])),
        ..Default::default()
    };

    let virtio = || Some(DiskTarget { bus: "virtio".into() });

    let spec = VirtualMachineInstanceSpec {
        hostname: Some(name.to_string()),
        networks: vec![Network {
            name: NIC_NAME.into(),
            multus: Some(MultusNetwork {
                network_name: options.network_name.clone(),
            }),
        }],
        volumes: vec![
            Volume {
                name: BOOT_DISK.into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                }),
                cloud_init_no_cloud: None,
            },
            Volume {
                name: CLOUD_INIT_DISK.into(),
                persistent_volume_claim: None,
                cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                    user_data_secret_ref: Some(LocalObjectReference {
                        name: format!("{name}-cloud-init"),
                    }),
                }),
            },
        ],
        domain: DomainSpec {
            cpu: Some(Cpu {
                cores: cpu,
                sockets: cpu,
                threads: cpu,
            }),
            devices: Devices {
                inputs: vec![Input {
                    bus: "usb".into(),
                    type_: "tablet".into(),
                    name: "tablet".into(),
                }],
                interfaces: vec![Interface {
                    name: NIC_NAME.into(),
                    model: Some("virtio".into()),
                    bridge: Some(BridgeBinding {}),
                }],
                disks: vec![
                    Disk {
                        name: BOOT_DISK.into(),
                        disk: virtio(),
                    },
                    Disk {
                        name: CLOUD_INIT_DISK.into(),
                        disk: virtio(),
                    },
                ],
            },
            resources: ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity(machine.spec.memory.clone()),
                )])),
                ..Default::default()
            },
        },
        affinity: Some(anti_affinity(name)),
    };

    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            running: Some(true),
            template: VirtualMachineInstanceTemplateSpec {
                metadata: template_metadata,
                spec,
            },
        },
    );
    vm.metadata = metadata;
    vm
}

/// Prefer spreading VMs sharing this name prefix across hosts.
fn anti_affinity(name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 1,
                    pod_affinity_term: PodAffinityTerm {
                        topology_key: HOSTNAME_TOPOLOGY_KEY.into(),
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                VM_NAME_PREFIX_LABEL.to_string(),
                                name.to_string(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn json_list(item: &str) -> String {
    serde_json::json!([item]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::tests::{api_error, harvester_machine, meta, scope, secret};
    use crate::{MockManagementStore, MockPlatform};
    use caph_api::KeyPairSpec;
    use std::sync::{Arc, Mutex};

    const BOOTSTRAP: &str = "#cloud-config\nruncmd:\n  - kubeadm join --config /run/kubeadm/kubeadm-join-config.yaml\nwrite_files:\n  - path: /run/kubeadm/kubeadm-join-config.yaml\n    content: x\n";

    fn key_pair(public_key: &str) -> KeyPair {
        let mut key = KeyPair::new(
            "capi-key",
            KeyPairSpec {
                public_key: public_key.into(),
            },
        );
        key.metadata = meta("vms", "capi-key");
        key
    }

    fn bootstrap_store(payload: Option<&'static [u8]>) -> MockManagementStore {
        let mut store = MockManagementStore::new();
        store
            .expect_get_secret()
            .withf(|ns, name| ns == "capi" && name == "worker-0-bootstrap")
            .returning(move |_, _| {
                Ok(Some(match payload {
                    Some(data) => secret("capi", "worker-0-bootstrap", &[(BOOTSTRAP_DATA_KEY, data)]),
                    None => secret("capi", "worker-0-bootstrap", &[]),
                }))
            });
        store
    }

    fn platform_with_key(public_key: &'static str) -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform
            .expect_get_keypair()
            .withf(|ns, name| ns == "vms" && name == "capi-key")
            .returning(move |_, _| Ok(Some(key_pair(public_key))));
        platform
    }

    #[test]
    fn definition_carries_compute_disks_network_and_affinity() {
        let vm = vm_definition(
            &harvester_machine("worker-0"),
            &VmOptions::default(),
            "capi-key",
            "worker-0-disk-0-abcde",
            "[]".into(),
        );

        assert_eq!(vm.name_any(), "worker-0");
        assert_eq!(vm.namespace().as_deref(), Some("vms"));
        assert_eq!(vm.spec.running, Some(true));
        assert_eq!(vm.annotations()[NETWORK_IPS_ANNOTATION], "[]");

        let template = &vm.spec.template;
        let annotations = template.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[DISK_NAMES_ANNOTATION], r#"["worker-0-disk-0-abcde"]"#);
        assert_eq!(annotations[SSH_NAMES_ANNOTATION], r#"["capi-key"]"#);
        assert_eq!(
            template.metadata.labels.as_ref().unwrap()[VM_NAME_PREFIX_LABEL],
            "worker-0"
        );

        let spec = &template.spec;
        assert_eq!(spec.hostname.as_deref(), Some("worker-0"));
        assert_eq!(
            spec.domain.cpu,
            Some(Cpu {
                cores: 2,
                sockets: 2,
                threads: 2
            })
        );
        assert_eq!(
            spec.domain.resources.requests.as_ref().unwrap()["memory"],
            Quantity("4Gi".into())
        );
        assert_eq!(
            spec.networks[0].multus.as_ref().map(|m| m.network_name.as_str()),
            Some("vlan1")
        );

        let boot = &spec.volumes[0];
        assert_eq!(
            boot.persistent_volume_claim.as_ref().map(|p| p.claim_name.as_str()),
            Some("worker-0-disk-0-abcde")
        );
        let cloud_init = spec.volumes[1].cloud_init_no_cloud.as_ref().unwrap();
        assert_eq!(
            cloud_init.user_data_secret_ref.as_ref().map(|r| r.name.as_str()),
            Some("worker-0-cloud-init")
        );

        let json = serde_json::to_value(&vm).unwrap();
        let term = &json["spec"]["template"]["spec"]["affinity"]["podAntiAffinity"]
            ["preferredDuringSchedulingIgnoredDuringExecution"][0];
        assert_eq!(term["weight"], 1);
        assert_eq!(term["podAffinityTerm"]["topologyKey"], HOSTNAME_TOPOLOGY_KEY);
        assert_eq!(
            term["podAffinityTerm"]["labelSelector"]["matchLabels"][VM_NAME_PREFIX_LABEL],
            "worker-0"
        );
        assert_eq!(json["apiVersion"], "kubevirt.io/v1");
        assert_eq!(json["kind"], "VirtualMachine");
    }

    #[tokio::test]
    async fn secret_carries_merged_user_data() {
        let created: Arc<Mutex<Option<Secret>>> = Arc::new(Mutex::new(None));
        let captured = created.clone();

        let mut platform = platform_with_key("ssh-ed25519 AAAAC3Nza capi@mgmt\n");
        platform.expect_create_secret().times(1).returning(move |s| {
            *captured.lock().unwrap() = Some(s.clone());
            Ok(s.clone())
        });

        let scope = scope("worker-0", platform, bootstrap_store(Some(BOOTSTRAP.as_bytes())));
        let vm = synthesize(&scope, "worker-0-disk-0-abcde", "[]".into())
            .await
            .unwrap();
        assert_eq!(vm.name_any(), "worker-0");

        let secret = created.lock().unwrap().clone().unwrap();
        assert_eq!(secret.name_any(), "worker-0-cloud-init");
        assert_eq!(secret.namespace().as_deref(), Some("vms"));

        let user_data = std::str::from_utf8(secret_value(&secret, USER_DATA_KEY).unwrap()).unwrap();
        assert!(user_data.starts_with("#cloud-config\n"));
        let doc: serde_yaml::Mapping = serde_yaml::from_str(user_data).unwrap();
        let runcmd = doc.get("runcmd").and_then(|v| v.as_sequence()).unwrap();
        assert_eq!(runcmd.len(), 2);
        let keys = doc
            .get("ssh_authorized_keys")
            .and_then(|v| v.as_sequence())
            .unwrap();
        assert_eq!(keys[0].as_str(), Some("ssh-ed25519 AAAAC3Nza capi@mgmt"));
        assert!(doc.get("write_files").is_some());
        assert_eq!(doc.get("package_update").and_then(|v| v.as_bool()), Some(true));
    }

    #[tokio::test]
    async fn missing_key_pair_aborts_before_any_write() {
        let mut platform = MockPlatform::new();
        platform.expect_get_keypair().returning(|_, _| Ok(None));
        platform.expect_create_secret().never();

        let scope = scope("worker-0", platform, MockManagementStore::new());
        let err = synthesize(&scope, "c", "[]".into()).await.unwrap_err();
        assert!(matches!(err, Error::SshKeyNotFound(k) if k == "vms/capi-key"));
    }

    #[tokio::test]
    async fn empty_public_key_counts_as_missing() {
        let mut platform = platform_with_key("  ");
        platform.expect_create_secret().never();

        let scope = scope("worker-0", platform, MockManagementStore::new());
        let err = synthesize(&scope, "c", "[]".into()).await.unwrap_err();
        assert!(matches!(err, Error::SshKeyNotFound(_)));
    }

    #[tokio::test]
    async fn bootstrap_secret_without_value_is_missing_data() {
        let mut platform = platform_with_key("ssh-rsa AAAA");
        platform.expect_create_secret().never();

        let scope = scope("worker-0", platform, bootstrap_store(None));
        let err = synthesize(&scope, "c", "[]".into()).await.unwrap_err();
        assert!(matches!(err, Error::BootstrapDataMissing(k) if k == "capi/worker-0-bootstrap"));
    }

    #[tokio::test]
    async fn bootstrap_data_that_is_not_utf8_is_rejected() {
        let mut platform = platform_with_key("ssh-rsa AAAA");
        platform.expect_create_secret().never();

        let scope = scope(
            "worker-0",
            platform,
            bootstrap_store(Some(&b"runcmd:\n  - echo \xff\xfe\n"[..])),
        );
        let err = synthesize(&scope, "c", "[]".into()).await.unwrap_err();
        assert!(matches!(err, Error::BootstrapDataEncoding(k) if k == "capi/worker-0-bootstrap"));
    }

    #[tokio::test]
    async fn malformed_bootstrap_data_is_wrapped_with_machine_context() {
        let mut platform = platform_with_key("ssh-rsa AAAA");
        platform.expect_create_secret().never();

        let scope = scope("worker-0", platform, bootstrap_store(Some(&b"runcmd: [unclosed"[..])));
        let err = synthesize(&scope, "c", "[]".into()).await.unwrap_err();
        match err {
            Error::CloudInitMerge { machine, source } => {
                assert_eq!(machine, "capi/worker-0");
                assert!(matches!(*source, Error::FragmentParse { index: 2, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn existing_secret_is_accepted() {
        let mut platform = platform_with_key("ssh-rsa AAAA");
        platform
            .expect_create_secret()
            .returning(|_| Err(api_error(409, "AlreadyExists")));

        let scope = scope("worker-0", platform, bootstrap_store(Some(BOOTSTRAP.as_bytes())));
        assert!(synthesize(&scope, "c", "[]".into()).await.is_ok());
    }

    #[tokio::test]
    async fn other_secret_failures_are_fatal() {
        let mut platform = platform_with_key("ssh-rsa AAAA");
        platform
            .expect_create_secret()
            .returning(|_| Err(api_error(403, "Forbidden")));

        let scope = scope("worker-0", platform, bootstrap_store(Some(BOOTSTRAP.as_bytes())));
        let err = synthesize(&scope, "c", "[]".into()).await.unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref r)) if r.code == 403));
    }
}
