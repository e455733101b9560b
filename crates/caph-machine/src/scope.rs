//! Per-pass context resolved from the machine's owner chain.
//!
//! HarvesterMachine → owning CAPI Machine (owner reference) → Cluster
//! (cluster-name label) → HarvesterCluster (infrastructure ref) → identity
//! secret → platform client. Every link is looked up by reference on each
//! pass; nothing holds back-pointers.

use std::sync::Arc;

use caph_api::{Cluster, HarvesterCluster, HarvesterMachine, Machine};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::vmspec::VmOptions;
use crate::{Error, ManagementStore, ObjectKey, Platform, PlatformConnector, Result};

pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub const IDENTITY_KUBECONFIG_KEY: &str = "kubeconfig";

/// Everything one reconciliation pass works with.
pub struct Scope {
    /// Working copy; status and finalizer changes are persisted after the pass.
    pub harvester_machine: HarvesterMachine,
    pub machine: Machine,
    pub cluster: Cluster,
    pub harvester_cluster: HarvesterCluster,
    pub platform: Arc<dyn Platform>,
    pub store: Arc<dyn ManagementStore>,
    pub options: VmOptions,
    pub cancel: CancellationToken,
}

impl Scope {
    pub fn name(&self) -> &str {
        self.harvester_machine.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn target_namespace(&self) -> &str {
        &self.harvester_machine.spec.target_namespace
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.harvester_machine.namespace().unwrap_or_default(),
            self.name(),
        )
    }

    /// Name of the secret carrying the VM's cloud-init user data.
    pub fn cloud_init_secret_name(&self) -> String {
        format!("{}-cloud-init", self.name())
    }

    /// Abort at a call boundary once the controller has cancelled the pass.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Raw bytes stored under `key`.
pub fn secret_value<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
}

/// Group part of an `apiVersion`; empty for the core group.
fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/// Outcome of resolving the owner chain.
pub enum Resolution {
    Ready(Box<Scope>),
    /// A link that another controller sets is not there yet.
    Waiting(&'static str),
}

/// Resolve the scope for `harvester_machine`.
pub async fn resolve(
    harvester_machine: HarvesterMachine,
    store: Arc<dyn ManagementStore>,
    connector: &dyn PlatformConnector,
    options: VmOptions,
    cancel: CancellationToken,
) -> Result<Resolution> {
    let namespace = harvester_machine.namespace().unwrap_or_default();

    let Some(owner) = harvester_machine
        .owner_references()
        .iter()
        .find(|o| o.kind == "Machine" && api_group(&o.api_version) == caph_api::capi::GROUP)
    else {
        return Ok(Resolution::Waiting(
            "waiting for Machine controller to set OwnerRef on HarvesterMachine",
        ));
    };

    let machine = store
        .get_machine(&namespace, &owner.name)
        .await?
        .ok_or_else(|| Error::ObjectMissing {
            kind: "Machine",
            key: format!("{namespace}/{}", owner.name),
        })?;

    let Some(cluster_name) = machine.labels().get(CLUSTER_NAME_LABEL) else {
        return Ok(Resolution::Waiting(
            "Machine is missing the cluster-name label",
        ));
    };

    let Some(cluster) = store.get_cluster(&namespace, cluster_name).await? else {
        return Ok(Resolution::Waiting("owning Cluster does not exist yet"));
    };

    let Some((infra_namespace, infra_name)) = cluster
        .spec
        .infrastructure_ref
        .as_ref()
        .and_then(|r| Some((r.namespace.as_deref().unwrap_or(&namespace), r.name.as_deref()?)))
    else {
        return Ok(Resolution::Waiting(
            "Cluster has no infrastructureRef yet",
        ));
    };

    let harvester_cluster = store
        .get_harvester_cluster(infra_namespace, infra_name)
        .await?
        .ok_or_else(|| Error::ObjectMissing {
            kind: "HarvesterCluster",
            key: format!("{infra_namespace}/{infra_name}"),
        })?;

    let identity = &harvester_cluster.spec.identity_secret;
    let identity_key = format!("{}/{}", identity.namespace, identity.name);
    let secret = store
        .get_secret(&identity.namespace, &identity.name)
        .await?
        .ok_or_else(|| Error::MissingIdentitySecret(identity_key.clone()))?;
    let kubeconfig = secret_value(&secret, IDENTITY_KUBECONFIG_KEY)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .ok_or_else(|| Error::MissingIdentitySecret(identity_key.clone()))?;

    let platform = connector.connect(kubeconfig).await?;
    debug!(identity = %identity_key, "connected to Harvester");

    Ok(Resolution::Ready(Box::new(Scope {
        harvester_machine,
        machine,
        cluster,
        harvester_cluster,
        platform,
        store,
        options,
        cancel,
    })))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{MockManagementStore, MockPlatform, MockPlatformConnector};
    use caph_api::{
        Bootstrap, ClusterSpec, ClusterStatus, HarvesterClusterSpec, HarvesterMachineSpec,
        MachineSpec, MachineVolume, SecretKeyReference,
    };
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;

    pub(crate) fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub(crate) fn secret(namespace: &str, name: &str, data: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: meta(namespace, name),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Error as the API server reports it.
    pub(crate) fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("request failed: {reason}"),
            reason: reason.into(),
            code,
        }))
    }

    pub(crate) fn deleting(mut hm: HarvesterMachine) -> HarvesterMachine {
        hm.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        hm
    }

    pub(crate) fn harvester_machine(name: &str) -> HarvesterMachine {
        let mut hm = HarvesterMachine::new(
            name,
            HarvesterMachineSpec {
                provider_id: None,
                target_namespace: "vms".into(),
                cpu: 2,
                memory: "4Gi".into(),
                volumes: vec![MachineVolume {
                    volume_type: Some("image".into()),
                    image_name: Some("default/ubuntu".into()),
                    volume_size: Some("40Gi".into()),
                    boot_order: Some(0),
                }],
                ssh_key_pair: "capi-key".into(),
            },
        );
        hm.metadata = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "cluster.x-k8s.io/v1beta1".into(),
                kind: "Machine".into(),
                name: format!("{name}-machine"),
                uid: "uid-1".into(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            finalizers: Some(vec![crate::reconciler::MACHINE_FINALIZER.into()]),
            resource_version: Some("100".into()),
            ..meta("capi", name)
        };
        hm
    }

    pub(crate) fn machine(name: &str) -> Machine {
        let mut machine = Machine::new(
            &format!("{name}-machine"),
            MachineSpec {
                cluster_name: "workload".into(),
                bootstrap: Bootstrap {
                    data_secret_name: Some(format!("{name}-bootstrap")),
                },
            },
        );
        machine.metadata = ObjectMeta {
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                "workload".to_string(),
            )])),
            ..meta("capi", &format!("{name}-machine"))
        };
        machine
    }

    pub(crate) fn cluster() -> Cluster {
        let mut cluster = Cluster::new(
            "workload",
            ClusterSpec {
                paused: false,
                infrastructure_ref: Some(ObjectReference {
                    api_version: Some("infrastructure.cluster.x-k8s.io/v1alpha1".into()),
                    kind: Some("HarvesterCluster".into()),
                    name: Some("workload-hv".into()),
                    ..Default::default()
                }),
            },
        );
        cluster.metadata = meta("capi", "workload");
        cluster.status = Some(ClusterStatus {
            infrastructure_ready: true,
        });
        cluster
    }

    pub(crate) fn harvester_cluster() -> HarvesterCluster {
        let mut hc = HarvesterCluster::new(
            "workload-hv",
            HarvesterClusterSpec {
                server: None,
                target_namespace: "vms".into(),
                identity_secret: SecretKeyReference {
                    namespace: "capi".into(),
                    name: "hv-identity".into(),
                },
            },
        );
        hc.metadata = meta("capi", "workload-hv");
        hc
    }

    /// Scope over the sample objects with the given collaborators.
    pub(crate) fn scope(
        name: &str,
        platform: MockPlatform,
        store: MockManagementStore,
    ) -> Scope {
        Scope {
            harvester_machine: harvester_machine(name),
            machine: machine(name),
            cluster: cluster(),
            harvester_cluster: harvester_cluster(),
            platform: Arc::new(platform),
            store: Arc::new(store),
            options: VmOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn connector() -> MockPlatformConnector {
        let mut connector = MockPlatformConnector::new();
        connector
            .expect_connect()
            .withf(|kubeconfig| kubeconfig.contains("harvester"))
            .returning(|_| Ok(Arc::new(MockPlatform::new()) as Arc<dyn Platform>));
        connector
    }

    pub(crate) fn store_with_chain() -> MockManagementStore {
        let mut store = MockManagementStore::new();
        store
            .expect_get_machine()
            .withf(|ns, name| ns == "capi" && name == "worker-0-machine")
            .returning(|_, _| Ok(Some(machine("worker-0"))));
        store
            .expect_get_cluster()
            .withf(|ns, name| ns == "capi" && name == "workload")
            .returning(|_, _| Ok(Some(cluster())));
        store
            .expect_get_harvester_cluster()
            .withf(|ns, name| ns == "capi" && name == "workload-hv")
            .returning(|_, _| Ok(Some(harvester_cluster())));
        store
    }

    #[tokio::test]
    async fn resolves_full_owner_chain() {
        let mut store = store_with_chain();
        store
            .expect_get_secret()
            .withf(|ns, name| ns == "capi" && name == "hv-identity")
            .returning(|_, _| {
                Ok(Some(secret(
                    "capi",
                    "hv-identity",
                    &[("kubeconfig", &b"clusters: [{name: harvester}]"[..])],
                )))
            });

        let resolution = resolve(
            harvester_machine("worker-0"),
            Arc::new(store),
            &connector(),
            VmOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let Resolution::Ready(scope) = resolution else {
            panic!("expected a resolved scope");
        };
        assert_eq!(scope.cluster.name_any(), "workload");
        assert_eq!(scope.harvester_cluster.name_any(), "workload-hv");
        assert_eq!(scope.cloud_init_secret_name(), "worker-0-cloud-init");
    }

    #[tokio::test]
    async fn waits_without_owner_reference() {
        let mut hm = harvester_machine("worker-0");
        hm.metadata.owner_references = None;

        let resolution = resolve(
            hm,
            Arc::new(MockManagementStore::new()),
            &MockPlatformConnector::new(),
            VmOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(resolution, Resolution::Waiting(_)));
    }

    #[tokio::test]
    async fn waits_without_cluster_label() {
        let mut store = MockManagementStore::new();
        store.expect_get_machine().returning(|_, _| {
            let mut m = machine("worker-0");
            m.metadata.labels = None;
            Ok(Some(m))
        });

        let resolution = resolve(
            harvester_machine("worker-0"),
            Arc::new(store),
            &MockPlatformConnector::new(),
            VmOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(resolution, Resolution::Waiting(_)));
    }

    #[tokio::test]
    async fn identity_secret_without_kubeconfig_is_an_error() {
        let mut store = store_with_chain();
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret("capi", "hv-identity", &[]))));

        let err = resolve(
            harvester_machine("worker-0"),
            Arc::new(store),
            &MockPlatformConnector::new(),
            VmOptions::default(),
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, Error::MissingIdentitySecret(key) if key == "capi/hv-identity"));
    }

    #[test]
    fn api_errors_classify_by_status_code() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(404, "NotFound").is_conflict());
        assert!(api_error(409, "AlreadyExists").is_conflict());
        assert!(!Error::Cancelled.is_not_found());
    }
}
