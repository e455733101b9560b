use std::sync::Arc;

use async_trait::async_trait;
use caph_api::{KeyPair, VirtualMachine, VirtualMachineImage, VirtualMachineInstance};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::{Platform, PlatformConnector, Result};

/// Harvester reached through its Kubernetes API.
///
/// Deletes and creates pass `NotFound` / `Conflict` through untouched; the
/// reconciler decides what absence means.
pub struct HarvesterPlatform {
    client: Client,
}

impl HarvesterPlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_kubeconfig(kubeconfig: &str) -> Result<Self> {
        Ok(Self::new(caph_api::client_from_kubeconfig(kubeconfig).await?))
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Platform for HarvesterPlatform {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>> {
        Ok(self.api::<VirtualMachine>(namespace).get_opt(name).await?)
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let namespace = vm.namespace().unwrap_or_default();
        let created = self
            .api::<VirtualMachine>(&namespace)
            .create(&PostParams::default(), vm)
            .await?;
        info!(vm = %created.name_any(), namespace = %namespace, "harvester: virtual machine created");
        Ok(created)
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<VirtualMachine>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        info!(vm = %name, namespace, "harvester: virtual machine deleted");
        Ok(())
    }

    async fn list_vm_instances(&self, namespace: &str) -> Result<Vec<VirtualMachineInstance>> {
        let list = self
            .api::<VirtualMachineInstance>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn list_images(&self, namespace: &str) -> Result<Vec<VirtualMachineImage>> {
        let list = self
            .api::<VirtualMachineImage>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn get_keypair(&self, namespace: &str, name: &str) -> Result<Option<KeyPair>> {
        Ok(self.api::<KeyPair>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        let created = self
            .api::<Secret>(&namespace)
            .create(&PostParams::default(), secret)
            .await?;
        debug!(secret = %created.name_any(), namespace = %namespace, "harvester: secret created");
        Ok(created)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<Secret>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        debug!(secret = %name, namespace, "harvester: secret deleted");
        Ok(())
    }
}

/// Connects to the Harvester cluster described by an identity kubeconfig.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeconfigConnector;

#[async_trait]
impl PlatformConnector for KubeconfigConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn Platform>> {
        let platform = HarvesterPlatform::from_kubeconfig(kubeconfig).await?;
        debug!("harvester: client configured");
        Ok(Arc::new(platform))
    }
}
