use async_trait::async_trait;
use caph_api::{Cluster, HarvesterCluster, HarvesterMachine, Machine};
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};

use crate::{ManagementStore, Result};

/// Field manager recorded on every write to the management cluster.
pub const FIELD_MANAGER: &str = "caph-controller";

/// Management cluster access over its Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<HarvesterMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ManagementStore for KubeStore {
    async fn get_harvester_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HarvesterMachine>> {
        Ok(self.machines(namespace).get_opt(name).await?)
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_harvester_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HarvesterCluster>> {
        let api: Api<HarvesterCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_harvester_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.machines(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_harvester_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.machines(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
