use caph_api::{MachineAddress, VirtualMachine};
use kube::ResourceExt;
use tracing::debug;

use crate::{Error, Platform, Result};

/// Collect the externally reachable addresses of `vm`'s running instances.
///
/// Every interface reporting an IP yields one `ExternalIP` entry, in instance
/// then interface order. Duplicates are kept.
pub async fn extract_addresses(
    platform: &dyn Platform,
    vm: &VirtualMachine,
) -> Result<Vec<MachineAddress>> {
    let namespace = vm.namespace().unwrap_or_default();
    let name = vm.name_any();

    let instances: Vec<_> = platform
        .list_vm_instances(&namespace)
        .await?
        .into_iter()
        .filter(|vmi| vmi.metadata.name.as_deref() == Some(name.as_str()))
        .collect();

    if instances.is_empty() {
        return Err(Error::NoInstancesFound(format!("{namespace}/{name}")));
    }

    let addresses: Vec<MachineAddress> = instances
        .iter()
        .filter_map(|vmi| vmi.status.as_ref())
        .flat_map(|status| status.interfaces.iter())
        .filter_map(|nic| nic.ip_address.as_deref())
        .filter(|ip| !ip.is_empty())
        .map(MachineAddress::external_ip)
        .collect();

    debug!(vm = %name, count = addresses.len(), "extracted addresses");
    Ok(addresses)
}
