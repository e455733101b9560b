//! The boot-disk storage claim Harvester materializes from a VM annotation.

use std::collections::BTreeMap;

use caph_api::MachineVolume;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;

use crate::image::ResolvedImage;
use crate::{Error, Result};

pub const VOLUME_CLAIM_TEMPLATES_ANNOTATION: &str = "harvesterhci.io/volumeClaimTemplates";
pub const IMAGE_ID_ANNOTATION: &str = "harvesterhci.io/imageId";

const RANDOM_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const RANDOM_ID_LEN: usize = 5;

/// Fresh claim name for the machine's boot disk: `<machine>-disk-0-<random>`.
pub fn claim_name(machine_name: &str) -> String {
    format!("{machine_name}-disk-0-{}", random_id())
}

fn random_id() -> String {
    let mut rng = rand::rng();
    (0..RANDOM_ID_LEN)
        .map(|_| RANDOM_ID_CHARSET[rng.random_range(0..RANDOM_ID_CHARSET.len())] as char)
        .collect()
}

/// Build the claim backing the boot disk: a block-mode, RWX claim on the
/// image's Longhorn storage class, sized from the volume spec.
pub fn boot_claim(
    volume: &MachineVolume,
    claim_name: &str,
    namespace: &str,
    image: &ResolvedImage,
) -> Result<PersistentVolumeClaim> {
    let size = volume
        .volume_size
        .clone()
        .ok_or(Error::MissingVolumeSize)?;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                IMAGE_ID_ANNOTATION.to_string(),
                image.id(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            volume_mode: Some("Block".into()),
            storage_class_name: Some(format!("longhorn-{}", image.name)),
            ..Default::default()
        }),
        status: None,
    })
}

/// Serialize claims into the JSON list stored under
/// [`VOLUME_CLAIM_TEMPLATES_ANNOTATION`].
pub fn claim_templates_annotation(claims: &[PersistentVolumeClaim]) -> Result<String> {
    serde_json::to_string(claims).map_err(Error::from)
}
