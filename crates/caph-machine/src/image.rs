use std::fmt;
use std::str::FromStr;

use caph_api::{MachineVolume, VirtualMachineImage};
use kube::ResourceExt;
use tracing::debug;

use crate::{Error, Platform, Result};

/// A `<namespace>/<display-name>` reference as written in a machine volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub namespace: String,
    pub display_name: String,
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [namespace, display_name] if !namespace.is_empty() && !display_name.is_empty() => {
                Ok(Self {
                    namespace: namespace.to_string(),
                    display_name: display_name.to_string(),
                })
            }
            _ => Err(Error::MalformedReference(s.to_string())),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.display_name)
    }
}

/// Concrete identity of a Harvester image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub namespace: String,
    pub name: String,
    pub display_name: String,
}

impl ResolvedImage {
    /// `<namespace>/<name>`, the form Harvester expects in image-id annotations.
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl From<&VirtualMachineImage> for ResolvedImage {
    fn from(image: &VirtualMachineImage) -> Self {
        Self {
            namespace: image.namespace().unwrap_or_default(),
            name: image.name_any(),
            display_name: image.spec.display_name.clone(),
        }
    }
}

/// The single volume that boots from an image.
pub fn image_volume(volumes: &[MachineVolume]) -> Result<&MachineVolume> {
    let with_image: Vec<&MachineVolume> = volumes
        .iter()
        .filter(|v| v.image_name.as_deref().is_some_and(|name| !name.is_empty()))
        .collect();

    match with_image.as_slice() {
        [] => Err(Error::NoImageVolume),
        [volume] => Ok(*volume),
        many => Err(Error::MultipleImageVolumes(many.len())),
    }
}

/// Find the image whose display name matches `reference` exactly.
///
/// Images are listed on every call; nothing is cached between passes.
pub async fn resolve(platform: &dyn Platform, reference: &ImageReference) -> Result<ResolvedImage> {
    let images = platform.list_images(&reference.namespace).await?;
    debug!(namespace = %reference.namespace, count = images.len(), "listed images");

    images
        .iter()
        .find(|image| image.spec.display_name == reference.display_name)
        .map(ResolvedImage::from)
        .ok_or_else(|| Error::ImageNotFound(reference.to_string()))
}

/// Select the image volume, parse its reference and resolve it.
pub async fn resolve_volume_image<'a>(
    platform: &dyn Platform,
    volumes: &'a [MachineVolume],
) -> Result<(&'a MachineVolume, ResolvedImage)> {
    let volume = image_volume(volumes)?;
    let reference: ImageReference = volume.image_name.as_deref().unwrap_or_default().parse()?;
    let image = resolve(platform, &reference).await?;
    Ok((volume, image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockPlatform;
    use caph_api::VirtualMachineImageSpec;

    fn image(namespace: &str, name: &str, display: &str) -> VirtualMachineImage {
        let mut image = VirtualMachineImage::new(
            name,
            VirtualMachineImageSpec {
                display_name: display.into(),
                url: None,
            },
        );
        image.metadata.namespace = Some(namespace.into());
        image
    }

    fn volume(image_name: Option<&str>) -> MachineVolume {
        MachineVolume {
            volume_type: Some("image".into()),
            image_name: image_name.map(Into::into),
            volume_size: Some("40Gi".into()),
            boot_order: Some(0),
        }
    }

    #[test]
    fn reference_requires_exactly_two_segments() {
        assert!(matches!(
            "badref".parse::<ImageReference>(),
            Err(Error::MalformedReference(r)) if r == "badref"
        ));
        assert!("a/b/c".parse::<ImageReference>().is_err());
        assert!("/ubuntu".parse::<ImageReference>().is_err());
        assert!("ns1/".parse::<ImageReference>().is_err());

        let reference: ImageReference = "ns1/ubuntu".parse().unwrap();
        assert_eq!(reference.namespace, "ns1");
        assert_eq!(reference.display_name, "ubuntu");
    }

    #[test]
    fn exactly_one_image_volume_is_required() {
        assert!(matches!(image_volume(&[]), Err(Error::NoImageVolume)));
        assert!(matches!(
            image_volume(&[volume(None), volume(Some(""))]),
            Err(Error::NoImageVolume)
        ));
        assert!(matches!(
            image_volume(&[volume(Some("a/b")), volume(Some("c/d"))]),
            Err(Error::MultipleImageVolumes(2))
        ));

        let volumes = [volume(None), volume(Some("ns1/ubuntu"))];
        let selected = image_volume(&volumes).unwrap();
        assert_eq!(selected.image_name.as_deref(), Some("ns1/ubuntu"));
    }

    #[tokio::test]
    async fn resolves_by_exact_display_name() {
        let mut platform = MockPlatform::new();
        platform
            .expect_list_images()
            .withf(|namespace| namespace == "ns1")
            .returning(|_| {
                Ok(vec![
                    image("ns1", "image-abcde", "Ubuntu"),
                    image("ns1", "image-fghij", "ubuntu"),
                ])
            });

        let resolved = resolve(&platform, &"ns1/ubuntu".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(resolved.name, "image-fghij");
        assert_eq!(resolved.id(), "ns1/image-fghij");
    }

    #[tokio::test]
    async fn missing_display_name_is_not_found() {
        let mut platform = MockPlatform::new();
        platform
            .expect_list_images()
            .returning(|_| Ok(vec![image("ns1", "image-fghij", "ubuntu")]));

        let err = resolve(&platform, &"ns1/missing".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(r) if r == "ns1/missing"));
    }

    #[tokio::test]
    async fn empty_namespace_is_not_found() {
        let mut platform = MockPlatform::new();
        platform.expect_list_images().returning(|_| Ok(vec![]));

        let err = resolve(&platform, &"ns2/ubuntu".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn malformed_volume_reference_skips_the_lookup() {
        let platform = MockPlatform::new();
        let volumes = [volume(Some("badref"))];

        let err = resolve_volume_image(&platform, &volumes).await.unwrap_err();
        assert!(matches!(err, Error::MalformedReference(_)));
    }
}
