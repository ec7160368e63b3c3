pub mod distribution;
pub mod ocidist;
pub mod store;

use oci_spec::image::MediaType;

pub const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_IMAGE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

// manifests and indexes get served from the manifest endpoint and nothing else; everything
// referenced by them (configs, layers) is a blob
pub fn is_manifest_media_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        OCI_IMAGE_MANIFEST_V1
            | OCI_IMAGE_INDEX_V1
            | DOCKER_IMAGE_MANIFEST_V2
            | DOCKER_IMAGE_MANIFEST_LIST_V2
    )
}

pub fn is_index_media_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        OCI_IMAGE_INDEX_V1 | DOCKER_IMAGE_MANIFEST_LIST_V2
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_media_types() {
        assert!(is_manifest_media_type(&MediaType::ImageManifest));
        assert!(is_manifest_media_type(&MediaType::ImageIndex));
        assert!(is_manifest_media_type(&MediaType::Other(
            DOCKER_IMAGE_MANIFEST_V2.to_string()
        )));
        assert!(!is_manifest_media_type(&MediaType::ImageLayerGzip));
        assert!(!is_manifest_media_type(&MediaType::Other(
            "application/octet-stream".to_string()
        )));
        assert!(is_index_media_type(&MediaType::ImageIndex));
        assert!(!is_index_media_type(&MediaType::ImageManifest));
    }
}
