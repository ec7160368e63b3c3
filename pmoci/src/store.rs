use std::collections::HashMap;
use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{error, info, warn};
use oci_spec::image::{Arch, Descriptor, Digest, ImageIndex, ImageManifest, Os};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::{RwLock, broadcast};

use crate::distribution::Image;
use crate::{is_index_media_type, is_manifest_media_type};

pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub enum ImageEvent {
    Create(Image),
    Delete(Image),
}

pub type BlobReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

// the store is read-only from our side, writes happen out of process and show up
// through the event channel
#[async_trait]
pub trait ContentStore: Send + Sync {
    // reference is the fully qualified registry/repository:tag form
    async fn resolve_tag(&self, reference: &str) -> Result<Option<Digest>, Error>;
    async fn descriptor(&self, digest: &Digest) -> Result<Option<Descriptor>, Error>;
    async fn read(
        &self,
        digest: &Digest,
        range: Option<(u64, u64)>,
    ) -> Result<Option<BlobReader>, Error>;
    async fn read_bytes(&self, digest: &Digest) -> Result<Option<Bytes>, Error>;
    async fn list_images(&self) -> Result<Vec<Image>, Error>;
    fn subscribe(&self) -> broadcast::Receiver<ImageEvent>;
}

// sha256:foo -> sha256/foo
fn digest_path(d: &Digest) -> String {
    d.to_string().replacen(':', "/", 1)
}

#[derive(Default)]
struct State {
    descriptors: HashMap<String, Descriptor>,
    tags: HashMap<String, Digest>,
    images: Vec<Image>,
}

// an OCI image layout directory: index.json at the root, content under blobs/<algo>/<hex>.
// descriptors are collected from index.json and every manifest reachable from it, so
// presence-by-digest means "referenced by some image here and the file exists"
pub struct OciDirStore {
    root: PathBuf,
    state: RwLock<State>,
    events: broadcast::Sender<ImageEvent>,
}

impl OciDirStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<OciDirStore, Error> {
        let root = root.into();
        let state = scan(&root).await?;
        info!(
            "store at {:?}: {} images, {} blobs",
            root,
            state.images.len(),
            state.descriptors.len()
        );
        let (events, _) = broadcast::channel(1024);
        Ok(OciDirStore {
            root,
            state: RwLock::new(state),
            events,
        })
    }

    // rescan and emit Create/Delete for images that appeared or went away
    pub async fn refresh(&self) -> Result<(), Error> {
        let new_state = scan(&self.root).await?;
        let mut guard = self.state.write().await;
        for image in new_state.images.iter() {
            if !guard.images.contains(image) {
                info!("image appeared {}", image.identifier());
                let _ = self.events.send(ImageEvent::Create(image.clone()));
            }
        }
        for image in guard.images.iter() {
            if !new_state.images.contains(image) {
                info!("image removed {}", image.identifier());
                let _ = self.events.send(ImageEvent::Delete(image.clone()));
            }
        }
        *guard = new_state;
        Ok(())
    }

    // external processes write the layout, we only ever poll it
    pub async fn watch(self: Arc<Self>, period: Duration) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately and new() already scanned
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = self.refresh().await {
                error!("store refresh failed {e:?}");
            }
        }
    }

    fn blob_file(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest_path(digest))
    }
}

#[async_trait]
impl ContentStore for OciDirStore {
    async fn resolve_tag(&self, reference: &str) -> Result<Option<Digest>, Error> {
        let guard = self.state.read().await;
        Ok(guard.tags.get(reference).cloned())
    }

    async fn descriptor(&self, digest: &Digest) -> Result<Option<Descriptor>, Error> {
        let guard = self.state.read().await;
        Ok(guard.descriptors.get(&digest.to_string()).cloned())
    }

    async fn read(
        &self,
        digest: &Digest,
        range: Option<(u64, u64)>,
    ) -> Result<Option<BlobReader>, Error> {
        let mut file = match tokio::fs::File::open(self.blob_file(digest)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match range {
            Some((start, end)) => {
                file.seek(SeekFrom::Start(start)).await?;
                Ok(Some(Box::pin(file.take(end - start + 1))))
            }
            None => Ok(Some(Box::pin(file))),
        }
    }

    async fn read_bytes(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        match tokio::fs::read(self.blob_file(digest)).await {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_images(&self) -> Result<Vec<Image>, Error> {
        let guard = self.state.read().await;
        Ok(guard.images.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<ImageEvent> {
        self.events.subscribe()
    }
}

async fn scan(root: &Path) -> Result<State, Error> {
    let mut state = State::default();
    let index_bytes = match tokio::fs::read(root.join("index.json")).await {
        Ok(b) => b,
        // an empty directory is an empty store
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(e.into()),
    };
    let index = ImageIndex::from_reader(Cursor::new(&index_bytes))?;

    for entry in index.manifests() {
        let Some(bytes) = read_blob(root, entry.digest()).await? else {
            warn!("index references missing blob {}", entry.digest());
            continue;
        };
        state
            .descriptors
            .insert(entry.digest().to_string(), entry.clone());

        if let Some(annotations) = entry.annotations() {
            if let Some(name) = annotations.get(REF_NAME_ANNOTATION) {
                match Image::parse_reference(name, entry.digest().clone()) {
                    Some(image) => {
                        if let Some(reference) = image.tagged_reference() {
                            state.tags.insert(reference, image.digest.clone());
                        }
                        state.images.push(image);
                    }
                    None => {
                        // still servable by digest below, just not enumerable
                        warn!("unqualified ref.name {name:?} on {}", entry.digest());
                    }
                }
            }
        }

        if is_index_media_type(entry.media_type()) {
            let Ok(nested) = ImageIndex::from_reader(Cursor::new(&bytes)) else {
                warn!("unparseable image index {}", entry.digest());
                continue;
            };
            for sub in nested.manifests() {
                let Some(sub_bytes) = read_blob(root, sub.digest()).await? else {
                    continue;
                };
                state
                    .descriptors
                    .insert(sub.digest().to_string(), sub.clone());
                if let Ok(manifest) = ImageManifest::from_reader(Cursor::new(&sub_bytes)) {
                    register_manifest_blobs(root, &manifest, &mut state).await?;
                }
            }
        } else if is_manifest_media_type(entry.media_type()) {
            if let Ok(manifest) = ImageManifest::from_reader(Cursor::new(&bytes)) {
                register_manifest_blobs(root, &manifest, &mut state).await?;
            } else {
                warn!("unparseable image manifest {}", entry.digest());
            }
        }
    }

    Ok(state)
}

async fn register_manifest_blobs(
    root: &Path,
    manifest: &ImageManifest,
    state: &mut State,
) -> Result<(), Error> {
    for descriptor in std::iter::once(manifest.config()).chain(manifest.layers()) {
        if blob_exists(root, descriptor.digest()).await {
            state
                .descriptors
                .insert(descriptor.digest().to_string(), descriptor.clone());
        }
    }
    Ok(())
}

async fn read_blob(root: &Path, digest: &Digest) -> Result<Option<Vec<u8>>, Error> {
    match tokio::fs::read(root.join("blobs").join(digest_path(digest))).await {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn blob_exists(root: &Path, digest: &Digest) -> bool {
    tokio::fs::metadata(root.join("blobs").join(digest_path(digest)))
        .await
        .is_ok()
}

pub fn host_platform() -> (Arch, Os) {
    let arch = if cfg!(target_arch = "aarch64") {
        Arch::ARM64
    } else {
        Arch::Amd64
    };
    (arch, Os::Linux)
}

// every key a peer could ask us for once it has the top manifest: the config digest, the
// layer digests, and for an index the platform-matching sub-manifest and its blobs
pub async fn referenced_keys(
    store: &dyn ContentStore,
    digest: &Digest,
) -> Result<Vec<String>, Error> {
    let mut keys = Vec::new();
    let Some(descriptor) = store.descriptor(digest).await? else {
        return Ok(keys);
    };
    let Some(bytes) = store.read_bytes(digest).await? else {
        return Ok(keys);
    };

    if is_index_media_type(descriptor.media_type()) {
        let Ok(index) = ImageIndex::from_reader(Cursor::new(&bytes)) else {
            return Ok(keys);
        };
        let (arch, os) = host_platform();
        let sub = index.manifests().iter().find(|d| {
            d.platform()
                .as_ref()
                .map(|p| *p.architecture() == arch && *p.os() == os)
                .unwrap_or(false)
        });
        if let Some(sub) = sub {
            keys.push(sub.digest().to_string());
            if let Some(sub_bytes) = store.read_bytes(sub.digest()).await? {
                if let Ok(manifest) = ImageManifest::from_reader(Cursor::new(&sub_bytes)) {
                    push_manifest_keys(&manifest, &mut keys);
                }
            }
        }
    } else if is_manifest_media_type(descriptor.media_type()) {
        if let Ok(manifest) = ImageManifest::from_reader(Cursor::new(&bytes)) {
            push_manifest_keys(&manifest, &mut keys);
        }
    }

    Ok(keys)
}

fn push_manifest_keys(manifest: &ImageManifest, keys: &mut Vec<String>) {
    keys.push(manifest.config().digest().to_string());
    for layer in manifest.layers() {
        keys.push(layer.digest().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OCI_IMAGE_INDEX_V1, OCI_IMAGE_MANIFEST_V1};
    use sha2::{Digest as _, Sha256};

    fn put_blob(root: &Path, bytes: &[u8]) -> Digest {
        let digest: Digest = format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
            .parse()
            .unwrap();
        std::fs::create_dir_all(root.join("blobs/sha256")).unwrap();
        std::fs::write(root.join("blobs").join(digest_path(&digest)), bytes).unwrap();
        digest
    }

    // returns (manifest_digest, manifest_size, config_digest, layer_digest)
    fn build_image(root: &Path, layer_bytes: &[u8]) -> (Digest, usize, Digest, Digest) {
        let config_bytes = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]},"config":{}}"#;
        let config = put_blob(root, config_bytes);
        let layer = put_blob(root, layer_bytes);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_MANIFEST_V1,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config.to_string(),
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer.to_string(),
                "size": layer_bytes.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let size = manifest_bytes.len();
        let digest = put_blob(root, &manifest_bytes);
        (digest, size, config, layer)
    }

    fn write_index(root: &Path, entries: &[(&Digest, usize, &str, Option<&str>)]) {
        let manifests: Vec<_> = entries
            .iter()
            .map(|(digest, size, media_type, reference)| {
                let mut entry = serde_json::json!({
                    "mediaType": media_type,
                    "digest": digest.to_string(),
                    "size": size,
                });
                if let Some(reference) = reference {
                    entry["annotations"] =
                        serde_json::json!({ REF_NAME_ANNOTATION: reference });
                }
                entry
            })
            .collect();
        let index = serde_json::json!({"schemaVersion": 2, "manifests": manifests});
        std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_scan_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, size, config, layer) = build_image(dir.path(), b"layer-bytes");
        write_index(
            dir.path(),
            &[(
                &manifest,
                size,
                OCI_IMAGE_MANIFEST_V1,
                Some("docker.io/library/busybox:latest"),
            )],
        );

        let store = OciDirStore::new(dir.path()).await.unwrap();

        let images = store.list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].registry, "docker.io");
        assert_eq!(images[0].repository, "library/busybox");
        assert_eq!(images[0].tag.as_deref(), Some("latest"));

        let resolved = store
            .resolve_tag("docker.io/library/busybox:latest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved, manifest);
        assert!(store.resolve_tag("docker.io/library/busybox:other").await.unwrap().is_none());

        let d = store.descriptor(&manifest).await.unwrap().unwrap();
        assert!(is_manifest_media_type(d.media_type()));
        assert_eq!(d.size() as usize, size);
        assert!(store.descriptor(&config).await.unwrap().is_some());
        assert!(store.descriptor(&layer).await.unwrap().is_some());

        let keys = referenced_keys(&store, &manifest).await.unwrap();
        assert_eq!(keys, vec![config.to_string(), layer.to_string()]);
    }

    #[tokio::test]
    async fn test_ranged_read() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, size, _config, layer) = build_image(dir.path(), b"0123456789");
        write_index(dir.path(), &[(&manifest, size, OCI_IMAGE_MANIFEST_V1, None)]);
        let store = OciDirStore::new(dir.path()).await.unwrap();

        let mut reader = store.read(&layer, Some((3, 6))).await.unwrap().unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"3456");

        let mut reader = store.read(&layer, None).await.unwrap().unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");

        let missing: Digest =
            "sha256:ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
                .parse()
                .unwrap();
        assert!(store.read(&missing, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_platform_walk() {
        let dir = tempfile::tempdir().unwrap();
        let (sub, sub_size, config, layer) = build_image(dir.path(), b"platform-layer");
        let (arch, os) = host_platform();
        let index_doc = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX_V1,
            "manifests": [
                {
                    "mediaType": OCI_IMAGE_MANIFEST_V1,
                    "digest": sub.to_string(),
                    "size": sub_size,
                    "platform": {"architecture": arch.to_string(), "os": os.to_string()},
                },
                {
                    "mediaType": OCI_IMAGE_MANIFEST_V1,
                    "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                    "size": 2,
                    "platform": {"architecture": "s390x", "os": os.to_string()},
                },
            ],
        });
        let index_bytes = serde_json::to_vec(&index_doc).unwrap();
        let index_size = index_bytes.len();
        let index_digest = put_blob(dir.path(), &index_bytes);
        write_index(
            dir.path(),
            &[(
                &index_digest,
                index_size,
                OCI_IMAGE_INDEX_V1,
                Some("docker.io/library/multi:latest"),
            )],
        );

        let store = OciDirStore::new(dir.path()).await.unwrap();
        let keys = referenced_keys(&store, &index_digest).await.unwrap();
        assert_eq!(
            keys,
            vec![sub.to_string(), config.to_string(), layer.to_string()]
        );
    }

    #[tokio::test]
    async fn test_refresh_events() {
        let dir = tempfile::tempdir().unwrap();
        let (first, first_size, _, _) = build_image(dir.path(), b"first");
        write_index(
            dir.path(),
            &[(&first, first_size, OCI_IMAGE_MANIFEST_V1, Some("docker.io/a/a:1"))],
        );
        let store = OciDirStore::new(dir.path()).await.unwrap();
        let mut events = store.subscribe();

        let (second, second_size, _, _) = build_image(dir.path(), b"second");
        write_index(
            dir.path(),
            &[
                (&first, first_size, OCI_IMAGE_MANIFEST_V1, Some("docker.io/a/a:1")),
                (&second, second_size, OCI_IMAGE_MANIFEST_V1, Some("docker.io/b/b:2")),
            ],
        );
        store.refresh().await.unwrap();

        match events.try_recv().unwrap() {
            ImageEvent::Create(image) => assert_eq!(image.identifier(), "docker.io/b/b:2"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
