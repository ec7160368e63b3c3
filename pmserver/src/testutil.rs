use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::net::TcpListener;

use pmoci::ocidist::Client;
use pmoci::store::{ContentStore, OciDirStore, REF_NAME_ANNOTATION};
use pmrouter::dht::{MemoryDht, MemoryMesh};
use pmrouter::router::Router;

use crate::mirror::BufferPool;
use crate::registry::{self, Config, Ctx};

pub(crate) struct Installed {
    pub manifest: Digest,
    pub config: Digest,
    pub layer: Digest,
}

pub(crate) fn put_blob(root: &Path, bytes: &[u8]) -> Digest {
    let digest: Digest = format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
        .parse()
        .unwrap();
    std::fs::create_dir_all(root.join("blobs/sha256")).unwrap();
    std::fs::write(
        root.join("blobs").join(digest.to_string().replacen(':', "/", 1)),
        bytes,
    )
    .unwrap();
    digest
}

// one tagged image in an otherwise fresh layout dir
pub(crate) fn install_image(root: &Path, reference: &str, layer_bytes: &[u8]) -> Installed {
    let config_bytes =
        br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]},"config":{}}"#;
    let config = put_blob(root, config_bytes);
    let layer = put_blob(root, layer_bytes);
    let manifest_doc = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
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
    let manifest_bytes = serde_json::to_vec(&manifest_doc).unwrap();
    let manifest = put_blob(root, &manifest_bytes);
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest.to_string(),
            "size": manifest_bytes.len(),
            "annotations": { REF_NAME_ANNOTATION: reference },
        }],
    });
    std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    Installed {
        manifest,
        config,
        layer,
    }
}

pub(crate) struct TestNode {
    pub addr: std::net::SocketAddr,
    pub store: Arc<OciDirStore>,
    pub router: Arc<Router>,
}

// every node listens on the same port at its own loopback address, the way a real
// deployment has one registry port across many hosts
pub(crate) struct TestMesh {
    pub mesh: MemoryMesh,
    pub port: u16,
    next_ip: u8,
}

impl TestMesh {
    pub async fn new() -> TestMesh {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        TestMesh {
            mesh: MemoryMesh::new(),
            port,
            next_ip: 1,
        }
    }

    fn next_ip(&mut self) -> IpAddr {
        let ip = IpAddr::from([127, 0, 0, self.next_ip]);
        self.next_ip += 1;
        ip
    }

    pub async fn start_node(&mut self, id: &str, dir: &Path, mut config: Config) -> TestNode {
        let ip = self.next_ip();
        let listener = TcpListener::bind((ip, self.port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        // generous resolve window, test hosts are slow and the memory mesh is instant
        config.resolve_timeout = Duration::from_secs(1);

        let store = Arc::new(OciDirStore::new(dir).await.unwrap());
        let dht = Arc::new(self.mesh.join(id, vec![ip]));
        let router = Arc::new(Router::new(dht, self.port));
        let ctx = Arc::new(Ctx {
            store: store.clone() as Arc<dyn ContentStore>,
            router: router.clone(),
            client: Client::new().unwrap(),
            buffers: Arc::new(BufferPool::new()),
            config,
        });
        let app = registry::app(ctx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestNode { addr, store, router }
    }

    // registered on the mesh but nothing answers at its address
    pub fn dead_node(&mut self, id: &str) -> MemoryDht {
        let ip = self.next_ip();
        self.mesh.join(id, vec![ip])
    }

    // a raw socket peer that claims content_length bytes and hangs up after the prefix
    pub async fn partial_node(&mut self, id: &str, digest: &Digest, content_length: usize, prefix: Vec<u8>) -> MemoryDht {
        let ip = self.next_ip();
        let listener = TcpListener::bind((ip, self.port)).await.unwrap();
        let digest = digest.to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let digest = digest.clone();
                let prefix = prefix.clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    // drain the request head
                    let mut buf = [0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ncontent-length: {content_length}\r\ndocker-content-digest: {digest}\r\n\r\n"
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&prefix).await;
                    let _ = socket.flush().await;
                    // connection drops here, well short of content-length
                });
            }
        });
        self.mesh.join(id, vec![ip])
    }
}
