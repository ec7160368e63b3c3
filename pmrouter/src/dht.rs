use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;

// provider records live this long; the tracker republishes one minute before expiry
pub const KEY_TTL: Duration = Duration::from_secs(10 * 60);

// default bound on provider channels when the caller asks for fewer
pub const PROVIDER_CHANNEL_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub id: NodeId,
    pub addrs: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct NodeAddr {
    pub id: Option<NodeId>,
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeAddr {
    // "1.2.3.4:5000" or "nodeid@1.2.3.4:5000"
    pub fn parse(s: &str) -> Option<NodeAddr> {
        let (id, rest) = match s.split_once('@') {
            Some((id, rest)) if !id.is_empty() => (Some(NodeId(id.to_string())), rest),
            Some(_) => return None,
            None => (None, s),
        };
        let addr: std::net::SocketAddr = rest.parse().ok()?;
        Some(NodeAddr {
            id,
            ip: addr.ip(),
            port: addr.port(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Unreachable(String),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// the overlay contract. records are hints with a TTL, re-providing overwrites, and
// lookups stream whatever unexpired records the overlay currently holds
#[async_trait]
pub trait Dht: Send + Sync {
    fn local_provider(&self) -> Provider;
    async fn provide(&self, key: &str) -> Result<(), Error>;
    // the receiver closes once the query is exhausted or limit records were sent
    async fn find_providers(&self, key: &str, limit: usize) -> mpsc::Receiver<Provider>;
    // connects and returns the identity learned from the handshake
    async fn connect(&self, addr: &NodeAddr) -> Result<NodeId, Error>;
    fn table_size(&self) -> usize;
}

struct Record {
    provider: Provider,
    expires_at: Instant,
}

#[derive(Default)]
struct MeshInner {
    // BTreeMap so lookups hand records out in a stable order
    records: HashMap<String, BTreeMap<NodeId, Record>>,
    nodes: HashMap<NodeId, Provider>,
}

// an in-process stand-in for the overlay: every node joined to the same mesh sees the
// same records. good enough for tests, development and a cluster of one
#[derive(Clone)]
pub struct MemoryMesh {
    inner: Arc<Mutex<MeshInner>>,
    ttl: Duration,
}

impl Default for MemoryMesh {
    fn default() -> MemoryMesh {
        MemoryMesh::new()
    }
}

impl MemoryMesh {
    pub fn new() -> MemoryMesh {
        MemoryMesh::with_ttl(KEY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> MemoryMesh {
        MemoryMesh {
            inner: Arc::new(Mutex::new(MeshInner::default())),
            ttl,
        }
    }

    pub fn join(&self, id: impl Into<String>, addrs: Vec<IpAddr>) -> MemoryDht {
        let provider = Provider {
            id: NodeId(id.into()),
            addrs,
        };
        self.inner
            .lock()
            .unwrap()
            .nodes
            .insert(provider.id.clone(), provider.clone());
        MemoryDht {
            mesh: self.clone(),
            local: provider,
            table: Mutex::new(HashSet::new()),
        }
    }
}

pub struct MemoryDht {
    mesh: MemoryMesh,
    local: Provider,
    table: Mutex<HashSet<NodeId>>,
}

#[async_trait]
impl Dht for MemoryDht {
    fn local_provider(&self) -> Provider {
        self.local.clone()
    }

    async fn provide(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.mesh.inner.lock().unwrap();
        inner.records.entry(key.to_string()).or_default().insert(
            self.local.id.clone(),
            Record {
                provider: self.local.clone(),
                expires_at: Instant::now() + self.mesh.ttl,
            },
        );
        Ok(())
    }

    async fn find_providers(&self, key: &str, limit: usize) -> mpsc::Receiver<Provider> {
        let (tx, rx) = mpsc::channel(limit.max(PROVIDER_CHANNEL_CAPACITY));
        let now = Instant::now();
        let providers: Vec<Provider> = {
            let inner = self.mesh.inner.lock().unwrap();
            inner
                .records
                .get(key)
                .map(|records| {
                    records
                        .values()
                        .filter(|r| r.expires_at > now)
                        .take(limit)
                        .map(|r| r.provider.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for provider in providers {
            if tx.try_send(provider).is_err() {
                warn!("provider channel for {key} full, dropping record");
            }
        }
        // tx drops here, the receiver sees the end of the query
        rx
    }

    async fn connect(&self, addr: &NodeAddr) -> Result<NodeId, Error> {
        let found = {
            let inner = self.mesh.inner.lock().unwrap();
            match &addr.id {
                Some(id) => inner.nodes.get(id).cloned(),
                None => inner
                    .nodes
                    .values()
                    .find(|p| p.addrs.contains(&addr.ip))
                    .cloned(),
            }
        };
        let provider =
            found.ok_or_else(|| Error::Unreachable(format!("{}:{}", addr.ip, addr.port)))?;
        self.table.lock().unwrap().insert(provider.id.clone());
        Ok(provider.id)
    }

    fn table_size(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}
