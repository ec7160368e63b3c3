use async_trait::async_trait;

use crate::dht::NodeAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Unavailable(String),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// where the very first peer addresses come from. everything after that is the
// overlay's own routing table maintenance
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn peers(&self) -> Result<Vec<NodeAddr>, Error>;
}

// a fixed list, the usual deployment shape (headless service, static config)
pub struct StaticBootstrapper {
    addrs: Vec<NodeAddr>,
}

impl StaticBootstrapper {
    pub fn new(addrs: Vec<NodeAddr>) -> StaticBootstrapper {
        StaticBootstrapper { addrs }
    }
}

#[async_trait]
impl Bootstrapper for StaticBootstrapper {
    async fn peers(&self) -> Result<Vec<NodeAddr>, Error> {
        Ok(self.addrs.clone())
    }
}
