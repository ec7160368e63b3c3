use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NoNext,
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Default)]
struct Inner {
    peers: Vec<Peer>,
    // index of the peer next() hands out next
    cursor: usize,
    closed: bool,
}

// round robin over the peers discovered for one key. peers arrive while consumers are
// already asking, so next() blocks until either something is added or the discovery
// closes the set
#[derive(Default)]
pub struct Balancer {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Balancer {
    pub fn new() -> Balancer {
        Balancer::default()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    // appends unless already present, wakes everyone blocked in next()
    pub fn add(&self, peer: Peer) -> bool {
        let added = {
            let mut inner = self.inner.lock().unwrap();
            if inner.peers.contains(&peer) {
                false
            } else {
                inner.peers.push(peer);
                true
            }
        };
        if added {
            self.notify.notify_waiters();
        }
        added
    }

    // the cursor steps back iff the removed slot was before it, so the original
    // successor is still the next peer handed out
    pub fn remove(&self, peer: &Peer) {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.peers.iter().position(|p| p == peer) else {
            return;
        };
        inner.peers.remove(index);
        if index < inner.cursor {
            inner.cursor -= 1;
        }
        if inner.cursor >= inner.peers.len() {
            inner.cursor = 0;
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub async fn next(&self) -> Result<Peer, Error> {
        loop {
            // register before checking so an add between the check and the await
            // still wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.peers.is_empty() {
                    let peer = inner.peers[inner.cursor];
                    inner.cursor = (inner.cursor + 1) % inner.peers.len();
                    return Ok(peer);
                }
                if inner.closed {
                    return Err(Error::NoNext);
                }
            }
            notified.await;
        }
    }
}
