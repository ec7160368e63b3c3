use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use moka::future::Cache;

use crate::balancer::{Balancer, Peer};
use crate::bootstrap::Bootstrapper;
use crate::dht::Dht;

// layer fanout means the same digest gets looked up by many pulls at once, so finished
// balancers stick around briefly and in-flight ones are shared
const BALANCER_IDLE: Duration = Duration::from_secs(5);

const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(30);
const BOOTSTRAP_BACKOFF_MIN: Duration = Duration::from_millis(100);
const BOOTSTRAP_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct Router {
    dht: Arc<dyn Dht>,
    registry_port: u16,
    ready: AtomicBool,
    balancers: Cache<String, Arc<Balancer>>,
}

impl Router {
    pub fn new(dht: Arc<dyn Dht>, registry_port: u16) -> Router {
        let balancers = Cache::builder()
            .time_to_idle(BALANCER_IDLE)
            .max_capacity(10_000)
            .build();
        Router {
            dht,
            registry_port,
            ready: AtomicBool::new(false),
            balancers,
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    // republishing is cheap and keys expire on their own, so failures only get logged
    // and the next tick tries again
    pub async fn advertise(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.dht.provide(key).await {
                debug!("advertise {key} failed {e:?}");
            }
        }
    }

    pub async fn lookup(&self, key: &str, max_count: usize) -> Arc<Balancer> {
        if let Some(balancer) = self.balancers.get(key).await {
            if !balancer.is_closed() || balancer.size() >= max_count {
                trace!("balancer reuse for {key}");
                return balancer;
            }
            // finished below what the caller wants, query again
            self.balancers.invalidate(key).await;
        }
        self.balancers
            .entry_by_ref(key)
            .or_insert_with(self.start_lookup(key, max_count))
            .await
            .into_value()
    }

    async fn start_lookup(&self, key: &str, max_count: usize) -> Arc<Balancer> {
        let balancer = Arc::new(Balancer::new());
        let providers = self.dht.find_providers(key, max_count).await;
        let local = self.dht.local_provider().id;
        let port = self.registry_port;
        let key = key.to_string();
        let task_balancer = balancer.clone();
        tokio::spawn(async move {
            let mut providers = providers;
            let mut added = 0;
            while let Some(provider) = providers.recv().await {
                if provider.id == local {
                    continue;
                }
                // a record has to pin down exactly one address to be usable
                let &[ip] = provider.addrs.as_slice() else {
                    debug!(
                        "skipping provider {} with {} addrs",
                        provider.id,
                        provider.addrs.len()
                    );
                    continue;
                };
                if task_balancer.add(Peer { ip, port }) {
                    added += 1;
                    if added >= max_count {
                        break;
                    }
                }
            }
            trace!("lookup for {key} found {added} peers");
            task_balancer.close();
        });
        balancer
    }

    // contact the bootstrapper forever: quickly with backoff while we are not ready or
    // lost the whole table, every 30s otherwise
    pub async fn run_bootstrap(&self, bootstrapper: &dyn Bootstrapper) {
        let mut backoff = BOOTSTRAP_BACKOFF_MIN;
        loop {
            let settled = self.bootstrap_pass(bootstrapper).await;
            let sleep = if settled {
                backoff = BOOTSTRAP_BACKOFF_MIN;
                BOOTSTRAP_INTERVAL
            } else {
                let jittered = jitter(backoff);
                backoff = (backoff * 2).min(BOOTSTRAP_BACKOFF_MAX);
                jittered
            };
            tokio::time::sleep(sleep).await;
        }
    }

    // one pass against the bootstrapper. returns whether the node is in a settled
    // state (ready with a populated table, or alone in the cluster)
    pub async fn bootstrap_pass(&self, bootstrapper: &dyn Bootstrapper) -> bool {
        let peers = match bootstrapper.peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("bootstrapper unavailable {e:?}");
                return false;
            }
        };

        let local = self.dht.local_provider();
        let mut others = 0;
        for addr in peers {
            let is_self = match &addr.id {
                Some(id) => *id == local.id,
                None => local.addrs.contains(&addr.ip),
            };
            if is_self {
                continue;
            }
            others += 1;
            match self.dht.connect(&addr).await {
                Ok(id) => trace!("connected to {id} at {}:{}", addr.ip, addr.port),
                Err(e) => warn!("connect to {}:{} failed {e:?}", addr.ip, addr.port),
            }
        }

        if others == 0 || self.dht.table_size() > 0 {
            self.ready.store(true, Ordering::Relaxed);
        }
        self.ready() && (others == 0 || self.dht.table_size() > 0)
    }
}

fn jitter(base: Duration) -> Duration {
    use rand::Rng;
    let extra = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra)
}
