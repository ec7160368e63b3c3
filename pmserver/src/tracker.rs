use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use regex::Regex;
use tokio::sync::broadcast;

use pmoci::store::{ContentStore, ImageEvent, referenced_keys};
use pmrouter::dht::KEY_TTL;
use pmrouter::router::Router;

use crate::filtered;
use crate::metrics::{ADVERTISED_KEYS, TRACKED_DIGESTS, TRACKED_IMAGES, TRACKED_TAGS};

// republish one minute ahead of provider record expiry
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(KEY_TTL.as_secs() - 60);

// long lived task: a full advertise pass on start and then ahead of every TTL expiry,
// plus an immediate advertise of anything that shows up in the store in between
pub async fn run(store: Arc<dyn ContentStore>, router: Arc<Router>, filters: Arc<Vec<Regex>>) {
    let mut events = store.subscribe();
    let mut events_open = true;
    let mut tick = tokio::time::interval(ADVERTISE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = advertise_once(store.as_ref(), &router, &filters).await {
                    error!("full advertise failed {e:?}");
                }
            }
            event = events.recv(), if events_open => match event {
                Ok(ImageEvent::Create(image)) => {
                    let identifier = image.identifier();
                    if filtered(&filters, &identifier) {
                        debug!("not advertising filtered {identifier}");
                    } else {
                        // referenced digests ride the next full pass
                        router.advertise(std::slice::from_ref(&identifier)).await;
                    }
                }
                // removals age out of the DHT on their own, nothing to withdraw
                Ok(ImageEvent::Delete(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("dropped {n} store events"),
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            }
        }
    }
}

#[derive(Default)]
struct RegistryCounts {
    images: i64,
    digests: BTreeSet<String>,
    tags: BTreeSet<String>,
}

// enumerate the store and republish every key we can serve. gauges describe exactly
// this pass, so they reset here and nowhere else
pub async fn advertise_once(
    store: &dyn ContentStore,
    router: &Router,
    filters: &[Regex],
) -> Result<(), pmoci::store::Error> {
    let images = store.list_images().await?;
    let mut per_registry: BTreeMap<String, RegistryCounts> = BTreeMap::new();

    for image in images {
        let identifier = image.identifier();
        if filtered(filters, &identifier) {
            debug!("skipping filtered {identifier}");
            continue;
        }
        let counts = per_registry.entry(image.registry.clone()).or_default();
        counts.images += 1;
        counts.digests.insert(image.digest.to_string());
        if let Some(tagged) = image.tagged_reference() {
            counts.tags.insert(tagged);
        }
        for key in referenced_keys(store, &image.digest).await? {
            counts.digests.insert(key);
        }
    }

    TRACKED_IMAGES.reset();
    TRACKED_DIGESTS.reset();
    TRACKED_TAGS.reset();
    ADVERTISED_KEYS.reset();

    let mut keys: BTreeSet<String> = BTreeSet::new();
    for (registry, counts) in per_registry.iter() {
        TRACKED_IMAGES
            .with_label_values(&[registry])
            .set(counts.images);
        TRACKED_DIGESTS
            .with_label_values(&[registry])
            .set(counts.digests.len() as i64);
        TRACKED_TAGS
            .with_label_values(&[registry])
            .set(counts.tags.len() as i64);
        ADVERTISED_KEYS
            .with_label_values(&[registry])
            .set((counts.digests.len() + counts.tags.len()) as i64);
        keys.extend(counts.digests.iter().cloned());
        keys.extend(counts.tags.iter().cloned());
    }

    let keys: Vec<String> = keys.into_iter().collect();
    debug!("advertising {} keys", keys.len());
    router.advertise(&keys).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use pmrouter::dht::MemoryMesh;
    use pmrouter::router::Router;
    use std::net::IpAddr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([10, 1, 0, n])
    }

    #[tokio::test]
    async fn test_advertise_once_publishes_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let installed = testutil::install_image(dir.path(), "docker.io/library/busybox:1.36.1", b"layer");
        let store = pmoci::store::OciDirStore::new(dir.path()).await.unwrap();

        let mesh = MemoryMesh::new();
        let advertiser = Router::new(std::sync::Arc::new(mesh.join("a", vec![ip(1)])), 5000);
        advertise_once(&store, &advertiser, &[]).await.unwrap();

        // every key is now resolvable from another node on the mesh
        let consumer = Router::new(std::sync::Arc::new(mesh.join("b", vec![ip(2)])), 5000);
        for key in [
            installed.manifest.to_string(),
            installed.config.to_string(),
            installed.layer.to_string(),
            "docker.io/library/busybox:1.36.1".to_string(),
        ] {
            let balancer = consumer.lookup(&key, 3).await;
            let peer = balancer.next().await.unwrap();
            assert_eq!(peer.ip, ip(1), "{key}");
        }
    }

    #[tokio::test]
    async fn test_advertise_once_respects_filters() {
        let dir = tempfile::tempdir().unwrap();
        let installed = testutil::install_image(dir.path(), "docker.io/library/busybox:latest", b"layer");
        let store = pmoci::store::OciDirStore::new(dir.path()).await.unwrap();

        let mesh = MemoryMesh::new();
        let advertiser = Router::new(std::sync::Arc::new(mesh.join("a", vec![ip(1)])), 5000);
        let filters = vec![Regex::new(":latest$").unwrap()];
        advertise_once(&store, &advertiser, &filters).await.unwrap();

        let consumer = Router::new(std::sync::Arc::new(mesh.join("b", vec![ip(2)])), 5000);
        let balancer = consumer.lookup(&installed.manifest.to_string(), 3).await;
        assert!(
            tokio::time::timeout(Duration::from_secs(1), balancer.next())
                .await
                .unwrap()
                .is_err()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_advertises_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(pmoci::store::OciDirStore::new(dir.path()).await.unwrap());

        let mesh = MemoryMesh::new();
        let router = std::sync::Arc::new(Router::new(
            std::sync::Arc::new(mesh.join("a", vec![ip(1)])),
            5000,
        ));
        tokio::spawn(run(
            store.clone() as std::sync::Arc<dyn ContentStore>,
            router.clone(),
            std::sync::Arc::new(Vec::new()),
        ));
        // let the tracker subscribe before the store changes
        tokio::time::sleep(Duration::from_millis(50)).await;

        testutil::install_image(dir.path(), "ghcr.io/foo/bar:1.0", b"fresh");
        store.refresh().await.unwrap();

        let consumer = Router::new(std::sync::Arc::new(mesh.join("b", vec![ip(2)])), 5000);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let balancer = consumer.lookup("ghcr.io/foo/bar:1.0", 3).await;
            if let Ok(Ok(peer)) =
                tokio::time::timeout(Duration::from_millis(50), balancer.next()).await
            {
                assert_eq!(peer.ip, ip(1));
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "identifier never advertised"
            );
        }
    }
}
