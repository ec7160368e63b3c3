use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use regex::Regex;

use pmoci::ocidist::Client;
use pmoci::store::{ContentStore, OciDirStore};
use pmrouter::bootstrap::StaticBootstrapper;
use pmrouter::dht::{MemoryMesh, NodeAddr};
use pmrouter::router::Router;

use pmserver::mirror::BufferPool;
use pmserver::registry::{self, Config, Ctx};
use pmserver::tracker;
use pmserver::util::setup_logs;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // where the registry listens
    #[arg(long, default_value = "0.0.0.0:5000")]
    addr: SocketAddr,

    // port peers reach each other on, defaults to the listen port
    #[arg(long)]
    registry_port: Option<u16>,

    // OCI image layout directory backing the local store
    #[arg(long)]
    store_dir: PathBuf,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long, default_value_t = 3)]
    resolve_retries: usize,

    #[arg(long, default_value_t = 20)]
    resolve_timeout_ms: u64,

    // references matching any of these never get served or advertised
    #[arg(long = "filter")]
    filters: Vec<String>,

    // ip:port or id@ip:port of nodes to bootstrap from
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    #[arg(long)]
    node_id: Option<String>,

    // the address peers see us under
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    #[arg(long, default_value_t = 60)]
    store_refresh_secs: u64,

    // write containerd hosts.toml mirror config here on startup
    #[arg(long)]
    mirror_config_dir: Option<PathBuf>,

    // upstream registries to write mirror config for
    #[arg(long = "mirror-registry", default_value = "docker.io")]
    mirror_registries: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logs();
    let args = Args::parse();

    let registry_port = args.registry_port.unwrap_or(args.addr.port());
    let filters = args
        .filters
        .iter()
        .map(|f| Regex::new(f))
        .collect::<Result<Vec<_>, _>>()?;
    let bootstrap = args
        .bootstrap
        .iter()
        .map(|s| NodeAddr::parse(s).ok_or_else(|| anyhow::anyhow!("bad bootstrap address {s:?}")))
        .collect::<Result<Vec<_>, _>>()?;
    let basic_auth = match (args.username, args.password) {
        (Some(user), Some(pass)) => Some((user, pass)),
        (None, None) => None,
        _ => anyhow::bail!("--username and --password go together"),
    };

    if let Some(dir) = &args.mirror_config_dir {
        let mirror_url = format!("http://localhost:{}", args.addr.port());
        pmserver::hosts::write_mirror_config(dir, &mirror_url, &args.mirror_registries)?;
    }

    let store = Arc::new(OciDirStore::new(args.store_dir.clone()).await?);

    let node_id = args.node_id.unwrap_or_else(random_node_id);
    let mesh = MemoryMesh::new();
    let dht = Arc::new(mesh.join(node_id.clone(), args.advertise_ip.into_iter().collect()));
    let router = Arc::new(Router::new(dht, registry_port));
    info!("node {node_id} serving peers on port {registry_port}");

    let bootstrapper = StaticBootstrapper::new(bootstrap);
    {
        let router = router.clone();
        tokio::spawn(async move { router.run_bootstrap(&bootstrapper).await });
    }
    tokio::spawn(
        store
            .clone()
            .watch(Duration::from_secs(args.store_refresh_secs)),
    );
    tokio::spawn(tracker::run(
        store.clone() as Arc<dyn ContentStore>,
        router.clone(),
        Arc::new(filters.clone()),
    ));

    let ctx = Arc::new(Ctx {
        store: store as Arc<dyn ContentStore>,
        router,
        client: Client::new()?,
        buffers: Arc::new(BufferPool::new()),
        config: Config {
            basic_auth,
            filters,
            resolve_retries: args.resolve_retries,
            resolve_timeout: Duration::from_millis(args.resolve_timeout_ms),
            scheme: "http".to_string(),
        },
    });

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, registry::app(ctx))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.unwrap();
        })
        .await?;
    Ok(())
}

fn random_node_id() -> String {
    use rand::Rng;
    let n: u64 = rand::rng().random();
    format!("node-{n:016x}")
}
