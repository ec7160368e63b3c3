use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::TryStreamExt;
use http::{Method, StatusCode, header};
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use pmoci::distribution::DistributionPath;
use pmoci::ocidist::{Client, DOCKER_CONTENT_DIGEST_HEADER, FetchOptions, OCTET_STREAM};
use pmrouter::balancer::Balancer;
use pmrouter::router::Router;

use crate::metrics::MIRROR_REQUESTS;
use crate::range::HttpRange;
use crate::registry::distribution_error;

pub const COPY_BUFFER_SIZE: usize = 32 * 1024;
// keep at most this many idle buffers around
const POOL_LIMIT: usize = 64;

const HEAD_TIMEOUT: Duration = Duration::from_secs(1);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MirrorConfig {
    pub resolve_retries: usize,
    pub resolve_timeout: Duration,
    // whatever scheme we terminate is the scheme peers speak
    pub scheme: String,
    // peers enforce the same credentials this node does
    pub basic_auth: Option<(String, String)>,
}

// free list of copy buffers, one gets checked out per body copy
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl Default for BufferPool {
    fn default() -> BufferPool {
        BufferPool::new()
    }
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Box<[u8]> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUFFER_SIZE].into_boxed_slice())
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < POOL_LIMIT {
            free.push(buf);
        }
    }
}

// blobs get the ambient request deadline, everything else is small and bounded per peer
fn attempt_timeout(method: &Method, path: &DistributionPath) -> Option<Duration> {
    if *method == Method::HEAD {
        Some(HEAD_TIMEOUT)
    } else if path.is_blob() {
        None
    } else {
        Some(MANIFEST_TIMEOUT)
    }
}

enum CopyOutcome {
    Done,
    // the client went away, nothing left to do
    Downstream,
    Upstream(io::Error),
}

pub async fn handle(
    router: &Router,
    client: &Client,
    buffers: &Arc<BufferPool>,
    config: &MirrorConfig,
    method: &Method,
    path: &DistributionPath,
    client_range: Option<HttpRange>,
    accept: Option<String>,
) -> Response {
    let key = path.key();
    let registry = path.registry().to_string();
    let retries = config.resolve_retries;
    let per_attempt = attempt_timeout(method, path);

    let balancer = router.lookup(&key, retries).await;
    // one shared deadline bounds every wait for a peer, already-discovered peers
    // come back instantly
    let resolve_deadline = tokio::time::Instant::now() + config.resolve_timeout;

    let mut attempts = 0usize;
    while attempts < retries {
        let peer = match tokio::time::timeout_at(resolve_deadline, balancer.next()).await {
            Ok(Ok(peer)) => peer,
            Ok(Err(_)) => break,
            Err(_) => {
                debug!("resolve timed out for {key} after {attempts} attempts");
                break;
            }
        };
        attempts += 1;

        let mirror = format!("{}://{}", config.scheme, peer.socket_addr());
        let opts = FetchOptions {
            headers: accept
                .iter()
                .map(|v| (header::ACCEPT.to_string(), v.clone()))
                .collect(),
            basic_auth: config.basic_auth.clone(),
            range: client_range.map(|r| (r.start, r.end)),
            timeout: per_attempt,
        };
        let (descriptor, response) = match client.fetch(method.clone(), &mirror, path, &opts).await
        {
            Ok(ok) => ok,
            Err(e) => {
                debug!("fetch {key} from {peer} failed: {e}");
                balancer.remove(&peer);
                continue;
            }
        };
        // a peer that ignores the range would restart the byte stream on us
        if client_range.is_some() && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!("peer {peer} ignored range request for {key}");
            balancer.remove(&peer);
            continue;
        }

        MIRROR_REQUESTS.with_label_values(&[&registry, "hit"]).inc();

        // headers are committed from here on, failures can only truncate
        let builder = response_builder(path, &descriptor, &client_range, &response);
        if *method == Method::HEAD {
            return builder.body(Body::empty()).unwrap();
        }

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
        let copy = CopyTask {
            client: client.clone(),
            balancer: balancer.clone(),
            buffers: buffers.clone(),
            path: path.clone(),
            scheme: config.scheme.clone(),
            basic_auth: config.basic_auth.clone(),
            resolve_deadline,
            retries,
            resume_base: client_range.map(|r| r.start).unwrap_or(0),
            resume_end: client_range
                .map(|r| r.end)
                .unwrap_or_else(|| descriptor.size().saturating_sub(1)),
            expected: client_range
                .map(|r| r.size())
                .unwrap_or_else(|| descriptor.size()),
        };
        tokio::spawn(copy.run(tx, peer, response, attempts, key));
        return builder
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .unwrap();
    }

    MIRROR_REQUESTS
        .with_label_values(&[&registry, "miss"])
        .inc();
    debug!("mirror miss for {key} after {attempts} attempts");
    let code = if path.is_blob() {
        "BLOB_UNKNOWN"
    } else {
        "MANIFEST_UNKNOWN"
    };
    distribution_error(
        StatusCode::NOT_FOUND,
        code,
        "content not found on any peer",
        Some(attempts),
    )
}

fn response_builder(
    path: &DistributionPath,
    descriptor: &oci_spec::image::Descriptor,
    client_range: &Option<HttpRange>,
    response: &reqwest::Response,
) -> http::response::Builder {
    if !path.is_blob() {
        // descriptor headers as-is
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, descriptor.media_type().to_string())
            .header(header::CONTENT_LENGTH, descriptor.size())
            .header(DOCKER_CONTENT_DIGEST_HEADER, descriptor.digest().to_string());
    }
    match client_range {
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, OCTET_STREAM)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, descriptor.size())
            .header(DOCKER_CONTENT_DIGEST_HEADER, descriptor.digest().to_string()),
        Some(range) => {
            // the peer told us the total in its own Content-Range
            let total = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit_once('/'))
                .map(|(_, total)| total.to_string())
                .unwrap_or_else(|| "*".to_string());
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, OCTET_STREAM)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, total),
                )
                .header(header::CONTENT_LENGTH, range.size())
                .header(DOCKER_CONTENT_DIGEST_HEADER, descriptor.digest().to_string())
        }
    }
}

struct CopyTask {
    client: Client,
    balancer: Arc<Balancer>,
    buffers: Arc<BufferPool>,
    path: DistributionPath,
    scheme: String,
    basic_auth: Option<(String, String)>,
    resolve_deadline: tokio::time::Instant,
    retries: usize,
    // where the byte stream started and where it must end, client range or whole blob
    resume_base: u64,
    resume_end: u64,
    // how many bytes the downstream was promised
    expected: u64,
}

impl CopyTask {
    async fn run(
        self,
        tx: mpsc::Sender<io::Result<Bytes>>,
        mut peer: pmrouter::balancer::Peer,
        mut response: reqwest::Response,
        mut attempts: usize,
        key: String,
    ) {
        let mut copied: u64 = 0;
        loop {
            match copy_body(response, &tx, &self.buffers, &mut copied).await {
                // trust content-length enforcement only as far as it goes, the size on
                // the wire has to match what the headers promised
                CopyOutcome::Done if copied == self.expected => {
                    debug!("mirrored {key} from {peer}, {copied} bytes");
                    return;
                }
                CopyOutcome::Done => {
                    warn!(
                        "peer {peer} sent {copied} of {} bytes for {key}",
                        self.expected
                    );
                    self.balancer.remove(&peer);
                    if !self.path.is_blob() {
                        let _ = tx.send(Err(io::Error::other("short manifest copy"))).await;
                        return;
                    }
                }
                CopyOutcome::Downstream => {
                    debug!("client went away mid mirror of {key}");
                    return;
                }
                CopyOutcome::Upstream(e) => {
                    warn!("copy of {key} from {peer} died after {copied} bytes: {e}");
                    self.balancer.remove(&peer);
                    if !self.path.is_blob() {
                        // a partial manifest is not recoverable once bytes are out
                        let _ = tx.send(Err(io::Error::other("manifest copy failed"))).await;
                        return;
                    }
                }
            }

            // resume against another peer from where the stream broke off
            let range = (self.resume_base + copied, self.resume_end);
            let mut resumed = None;
            while attempts < self.retries {
                let candidate =
                    match tokio::time::timeout_at(self.resolve_deadline, self.balancer.next())
                        .await
                    {
                        Ok(Ok(peer)) => peer,
                        _ => break,
                    };
                attempts += 1;
                let mirror = format!("{}://{}", self.scheme, candidate.socket_addr());
                let opts = FetchOptions {
                    headers: Vec::new(),
                    basic_auth: self.basic_auth.clone(),
                    range: Some(range),
                    timeout: None,
                };
                match self
                    .client
                    .fetch(Method::GET, &mirror, &self.path, &opts)
                    .await
                {
                    Ok((_, response)) if response.status() == StatusCode::PARTIAL_CONTENT => {
                        debug!("resuming {key} from {candidate} at byte {}", range.0);
                        resumed = Some((candidate, response));
                        break;
                    }
                    Ok(_) => {
                        // a 200 would restart from byte zero and corrupt the stream
                        debug!("peer {candidate} cannot resume {key}");
                        self.balancer.remove(&candidate);
                    }
                    Err(e) => {
                        debug!("resume fetch {key} from {candidate} failed: {e}");
                        self.balancer.remove(&candidate);
                    }
                }
            }
            match resumed {
                Some((p, r)) => {
                    peer = p;
                    response = r;
                }
                None => {
                    warn!("mirror of {key} truncated at {copied} bytes after {attempts} attempts");
                    let _ = tx.send(Err(io::Error::other("all mirror attempts failed"))).await;
                    return;
                }
            }
        }
    }
}

// pump the peer body into the response channel through a pooled buffer. the bounded
// channel is what carries client backpressure all the way to the peer read
async fn copy_body(
    response: reqwest::Response,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    buffers: &BufferPool,
    copied: &mut u64,
) -> CopyOutcome {
    let stream = response.bytes_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(stream);
    let mut buf = buffers.take();
    let outcome = loop {
        match reader.read(&mut buf[..]).await {
            Ok(0) => break CopyOutcome::Done,
            Ok(n) => {
                if tx
                    .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    break CopyOutcome::Downstream;
                }
                *copied += n as u64;
            }
            Err(e) => break CopyOutcome::Upstream(e),
        }
    };
    buffers.put(buf);
    outcome
}
