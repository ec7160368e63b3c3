use std::time::Duration;

use log::trace;
use oci_spec::image::{Descriptor, Digest};
use reqwest::{Method, Response, StatusCode, header, header::HeaderMap};

use crate::distribution::DistributionPath;

pub const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
// peers mark their requests so the receiving node never mirrors a mirror request
pub const MIRRORED_HEADER: &str = "x-spegel-mirrored";
pub const MIRRORED_HEADER_VALUE: &str = "true";
pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    UnexpectedStatus {
        expected: &'static str,
        got: StatusCode,
        body: String,
    },
    MissingDigestHeader,
    BadDigestHeader,
    MissingContentLength,
    BadContentLength,
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FetchOptions {
    // forwarded verbatim, e.g. the original Accept header
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    // inclusive byte range
    pub range: Option<(u64, u64)>,
    // covers the whole request including the body read, reqwest enforces it end to end
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
}

impl Client {
    pub fn new() -> Result<Self, Error> {
        // peers serve content directly, anything that redirects is not one of ours
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Client { client })
    }

    // mirror is scheme://host:port of the selected peer. returns the descriptor parsed from
    // the response headers and the still-open response, draining it is on the caller
    pub async fn fetch(
        &self,
        method: Method,
        mirror: &str,
        path: &DistributionPath,
        opts: &FetchOptions,
    ) -> Result<(Descriptor, Response), Error> {
        let url = format!("{}{}", mirror, path.url_path());
        trace!("{method} {url} range={:?}", opts.range);

        let mut request = self
            .client
            .request(method, &url)
            .header(MIRRORED_HEADER, MIRRORED_HEADER_VALUE);
        for (name, value) in &opts.headers {
            request = request.header(name, value);
        }
        if let Some((user, pass)) = &opts.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        if let Some((start, end)) = opts.range {
            request = request.header(header::RANGE, format!("bytes={start}-{end}"));
        }
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            _ => return Err(unexpected_status(response).await),
        }

        let descriptor = descriptor_from_headers(response.headers())?;
        Ok((descriptor, response))
    }
}

pub fn descriptor_from_headers(headers: &HeaderMap) -> Result<Descriptor, Error> {
    let digest: Digest = headers
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .ok_or(Error::MissingDigestHeader)?
        .to_str()
        .map_err(|_| Error::BadDigestHeader)?
        .parse()
        .map_err(|_| Error::BadDigestHeader)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|x| x.to_str().ok())
        .unwrap_or(OCTET_STREAM);

    let size: u64 = headers
        .get(header::CONTENT_LENGTH)
        .ok_or(Error::MissingContentLength)?
        .to_str()
        .map_err(|_| Error::BadContentLength)?
        .parse()
        .map_err(|_| Error::BadContentLength)?;

    Ok(Descriptor::new(content_type.into(), size, digest))
}

async fn unexpected_status(res: Response) -> Error {
    let status = res.status();
    // keep a snippet for the log line, peers send the distribution error json here
    let body = match res.text().await {
        Ok(s) => s.chars().take(256).collect(),
        Err(_) => String::new(),
    };
    Error::UnexpectedStatus {
        expected: "200 or 206",
        got: status,
        body,
    }
}
