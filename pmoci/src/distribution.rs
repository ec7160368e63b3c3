use oci_spec::image::Digest;
use once_cell::sync::Lazy;
use regex::Regex;

// name and tag grammars from the distribution spec. names can nest with /, tags cannot.
// the whole path has to match exactly, a name component could itself be called "manifests"
// so the greedy name capture keeps only the last separator as the route split
static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^/v2/(?P<name>[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*)/(?P<kind>manifests|blobs)/(?P<reference>[^/]+)$",
    )
    .unwrap()
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // path does not look like a distribution endpoint at all
    NotRecognized,
    // matched the shape but the reference is not a valid tag or digest
    BadReference(String),
    // a tag is only meaningful relative to an upstream registry
    MissingNamespace,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub enum ManifestRef {
    Tag(String),
    Digest(Digest),
}

impl ManifestRef {
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            ManifestRef::Tag(_) => None,
            ManifestRef::Digest(d) => Some(d),
        }
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ManifestRef::Tag(t) => write!(f, "{t}"),
            ManifestRef::Digest(d) => write!(f, "{d}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DistributionPath {
    Manifest {
        registry: String,
        name: String,
        reference: ManifestRef,
    },
    Blob {
        registry: String,
        name: String,
        digest: Digest,
    },
}

impl DistributionPath {
    // ns carries the upstream registry host. it is required for tag references since a
    // tag on its own does not name unique content anywhere
    pub fn parse(path: &str, ns: Option<&str>) -> Result<DistributionPath, Error> {
        let caps = PATH_RE.captures(path).ok_or(Error::NotRecognized)?;
        let name = caps["name"].to_string();
        let reference = &caps["reference"];
        let registry = ns.unwrap_or_default().to_string();
        match &caps["kind"] {
            "manifests" => {
                if reference.contains(':') {
                    let digest: Digest = reference
                        .parse()
                        .map_err(|_| Error::BadReference(reference.to_string()))?;
                    Ok(DistributionPath::Manifest {
                        registry,
                        name,
                        reference: ManifestRef::Digest(digest),
                    })
                } else {
                    if !TAG_RE.is_match(reference) {
                        return Err(Error::BadReference(reference.to_string()));
                    }
                    if ns.is_none_or(|s| s.is_empty()) {
                        return Err(Error::MissingNamespace);
                    }
                    Ok(DistributionPath::Manifest {
                        registry,
                        name,
                        reference: ManifestRef::Tag(reference.to_string()),
                    })
                }
            }
            "blobs" => {
                let digest: Digest = reference
                    .parse()
                    .map_err(|_| Error::BadReference(reference.to_string()))?;
                Ok(DistributionPath::Blob {
                    registry,
                    name,
                    digest,
                })
            }
            _ => unreachable!(),
        }
    }

    pub fn registry(&self) -> &str {
        match self {
            DistributionPath::Manifest { registry, .. } => registry,
            DistributionPath::Blob { registry, .. } => registry,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DistributionPath::Manifest { name, .. } => name,
            DistributionPath::Blob { name, .. } => name,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            DistributionPath::Manifest { reference, .. } => reference.digest(),
            DistributionPath::Blob { digest, .. } => Some(digest),
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, DistributionPath::Blob { .. })
    }

    // the routing key: content digest when we have one, else the fully qualified tag
    pub fn key(&self) -> String {
        match self.digest() {
            Some(d) => d.to_string(),
            None => self.identifier(),
        }
    }

    // what filter regexes get matched against
    pub fn identifier(&self) -> String {
        match self {
            DistributionPath::Manifest {
                registry,
                name,
                reference: ManifestRef::Tag(tag),
            } => format!("{registry}/{name}:{tag}"),
            DistributionPath::Manifest {
                registry,
                name,
                reference: ManifestRef::Digest(digest),
            } => format!("{registry}/{name}@{digest}"),
            DistributionPath::Blob {
                registry,
                name,
                digest,
            } => format!("{registry}/{name}@{digest}"),
        }
    }

    // the path on the peer side is the same path we got, ns included
    pub fn url_path(&self) -> String {
        match self {
            DistributionPath::Manifest {
                registry,
                name,
                reference,
            } => format!("/v2/{}/manifests/{}?ns={}", name, reference, registry),
            DistributionPath::Blob {
                registry,
                name,
                digest,
            } => format!("/v2/{}/blobs/{}?ns={}", name, digest, registry),
        }
    }
}

// one image as enumerated from the local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Digest,
}

impl Image {
    pub fn identifier(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}/{}:{}", self.registry, self.repository, tag),
            None => format!("{}/{}@{}", self.registry, self.repository, self.digest),
        }
    }

    pub fn tagged_reference(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}/{}:{}", self.registry, self.repository, tag))
    }

    // registry/repo:tag or registry/repo@sha256:... as stored in ref.name annotations
    pub fn parse_reference(reference: &str, digest: Digest) -> Option<Image> {
        let (rest, tag) = match reference.rsplit_once('@') {
            Some((rest, _digest)) => (rest, None),
            None => match reference.rsplit_once(':') {
                Some((rest, tag)) => (rest, Some(tag.to_string())),
                None => (reference, None),
            },
        };
        let (registry, repository) = rest.split_once('/')?;
        if registry.is_empty() || repository.is_empty() {
            return None;
        }
        Some(Image {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}
