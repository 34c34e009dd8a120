//! Registry target resolution and image paths.

use std::fmt;

use axum::http::Uri;

use crate::error::{ProxyError, ProxyResult};

/// Upstream host for Docker Hub.
pub const DOCKERHUB: &str = "registry-1.docker.io";

/// Upstream host for the GitHub Container Registry.
pub const GHCR: &str = "ghcr.io";

/// Map an explicit route target onto an upstream host.
///
/// Returns `None` when the target is empty or not recognizable as a host.
pub fn explicit_target(target: &str) -> Option<&str> {
    match target {
        "docker.io" => Some(DOCKERHUB),
        "ghcr.io" => Some(GHCR),
        "gcr.io" => Some(target),
        _ if target.ends_with(".gcr.io") => Some(target),
        _ if target.contains('.') => Some(target),
        _ => None,
    }
}

/// Map the configured default target onto an upstream host.
pub fn default_target(target: &str) -> ProxyResult<&str> {
    match target {
        "" => Err(ProxyError::Forbidden("Docker target is not set".into())),
        "ghcr" => Ok(GHCR),
        "dockerhub" => Ok(DOCKERHUB),
        literal => Ok(literal),
    }
}

/// Pick the upstream host: a recognized explicit target wins, then the configured default.
pub fn resolve_target(explicit: &str, default: &str) -> ProxyResult<String> {
    if let Some(host) = explicit_target(explicit) {
        return Ok(host.to_owned());
    }

    if !explicit.is_empty() {
        tracing::debug!(registry = explicit, "unrecognized registry target, using default");
    }

    default_target(default).map(str::to_owned)
}

/// An image identity, `owner/repo`.
///
/// The canonical name is both the token cache key and the subject of the pull scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    name: String,
}

impl ImageName {
    /// Join `owner` and `repo` into an image name.
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            name: format!("{owner}/{repo}"),
        }
    }

    /// The canonical `owner/repo` string.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Token scope for pulling this image.
    pub fn scope(&self) -> String {
        format!("repository:{}:pull", self.name)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A registry request path, split after `/v2/`.
///
/// `ghcr.io/owner/repo/manifests/latest` names an explicit target, since the first
/// segment contains a `.`. `library/ubuntu/manifests/latest` goes to the configured
/// default target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPath {
    /// Explicit target from the first segment, if any.
    pub target: Option<String>,
    /// Image identity, when the path has one.
    pub image: Option<ImageName>,
    /// Everything after `owner/repo`, with its leading `/`. May be empty.
    pub filepath: String,
}

impl RegistryPath {
    /// Parse the part of a request path which follows `/v2/`.
    pub fn parse(rest: &str) -> ProxyResult<Self> {
        let (first, _) = split_segment(rest);

        if first.contains('.') {
            let (_, rest) = split_segment(rest);
            let (owner, rest) = split_segment(rest);
            let (repo, filepath) = split_segment(rest);
            if owner.is_empty() || repo.is_empty() {
                return Err(ProxyError::BadRequest(
                    "malformed image path: missing user/repo".into(),
                ));
            }

            return Ok(RegistryPath {
                target: Some(first.to_owned()),
                image: Some(ImageName::new(owner, repo)),
                filepath: with_slash(filepath),
            });
        }

        let (owner, rest) = split_segment(rest);
        let (repo, filepath) = split_segment(rest);
        let image = (!owner.is_empty() && !repo.is_empty()).then(|| ImageName::new(owner, repo));

        Ok(RegistryPath {
            target: None,
            image,
            filepath: with_slash(filepath),
        })
    }
}

/// Split at the first `/`, returning the segment and what follows the slash.
fn split_segment(path: &str) -> (&str, &str) {
    path.split_once('/').unwrap_or((path, ""))
}

fn with_slash(filepath: &str) -> String {
    if filepath.is_empty() {
        String::new()
    } else {
        format!("/{filepath}")
    }
}

/// Where a registry request is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Upstream authority, also sent as the `Host` header.
    pub host: String,
    /// Full upstream URL.
    pub uri: Uri,
}

impl Destination {
    /// Resolve the destination for a parsed registry path.
    ///
    /// An explicit target rewrites the path to `/v2/<owner>/<repo><filepath>`. Requests
    /// for the default target keep the original path and query.
    pub fn resolve(path: &RegistryPath, default: &str, request: &Uri) -> ProxyResult<Self> {
        let explicit = path.target.as_deref().unwrap_or_default();

        let explicit_host = explicit_target(explicit);
        let (host, path_and_query) = match (explicit_host, &path.image) {
            (Some(host), Some(image)) => {
                let mut rewritten = format!("/v2/{image}{}", path.filepath);
                if let Some(query) = request.query() {
                    rewritten.push('?');
                    rewritten.push_str(query);
                }
                (host.to_owned(), rewritten)
            }
            _ => {
                let host = resolve_target(explicit, default)?;
                let original = request
                    .path_and_query()
                    .map_or_else(|| request.path().to_owned(), |pq| pq.as_str().to_owned());
                (host, original)
            }
        };

        let uri = Uri::builder()
            .scheme("https")
            .authority(host.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|err| ProxyError::BadRequest(format!("invalid upstream url: {err}")))?;

        Ok(Destination { host, uri })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn explicit_targets() {
        assert_eq!(resolve_target("docker.io", "").unwrap(), DOCKERHUB);
        assert_eq!(resolve_target("ghcr.io", "").unwrap(), GHCR);
        assert_eq!(resolve_target("gcr.io", "").unwrap(), "gcr.io");
        assert_eq!(resolve_target("foo.gcr.io", "").unwrap(), "foo.gcr.io");
        assert_eq!(
            resolve_target("registry.example.com", "").unwrap(),
            "registry.example.com"
        );
    }

    #[test]
    fn default_targets() {
        assert_eq!(resolve_target("", "ghcr").unwrap(), GHCR);
        assert_eq!(resolve_target("", "dockerhub").unwrap(), DOCKERHUB);
        assert_eq!(
            resolve_target("", "mirror.example.com").unwrap(),
            "mirror.example.com"
        );
    }

    #[test]
    fn unrecognized_explicit_target_uses_default() {
        assert_eq!(resolve_target("localhost", "ghcr").unwrap(), GHCR);
    }

    #[test]
    fn missing_default_is_forbidden() {
        let err = resolve_target("", "").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let err = resolve_target("nodots", "").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn image_name() {
        let image = ImageName::new("library", "ubuntu");
        assert_eq!(image.as_str(), "library/ubuntu");
        assert_eq!(image.scope(), "repository:library/ubuntu:pull");
        assert_eq!(image.to_string(), "library/ubuntu");
    }

    #[test]
    fn parse_explicit_target_path() {
        let path = RegistryPath::parse("ghcr.io/owner/app/manifests/v1").unwrap();
        assert_eq!(path.target.as_deref(), Some("ghcr.io"));
        assert_eq!(path.image, Some(ImageName::new("owner", "app")));
        assert_eq!(path.filepath, "/manifests/v1");
    }

    #[test]
    fn parse_default_target_path() {
        let path = RegistryPath::parse("library/ubuntu/blobs/sha256:abc").unwrap();
        assert_eq!(path.target, None);
        assert_eq!(path.image, Some(ImageName::new("library", "ubuntu")));
        assert_eq!(path.filepath, "/blobs/sha256:abc");
    }

    #[test]
    fn parse_short_paths() {
        let path = RegistryPath::parse("").unwrap();
        assert_eq!(path.image, None);
        assert_eq!(path.filepath, "");

        let path = RegistryPath::parse("_catalog").unwrap();
        assert_eq!(path.image, None);

        let err = RegistryPath::parse("ghcr.io/owner").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn destination_for_explicit_target() {
        let request: Uri = "/v2/docker.io/library/alpine/manifests/3.20?ns=x"
            .parse()
            .unwrap();
        let path = RegistryPath::parse("docker.io/library/alpine/manifests/3.20").unwrap();
        let destination = Destination::resolve(&path, "", &request).unwrap();

        assert_eq!(destination.host, DOCKERHUB);
        assert_eq!(
            destination.uri,
            "https://registry-1.docker.io/v2/library/alpine/manifests/3.20?ns=x"
        );
    }

    #[test]
    fn destination_for_default_target() {
        let request: Uri = "/v2/owner/app/blobs/sha256:abc".parse().unwrap();
        let path = RegistryPath::parse("owner/app/blobs/sha256:abc").unwrap();
        let destination = Destination::resolve(&path, "ghcr", &request).unwrap();

        assert_eq!(destination.host, GHCR);
        assert_eq!(destination.uri, "https://ghcr.io/v2/owner/app/blobs/sha256:abc");
    }

    #[test]
    fn destination_without_default() {
        let request: Uri = "/v2/".parse().unwrap();
        let path = RegistryPath::parse("").unwrap();
        let err = Destination::resolve(&path, "", &request).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }
}
