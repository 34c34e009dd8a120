//! Classification of GitHub-family URLs.
//!
//! URLs are matched by prefix and split on `/` by offset, without a general URL
//! parser. Every failure is a [`ProxyError`] carrying the status the client sees.

use std::fmt;

use crate::error::{ProxyError, ProxyResult};

const GITHUB_PREFIX: &str = "https://github.com/";
const RAW_PREFIX: &str = "https://raw.githubusercontent.com/";
const GIST_PREFIX: &str = "https://gist.github.com/";
const GIST_CONTENT_PREFIX: &str = "https://gist.githubusercontent.com/";
const API_PREFIX: &str = "https://api.github.com/";
const RELEASES_DOWNLOAD: &str = "releases/download/";

/// Shorter than any URL worth looking at.
const MIN_LENGTH: usize = 18;

/// What a GitHub URL is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Release assets and source archives
    Releases,
    /// File view pages (`/blob/`)
    Blob,
    /// Raw file content
    Raw,
    /// `git clone` over smart HTTP
    Clone,
    /// Gists and gist content
    Gist,
    /// The REST API
    Api,
}

impl ActionKind {
    /// Kinds whose content is fetched through the streaming content path.
    pub const PROXYABLE: [ActionKind; 3] = [ActionKind::Blob, ActionKind::Raw, ActionKind::Gist];

    /// Lowercase name, as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Releases => "releases",
            ActionKind::Blob => "blob",
            ActionKind::Raw => "raw",
            ActionKind::Clone => "clone",
            ActionKind::Gist => "gist",
            ActionKind::Api => "api",
        }
    }

    /// Whether this kind is one of [`ActionKind::PROXYABLE`].
    pub fn is_proxyable(&self) -> bool {
        Self::PROXYABLE.contains(self)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Repository owner, user, or gist author
    pub owner: String,
    /// Repository name. Empty for gists and user-level API calls.
    pub repo: String,
    /// What the URL is for
    pub kind: ActionKind,
}

impl Route {
    fn new(owner: &str, repo: &str, kind: ActionKind) -> Self {
        Self {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            kind,
        }
    }
}

/// Whether `api.github.com` URLs may be proxied.
///
/// The API is only opened up when clients authenticate by header, or when an
/// operator forces it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApiAccess {
    allowed: bool,
}

impl ApiAccess {
    /// API URLs are classified.
    pub fn allowed() -> Self {
        Self { allowed: true }
    }

    /// API URLs are rejected with `403`.
    pub fn denied() -> Self {
        Self { allowed: false }
    }

    /// Whether API URLs are classified.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Classifies URLs into [`Route`]s.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    api: ApiAccess,
}

impl Matcher {
    /// Create a matcher with the given API policy.
    pub fn new(api: ApiAccess) -> Self {
        Self { api }
    }

    /// Classify a full URL such as `https://github.com/owner/repo/releases/download/v1/x.tar.gz`.
    pub fn classify(&self, raw: &str) -> ProxyResult<Route> {
        if raw.len() < MIN_LENGTH {
            return Err(ProxyError::NotFound("path too short".into()));
        }

        if let Some(rest) = raw.strip_prefix(GITHUB_PREFIX) {
            return github(rest);
        }

        if let Some(rest) = raw.strip_prefix(RAW_PREFIX) {
            return raw_content(rest);
        }

        if let Some(rest) = raw
            .strip_prefix(GIST_PREFIX)
            .or_else(|| raw.strip_prefix(GIST_CONTENT_PREFIX))
        {
            return gist(rest);
        }

        if let Some(rest) = raw.strip_prefix(API_PREFIX) {
            if !self.api.is_allowed() {
                return Err(ProxyError::Forbidden(
                    "API proxy requires header authentication".into(),
                ));
            }
            return Ok(api(rest));
        }

        Err(ProxyError::NotFound(
            "no matcher found for the given path".into(),
        ))
    }
}

/// Split off the next non-empty segment, which must be followed by a `/`.
///
/// Returns the segment and everything after its trailing slash.
fn segment(rest: &str) -> Option<(&str, &str)> {
    match rest.find('/') {
        Some(0) | None => None,
        Some(i) => Some((&rest[..i], &rest[i + 1..])),
    }
}

fn malformed(what: &str, missing: &str) -> ProxyError {
    ProxyError::BadRequest(format!("malformed {what}: missing {missing}"))
}

fn github(rest: &str) -> ProxyResult<Route> {
    let (owner, rest) = segment(rest).ok_or_else(|| malformed("github path", "user"))?;
    let (repo, rest) = segment(rest).ok_or_else(|| malformed("github path", "repo"))?;
    if rest.is_empty() {
        return Err(malformed("github path", "action"));
    }

    let action = rest.find('/').map_or(rest, |i| &rest[..i]);
    let kind = match action {
        "releases" if rest.starts_with(RELEASES_DOWNLOAD) => ActionKind::Releases,
        "releases" => {
            return Err(ProxyError::BadRequest(
                "malformed github path: not a releases download url".into(),
            ))
        }
        "archive" => ActionKind::Releases,
        "blob" => ActionKind::Blob,
        "raw" => ActionKind::Raw,
        "info" | "git-upload-pack" => ActionKind::Clone,
        other => {
            return Err(ProxyError::BadRequest(format!(
                "unsupported github action: {other}"
            )))
        }
    };

    Ok(Route::new(owner, repo, kind))
}

fn raw_content(rest: &str) -> ProxyResult<Route> {
    let (owner, rest) = segment(rest).ok_or_else(|| malformed("raw url", "user"))?;
    let (repo, rest) = segment(rest).ok_or_else(|| malformed("raw url", "repo"))?;
    if rest.is_empty() {
        return Err(malformed("raw url", "branch/commit"));
    }

    Ok(Route::new(owner, repo, ActionKind::Raw))
}

fn gist(rest: &str) -> ProxyResult<Route> {
    // The gist id is optional, and never reported.
    let owner = match rest.find('/') {
        Some(0) => "",
        Some(i) => &rest[..i],
        None => rest,
    };

    if owner.is_empty() {
        return Err(malformed("gist url", "user"));
    }

    Ok(Route::new(owner, "", ActionKind::Gist))
}

fn api(rest: &str) -> Route {
    if let Some(rest) = rest.strip_prefix("repos/") {
        let mut parts = rest.splitn(3, '/');
        if let (Some(owner), Some(repo)) = (parts.next(), parts.next()) {
            return Route::new(owner, repo, ActionKind::Api);
        }
    } else if let Some(rest) = rest.strip_prefix("users/") {
        let owner = rest.split('/').next().unwrap_or_default();
        return Route::new(owner, "", ActionKind::Api);
    }

    Route::new("", "", ActionKind::Api)
}
