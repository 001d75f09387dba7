//! Endpoint identity: connection ids, diagnostic tags, transport addresses.
//!
//! A connection id looks like a relative path with forward slashes, for
//! example `FLExEndpoint/home/me/Projects/Test/Test.fwdata_42`. Both processes
//! of a duplex pair use ids that differ only in the role prefix, so the tag
//! derived here names the same session on both sides.
//!
//! Derivation is deliberately lossy. Two ids sharing the distinguishing
//! substring collide; that is an accepted limitation of the naming scheme.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::EndpointConfig;

/// Opaque, path-like id supplied by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Endpoint the main application hosts and the bridge calls into.
    pub fn bridge_endpoint(pipe_id: &str) -> Self {
        Self(format!("{}{}", EndpointConfig::BRIDGE_PREFIX, pipe_id))
    }

    /// Endpoint the bridge hosts and the main application calls into.
    pub fn app_endpoint(pipe_id: &str) -> Self {
        Self(format!("{}{}", EndpointConfig::APP_PREFIX, pipe_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short diagnostic tag for log lines.
    pub fn tag(&self) -> String {
        derive_tag(self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Transport-specific bindable/connectable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddress {
    /// Linux abstract socket namespace name, without the leading NUL.
    Abstract(String),
    /// Unix socket file.
    Path(PathBuf),
    /// Windows named pipe name.
    Pipe(String),
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddress::Abstract(name) => write!(f, "@{}", name),
            EndpointAddress::Path(path) => write!(f, "{}", path.display()),
            EndpointAddress::Pipe(name) => f.write_str(name),
        }
    }
}

/// Classifies the id by role prefix and appends its distinguishing part.
///
/// The distinguishing part is the text between the project marker and the
/// next session separator or, without a marker, the final path segment. An id
/// with neither is returned unchanged.
pub fn derive_tag(id: &ConnectionId) -> String {
    let id = id.as_str();
    let role = if id.starts_with(EndpointConfig::BRIDGE_PREFIX) {
        EndpointConfig::BRIDGE_TAG
    } else {
        EndpointConfig::APP_TAG
    };

    if let Some(idx) = id.find(EndpointConfig::PROJECT_MARKER) {
        let rest = &id[idx + EndpointConfig::PROJECT_MARKER.len()..];
        let part = match rest.find(EndpointConfig::SESSION_SEPARATOR) {
            Some(end) if end > 0 => &rest[..end],
            _ => rest,
        };
        return format!("{}{}", role, part);
    }

    match id.rfind('/') {
        Some(idx) if idx > 0 => format!("{}{}", role, &id[idx..]),
        _ => id.to_string(),
    }
}

/// Drops the redundant middle of a path-like id and swaps the project marker
/// for a separator, e.g. `FLExEndpoint/home/me/Test/Test.fwdata_42` becomes
/// `FLExEndpoint/Test/_42`.
pub fn compact_id(id: &ConnectionId) -> String {
    let id = id.as_str();
    let compacted = match (id.find('/'), id.rfind('/')) {
        (Some(first), Some(last)) if first < last => {
            let mut s = String::with_capacity(id.len() - (last - first));
            s.push_str(&id[..first]);
            s.push_str(&id[last..]);
            s
        }
        _ => id.to_string(),
    };
    compacted.replace(EndpointConfig::PROJECT_MARKER, "/")
}

/// Shortens `name` to at most `max` bytes.
///
/// Keeps the leading role segment (up to the first `/`) when it is short, and
/// fills the rest with the tail of the name, which carries the session
/// suffix.
pub fn fit_to_ceiling(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }

    let head = match name.find('/') {
        Some(idx) if idx < max / 2 => &name[..idx + 1],
        _ => "",
    };
    let mut start = name.len() - (max - head.len());
    while !name.is_char_boundary(start) {
        start += 1;
    }
    format!("{}{}", head, &name[start..])
}

/// Abstract socket name for `id`.
pub fn abstract_name(id: &ConnectionId) -> String {
    fit_to_ceiling(&compact_id(id), EndpointConfig::ABSTRACT_SOCKET_MAX_LEN)
}

/// Socket file path for `id` inside `dir`.
///
/// The path counts against the same `sun_path` ceiling as an abstract name,
/// so the file name is shortened by whatever the directory already uses. A
/// directory that leaves no room still yields a one-character stem, so the
/// result can exceed the ceiling; binding such a path fails with a transport
/// error.
pub fn socket_path(dir: &Path, id: &ConnectionId) -> PathBuf {
    let file_stem: String = compact_id(id)
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect();
    let used = dir.as_os_str().len() + 1 + EndpointConfig::SOCKET_FILE_EXTENSION.len();
    let budget = EndpointConfig::SOCKET_PATH_MAX_LEN.saturating_sub(used).max(1);
    let file_name = format!(
        "{}{}",
        fit_to_ceiling(&file_stem, budget),
        EndpointConfig::SOCKET_FILE_EXTENSION
    );
    dir.join(file_name)
}

/// Named pipe name for `id`. Pipes have a generous ceiling, so the id is used
/// nearly verbatim with the channel suffix appended.
pub fn pipe_name(id: &ConnectionId) -> String {
    let channel = format!("{}/{}", id.as_str(), EndpointConfig::CHANNEL_SUFFIX);
    let budget = EndpointConfig::PIPE_NAME_MAX_LEN - EndpointConfig::PIPE_NAME_PREFIX.len();
    format!(
        "{}{}",
        EndpointConfig::PIPE_NAME_PREFIX,
        fit_to_ceiling(&channel, budget)
    )
}
