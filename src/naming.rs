//! Deterministic names for everything derived from a Service.
//!
//! Fly.io app names and Kubernetes label values share the same constraints:
//! lowercase alphanumerics and dashes, at most 63 characters. Names that
//! would exceed the limit are truncated and suffixed with a short digest of
//! the full name so that two long inputs sharing a prefix stay distinct.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

/// Maximum length for Fly.io app names and Kubernetes label values.
pub const MAX_NAME_LEN: usize = 63;

/// Number of hex characters appended when a name is truncated.
const HASH_SUFFIX_LEN: usize = 8;

/// The kinds of identifiers derived from a Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Machine name and frp proxy group
    Tunnel,
    /// Fly.io App name
    App,
    /// frpc Deployment name (the ConfigMap appends `-config`)
    Deployment,
    /// Label value identifying the owning Service
    Label,
}

impl NameKind {
    fn prefix(self) -> &'static str {
        match self {
            NameKind::Tunnel => "frp-",
            NameKind::App => "fly-tunnel-",
            NameKind::Deployment => "frpc-",
            NameKind::Label => "",
        }
    }
}

/// Derive the identifier of `kind` for the Service `namespace/name`.
pub fn derive(kind: NameKind, namespace: &str, name: &str) -> String {
    sanitize(&format!("{}{}-{}", kind.prefix(), namespace, name))
}

/// Derive the identifier of `kind` for a Service object.
pub fn for_service(kind: NameKind, service: &Service) -> String {
    derive(
        kind,
        &service.namespace().unwrap_or_default(),
        &service.name_any(),
    )
}

/// Reduce `name` to `[a-z0-9-]`, without repeated or edge dashes, and at most
/// [`MAX_NAME_LEN`] characters.
pub fn sanitize(name: &str) -> String {
    let lowered = name.to_lowercase();

    let mut sanitized = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(c);
    }
    let sanitized = sanitized.trim_matches('-');

    if sanitized.len() <= MAX_NAME_LEN {
        return sanitized.to_string();
    }

    let digest = Sha256::digest(lowered.as_bytes());
    let suffix = &hex::encode(digest)[..HASH_SUFFIX_LEN];

    // sanitized is pure ASCII here, so byte slicing is safe
    let truncated = sanitized[..MAX_NAME_LEN - HASH_SUFFIX_LEN - 1].trim_end_matches('-');
    format!("{}-{}", truncated, suffix)
}
