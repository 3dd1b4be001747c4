//! Source identity: mapping adapter source descriptors to canonical URIs and back.

use crate::protocol::Source;

pub const DEBUG_SCHEME: &str = "debug";
const FILE_PREFIX: &str = "file://";

/// Collapses textually different spellings of one resource to a single key.
pub trait UriIdentity: Send + Sync {
    fn canonical(&self, uri: &str) -> String;
}

/// Default identity: drive letters upper-cased, `\` turned into `/`, `.`/`..` segments
/// resolved for `file://` URIs. Everything else is compared verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathIdentity;

impl UriIdentity for PathIdentity {
    fn canonical(&self, uri: &str) -> String {
        match uri.strip_prefix(FILE_PREFIX) {
            Some(path) => format!("{FILE_PREFIX}{}", normalize_path(path)),
            None => uri.to_string(),
        }
    }
}

/// Upper-cases a leading Windows drive letter so paths sent to adapters are consistent.
pub fn normalize_drive_letter(path: &str) -> String {
    if has_drive_letter(path) {
        let mut chars = path.chars();
        if let Some(first) = chars.next() {
            return first.to_ascii_uppercase().to_string() + chars.as_str();
        }
    }
    path.to_string()
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let (prefix, rest) = match unified.strip_prefix('/') {
        Some(rest) => ("/", rest),
        None => ("", unified.as_str()),
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    normalize_drive_letter(&format!("{prefix}{}", segments.join("/")))
}

fn is_uri(path: &str) -> bool {
    match path.split_once("://") {
        Some((scheme, _)) => {
            scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        }
        None => false,
    }
}

/// Builds the (not yet canonicalised) URI for an adapter source descriptor.
///
/// Sources the adapter serves by reference live under the `debug:` scheme and are scoped
/// to the session; everything with a path maps to a `file://` URI.
pub fn source_uri(raw: &Source, session_id: &str) -> String {
    let reference = raw.source_reference.filter(|r| *r > 0);
    match (reference, raw.path.as_deref()) {
        (None, Some(path)) if is_uri(path) => path.to_string(),
        (None, Some(path)) => {
            let path = normalize_drive_letter(path);
            if path.starts_with('/') {
                format!("{FILE_PREFIX}{path}")
            } else {
                format!("{FILE_PREFIX}/{path}")
            }
        }
        (Some(reference), path) => {
            let label = path.or(raw.name.as_deref()).unwrap_or("unknown");
            format!("{DEBUG_SCHEME}:{label}?session={session_id}&ref={reference}")
        }
        (None, None) => {
            let label = raw.name.as_deref().unwrap_or("unknown");
            format!("{DEBUG_SCHEME}:{label}?session={session_id}")
        }
    }
}

/// Recovers a minimal adapter descriptor from a URI produced by [`source_uri`].
pub fn decode_source_uri(uri: &str) -> Source {
    if let Some(path) = uri.strip_prefix(FILE_PREFIX) {
        let path = if has_drive_letter(path.trim_start_matches('/')) {
            path.trim_start_matches('/')
        } else {
            path
        };
        return Source {
            name: path.rsplit('/').next().map(str::to_string),
            path: Some(path.to_string()),
            ..Source::default()
        };
    }

    if let Some(rest) = uri.strip_prefix(&format!("{DEBUG_SCHEME}:")) {
        let (label, query) = rest.split_once('?').unwrap_or((rest, ""));
        let source_reference = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "ref")
            .and_then(|(_, value)| value.parse::<i64>().ok());
        return Source {
            name: label.rsplit('/').next().map(str::to_string),
            path: Some(label.to_string()),
            source_reference,
            ..Source::default()
        };
    }

    Source {
        name: uri.rsplit('/').next().map(str::to_string),
        path: Some(uri.to_string()),
        ..Source::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_letter_is_upper_cased() {
        assert_eq!(normalize_drive_letter("c:\\work\\main.rs"), "C:\\work\\main.rs");
        assert_eq!(normalize_drive_letter("/usr/src/main.rs"), "/usr/src/main.rs");
    }

    #[test]
    fn path_identity_collapses_equivalent_spellings() {
        let identity = PathIdentity;
        assert_eq!(
            identity.canonical("file:///work/./src/../src/main.rs"),
            identity.canonical("file:///work/src/main.rs")
        );
        assert_eq!(
            identity.canonical("file://c:\\work\\main.rs"),
            identity.canonical("file://C:/work/main.rs")
        );
    }

    #[test]
    fn path_sources_map_to_file_uris() {
        let raw = Source {
            path: Some("/work/src/lib.rs".into()),
            ..Source::default()
        };
        assert_eq!(source_uri(&raw, "s1"), "file:///work/src/lib.rs");
    }

    #[test]
    fn referenced_sources_are_session_scoped() {
        let raw = Source {
            name: Some("<eval>".into()),
            source_reference: Some(12),
            ..Source::default()
        };
        let uri = source_uri(&raw, "s1");
        assert_eq!(uri, "debug:<eval>?session=s1&ref=12");

        let decoded = decode_source_uri(&uri);
        assert_eq!(decoded.source_reference, Some(12));
        assert_eq!(decoded.name.as_deref(), Some("<eval>"));
    }

    #[test]
    fn decode_file_uri_recovers_path() {
        let decoded = decode_source_uri("file:///work/src/lib.rs");
        assert_eq!(decoded.path.as_deref(), Some("/work/src/lib.rs"));
        assert_eq!(decoded.name.as_deref(), Some("lib.rs"));
        assert_eq!(decoded.source_reference, None);
    }

    #[test]
    fn windows_paths_round_trip_without_leading_slash() {
        let raw = Source {
            path: Some("c:\\work\\main.rs".into()),
            ..Source::default()
        };
        let uri = PathIdentity.canonical(&source_uri(&raw, "s1"));
        assert_eq!(uri, "file:///C:/work/main.rs");
        assert_eq!(decode_source_uri(&uri).path.as_deref(), Some("C:/work/main.rs"));
    }
}
