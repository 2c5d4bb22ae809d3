//! Boundary value transformation.
//!
//! Both processes agree on a URI wire shape: a JSON object with `"$mid": 1`
//! and string `scheme`/`path` fields. Values crossing the boundary are walked
//! recursively and every URI-shaped object is passed through a
//! [`UriTransformer`]. Argument coercion lives in [`coerce`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod coerce;

pub use coerce::{coerce_args, Args, CoercionError, ParamType};

const URI_MARKER: &str = "$mid";
/// Cached renderings the peer may attach; recomputed when components change.
const DERIVED_FIELDS: &[&str] = &["external", "_formatted", "_fsPath", "fsPath"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    #[serde(rename = "$mid", default = "uri_marker")]
    marker: u8,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authority: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fragment: String,
}

fn uri_marker() -> u8 {
    1
}

impl Uri {
    pub fn new(
        scheme: impl Into<String>,
        authority: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            marker: uri_marker(),
            scheme: scheme.into(),
            authority: authority.into(),
            path: path.into(),
            query: String::new(),
            fragment: String::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = fragment.into();
        self
    }

    /// Parses an absolute URI string. Path, query and fragment keep their
    /// percent-encoded form.
    pub fn parse(input: &str) -> Result<Self, url::ParseError> {
        let url = url::Url::parse(input)?;
        Ok(Self::from_url(&url))
    }

    /// `file` URI for a local path; relative paths are kept verbatim.
    pub fn file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match url::Url::from_file_path(path) {
            Ok(url) => Self::from_url(&url),
            Err(()) => Self::new("file", "", path.to_string_lossy()),
        }
    }

    fn from_url(url: &url::Url) -> Self {
        let authority = &url[url::Position::BeforeUsername..url::Position::AfterPort];
        Self::new(url.scheme(), authority, url.path())
            .with_query(url.query().unwrap_or_default())
            .with_fragment(url.fragment().unwrap_or_default())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn from_components(map: &Map<String, Value>) -> Option<Self> {
        let text = |key: &str| -> Option<String> {
            match map.get(key) {
                None | Some(Value::Null) => Some(String::new()),
                Some(Value::String(value)) => Some(value.clone()),
                Some(_) => None,
            }
        };
        Some(Self {
            marker: uri_marker(),
            scheme: text("scheme")?,
            authority: text("authority")?,
            path: text("path")?,
            query: text("query")?,
            fragment: text("fragment")?,
        })
    }

    /// Rewrites only the components that changed. Empty components are
    /// omitted, as the peer does, and derived renderings that were present
    /// are recomputed so a round trip restores them.
    fn write_components(&self, previous: &Uri, map: &mut Map<String, Value>) {
        let components = [
            ("scheme", &previous.scheme, &self.scheme),
            ("authority", &previous.authority, &self.authority),
            ("path", &previous.path, &self.path),
            ("query", &previous.query, &self.query),
            ("fragment", &previous.fragment, &self.fragment),
        ];
        for (key, before, after) in components {
            if before == after {
                continue;
            }
            if after.is_empty() && key != "scheme" && key != "path" {
                map.remove(key);
            } else {
                map.insert(key.into(), Value::String(after.clone()));
            }
        }
        for field in DERIVED_FIELDS {
            if let Some(slot) = map.get_mut(*field) {
                *slot = Value::String(match *field {
                    "fsPath" | "_fsPath" => self.path.clone(),
                    _ => self.to_string(),
                });
            }
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if !self.authority.is_empty() || self.scheme == "file" {
            write!(f, "//{}", self.authority)?;
        }
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

/// True for objects carrying the URI marker and string `scheme`/`path`.
pub fn is_uri_shaped(map: &Map<String, Value>) -> bool {
    map.get(URI_MARKER).and_then(Value::as_f64) == Some(1.0)
        && matches!(map.get("scheme"), Some(Value::String(_)))
        && matches!(map.get("path"), Some(Value::String(_)))
}

pub trait UriTransformer: Send + Sync {
    /// Applied to URIs leaving this process.
    fn transform_outgoing(&self, uri: &Uri) -> Uri;
    /// Applied to URIs arriving from the peer.
    fn transform_incoming(&self, uri: &Uri) -> Uri;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl UriTransformer for IdentityTransformer {
    fn transform_outgoing(&self, uri: &Uri) -> Uri {
        uri.clone()
    }

    fn transform_incoming(&self, uri: &Uri) -> Uri {
        uri.clone()
    }
}

/// A `(scheme, authority)` pair naming one side's URI namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub scheme: String,
    pub authority: String,
}

impl Namespace {
    pub fn new(scheme: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: authority.into(),
        }
    }

    fn matches(&self, uri: &Uri) -> bool {
        uri.scheme == self.scheme && uri.authority == self.authority
    }

    fn apply(&self, uri: &Uri) -> Uri {
        let mut mapped = uri.clone();
        mapped.scheme.clone_from(&self.scheme);
        mapped.authority.clone_from(&self.authority);
        mapped
    }
}

/// Rewrites URIs in the local namespace into the remote one on the way out
/// and back on the way in. Everything else passes through untouched, so a
/// round trip is lossless for URIs that did not already live remotely.
#[derive(Debug, Clone)]
pub struct AuthorityRemap {
    pub local: Namespace,
    pub remote: Namespace,
}

impl UriTransformer for AuthorityRemap {
    fn transform_outgoing(&self, uri: &Uri) -> Uri {
        if self.local.matches(uri) {
            self.remote.apply(uri)
        } else {
            uri.clone()
        }
    }

    fn transform_incoming(&self, uri: &Uri) -> Uri {
        if self.remote.matches(uri) {
            self.local.apply(uri)
        } else {
            uri.clone()
        }
    }
}

pub fn transform_value_outgoing(value: &mut Value, transformer: &dyn UriTransformer) {
    rewrite_uris(value, &|uri| transformer.transform_outgoing(uri));
}

pub fn transform_value_incoming(value: &mut Value, transformer: &dyn UriTransformer) {
    rewrite_uris(value, &|uri| transformer.transform_incoming(uri));
}

fn rewrite_uris(value: &mut Value, map_uri: &dyn Fn(&Uri) -> Uri) {
    match value {
        Value::Object(map) if is_uri_shaped(map) => {
            if let Some(uri) = Uri::from_components(map) {
                let mapped = map_uri(&uri);
                if mapped != uri {
                    mapped.write_components(&uri, map);
                }
            }
        }
        Value::Object(map) => {
            for child in map.values_mut() {
                rewrite_uris(child, map_uri);
            }
        }
        Value::Array(items) => {
            for child in items {
                rewrite_uris(child, map_uri);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remap() -> AuthorityRemap {
        AuthorityRemap {
            local: Namespace::new("file", ""),
            remote: Namespace::new("vscode-remote", "ssh-remote+box"),
        }
    }

    #[test]
    fn parse_and_display_agree() {
        let uri = Uri::parse("vscode-remote://ssh-remote+box/home/me/a.rs?x=1#L3").unwrap();
        assert_eq!(uri.scheme, "vscode-remote");
        assert_eq!(uri.authority, "ssh-remote+box");
        assert_eq!(uri.path, "/home/me/a.rs");
        assert_eq!(uri.query, "x=1");
        assert_eq!(uri.fragment, "L3");
        assert_eq!(uri.to_string(), "vscode-remote://ssh-remote+box/home/me/a.rs?x=1#L3");
        assert_eq!(Uri::file("/tmp/x.txt").to_string(), "file:///tmp/x.txt");
    }

    #[test]
    fn wire_shape_carries_marker() {
        let value = Uri::file("/tmp/x.txt").to_value();
        assert_eq!(value["$mid"], json!(1));
        assert_eq!(value["scheme"], json!("file"));
        assert!(value.get("authority").is_none());
        let back: Uri = serde_json::from_value(value).unwrap();
        assert_eq!(back, Uri::file("/tmp/x.txt"));
    }

    #[test]
    fn nested_uris_round_trip() {
        let original = json!({
            "uri": Uri::file("/work/src/main.rs").to_value(),
            "related": [
                Uri::file("/work/Cargo.toml").to_value(),
                {"deep": {"target": Uri::parse("https://example.com/doc").unwrap().to_value()}}
            ],
            "count": 3,
        });
        let transformer = remap();

        let mut value = original.clone();
        transform_value_outgoing(&mut value, &transformer);
        assert_eq!(value["uri"]["scheme"], json!("vscode-remote"));
        assert_eq!(value["uri"]["authority"], json!("ssh-remote+box"));
        assert_eq!(value["uri"]["path"], json!("/work/src/main.rs"));
        assert_eq!(value["related"][1]["deep"]["target"]["scheme"], json!("https"));

        transform_value_incoming(&mut value, &transformer);
        let restored: Uri = serde_json::from_value(value["uri"].clone()).unwrap();
        assert_eq!(restored, Uri::file("/work/src/main.rs"));
        assert_eq!(value["related"][0]["path"], json!("/work/Cargo.toml"));
        assert_eq!(value["related"][0]["scheme"], json!("file"));
        assert_eq!(value["related"][1], original["related"][1]);
        assert_eq!(value, original);
    }

    #[test]
    fn round_trip_restores_raw_payload() {
        let original = json!({
            "$mid": 1,
            "scheme": "file",
            "path": "/a",
            "external": "file:///a",
            "fsPath": "/a",
        });
        let mut value = original.clone();
        transform_value_outgoing(&mut value, &remap());
        assert_eq!(value["scheme"], json!("vscode-remote"));
        assert_eq!(value["authority"], json!("ssh-remote+box"));
        assert_eq!(value["external"], json!("vscode-remote://ssh-remote+box/a"));
        assert_eq!(value["fsPath"], json!("/a"));
        assert!(value.get("query").is_none());

        transform_value_incoming(&mut value, &remap());
        assert_eq!(value, original);
    }

    #[test]
    fn lookalikes_are_left_alone() {
        let mut value = json!([
            {"$mid": 2, "scheme": "file", "path": "/a"},
            {"$mid": 1, "scheme": "file"},
            {"scheme": "file", "path": "/a"},
        ]);
        let before = value.clone();
        transform_value_outgoing(&mut value, &remap());
        assert_eq!(value, before);
    }

    #[test]
    fn identity_changes_nothing() {
        let mut value = json!({"u": Uri::file("/x").to_value()});
        let before = value.clone();
        transform_value_incoming(&mut value, &IdentityTransformer);
        assert_eq!(value, before);
    }
}
