use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    Never,
    Always,
    #[default]
    Threshold,
}

const DEFAULT_THRESHOLD: usize = 64;
const DIGEST_LEN: usize = 12;

fn namespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?!.*__)[A-Za-z0-9_.-]+$").unwrap())
}

/// Validates namespace syntax at bundle load time.
pub fn is_valid_namespace(ns: &str) -> bool {
    namespace_regex().is_match(ns)
}

pub struct NamespacedTool {
    pub name: String,
    pub title: String,
    pub meta: Option<Value>,
}

/// Owns the per-session reverse-hash table and hashing policy. Cleared on
/// session close, never shared across sessions.
pub struct NamespaceResolver {
    separator: String,
    hash_mode: HashMode,
    threshold: usize,
    reverse: HashMap<String, (String, String)>,
}

impl NamespaceResolver {
    pub fn new(separator: impl Into<String>, hash_mode: HashMode, threshold: usize) -> Self {
        Self {
            separator: separator.into(),
            hash_mode,
            threshold,
            reverse: HashMap::new(),
        }
    }

    pub fn default_with(hash_mode: HashMode) -> Self {
        Self::new("__", hash_mode, DEFAULT_THRESHOLD)
    }

    fn should_hash(&self, combined_len: usize) -> bool {
        match self.hash_mode {
            HashMode::Never => false,
            HashMode::Always => true,
            HashMode::Threshold => combined_len > self.threshold,
        }
    }

    fn digest(&self, ns: &str, name: &str) -> String {
        let input = format!("mcpbundler:{ns}{}{name}", self.separator);
        let hash = Sha256::digest(input.as_bytes());
        hex::encode(hash)[..DIGEST_LEN].to_string()
    }

    /// Tools are the only kind eligible for hashing.
    pub fn namespace_tool(&mut self, ns: &str, tool_name: &str) -> NamespacedTool {
        let combined = format!("{ns}{}{tool_name}", self.separator);
        let title = combined.clone();

        if self.should_hash(combined.len()) {
            let digest = self.digest(ns, tool_name);
            self.reverse
                .insert(digest.clone(), (ns.to_string(), tool_name.to_string()));

            let mut meta = Map::new();
            meta.insert("originalName".into(), Value::String(tool_name.to_string()));
            meta.insert("namespace".into(), Value::String(ns.to_string()));
            meta.insert("hashAlgorithm".into(), Value::String("sha256".into()));
            meta.insert("hashLength".into(), Value::Number(DIGEST_LEN.into()));

            NamespacedTool {
                name: digest,
                title,
                meta: Some(Value::Object(meta)),
            }
        } else {
            NamespacedTool {
                name: combined,
                title,
                meta: None,
            }
        }
    }

    /// Prompts are never hashed.
    pub fn namespace_prompt(&self, ns: &str, prompt_name: &str) -> String {
        format!("{ns}{}{prompt_name}", self.separator)
    }

    /// Sets `namespace=<ns>` as a query parameter on a resource/template URI.
    pub fn namespace_uri(&self, ns: &str, uri: &str) -> String {
        match url::Url::parse(uri) {
            Ok(mut parsed) => {
                parsed.query_pairs_mut().append_pair("namespace", ns);
                parsed.to_string()
            }
            Err(_) => {
                if uri.contains('?') {
                    format!("{uri}&namespace={ns}")
                } else {
                    format!("{uri}?namespace={ns}")
                }
            }
        }
    }

    /// Looks up the reverse-hash table first, then falls back to splitting
    /// at the first separator occurrence.
    pub fn extract_namespace_from_name<'a>(&self, name: &'a str) -> Option<(String, String)> {
        if let Some((ns, original)) = self.reverse.get(name) {
            return Some((ns.clone(), original.clone()));
        }
        name.split_once(self.separator.as_str())
            .map(|(ns, rest)| (ns.to_string(), rest.to_string()))
    }

    /// Reads then strips the `namespace` query parameter from a URI.
    /// On parse failure, returns `(None, uri)` unchanged.
    pub fn extract_namespace_from_uri(&self, uri: &str) -> (Option<String>, String) {
        match url::Url::parse(uri) {
            Ok(mut parsed) => {
                let ns = parsed
                    .query_pairs()
                    .find(|(k, _)| k == "namespace")
                    .map(|(_, v)| v.to_string());

                if ns.is_some() {
                    let remaining: Vec<(String, String)> = parsed
                        .query_pairs()
                        .filter(|(k, _)| k != "namespace")
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();

                    if remaining.is_empty() {
                        parsed.set_query(None);
                    } else {
                        parsed
                            .query_pairs_mut()
                            .clear()
                            .extend_pairs(remaining.iter());
                    }
                }

                (ns, parsed.to_string())
            }
            Err(_) => (None, uri.to_string()),
        }
    }

    pub fn reverse_table_len(&self) -> usize {
        self.reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_and_round_trips_a_short_tool_name() {
        let mut resolver = NamespaceResolver::default_with(HashMode::Never);
        let namespaced = resolver.namespace_tool("github", "search");
        assert_eq!(namespaced.name, "github__search");
        assert!(namespaced.meta.is_none());

        let (ns, name) = resolver.extract_namespace_from_name(&namespaced.name).unwrap();
        assert_eq!(ns, "github");
        assert_eq!(name, "search");
    }

    #[test]
    fn hashes_over_threshold_and_round_trips() {
        let mut resolver = NamespaceResolver::new("__", HashMode::Threshold, 10);
        let namespaced = resolver.namespace_tool("a", "very_long_name");
        assert_eq!(namespaced.name.len(), 12);
        assert_eq!(namespaced.title, "a__very_long_name");

        let meta = namespaced.meta.unwrap();
        assert_eq!(meta["originalName"], "very_long_name");

        let (ns, name) = resolver
            .extract_namespace_from_name(&namespaced.name)
            .unwrap();
        assert_eq!(ns, "a");
        assert_eq!(name, "very_long_name");
    }

    #[test]
    fn resource_uri_round_trips() {
        let resolver = NamespaceResolver::default_with(HashMode::Never);
        let namespaced = resolver.namespace_uri("files", "https://x/y");
        assert_eq!(namespaced, "https://x/y?namespace=files");

        let (ns, original) = resolver.extract_namespace_from_uri(&namespaced);
        assert_eq!(ns.as_deref(), Some("files"));
        assert_eq!(original, "https://x/y");
    }

    #[test]
    fn rejects_namespaces_containing_separator() {
        assert!(is_valid_namespace("github"));
        assert!(is_valid_namespace("my-mcp.v2"));
        assert!(!is_valid_namespace("a__b"));
        assert!(!is_valid_namespace("has space"));
    }
}
