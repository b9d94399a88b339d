use crate::model::{AllowList, PermissionKind, PermissionSet};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Evaluates allow-lists for one upstream's tools/resources/prompts.
/// Stateless except for the "log denial once per call" flag, which the
/// filtering wrapper resets per call (see `session.rs`).
pub struct PermissionEngine {
    warned_this_call: AtomicBool,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self {
            warned_this_call: AtomicBool::new(false),
        }
    }

    pub fn begin_call(&self) {
        self.warned_this_call.store(false, Ordering::Relaxed);
    }

    /// `isAllowed`: absent list -> allow-all, empty list -> deny-all,
    /// otherwise literal / `"*"` / regex match.
    pub fn is_allowed(&self, policy: &AllowList, name: &str) -> bool {
        let Some(patterns) = policy else {
            return true;
        };
        if patterns.is_empty() {
            return false;
        }
        patterns.iter().any(|pattern| pattern_matches(pattern, name))
    }

    /// `is_allowed` plus the warn-once-per-call log line the spec requires
    /// on denial.
    pub fn check(
        &self,
        permissions: &PermissionSet,
        kind: PermissionKind,
        name: &str,
        session_id: &str,
        namespace: &str,
    ) -> bool {
        let policy = match kind {
            PermissionKind::Tool => &permissions.tools,
            PermissionKind::Resource => &permissions.resources,
            PermissionKind::Prompt => &permissions.prompts,
        };
        let allowed = self.is_allowed(policy, name);
        if !allowed && !self.warned_this_call.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                session_id,
                namespace,
                kind = kind.as_str(),
                name,
                "permission denied"
            );
        }
        allowed
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == name {
        return true;
    }
    // A regex compilation failure degrades to non-match, never an error.
    match Regex::new(pattern) {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_policy_allows_everything() {
        let engine = PermissionEngine::new();
        assert!(engine.is_allowed(&None, "anything"));
    }

    #[test]
    fn empty_policy_denies_everything() {
        let engine = PermissionEngine::new();
        assert!(!engine.is_allowed(&Some(vec![]), "anything"));
    }

    #[test]
    fn literal_and_wildcard_and_regex_match() {
        let engine = PermissionEngine::new();
        assert!(engine.is_allowed(&Some(vec!["search".into()]), "search"));
        assert!(!engine.is_allowed(&Some(vec!["search".into()]), "delete"));
        assert!(engine.is_allowed(&Some(vec!["*".into()]), "delete"));
        assert!(engine.is_allowed(&Some(vec!["^get_.*".into()]), "get_user"));
    }

    #[test]
    fn bad_regex_degrades_to_non_match() {
        let engine = PermissionEngine::new();
        assert!(!engine.is_allowed(&Some(vec!["(unterminated".into()]), "(unterminated"));
    }
}
