//! Module allow-list guard.
//!
//! Decides whether task code may import a given module. The guard is pure:
//! it holds the configured lists and nothing else, so runners can consult it
//! from any executor without synchronisation.
//!
//! Matching rules:
//! - deny-list entries win over allow-list entries;
//! - an empty allow-list allows everything that is not denied;
//! - `*` in either list matches every module;
//! - names are compared by package root, with any `node:` prefix removed,
//!   so `node:fs/promises` is matched by an `fs` entry.

use serde::{Deserialize, Serialize};

use crate::TaskError;

/// Returns true if `module` may be imported under the given lists.
pub fn is_allowed(module: &str, allow_list: &[String], deny_list: &[String]) -> bool {
    let root = package_root(module);

    if deny_list.iter().any(|entry| matches_entry(entry, root)) {
        return false;
    }
    if allow_list.is_empty() {
        return true;
    }
    allow_list.iter().any(|entry| matches_entry(entry, root))
}

/// Reduce an import specifier to the package it names.
///
/// `lodash/fp` -> `lodash`, `@scope/pkg/sub` -> `@scope/pkg`, `node:fs` -> `fs`.
pub fn package_root(module: &str) -> &str {
    let name = module.trim();
    let name = name.strip_prefix("node:").unwrap_or(name);

    let mut slashes = name.match_indices('/');
    let cut = if name.starts_with('@') {
        slashes.nth(1)
    } else {
        slashes.next()
    };
    match cut {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

fn matches_entry(entry: &str, root: &str) -> bool {
    let entry = entry.trim();
    entry == "*" || package_root(entry) == root
}

/// Configured allow/deny lists for one runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleGuard {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl ModuleGuard {
    /// Create a guard from explicit lists.
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    /// Parse comma separated lists, as they come from the environment.
    pub fn from_csv(allow: &str, deny: &str) -> Self {
        Self::new(split_csv(allow), split_csv(deny))
    }

    /// Narrow the guard for one task.
    ///
    /// A non-empty per-task allow-list replaces the configured one; the
    /// configured deny-list always applies.
    pub fn for_task(&self, task_allow: &[String]) -> Self {
        if task_allow.is_empty() {
            return self.clone();
        }
        Self {
            allow: task_allow.to_vec(),
            deny: self.deny.clone(),
        }
    }

    /// Returns true if `module` may be imported.
    pub fn is_allowed(&self, module: &str) -> bool {
        is_allowed(module, &self.allow, &self.deny)
    }

    /// Like [`is_allowed`](Self::is_allowed) but yields the error the task fails with.
    pub fn check(&self, module: &str) -> Result<(), TaskError> {
        if self.is_allowed(module) {
            Ok(())
        } else {
            Err(TaskError::DisallowedModule {
                module: module.to_string(),
            })
        }
    }

    /// Returns true if the guard refuses at least one module.
    pub fn is_restrictive(&self) -> bool {
        !self.allow.is_empty() || !self.deny.is_empty()
    }

    pub fn allow_list(&self) -> &[String] {
        &self.allow
    }

    pub fn deny_list(&self) -> &[String] {
        &self.deny
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let allow = list(&["fs", "lodash"]);
        let deny = list(&["fs"]);
        assert!(!is_allowed("fs", &allow, &deny));
        assert!(is_allowed("lodash", &allow, &deny));
    }

    #[test]
    fn test_empty_allow_list_allows_everything_not_denied() {
        let deny = list(&["child_process"]);
        assert!(is_allowed("moment", &[], &deny));
        assert!(!is_allowed("child_process", &[], &deny));
    }

    #[test]
    fn test_non_empty_allow_list_rejects_unlisted() {
        let allow = list(&["lodash"]);
        assert!(!is_allowed("moment", &allow, &[]));
    }

    #[test]
    fn test_wildcards() {
        assert!(is_allowed("anything", &list(&["*"]), &[]));
        assert!(!is_allowed("anything", &list(&["*"]), &list(&["*"])));
        assert!(!is_allowed("lodash", &[], &list(&["*"])));
    }

    #[test]
    fn test_subpaths_and_node_prefix() {
        assert_eq!(package_root("lodash/fp"), "lodash");
        assert_eq!(package_root("@scope/pkg/deep/file"), "@scope/pkg");
        assert_eq!(package_root("node:fs/promises"), "fs");
        assert_eq!(package_root("@scope"), "@scope");

        let deny = list(&["fs"]);
        assert!(!is_allowed("node:fs", &[], &deny));
        assert!(!is_allowed("fs/promises", &[], &deny));
    }

    #[test]
    fn test_guard_check_returns_disallowed_module() {
        let guard = ModuleGuard::from_csv("", "vm, child_process");
        assert_eq!(guard.deny_list().len(), 2);
        assert!(guard.check("crypto").is_ok());
        assert_eq!(
            guard.check("vm"),
            Err(TaskError::DisallowedModule {
                module: "vm".to_string()
            })
        );
    }

    #[test]
    fn test_task_allow_list_replaces_configured_but_keeps_deny() {
        let guard = ModuleGuard::from_csv("lodash", "fs");
        let narrowed = guard.for_task(&list(&["moment", "fs"]));
        assert!(narrowed.is_allowed("moment"));
        assert!(!narrowed.is_allowed("lodash"));
        assert!(!narrowed.is_allowed("fs"));

        assert_eq!(guard.for_task(&[]), guard);
    }

    #[test]
    fn test_restrictive_guards() {
        assert!(!ModuleGuard::default().is_restrictive());
        assert!(!ModuleGuard::from_csv(" , ", "").is_restrictive());
        assert!(ModuleGuard::from_csv("lodash", "").is_restrictive());
        assert!(ModuleGuard::from_csv("", "fs").is_restrictive());
    }
}
