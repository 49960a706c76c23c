//! Role-scoped command and path allowlist.
//!
//! Only explicitly permitted commands and paths pass. There is no
//! default-allow: a role with no matching entry denies.

use std::collections::HashMap;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::GateError;

/// Characters refused by `is_permitted` regardless of patterns, in case a
/// caller reaches the policy engine without going through the sanitizer.
const FORBIDDEN_CHARS: &[char] = &[';', '|', '&', '`', '\n', '\r', '\0'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    Read,
    Write,
}

/// A frozen permission profile.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub allowed_commands: Vec<String>,
    pub allowed_paths_read: Vec<String>,
    pub allowed_paths_write: Vec<String>,
    matcher: GlobSet,
}

impl Role {
    /// Compiles the role's command patterns. `*` matches any run of
    /// characters, spaces and slashes included.
    pub fn new(
        name: impl Into<String>,
        allowed_commands: Vec<String>,
        allowed_paths_read: Vec<String>,
        allowed_paths_write: Vec<String>,
    ) -> Result<Self, GateError> {
        let name = name.into();
        let mut builder = GlobSetBuilder::new();
        for pattern in &allowed_commands {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .backslash_escape(false)
                .build()
                .map_err(|e| {
                    GateError::configuration(format!(
                        "role '{name}': invalid command pattern '{pattern}': {e}"
                    ))
                })?;
            builder.add(glob);
        }
        let matcher = builder.build().map_err(|e| {
            GateError::configuration(format!("role '{name}': cannot compile patterns: {e}"))
        })?;

        Ok(Self {
            name,
            allowed_commands,
            allowed_paths_read,
            allowed_paths_write,
            matcher,
        })
    }

    fn prefixes(&self, mode: PathMode) -> &[String] {
        match mode {
            PathMode::Read => &self.allowed_paths_read,
            PathMode::Write => &self.allowed_paths_write,
        }
    }
}

/// The command text must match at least one of the role's patterns in full.
pub fn is_permitted(role: &Role, command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() || command.contains(FORBIDDEN_CHARS) {
        return false;
    }
    role.matcher.is_match(command)
}

/// The path must sit under one of the role's prefixes for `mode`.
pub fn is_path_allowed(role: &Role, path: &str, mode: PathMode) -> bool {
    let Some(normalized) = normalize_path(path) else {
        return false;
    };
    role.prefixes(mode).iter().any(|prefix| {
        let Some(prefix) = normalize_path(prefix) else {
            return false;
        };
        if prefix == "/" {
            return normalized.starts_with('/');
        }
        normalized == prefix
            || normalized
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Lexical normalization: collapses duplicate slashes and `.` components
/// and drops a trailing slash. Symlinks are not resolved. Returns `None`
/// for empty paths and for any path with a `..` component.
pub fn normalize_path(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let absolute = path.starts_with('/');
    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    Some(match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    })
}

/// Frozen role table plus the global approval triggers. Built once at load
/// and shared read-only between invocations.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    roles: HashMap<String, Role>,
    pub approval_required_patterns: Vec<String>,
}

impl Policy {
    pub fn new(roles: Vec<Role>, approval_required_patterns: Vec<String>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            approval_required_patterns,
        }
    }

    pub fn role(&self, name: &str) -> Result<&Role, GateError> {
        self.roles
            .get(name)
            .ok_or_else(|| GateError::configuration(format!("unknown role: '{name}'")))
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }
}
