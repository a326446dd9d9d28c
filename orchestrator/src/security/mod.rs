//! Import policy gate
//!
//! Static scan of user code for import targets, checked against the
//! configured allowed/blocked module sets before any container is touched.
//!
//! This is defense-in-depth only. Dynamic imports built from computed strings,
//! `exec` of generated source and similar tricks are not visible to a static
//! scan; containment comes from the container's network, filesystem and
//! resource isolation.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};

/// `import a.b as c, d`
static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^import\s+(.+)$").unwrap_or_else(|e| panic!("invalid regex: {e}")));

/// `from a.b import c` (relative imports have leading dots)
static FROM_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^from\s+(\.*)([A-Za-z_][\w.]*)?\s+import\b")
        .unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

/// `__import__("x")` and `importlib.import_module("x")` with literal names
static DYNAMIC_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:__import__|import_module)\(\s*['"]([A-Za-z_][\w.]*)['"]"#)
        .unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

/// Allowed/blocked module sets
#[derive(Debug, Clone, Default)]
pub struct ImportPolicy {
    allowed: BTreeSet<String>,
    blocked: BTreeSet<String>,
}

impl ImportPolicy {
    pub fn new(allowed: BTreeSet<String>, blocked: BTreeSet<String>) -> Self {
        Self { allowed, blocked }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.allowed_modules.clone(), config.blocked_modules.clone())
    }

    /// Reject code importing a blocked module, or any module outside a non-empty allow list
    pub fn validate(&self, code: &str) -> SandboxResult<()> {
        for module in imported_modules(code) {
            if let Err(reason) = self.check_module(&module) {
                warn!(module = %module, reason = %reason, "Import rejected by policy");
                return Err(SandboxError::PolicyViolation { module, reason });
            }
        }
        Ok(())
    }

    fn check_module(&self, module: &str) -> Result<(), String> {
        let prefixes = dotted_prefixes(module);

        if let Some(hit) = prefixes.iter().find(|p| self.blocked.contains(**p)) {
            return Err(format!("module '{}' is blocked", hit));
        }

        if !self.allowed.is_empty() && !prefixes.iter().any(|p| self.allowed.contains(*p)) {
            return Err("module is not in the allowed list".to_string());
        }

        Ok(())
    }
}

/// `a.b.c` -> `["a", "a.b", "a.b.c"]`
fn dotted_prefixes(module: &str) -> Vec<&str> {
    module
        .match_indices('.')
        .map(|(idx, _)| &module[..idx])
        .chain(std::iter::once(module))
        .collect()
}

/// Absolute module names imported anywhere in `code`
pub fn imported_modules(code: &str) -> Vec<String> {
    let mut modules = Vec::new();

    for line in code.lines() {
        for statement in statements(line) {
            let statement = statement.trim();

            if let Some(caps) = IMPORT_RE.captures(statement) {
                for target in caps[1].split(',') {
                    if let Some(name) = target.split_whitespace().next() {
                        modules.push(name.trim_end_matches(',').to_string());
                    }
                }
            } else if let Some(caps) = FROM_IMPORT_RE.captures(statement) {
                let relative = !caps[1].is_empty();
                if let (false, Some(name)) = (relative, caps.get(2)) {
                    modules.push(name.as_str().to_string());
                }
            }

            for caps in DYNAMIC_IMPORT_RE.captures_iter(statement) {
                modules.push(caps[1].to_string());
            }
        }
    }

    modules.retain(|m| !m.is_empty());
    modules
}

/// Split one source line on `;`, dropping a trailing `#` comment
///
/// Separators and `#` inside string literals are ignored. Quote state does
/// not carry across lines.
fn statements(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut begin = 0;

    for (idx, ch) in line.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }

        match ch {
            '\'' | '"' => quote = Some(ch),
            ';' => {
                parts.push(&line[begin..idx]);
                begin = idx + 1;
            }
            '#' => {
                parts.push(&line[begin..idx]);
                return parts;
            }
            _ => {}
        }
    }

    parts.push(&line[begin..]);
    parts
}
