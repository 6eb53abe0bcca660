//! Input-validation sandbox enforced before any tool handler runs.
//!
//! Three checks, all driven by the tool schema's parameter roles:
//! - paths must canonicalize into an allow-listed root and outside every
//!   deny-listed one;
//! - scripts must not contain any deny-listed substring (shell-exec and
//!   privileged-auth primitives);
//! - outbound content needs an explicit `confirmed=true` argument unless
//!   the tool is marked `silent_ok`.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::ToolsConfig;

/// Script substrings refused by default. Config can waive individual
/// entries via `tools.allow_dangerous_substrings`.
const DENY_SUBSTRINGS: &[&str] = &[
    "do shell script",
    "administrator privileges",
    "osascript -e",
    "sudo ",
    "rm -rf",
    "keystroke password",
    "security find-generic-password",
    "security find-internet-password",
];

/// Deny-listed directories applied even inside allowed roots.
fn default_deny_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".ssh"));
        roots.push(home.join(".aws"));
        roots.push(home.join(".gnupg"));
        roots.push(home.join("Library").join("Keychains"));
    }
    roots
}

/// Allowed roots when config names none.
fn default_allow_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join("Documents"));
        roots.push(home.join("Downloads"));
        roots.push(home.join("Desktop"));
    }
    roots
}

pub struct Sandbox {
    allow_roots: Vec<PathBuf>,
    deny_roots: Vec<PathBuf>,
    deny_substrings: Vec<String>,
}

impl Sandbox {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let allow_roots = if cfg.allow_paths.is_empty() {
            default_allow_roots()
        } else {
            cfg.allow_paths.clone()
        };
        let mut deny_roots = default_deny_roots();
        deny_roots.extend(cfg.deny_paths.iter().cloned());

        let deny_substrings = DENY_SUBSTRINGS
            .iter()
            .map(|s| s.to_string())
            .filter(|s| !cfg.allow_dangerous_substrings.contains(s))
            .collect();

        Self {
            allow_roots,
            deny_roots,
            deny_substrings,
        }
    }

    /// Explicit roots, mainly for tests.
    pub fn with_roots(allow_roots: Vec<PathBuf>, deny_roots: Vec<PathBuf>) -> Self {
        Self {
            allow_roots,
            deny_roots,
            deny_substrings: DENY_SUBSTRINGS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Verify a path argument resolves inside the allow-list and outside
    /// the deny-list. Symlinks are resolved before comparison.
    pub fn check_path(&self, raw: &str) -> Result<(), String> {
        let resolved = resolve(Path::new(raw))
            .ok_or_else(|| format!("path does not resolve: {raw}"))?;

        for deny in &self.deny_roots {
            let deny_resolved = resolve(deny).unwrap_or_else(|| deny.clone());
            if resolved.starts_with(&deny_resolved) {
                return Err(format!("path is deny-listed: {}", resolved.display()));
            }
        }

        let allowed = self.allow_roots.iter().any(|root| {
            let root_resolved = resolve(root).unwrap_or_else(|| root.clone());
            resolved.starts_with(&root_resolved)
        });
        if !allowed {
            return Err(format!(
                "path is outside the allowed directories: {}",
                resolved.display()
            ));
        }
        Ok(())
    }

    /// Scan a script argument for deny-listed substrings.
    pub fn check_script(&self, script: &str) -> Result<(), String> {
        let lower = script.to_lowercase();
        for denied in &self.deny_substrings {
            if lower.contains(&denied.to_lowercase()) {
                return Err(format!("script contains a blocked phrase: {denied:?}"));
            }
        }
        Ok(())
    }

    /// Gate outbound sends on an explicit confirmation argument.
    pub fn check_outbound(
        &self,
        args: &serde_json::Map<String, Value>,
        silent_ok: bool,
    ) -> Result<(), String> {
        if silent_ok {
            return Ok(());
        }
        match args.get("confirmed") {
            Some(Value::Bool(true)) => Ok(()),
            _ => Err("outbound content requires confirmed=true".to_string()),
        }
    }
}

/// Canonicalize, tolerating a not-yet-existing final component by resolving
/// its parent instead.
fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(p) = std::fs::canonicalize(path) {
        return Some(p);
    }
    let parent = path.parent()?;
    let file = path.file_name()?;
    let parent_resolved = std::fs::canonicalize(parent).ok()?;
    Some(parent_resolved.join(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_with(dir: &Path) -> Sandbox {
        Sandbox::with_roots(vec![dir.to_path_buf()], vec![dir.join("secrets")])
    }

    #[test]
    fn allows_paths_under_allowed_root() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        let inside = tmp.path().join("notes.txt");
        std::fs::write(&inside, "hi").unwrap();
        assert!(sandbox.check_path(inside.to_str().unwrap()).is_ok());
    }

    #[test]
    fn allows_new_file_in_allowed_root() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        let new_file = tmp.path().join("not_yet_created.txt");
        assert!(sandbox.check_path(new_file.to_str().unwrap()).is_ok());
    }

    #[test]
    fn rejects_paths_outside_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        let outside = other.path().join("file.txt");
        std::fs::write(&outside, "x").unwrap();
        assert!(sandbox.check_path(outside.to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_deny_listed_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("secrets")).unwrap();
        let sandbox = sandbox_with(tmp.path());
        let secret = tmp.path().join("secrets").join("token.txt");
        std::fs::write(&secret, "x").unwrap();
        assert!(sandbox.check_path(secret.to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_traversal_out_of_root() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        let sneaky = format!("{}/../../etc/passwd", tmp.path().display());
        assert!(sandbox.check_path(&sneaky).is_err());
    }

    #[test]
    fn script_deny_list_blocks_shell_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        assert!(sandbox.check_script("tell app \"Safari\" to activate").is_ok());
        assert!(sandbox.check_script("do shell script \"rm -rf ~\"").is_err());
        assert!(sandbox
            .check_script("with administrator privileges")
            .is_err());
    }

    #[test]
    fn script_deny_list_is_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        assert!(sandbox.check_script("DO SHELL SCRIPT \"ls\"").is_err());
    }

    #[test]
    fn config_can_waive_substrings() {
        let cfg = ToolsConfig {
            allow_dangerous_substrings: vec!["do shell script".to_string()],
            ..Default::default()
        };
        let sandbox = Sandbox::from_config(&cfg);
        assert!(sandbox.check_script("do shell script \"ls\"").is_ok());
        assert!(sandbox.check_script("sudo reboot").is_err());
    }

    #[test]
    fn outbound_requires_confirmation() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        let mut args = serde_json::Map::new();
        assert!(sandbox.check_outbound(&args, false).is_err());
        args.insert("confirmed".to_string(), Value::Bool(false));
        assert!(sandbox.check_outbound(&args, false).is_err());
        args.insert("confirmed".to_string(), Value::Bool(true));
        assert!(sandbox.check_outbound(&args, false).is_ok());
    }

    #[test]
    fn silent_ok_skips_confirmation() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(tmp.path());
        let args = serde_json::Map::new();
        assert!(sandbox.check_outbound(&args, true).is_ok());
    }
}
