use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Deterministic naming for tenants, projects and collections. Pure and
/// side-effect free; changing any hash here is a breaking storage change.

const BRANCH_TOKEN_MAX: usize = 40;

fn hash16(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    hex::encode(digest)[..16].to_string()
}

/// Stable opaque owner id for an external principal identifier.
pub fn owner_id(principal: &str) -> String {
    hash16(principal.as_bytes())
}

/// Project key: first 16 hex chars of SHA-256 of the cleaned absolute path.
/// Two worktrees of the same repo live at different paths and therefore get
/// different projects.
pub fn project_hash(path: &str) -> Result<String> {
    let cleaned = clean_abs_path(path)?;
    Ok(hash16(cleaned.to_string_lossy().as_bytes()))
}

/// Lexical path cleaning: resolves `.` and `..` without touching the
/// filesystem. Rejects non-absolute input.
pub fn clean_abs_path(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(Error::invalid_argument(format!(
            "project path must be absolute: {path:?}"
        )));
    }
    let mut cleaned = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::Prefix(prefix) => cleaned.push(prefix.as_os_str()),
            Component::RootDir => cleaned.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop past the root.
                if cleaned.parent().is_some() {
                    cleaned.pop();
                }
            }
            Component::Normal(part) => cleaned.push(part),
        }
    }
    Ok(cleaned)
}

/// Branch name → collection token: lowercase, `[^a-z0-9_-]` becomes `-`,
/// runs collapsed, edges trimmed, max 40 chars.
pub fn sanitize_branch(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.to_lowercase().chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            ch
        } else {
            '-'
        };
        if mapped == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('-');
    let token: String = trimmed.chars().take(BRANCH_TOKEN_MAX).collect();
    let token = token.trim_matches('-').to_string();
    if token.is_empty() {
        "unnamed".to_string()
    } else {
        token
    }
}

/// Leaf of a project-scoped collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectLeaf<'a> {
    Main,
    /// Already-sanitized branch token.
    Branch(&'a str),
    Archive,
}

/// Shared-pool kinds owned directly by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedKind {
    Remediations,
    Skills,
    Strategies,
}

impl SharedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharedKind::Remediations => "remediations",
            SharedKind::Skills => "skills",
            SharedKind::Strategies => "strategies",
        }
    }
}

/// `owner_<h>/project_<h>/(main|branch_<tok>|archive)`
pub fn project_collection(owner: &str, project: &str, leaf: ProjectLeaf<'_>) -> String {
    let leaf = match leaf {
        ProjectLeaf::Main => "main".to_string(),
        ProjectLeaf::Branch(tok) => format!("branch_{tok}"),
        ProjectLeaf::Archive => "archive".to_string(),
    };
    format!("owner_{owner}/project_{project}/{leaf}")
}

/// `owner_<h>/shared/<kind>`
pub fn shared_collection(owner: &str, kind: SharedKind) -> String {
    format!("owner_{owner}/shared/{}", kind.as_str())
}
