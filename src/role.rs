//! Role policy for canvas access.
//!
//! A role arrives as a free-form string (token claim or configured default)
//! and normalizes case-insensitively; anything unrecognized collapses to
//! `Editor`. Viewers hold a read-only capability: they may subscribe to the
//! stream but may not post actions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    /// Normalize an arbitrary role string. Unknown inputs map to `Editor`.
    pub fn normalize(s: &str) -> Role {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Role::Viewer,
            "admin" => Role::Admin,
            _ => Role::Editor,
        }
    }

    /// Whether this role may post actions to the ingress.
    pub fn allows_action(self) -> bool {
        matches!(self, Role::Editor | Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_insensitively() {
        assert_eq!(Role::normalize("Viewer"), Role::Viewer);
        assert_eq!(Role::normalize("ADMIN"), Role::Admin);
        assert_eq!(Role::normalize("editor"), Role::Editor);
        assert_eq!(Role::normalize("  viewer "), Role::Viewer);
    }

    #[test]
    fn unknowns_collapse_to_editor() {
        assert_eq!(Role::normalize(""), Role::Editor);
        assert_eq!(Role::normalize("root"), Role::Editor);
        assert_eq!(Role::normalize("superuser"), Role::Editor);
    }

    #[test]
    fn viewer_is_read_only() {
        assert!(!Role::Viewer.allows_action());
        assert!(Role::Editor.allows_action());
        assert!(Role::Admin.allows_action());
    }
}
