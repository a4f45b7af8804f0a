#![forbid(unsafe_code)]

//! Errors for the checked tree-wiring API.
//!
//! Hot-path calls never fail: they degrade to no-ops. Only
//! [`VTree::try_attach`](crate::tree::VTree::try_attach) and
//! [`VTree::try_mount_overlay`](crate::tree::VTree::try_mount_overlay) report
//! why a structural edit was refused.

use std::fmt;

/// Reasons a structural edit was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VTreeError {
    /// The named node was removed from its tree; detachment is terminal.
    Detached(String),
    /// The parent belongs to another tree (or none).
    ForeignTree(String),
    /// Attaching would make a node its own ancestor.
    Cycle {
        /// Oid of the would-be parent.
        parent: String,
        /// Oid of the would-be child.
        child: String,
    },
    /// A node cannot be pushed under itself.
    SelfParent(String),
    /// The parent restricts which oids it may contain.
    NotAllowed {
        /// Oid of the parent with the whitelist.
        parent: String,
        /// Oid that was rejected.
        child: String,
    },
    /// The node is already mounted as a root of this tree.
    AlreadyMounted(String),
}

impl fmt::Display for VTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached(oid) => write!(f, "node `{oid}` is detached"),
            Self::ForeignTree(oid) => write!(f, "node `{oid}` is not associated with this tree"),
            Self::Cycle { parent, child } => {
                write!(f, "attaching `{child}` under `{parent}` would create a cycle")
            }
            Self::SelfParent(oid) => write!(f, "node `{oid}` cannot be its own parent"),
            Self::NotAllowed { parent, child } => {
                write!(f, "`{parent}` does not accept sub node `{child}`")
            }
            Self::AlreadyMounted(oid) => write!(f, "node `{oid}` is already mounted as a root"),
        }
    }
}

impl std::error::Error for VTreeError {}

/// Result type for checked tree operations.
pub type Result<T> = std::result::Result<T, VTreeError>;

#[cfg(test)]
mod tests {
    use super::VTreeError;

    #[test]
    fn display_names_nodes() {
        let err = VTreeError::Cycle {
            parent: "list".into(),
            child: "page".into(),
        };
        assert_eq!(
            err.to_string(),
            "attaching `page` under `list` would create a cycle"
        );
        assert_eq!(
            VTreeError::Detached("cell".into()).to_string(),
            "node `cell` is detached"
        );
    }

    #[test]
    fn is_std_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&VTreeError::SelfParent("x".into()));
    }
}
