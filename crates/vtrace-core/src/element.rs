#![forbid(unsafe_code)]

//! Handle to a real UI element backing a node.

use crate::event::LogDisableStrategy;
use crate::params::Params;

/// A host UI element that can be tracked.
///
/// Nodes built from an element read its identity once at construction and
/// afterwards keep only a weak handle to it, so the host remains the sole
/// owner of the element's lifetime.
pub trait TrackedElement: Send + Sync {
    /// Element identifier.
    fn oid(&self) -> String;

    /// Page-level element rather than a leaf.
    fn is_page(&self) -> bool {
        false
    }

    /// Distinguishes elements that share an oid inside the same parent
    /// (e.g. reused list cells bound to different data).
    fn identifier(&self) -> String {
        String::new()
    }

    /// Ordinal among siblings; `0` means unspecified.
    fn position(&self) -> u32 {
        0
    }

    /// Initial static parameters.
    fn static_params(&self) -> Params {
        Params::new()
    }

    /// Builtin events this element does not want logged.
    fn log_disable_strategy(&self) -> LogDisableStrategy {
        LogDisableStrategy::NONE
    }
}
