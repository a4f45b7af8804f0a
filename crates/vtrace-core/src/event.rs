#![forbid(unsafe_code)]

//! Builtin event names and the per-node builtin-event log switch.

use bitflags::bitflags;

/// Page view (page node became visible).
pub const PAGE_VIEW: &str = "_pv";
/// Page view end (page node left the screen).
pub const PAGE_VIEW_END: &str = "_pd";
/// Element impression.
pub const IMPRESS: &str = "_ev";
/// Element impression end.
pub const IMPRESS_END: &str = "_ed";
/// Element click.
pub const CLICK: &str = "_ec";
/// Scroll interaction.
pub const SCROLL: &str = "_es";

/// Builtin event names in reporting order.
pub const BUILTIN_EVENTS: [&str; 6] = [PAGE_VIEW, PAGE_VIEW_END, IMPRESS, IMPRESS_END, CLICK, SCROLL];

/// Whether `event` is one of the builtin event names.
#[must_use]
pub fn is_builtin(event: &str) -> bool {
    BUILTIN_EVENTS.contains(&event)
}

bitflags! {
    /// Which builtin events a node suppresses.
    ///
    /// Passed at node construction. Custom (non-builtin) events are never
    /// affected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct LogDisableStrategy: u8 {
        /// Everything is logged.
        const NONE        = 0b0000;
        /// Suppress impressions (`_ev` / `_pv`).
        const IMPRESS     = 0b0001;
        /// Suppress impression ends (`_ed` / `_pd`).
        const IMPRESS_END = 0b0010;
        /// Suppress clicks (`_ec`).
        const CLICK       = 0b0100;
        /// Suppress every builtin event.
        const ALL         = Self::IMPRESS.bits() | Self::IMPRESS_END.bits() | Self::CLICK.bits();
    }
}

impl LogDisableStrategy {
    /// Whether this strategy suppresses `event`.
    #[must_use]
    pub fn disables(self, event: &str) -> bool {
        match event {
            IMPRESS | PAGE_VIEW => self.contains(Self::IMPRESS),
            IMPRESS_END | PAGE_VIEW_END => self.contains(Self::IMPRESS_END),
            CLICK => self.contains(Self::CLICK),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_disables_nothing() {
        for event in BUILTIN_EVENTS {
            assert!(!LogDisableStrategy::NONE.disables(event));
        }
    }

    #[test]
    fn impress_covers_page_view() {
        let s = LogDisableStrategy::IMPRESS;
        assert!(s.disables(IMPRESS));
        assert!(s.disables(PAGE_VIEW));
        assert!(!s.disables(IMPRESS_END));
        assert!(!s.disables(CLICK));
    }

    #[test]
    fn all_leaves_custom_events_alone() {
        let s = LogDisableStrategy::ALL;
        assert!(s.disables(CLICK));
        assert!(s.disables(PAGE_VIEW_END));
        assert!(!s.disables(SCROLL));
        assert!(!s.disables("custom_share"));
    }

    #[test]
    fn builtin_lookup() {
        assert!(is_builtin(CLICK));
        assert!(!is_builtin("custom_share"));
    }
}
