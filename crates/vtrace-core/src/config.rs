#![forbid(unsafe_code)]

//! Tree-wide configuration injected at [`VTree`](crate::tree::VTree) creation.
//!
//! Nothing in the core reads global state; every knob lives here and reaches
//! nodes through their weak tree back-reference.
//!
//! # Environment
//!
//! [`VTreeConfig::from_env`] honours:
//!
//! - `VTRACE_FORCE_REFRESH_EVENTS`: comma-separated event names whose dynamic
//!   params are always recomputed before reporting.
//! - `VTRACE_VISIBLE_RATIO`: minimum visible fraction (`0.0..=1.0`) for a node
//!   to count as visible.
//!
//! Malformed values are ignored and the default is kept.

use std::fmt;
use std::sync::Arc;

use crate::params::{DynamicParamsProvider, RefreshPolicy};
use crate::refer::{ReferFormatter, SpmReferFormatter};

/// Env var listing events that force a dynamic-params refresh.
pub const ENV_FORCE_REFRESH_EVENTS: &str = "VTRACE_FORCE_REFRESH_EVENTS";
/// Env var holding the visible-ratio threshold.
pub const ENV_VISIBLE_RATIO: &str = "VTRACE_VISIBLE_RATIO";

/// Flags applied to overlay roots (dialogs, alerts) when they are mounted.
///
/// Ordinary elements default both flags to `false`; transient overlays should
/// neither inherit nor propagate the enclosing page's referrer chain, so they
/// default to `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayDefaults {
    /// Do not cascade the overlay's referrer to what it opens.
    pub ignore_refer_cascade: bool,
    /// Drop the page-section referrer for events inside the overlay.
    pub psrefer_mute: bool,
}

impl Default for OverlayDefaults {
    fn default() -> Self {
        Self {
            ignore_refer_cascade: true,
            psrefer_mute: true,
        }
    }
}

/// Configuration shared by every node of one tree.
#[derive(Clone)]
pub struct VTreeConfig {
    /// Which events force a dynamic-params recomputation.
    pub refresh_policy: RefreshPolicy,
    /// Formats root referrer snapshots at impression time.
    pub refer_formatter: Arc<dyn ReferFormatter>,
    /// Fallback provider for nodes that have none of their own.
    pub dynamic_params: Option<Arc<dyn DynamicParamsProvider>>,
    /// A node is visible when its visible fraction exceeds this.
    /// Default: 0.0 (any visible area)
    pub visible_ratio_threshold: f32,
    /// Flags applied to overlay roots on mount.
    pub overlay_defaults: OverlayDefaults,
}

impl Default for VTreeConfig {
    fn default() -> Self {
        Self {
            refresh_policy: RefreshPolicy::new(),
            refer_formatter: Arc::new(SpmReferFormatter),
            dynamic_params: None,
            visible_ratio_threshold: 0.0,
            overlay_defaults: OverlayDefaults::default(),
        }
    }
}

impl VTreeConfig {
    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by a custom environment lookup (for tests).
    #[must_use]
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = get_env(ENV_FORCE_REFRESH_EVENTS) {
            config.refresh_policy = raw
                .split(',')
                .map(str::trim)
                .filter(|event| !event.is_empty())
                .collect();
        }

        if let Some(ratio) = get_env(ENV_VISIBLE_RATIO)
            .and_then(|raw| raw.trim().parse::<f32>().ok())
            .filter(|ratio| ratio.is_finite())
        {
            config.visible_ratio_threshold = ratio.clamp(0.0, 1.0);
        }

        config
    }

    /// Replace the refresh policy.
    #[must_use]
    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    /// Replace the referrer formatter.
    #[must_use]
    pub fn with_refer_formatter(mut self, formatter: Arc<dyn ReferFormatter>) -> Self {
        self.refer_formatter = formatter;
        self
    }

    /// Install a tree-wide dynamic params provider.
    #[must_use]
    pub fn with_dynamic_params(mut self, provider: Arc<dyn DynamicParamsProvider>) -> Self {
        self.dynamic_params = Some(provider);
        self
    }

    /// Set the visible-ratio threshold, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_visible_ratio_threshold(mut self, ratio: f32) -> Self {
        self.visible_ratio_threshold = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Replace the overlay defaults.
    #[must_use]
    pub fn with_overlay_defaults(mut self, defaults: OverlayDefaults) -> Self {
        self.overlay_defaults = defaults;
        self
    }
}

impl fmt::Debug for VTreeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VTreeConfig")
            .field("refresh_policy", &self.refresh_policy)
            .field("refer_formatter", &self.refer_formatter)
            .field("dynamic_params", &self.dynamic_params.is_some())
            .field("visible_ratio_threshold", &self.visible_ratio_threshold)
            .field("overlay_defaults", &self.overlay_defaults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RefreshMode;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = VTreeConfig::default();
        assert_eq!(config.visible_ratio_threshold, 0.0);
        assert!(config.dynamic_params.is_none());
        assert!(config.refresh_policy.forced_events().is_empty());
        assert_eq!(config.overlay_defaults, OverlayDefaults::default());
        assert!(config.overlay_defaults.ignore_refer_cascade);
        assert!(config.overlay_defaults.psrefer_mute);
    }

    #[test]
    fn env_force_refresh_events() {
        let config = VTreeConfig::from_env_with(env(&[(
            ENV_FORCE_REFRESH_EVENTS,
            " _pv, _ec ,,",
        )]));
        assert_eq!(config.refresh_policy.mode_for("_pv"), RefreshMode::Force);
        assert_eq!(config.refresh_policy.mode_for("_ec"), RefreshMode::Force);
        assert_eq!(config.refresh_policy.mode_for("_ev"), RefreshMode::Lazy);
    }

    #[test]
    fn env_visible_ratio_clamped() {
        let config = VTreeConfig::from_env_with(env(&[(ENV_VISIBLE_RATIO, "1.7")]));
        assert_eq!(config.visible_ratio_threshold, 1.0);
        let config = VTreeConfig::from_env_with(env(&[(ENV_VISIBLE_RATIO, "0.25")]));
        assert_eq!(config.visible_ratio_threshold, 0.25);
    }

    #[test]
    fn env_malformed_keeps_default() {
        let config = VTreeConfig::from_env_with(env(&[(ENV_VISIBLE_RATIO, "half")]));
        assert_eq!(config.visible_ratio_threshold, 0.0);
        let config = VTreeConfig::from_env_with(env(&[(ENV_VISIBLE_RATIO, "NaN")]));
        assert_eq!(config.visible_ratio_threshold, 0.0);
    }

    #[test]
    fn builder_clamps_threshold() {
        let config = VTreeConfig::default().with_visible_ratio_threshold(-3.0);
        assert_eq!(config.visible_ratio_threshold, 0.0);
        let config = VTreeConfig::default().with_visible_ratio_threshold(f32::INFINITY);
        assert_eq!(config.visible_ratio_threshold, 0.0);
    }
}
