#![forbid(unsafe_code)]

//! Parameter layers and their merge.
//!
//! A node carries three independently owned layers:
//!
//! | Layer    | Owner                         | Lifetime                      |
//! |----------|-------------------------------|-------------------------------|
//! | static   | caller (`update_static_params`) | until overwritten           |
//! | dynamic  | [`DynamicParamsProvider`]     | until the dirty flag is set   |
//! | callback | reporting call site           | one event, never stored       |
//!
//! Precedence, lowest to highest: static < dynamic < callback. Missing keys
//! are simply absent from the result; nothing here validates values.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::node::VTreeNode;

/// A parameter dictionary. Ordered so merged output is deterministic.
pub type Params = BTreeMap<String, String>;

/// Build [`Params`] from string pairs.
#[must_use]
pub fn params<K, V, I>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merges the three parameter layers of a node for one event.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamsResolver<'a> {
    static_layer: Option<&'a Params>,
    dynamic_layer: Option<&'a Params>,
    callback_layer: Option<&'a Params>,
}

impl<'a> ParamsResolver<'a> {
    /// Resolver with no layers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the static (lowest precedence) layer.
    #[must_use]
    pub fn with_static(mut self, layer: &'a Params) -> Self {
        self.static_layer = Some(layer);
        self
    }

    /// Set the dynamic layer.
    #[must_use]
    pub fn with_dynamic(mut self, layer: &'a Params) -> Self {
        self.dynamic_layer = Some(layer);
        self
    }

    /// Set the per-event callback (highest precedence) layer.
    #[must_use]
    pub fn with_callback(mut self, layer: Option<&'a Params>) -> Self {
        self.callback_layer = layer;
        self
    }

    /// Produce the merged attribute set.
    #[must_use]
    pub fn resolve(&self) -> Params {
        let mut merged = Params::new();
        for layer in [self.static_layer, self.dynamic_layer, self.callback_layer]
            .into_iter()
            .flatten()
        {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

// ---------------------------------------------------------------------------
// Dynamic provider
// ---------------------------------------------------------------------------

/// Produces the dynamic parameter layer of a node on demand.
///
/// Called without any node lock held, so implementations may read the node
/// (position, static params, snapshot) freely.
pub trait DynamicParamsProvider: Send + Sync {
    /// Compute the dynamic layer for `node`.
    fn dynamic_params(&self, node: &VTreeNode) -> Params;
}

impl<F> DynamicParamsProvider for F
where
    F: Fn(&VTreeNode) -> Params + Send + Sync,
{
    fn dynamic_params(&self, node: &VTreeNode) -> Params {
        self(node)
    }
}

// ---------------------------------------------------------------------------
// Refresh policy
// ---------------------------------------------------------------------------

/// How an event treats a clean dynamic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    /// Recompute only when the dirty flag is set.
    #[default]
    Lazy,
    /// Always recompute before reporting this event.
    Force,
}

/// Event-name → [`RefreshMode`] table. Unlisted events are [`RefreshMode::Lazy`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RefreshPolicy {
    table: HashMap<String, RefreshMode>,
}

impl RefreshPolicy {
    /// Empty table: every event is lazy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force recomputation for `event`.
    #[must_use]
    pub fn force(mut self, event: impl Into<String>) -> Self {
        self.table.insert(event.into(), RefreshMode::Force);
        self
    }

    /// Explicitly mark `event` as lazy.
    #[must_use]
    pub fn lazy(mut self, event: impl Into<String>) -> Self {
        self.table.insert(event.into(), RefreshMode::Lazy);
        self
    }

    /// Mode for `event`.
    #[must_use]
    pub fn mode_for(&self, event: &str) -> RefreshMode {
        self.table.get(event).copied().unwrap_or_default()
    }

    /// Events configured as [`RefreshMode::Force`], sorted.
    #[must_use]
    pub fn forced_events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self
            .table
            .iter()
            .filter(|(_, mode)| **mode == RefreshMode::Force)
            .map(|(event, _)| event.as_str())
            .collect();
        events.sort_unstable();
        events
    }
}

impl fmt::Debug for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshPolicy")
            .field("forced", &self.forced_events())
            .finish()
    }
}

impl<S: Into<String>> FromIterator<S> for RefreshPolicy {
    /// Collect event names into a table that forces each of them.
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |policy, e| policy.force(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_precedence() {
        let s = params([("a", "1")]);
        let d = params([("b", "2")]);
        let c = params([("a", "3"), ("c", "4")]);
        let merged = ParamsResolver::new()
            .with_static(&s)
            .with_dynamic(&d)
            .with_callback(Some(&c))
            .resolve();
        assert_eq!(merged, params([("a", "3"), ("b", "2"), ("c", "4")]));
    }

    #[test]
    fn dynamic_beats_static() {
        let s = params([("k", "static")]);
        let d = params([("k", "dynamic")]);
        let merged = ParamsResolver::new().with_static(&s).with_dynamic(&d).resolve();
        assert_eq!(merged.get("k").map(String::as_str), Some("dynamic"));
    }

    #[test]
    fn missing_layers_are_empty() {
        assert!(ParamsResolver::new().resolve().is_empty());
        let d = params([("only", "dyn")]);
        let merged = ParamsResolver::new().with_dynamic(&d).with_callback(None).resolve();
        assert_eq!(merged, d);
    }

    #[test]
    fn refresh_policy_defaults_to_lazy() {
        let policy = RefreshPolicy::new().force("_pv");
        assert_eq!(policy.mode_for("_pv"), RefreshMode::Force);
        assert_eq!(policy.mode_for("_ec"), RefreshMode::Lazy);
    }

    #[test]
    fn refresh_policy_lazy_overrides_force() {
        let policy = RefreshPolicy::new().force("_ev").lazy("_ev");
        assert_eq!(policy.mode_for("_ev"), RefreshMode::Lazy);
        assert!(policy.forced_events().is_empty());
    }

    #[test]
    fn refresh_policy_from_iter() {
        let policy: RefreshPolicy = ["_pv", "_ec"].into_iter().collect();
        assert_eq!(policy.forced_events(), vec!["_ec", "_pv"]);
    }
}
