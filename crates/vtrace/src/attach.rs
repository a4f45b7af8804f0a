#![forbid(unsafe_code)]

//! Element bindings and overlay (alert / action sheet) attachment.
//!
//! Host UI code rarely builds nodes by hand. It tags a widget with an
//! [`ElementBinding`] (oid, position, params and how its click should be
//! counted) and lets the binding produce the node. Overlays such as alerts
//! collect one binding per button and mount themselves as a top-priority
//! root of the tree, so they are never occluded by the page underneath.
//!
//! # Example
//!
//! ```
//! use vtrace::prelude::*;
//!
//! let tree = VTree::new(VTreeConfig::default());
//! let mut alert = Overlay::new("alert_logout");
//! alert.add_action();
//! alert.configure_latest_action("btn_cancel", None);
//! alert.add_action();
//! alert.configure_latest_action_with("btn_confirm", None, |action| {
//!     action.use_for_refer = true;
//! });
//!
//! let mounted = alert.mount(&tree).unwrap();
//! assert_eq!(mounted.actions().len(), 2);
//! ```

use std::sync::Arc;

use tracing::debug;
use vtrace_core::error::Result;
use vtrace_core::event::LogDisableStrategy;
use vtrace_core::params::Params;
use vtrace_core::{MountPriority, VTree, VTreeNode};

// ---------------------------------------------------------------------------
// Event action
// ---------------------------------------------------------------------------

/// How an interaction on a bound element is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventActionConfig {
    /// The interaction becomes the referrer of whatever it opens.
    /// Default: true (false for overlay actions)
    pub use_for_refer: bool,
    /// Draw a new sequence number from the root sentinel.
    /// Default: true
    pub increase_actseq: bool,
    /// Extra params for this interaction only.
    pub params: Params,
}

impl Default for EventActionConfig {
    fn default() -> Self {
        Self {
            use_for_refer: true,
            increase_actseq: true,
            params: Params::new(),
        }
    }
}

impl EventActionConfig {
    /// Defaults for a button inside an overlay.
    #[must_use]
    pub fn for_overlay() -> Self {
        Self {
            use_for_refer: false,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Tracking annotation for one host element.
///
/// An unbound binding (no element id yet) produces no node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementBinding {
    element_id: Option<String>,
    position: u32,
    params: Params,
    action: EventActionConfig,
}

impl ElementBinding {
    /// Unbound binding with ordinary element defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unbound binding with overlay-button defaults.
    #[must_use]
    pub fn overlay_action() -> Self {
        Self {
            action: EventActionConfig::for_overlay(),
            ..Self::default()
        }
    }

    pub fn set_element_id(&mut self, element_id: impl Into<String>, params: Option<Params>) {
        self.bind(element_id.into(), None, params);
    }

    pub fn set_element_id_at(&mut self, element_id: impl Into<String>, position: u32, params: Option<Params>) {
        self.bind(element_id.into(), Some(position), params);
    }

    /// Bind and adjust the action. `configure` runs once, immediately.
    pub fn set_element_id_with<F>(&mut self, element_id: impl Into<String>, params: Option<Params>, configure: F)
    where
        F: FnOnce(&mut EventActionConfig),
    {
        self.bind(element_id.into(), None, params);
        configure(&mut self.action);
    }

    /// Bind with a position and adjust the action.
    pub fn set_element_id_at_with<F>(
        &mut self,
        element_id: impl Into<String>,
        position: u32,
        params: Option<Params>,
        configure: F,
    ) where
        F: FnOnce(&mut EventActionConfig),
    {
        self.bind(element_id.into(), Some(position), params);
        configure(&mut self.action);
    }

    fn bind(&mut self, element_id: String, position: Option<u32>, params: Option<Params>) {
        self.element_id = Some(element_id);
        if let Some(position) = position {
            self.position = position;
        }
        if let Some(params) = params {
            self.params = params;
        }
    }

    pub fn element_id(&self) -> Option<&str> {
        self.element_id.as_deref()
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn action(&self) -> &EventActionConfig {
        &self.action
    }

    /// Bound to an element id.
    pub fn is_element(&self) -> bool {
        self.element_id.is_some()
    }

    /// Build the node for this binding, or `None` while unbound.
    pub fn build_node(&self) -> Option<Arc<VTreeNode>> {
        let oid = self.element_id.as_ref()?;
        Some(VTreeNode::build_virtual(
            oid.clone(),
            false,
            "",
            self.position,
            LogDisableStrategy::NONE,
            Some(self.params.clone()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// An alert-style overlay page with tracked buttons.
#[derive(Debug, Clone)]
pub struct Overlay {
    oid: String,
    params: Params,
    priority: MountPriority,
    ignore_refer_cascade: Option<bool>,
    psrefer_mute: Option<bool>,
    allowed_actions: Option<Vec<String>>,
    actions: Vec<ElementBinding>,
}

impl Overlay {
    /// Overlay mounted at [`MountPriority::Highest`] with the tree's overlay
    /// defaults.
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            params: Params::new(),
            priority: MountPriority::Highest,
            ignore_refer_cascade: None,
            psrefer_mute: None,
            allowed_actions: None,
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: MountPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the tree's `ignore_refer_cascade` default for this overlay.
    #[must_use]
    pub fn with_ignore_refer_cascade(mut self, ignore: bool) -> Self {
        self.ignore_refer_cascade = Some(ignore);
        self
    }

    /// Override the tree's `psrefer_mute` default for this overlay.
    #[must_use]
    pub fn with_psrefer_mute(mut self, mute: bool) -> Self {
        self.psrefer_mute = Some(mute);
        self
    }

    /// Only buttons with these element ids may be mounted under the overlay.
    #[must_use]
    pub fn with_allowed_actions(mut self, oids: Vec<String>) -> Self {
        self.allowed_actions = Some(oids);
        self
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// Append an unbound button and return it for configuration.
    pub fn add_action(&mut self) -> &mut ElementBinding {
        self.actions.push(ElementBinding::overlay_action());
        let last = self.actions.len() - 1;
        &mut self.actions[last]
    }

    pub fn actions(&self) -> &[ElementBinding] {
        &self.actions
    }

    /// Bind the most recently added button. `false` if there is none.
    pub fn configure_latest_action(&mut self, element_id: impl Into<String>, params: Option<Params>) -> bool {
        self.latest()
            .map(|action| action.set_element_id(element_id, params))
            .is_some()
    }

    pub fn configure_latest_action_at(
        &mut self,
        element_id: impl Into<String>,
        position: u32,
        params: Option<Params>,
    ) -> bool {
        self.latest()
            .map(|action| action.set_element_id_at(element_id, position, params))
            .is_some()
    }

    pub fn configure_latest_action_with<F>(
        &mut self,
        element_id: impl Into<String>,
        params: Option<Params>,
        configure: F,
    ) -> bool
    where
        F: FnOnce(&mut EventActionConfig),
    {
        self.latest()
            .map(|action| action.set_element_id_with(element_id, params, configure))
            .is_some()
    }

    pub fn configure_latest_action_at_with<F>(
        &mut self,
        element_id: impl Into<String>,
        position: u32,
        params: Option<Params>,
        configure: F,
    ) -> bool
    where
        F: FnOnce(&mut EventActionConfig),
    {
        self.latest()
            .map(|action| action.set_element_id_at_with(element_id, position, params, configure))
            .is_some()
    }

    fn latest(&mut self) -> Option<&mut ElementBinding> {
        self.actions.last_mut()
    }

    /// Mount as an overlay root of `tree`, with one child node per bound
    /// button. Unbound buttons are skipped. If a button cannot be attached
    /// the overlay is unmounted again and the error returned.
    pub fn mount(&self, tree: &Arc<VTree>) -> Result<MountedOverlay> {
        let root = VTreeNode::build_virtual(
            self.oid.clone(),
            true,
            "",
            0,
            LogDisableStrategy::NONE,
            Some(self.params.clone()),
        );
        tree.try_mount_overlay(&root, self.priority)?;
        if let Some(ignore) = self.ignore_refer_cascade {
            root.set_ignore_refer_cascade(ignore);
        }
        if let Some(mute) = self.psrefer_mute {
            root.set_psrefer_mute(mute);
        }
        root.set_valid_for_containing_sub_node_oids(self.allowed_actions.clone());

        let mut actions = Vec::with_capacity(self.actions.len());
        for binding in &self.actions {
            let Some(node) = binding.build_node() else {
                continue;
            };
            if let Err(err) = tree.try_attach(&root, &node) {
                debug!(oid = %self.oid, action = %node.oid(), %err, "overlay mount rolled back");
                tree.unmount_overlay(&root);
                return Err(err);
            }
            actions.push(BoundAction {
                node,
                config: binding.action.clone(),
            });
        }
        debug!(oid = %self.oid, actions = actions.len(), "overlay attached");
        Ok(MountedOverlay { root, actions })
    }
}

/// A button node of a mounted overlay with its action settings.
#[derive(Debug, Clone)]
pub struct BoundAction {
    pub node: Arc<VTreeNode>,
    pub config: EventActionConfig,
}

/// Handle to an overlay mounted on a tree.
#[derive(Debug, Clone)]
pub struct MountedOverlay {
    root: Arc<VTreeNode>,
    actions: Vec<BoundAction>,
}

impl MountedOverlay {
    pub fn root(&self) -> &Arc<VTreeNode> {
        &self.root
    }

    pub fn actions(&self) -> &[BoundAction] {
        &self.actions
    }

    /// The first button bound to `element_id`.
    pub fn action(&self, element_id: &str) -> Option<&BoundAction> {
        self.actions.iter().find(|a| a.node.oid() == element_id)
    }

    /// Remove the overlay from `tree`, detaching all its nodes.
    pub fn unmount(&self, tree: &VTree) -> bool {
        tree.unmount_overlay(&self.root)
    }
}
