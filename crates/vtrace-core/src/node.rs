#![forbid(unsafe_code)]

//! The annotated tree node.
//!
//! A [`VTreeNode`] represents one tracked UI element (or a virtual grouping)
//! and carries everything needed to report impressions and interactions for
//! it: identity, position, exposure state, three parameter layers, the
//! root-scoped interaction counter and the referrer snapshot.
//!
//! # Ownership
//!
//! ```text
//!            Arc (owns)                Weak (lookup only)
//!   parent ─────────────▶ sub node ─────────────────────▶ parent
//!   VTree  ─────────────▶ root     ─────────────────────▶ VTree
//!   host   ─────────────▶ element  ◀───────────────────── node
//! ```
//!
//! A parent exclusively owns its children; children, the tree and the host
//! element are reached through `Weak` handles that are upgraded (and may fail)
//! on every use.
//!
//! # Locking
//!
//! Every node guards its mutable fields with its own mutex. No operation holds
//! two node locks at once: ancestor walks take and release one lock per hop,
//! and user callbacks (dynamic params, referrer formatting) run with no lock
//! held. Structural edits (association, parent/child wiring, root marking)
//! must come from a single thread; readers on other threads see a consistent
//! per-node snapshot and eventually consistent ancestor state.
//!
//! # Invariants
//!
//! 1. A node appears in at most one parent's sub-node list.
//! 2. `has_sub_page_node_mark_as_root_page` is true iff some live descendant
//!    is marked as root page.
//! 3. `blocked_by_sub_page` is true iff a later sibling is, or contains, a
//!    root-page-marked node.
//! 4. The sentinel and pv referrer exist only on root-page-marked nodes and
//!    on tree roots.
//! 5. `position` never contributes to the diff identifier.
//! 6. Detachment is terminal: every mutating call on a detached node is a no-op.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::element::TrackedElement;
use crate::error::{Result, VTreeError};
use crate::event::LogDisableStrategy;
use crate::geometry::Rect;
use crate::params::{DynamicParamsProvider, Params, ParamsResolver, RefreshMode};
use crate::refer::{
    ExternalRefer, FormattedRefer, ReferContext, ReferFormatter, SpmReferFormatter, SpmSegment,
    spm_string,
};
use crate::sentinel::Sentinel;
use crate::tree::VTree;

// ---------------------------------------------------------------------------
// Exposure results
// ---------------------------------------------------------------------------

/// One completed Visible span of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSpan {
    /// When the node became visible.
    pub begin: Instant,
    /// How long it stayed visible.
    pub duration: Duration,
    /// Highest visible fraction seen during the span.
    pub max_ratio: f32,
}

/// Outcome of [`VTreeNode::update_visibility`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VisibilityChange {
    /// No Hidden/Visible transition happened.
    Unchanged,
    /// Hidden → Visible; an impression should be reported.
    Impressed,
    /// Visible → Hidden; the span is final.
    Hidden(ExposureSpan),
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Consistent single-lock read of a node's reporting fields.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeSnapshot {
    pub oid: String,
    pub is_page: bool,
    pub identifier: String,
    pub position: u32,
    pub visible: bool,
    pub visible_rect: Rect,
    pub view_visible_rect_on_screen: Rect,
    pub impress_max_ratio: f32,
    pub blocked_by_sub_page: bool,
    pub page_node_mark_as_root_page: bool,
    pub has_sub_page_node_mark_as_root_page: bool,
    pub ignore_refer: bool,
    pub ignore_refer_cascade: bool,
    pub psrefer_mute: bool,
    pub has_bind_data: bool,
    pub static_params: Params,
    pub dynamic_params: Params,
    pub detached: bool,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct NodeState {
    identifier: String,
    position: u32,

    visible: bool,
    visible_rect: Rect,
    view_visible_rect_on_screen: Rect,
    impress_max_ratio: f32,
    begin_time: Option<Instant>,
    has_bind_data: bool,

    diff_identifier: String,
    diff_identifier_should_update: bool,
    /// Bumped on every diff invalidation.
    diff_generation: u64,

    blocked_by_sub_page: bool,
    could_auto_mount_other_nodes: bool,
    valid_for_containing_sub_node_oids: Option<Vec<String>>,

    has_sub_page_node_mark_as_root_page: bool,
    page_node_mark_as_root_page: bool,
    is_tree_root: bool,

    ignore_refer: bool,
    ignore_refer_cascade: bool,
    psrefer_mute: bool,

    actseq_sentinel: Option<Arc<Sentinel>>,
    root_page_pv_formatted_refer: Option<Arc<dyn FormattedRefer>>,

    static_params: Params,
    dynamic_params: Params,
    dynamic_params_dirty: bool,
    /// Bumped on every dynamic-layer invalidation.
    dynamic_params_generation: u64,
    dynamic_provider: Option<Arc<dyn DynamicParamsProvider>>,

    sub_nodes: Vec<Arc<VTreeNode>>,
    parent: Weak<VTreeNode>,
    tree: Weak<VTree>,

    detached: bool,
}

impl NodeState {
    fn new(identifier: String, position: u32, static_params: Params) -> Self {
        Self {
            identifier,
            position,
            visible: false,
            visible_rect: Rect::default(),
            view_visible_rect_on_screen: Rect::default(),
            impress_max_ratio: 0.0,
            begin_time: None,
            has_bind_data: false,
            diff_identifier: String::new(),
            diff_identifier_should_update: true,
            diff_generation: 0,
            blocked_by_sub_page: false,
            could_auto_mount_other_nodes: false,
            valid_for_containing_sub_node_oids: None,
            has_sub_page_node_mark_as_root_page: false,
            page_node_mark_as_root_page: false,
            is_tree_root: false,
            ignore_refer: false,
            ignore_refer_cascade: false,
            psrefer_mute: false,
            actseq_sentinel: None,
            root_page_pv_formatted_refer: None,
            static_params,
            dynamic_params: Params::new(),
            dynamic_params_dirty: true,
            dynamic_params_generation: 0,
            dynamic_provider: None,
            sub_nodes: Vec::new(),
            parent: Weak::new(),
            tree: Weak::new(),
            detached: false,
        }
    }

    /// Drop root-scoped state unless something still makes this node a root.
    fn release_root_scope_if_unused(&mut self) {
        if !self.page_node_mark_as_root_page && !self.is_tree_root {
            self.actseq_sentinel = None;
            self.root_page_pv_formatted_refer = None;
        }
    }

    fn contributes_root_page_mark(&self) -> bool {
        self.page_node_mark_as_root_page || self.has_sub_page_node_mark_as_root_page
    }

    fn invalidate_dynamic_params(&mut self) {
        self.dynamic_params_dirty = true;
        self.dynamic_params_generation = self.dynamic_params_generation.wrapping_add(1);
    }

    fn invalidate_diff_identifier(&mut self) {
        self.diff_identifier_should_update = true;
        self.diff_generation = self.diff_generation.wrapping_add(1);
    }
}

fn compose_diff_identifier(parent: Option<&str>, is_page: bool, oid: &str, identifier: &str) -> String {
    let kind = if is_page { 'p' } else { 'e' };
    let own = if identifier.is_empty() {
        format!("{kind}:{oid}")
    } else {
        format!("{kind}:{oid}#{identifier}")
    };
    match parent {
        Some(parent) => format!("{parent}/{own}"),
        None => own,
    }
}

// ---------------------------------------------------------------------------
// VTreeNode
// ---------------------------------------------------------------------------

/// A tracked node. Always handled as `Arc<VTreeNode>`.
pub struct VTreeNode {
    oid: String,
    is_page: bool,
    element: Option<Weak<dyn TrackedElement>>,
    log_disable_strategy: LogDisableStrategy,
    state: Mutex<NodeState>,
}

impl VTreeNode {
    // --- construction ------------------------------------------------------

    /// Build a node bound to a host element.
    ///
    /// Identity, position and initial static params are read from the element
    /// now; afterwards only a weak handle is kept.
    pub fn build<E: TrackedElement + 'static>(element: &Arc<E>) -> Arc<Self> {
        let weak = Arc::downgrade(element);
        let weak: Weak<dyn TrackedElement> = weak;
        Arc::new(Self {
            oid: element.oid(),
            is_page: element.is_page(),
            element: Some(weak),
            log_disable_strategy: element.log_disable_strategy(),
            state: Mutex::new(NodeState::new(
                element.identifier(),
                element.position(),
                element.static_params(),
            )),
        })
    }

    /// Build a synthetic node with no backing element.
    pub fn build_virtual(
        oid: impl Into<String>,
        is_page: bool,
        identifier: impl Into<String>,
        position: u32,
        log_disable_strategy: LogDisableStrategy,
        params: Option<Params>,
    ) -> Arc<Self> {
        Arc::new(Self {
            oid: oid.into(),
            is_page,
            element: None,
            log_disable_strategy,
            state: Mutex::new(NodeState::new(
                identifier.into(),
                position,
                params.unwrap_or_default(),
            )),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the state unless the node is detached.
    fn with_live<R>(&self, op: &'static str, f: impl FnOnce(&mut NodeState) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.detached {
            drop(state);
            debug!(oid = %self.oid, op, "ignored mutation on detached node");
            return None;
        }
        Some(f(&mut state))
    }

    // --- identity ----------------------------------------------------------

    /// Element identifier.
    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// Page-level node rather than a leaf element.
    pub fn is_page(&self) -> bool {
        self.is_page
    }

    /// Built without a backing element.
    pub fn is_virtual(&self) -> bool {
        self.element.is_none()
    }

    /// The backing element, if it is still alive.
    pub fn element(&self) -> Option<Arc<dyn TrackedElement>> {
        self.element.as_ref().and_then(Weak::upgrade)
    }

    pub fn log_disable_strategy(&self) -> LogDisableStrategy {
        self.log_disable_strategy
    }

    /// Whether this node suppresses the builtin `event`.
    pub fn is_event_logging_disabled(&self, event: &str) -> bool {
        self.log_disable_strategy.disables(event)
    }

    pub fn identifier(&self) -> String {
        self.lock().identifier.clone()
    }

    pub fn position(&self) -> u32 {
        self.lock().position
    }

    /// Pointer identity.
    pub fn is_same(&self, other: &VTreeNode) -> bool {
        std::ptr::eq(self, other)
    }

    // --- simple state reads -------------------------------------------------

    pub fn visible(&self) -> bool {
        self.lock().visible
    }

    pub fn visible_rect(&self) -> Rect {
        self.lock().visible_rect
    }

    pub fn view_visible_rect_on_screen(&self) -> Rect {
        self.lock().view_visible_rect_on_screen
    }

    pub fn impress_max_ratio(&self) -> f32 {
        self.lock().impress_max_ratio
    }

    /// Start of the current Visible span.
    pub fn begin_time(&self) -> Option<Instant> {
        self.lock().begin_time
    }

    pub fn has_bind_data(&self) -> bool {
        self.lock().has_bind_data
    }

    pub fn is_blocked_by_sub_page(&self) -> bool {
        self.lock().blocked_by_sub_page
    }

    pub fn has_sub_page_node_mark_as_root_page(&self) -> bool {
        self.lock().has_sub_page_node_mark_as_root_page
    }

    pub fn page_node_mark_as_root_page(&self) -> bool {
        self.lock().page_node_mark_as_root_page
    }

    /// Designated as a root of its [`VTree`].
    pub fn is_tree_root(&self) -> bool {
        self.lock().is_tree_root
    }

    pub fn ignore_refer(&self) -> bool {
        self.lock().ignore_refer
    }

    pub fn ignore_refer_cascade(&self) -> bool {
        self.lock().ignore_refer_cascade
    }

    pub fn psrefer_mute(&self) -> bool {
        self.lock().psrefer_mute
    }

    pub fn could_auto_mount_other_nodes(&self) -> bool {
        self.lock().could_auto_mount_other_nodes
    }

    pub fn valid_for_containing_sub_node_oids(&self) -> Option<Vec<String>> {
        self.lock().valid_for_containing_sub_node_oids.clone()
    }

    pub fn is_detached(&self) -> bool {
        self.lock().detached
    }

    pub fn static_params(&self) -> Params {
        self.lock().static_params.clone()
    }

    /// The dynamic layer as last computed (may be stale if dirty).
    pub fn dynamic_params(&self) -> Params {
        self.lock().dynamic_params.clone()
    }

    pub fn dynamic_params_dirty(&self) -> bool {
        self.lock().dynamic_params_dirty
    }

    /// This node's own sentinel; `None` unless it acts as a root.
    pub fn actseq_sentinel(&self) -> Option<Arc<Sentinel>> {
        self.lock().actseq_sentinel.clone()
    }

    /// This node's own pv referrer snapshot; `None` unless it acts as a root
    /// and has been impressed (or seeded).
    pub fn root_page_pv_formatted_refer(&self) -> Option<Arc<dyn FormattedRefer>> {
        self.lock().root_page_pv_formatted_refer.clone()
    }

    /// Owns a sentinel, i.e. acts as an interaction/referrer root.
    pub fn is_root_scope(&self) -> bool {
        self.lock().actseq_sentinel.is_some()
    }

    /// Read every reporting field under one lock.
    pub fn snapshot(&self) -> NodeSnapshot {
        let s = self.lock();
        NodeSnapshot {
            oid: self.oid.clone(),
            is_page: self.is_page,
            identifier: s.identifier.clone(),
            position: s.position,
            visible: s.visible,
            visible_rect: s.visible_rect,
            view_visible_rect_on_screen: s.view_visible_rect_on_screen,
            impress_max_ratio: s.impress_max_ratio,
            blocked_by_sub_page: s.blocked_by_sub_page,
            page_node_mark_as_root_page: s.page_node_mark_as_root_page,
            has_sub_page_node_mark_as_root_page: s.has_sub_page_node_mark_as_root_page,
            ignore_refer: s.ignore_refer,
            ignore_refer_cascade: s.ignore_refer_cascade,
            psrefer_mute: s.psrefer_mute,
            has_bind_data: s.has_bind_data,
            static_params: s.static_params.clone(),
            dynamic_params: s.dynamic_params.clone(),
            detached: s.detached,
        }
    }

    // --- relations ---------------------------------------------------------

    pub fn parent_node(&self) -> Option<Arc<VTreeNode>> {
        self.lock().parent.upgrade()
    }

    /// Children in push order.
    pub fn sub_nodes(&self) -> Vec<Arc<VTreeNode>> {
        self.lock().sub_nodes.clone()
    }

    /// The associated tree, if it is still alive.
    pub fn tree(&self) -> Option<Arc<VTree>> {
        self.lock().tree.upgrade()
    }

    /// Visit this node and every descendant, pre-order.
    pub fn walk<F: FnMut(&Arc<VTreeNode>)>(self: &Arc<Self>, mut f: F) {
        fn visit<F: FnMut(&Arc<VTreeNode>)>(node: &Arc<VTreeNode>, f: &mut F) {
            f(node);
            for child in node.sub_nodes() {
                visit(&child, f);
            }
        }
        visit(self, &mut f);
    }

    /// Whether `other` is this node or one of its ancestors.
    fn is_self_or_ancestor(&self, other: &VTreeNode) -> bool {
        if self.is_same(other) {
            return true;
        }
        let mut current = self.parent_node();
        while let Some(node) = current {
            if node.is_same(other) {
                return true;
            }
            current = node.parent_node();
        }
        false
    }

    // --- configuration ------------------------------------------------------

    /// Bind to `tree`. Repeated association to the same tree is a no-op;
    /// a new tree marks the dynamic layer dirty since its provider may differ.
    ///
    /// Returns whether the back-reference changed.
    pub fn associate(&self, tree: &Arc<VTree>) -> bool {
        self.with_live("associate", |s| {
            if s.tree.upgrade().is_some_and(|current| Arc::ptr_eq(&current, tree)) {
                return false;
            }
            s.tree = Arc::downgrade(tree);
            s.invalidate_dynamic_params();
            true
        })
        .unwrap_or(false)
    }

    /// Exclude this node from referrer path composition.
    pub fn mark_ignore_refer(&self) {
        self.with_live("mark_ignore_refer", |s| s.ignore_refer = true);
    }

    pub fn set_ignore_refer_cascade(&self, ignore: bool) {
        self.with_live("set_ignore_refer_cascade", |s| s.ignore_refer_cascade = ignore);
    }

    pub fn set_psrefer_mute(&self, mute: bool) {
        self.with_live("set_psrefer_mute", |s| s.psrefer_mute = mute);
    }

    pub fn set_has_bind_data(&self, has_bind_data: bool) {
        self.with_live("set_has_bind_data", |s| s.has_bind_data = has_bind_data);
    }

    pub fn set_could_auto_mount_other_nodes(&self, could: bool) {
        self.with_live("set_could_auto_mount_other_nodes", |s| {
            s.could_auto_mount_other_nodes = could;
        });
    }

    /// Restrict which oids may be pushed under this node. `None` lifts the
    /// restriction.
    pub fn set_valid_for_containing_sub_node_oids(&self, oids: Option<Vec<String>>) {
        self.with_live("set_valid_for_containing_sub_node_oids", |s| {
            s.valid_for_containing_sub_node_oids = oids;
        });
    }

    /// Install this node's own dynamic params provider. Marks the layer dirty.
    pub fn set_dynamic_params_provider(&self, provider: Arc<dyn DynamicParamsProvider>) {
        self.with_live("set_dynamic_params_provider", |s| {
            s.dynamic_provider = Some(provider);
            s.invalidate_dynamic_params();
        });
    }

    // --- root marking -------------------------------------------------------

    /// Promote to root page: this node becomes the interaction and referrer
    /// scope of its subtree.
    pub fn mark_as_root(&self) {
        let changed = self.with_live("mark_as_root", |s| {
            let changed = !s.page_node_mark_as_root_page;
            s.page_node_mark_as_root_page = true;
            if s.actseq_sentinel.is_none() {
                s.actseq_sentinel = Some(Arc::new(Sentinel::new()));
            }
            changed
        });
        if changed == Some(true) {
            debug!(oid = %self.oid, "marked as root page");
            self.update_parent_nodes_has_subpage_node_mark_as_root_page_if_needed();
        }
    }

    /// Withdraw root-page status.
    pub fn unmark_as_root(&self) {
        let changed = self.with_live("unmark_as_root", |s| {
            let changed = s.page_node_mark_as_root_page;
            s.page_node_mark_as_root_page = false;
            s.release_root_scope_if_unused();
            changed
        });
        if changed == Some(true) {
            debug!(oid = %self.oid, "root page mark removed");
            self.update_parent_nodes_has_subpage_node_mark_as_root_page_if_needed();
        }
    }

    /// Designate as a tree root: gains root-scoped state without a page mark.
    pub(crate) fn mark_as_tree_root(&self) {
        self.with_live("mark_as_tree_root", |s| {
            s.is_tree_root = true;
            if s.actseq_sentinel.is_none() {
                s.actseq_sentinel = Some(Arc::new(Sentinel::new()));
            }
        });
    }

    pub(crate) fn clear_tree_root(&self) {
        let mut s = self.lock();
        s.is_tree_root = false;
        s.release_root_scope_if_unused();
    }

    /// Walk ancestors recomputing `has_sub_page_node_mark_as_root_page`.
    ///
    /// Each level also refreshes the `blocked_by_sub_page` flags of its
    /// children. Stops at the first ancestor whose flag did not change.
    pub fn update_parent_nodes_has_subpage_node_mark_as_root_page_if_needed(&self) {
        let mut current = self.parent_node();
        while let Some(node) = current {
            node.refresh_sub_node_occlusion();
            if !node.recompute_has_sub_page_mark() {
                break;
            }
            current = node.parent_node();
        }
    }

    /// Returns whether the flag changed.
    fn recompute_has_sub_page_mark(&self) -> bool {
        let any = self
            .sub_nodes()
            .iter()
            .any(|child| child.lock().contributes_root_page_mark());
        let mut s = self.lock();
        let changed = s.has_sub_page_node_mark_as_root_page != any;
        s.has_sub_page_node_mark_as_root_page = any;
        changed
    }

    /// A child is blocked iff a later sibling is or contains a root page.
    fn refresh_sub_node_occlusion(&self) {
        let mut covered = false;
        for child in self.sub_nodes().iter().rev() {
            let mut s = child.lock();
            s.blocked_by_sub_page = covered;
            covered |= s.contributes_root_page_mark();
        }
    }

    /// Blocked itself or through any ancestor.
    pub fn is_occluded(&self) -> bool {
        if self.is_blocked_by_sub_page() {
            return true;
        }
        let mut current = self.parent_node();
        while let Some(node) = current {
            if node.is_blocked_by_sub_page() {
                return true;
            }
            current = node.parent_node();
        }
        false
    }

    // --- parameters ---------------------------------------------------------

    /// Merge into the static layer, overwriting on key collision.
    ///
    /// The dynamic layer is left alone.
    pub fn update_static_params(&self, params: Params) {
        self.with_live("update_static_params", |s| s.static_params.extend(params));
    }

    /// Update the sibling ordinal. Takes effect immediately for path and
    /// referrer composition; the diff identifier is unaffected.
    pub fn update_position(&self, position: u32) -> bool {
        self.with_live("update_position", |s| {
            let changed = s.position != position;
            s.position = position;
            changed
        })
        .unwrap_or(false)
    }

    /// Change the disambiguating identifier. Invalidates the diff identifier
    /// of this node and its subtree.
    pub fn update_identifier(self: &Arc<Self>, identifier: impl Into<String>) -> bool {
        let identifier = identifier.into();
        let changed = self
            .with_live("update_identifier", |s| {
                let changed = s.identifier != identifier;
                s.identifier = identifier;
                changed
            })
            .unwrap_or(false);
        if changed {
            self.mark_subtree_diff_dirty();
        }
        changed
    }

    pub fn mark_dynamic_params_dirty(&self) {
        self.with_live("mark_dynamic_params_dirty", NodeState::invalidate_dynamic_params);
    }

    /// Recompute the dynamic layer if it is dirty. Returns whether it ran.
    pub fn refresh_dynamic_params_if_needed(&self) -> bool {
        self.refresh_dynamic_params(false)
    }

    /// Recompute the dynamic layer if it is dirty or the tree's refresh
    /// policy forces it for `event`.
    pub fn refresh_dynamic_params_if_needed_for_event(&self, event: &str) -> bool {
        let forced = self
            .tree()
            .is_some_and(|tree| tree.config().refresh_policy.mode_for(event) == RefreshMode::Force);
        self.refresh_dynamic_params(forced)
    }

    fn refresh_dynamic_params(&self, forced: bool) -> bool {
        let Some(dirty) = self.with_live("refresh_dynamic_params", |s| s.dynamic_params_dirty) else {
            return false;
        };
        if !dirty && !forced {
            return false;
        }
        self.do_update_dynamic_params();
        true
    }

    /// Unconditionally recompute the dynamic layer.
    ///
    /// Uses the node's own provider, falling back to the tree's. With no
    /// provider the layer is empty. The provider runs without the node lock;
    /// an invalidation that lands meanwhile keeps the layer dirty.
    pub fn do_update_dynamic_params(&self) {
        let (own, generation) = {
            let s = self.lock();
            (s.dynamic_provider.clone(), s.dynamic_params_generation)
        };
        let provider = own.or_else(|| self.tree().and_then(|tree| tree.config().dynamic_params.clone()));
        let computed = provider
            .map(|provider| provider.dynamic_params(self))
            .unwrap_or_default();
        let keys = computed.len();
        let settled = self.with_live("do_update_dynamic_params", |s| {
            s.dynamic_params = computed;
            let settled = s.dynamic_params_generation == generation;
            if settled {
                s.dynamic_params_dirty = false;
            }
            settled
        });
        trace!(oid = %self.oid, keys, ?settled, "dynamic params refreshed");
    }

    /// Merged attributes for `event`: static < dynamic < `callback`.
    pub fn params_for_event(&self, event: &str, callback: Option<&Params>) -> Params {
        self.refresh_dynamic_params_if_needed_for_event(event);
        let s = self.lock();
        ParamsResolver::new()
            .with_static(&s.static_params)
            .with_dynamic(&s.dynamic_params)
            .with_callback(callback)
            .resolve()
    }

    /// Like [`params_for_event`](Self::params_for_event), with the callback
    /// layer filled in by `add`. The closure runs once, before any lock is
    /// taken, and is not retained.
    pub fn params_for_event_with<F>(&self, event: &str, add: F) -> Params
    where
        F: FnOnce(&mut Params),
    {
        let mut callback = Params::new();
        add(&mut callback);
        self.params_for_event(event, Some(&callback))
    }

    // --- structure ----------------------------------------------------------

    /// Why `child` may not be pushed under this node, if it may not.
    pub(crate) fn check_push(&self, child: &VTreeNode) -> Result<()> {
        if self.is_detached() {
            return Err(VTreeError::Detached(self.oid.clone()));
        }
        if child.is_detached() {
            return Err(VTreeError::Detached(child.oid.clone()));
        }
        if self.is_same(child) {
            return Err(VTreeError::SelfParent(self.oid.clone()));
        }
        if self.is_self_or_ancestor(child) {
            return Err(VTreeError::Cycle {
                parent: self.oid.clone(),
                child: child.oid.clone(),
            });
        }
        let allowed = self
            .valid_for_containing_sub_node_oids()
            .is_none_or(|valid| valid.iter().any(|oid| *oid == child.oid));
        if !allowed {
            return Err(VTreeError::NotAllowed {
                parent: self.oid.clone(),
                child: child.oid.clone(),
            });
        }
        Ok(())
    }

    /// Append `child`, moving it out of its previous parent first.
    ///
    /// Refused silently (returns `false`) when either node is detached, when
    /// the edit would create a cycle, when the whitelist rejects the child, or
    /// when the child is already under this node.
    pub fn push_sub_node(self: &Arc<Self>, child: &Arc<VTreeNode>) -> bool {
        if let Err(err) = self.check_push(child) {
            debug!(parent = %self.oid, child = %child.oid, %err, "push_sub_node refused");
            return false;
        }
        let old_parent = child.parent_node();
        if old_parent.as_ref().is_some_and(|p| Arc::ptr_eq(p, self)) {
            return false;
        }
        if let Some(old_parent) = old_parent {
            old_parent.unlink_sub_node(child);
        }
        // A mounted root moved under a node stops being a root of its tree.
        if child.is_tree_root() {
            if let Some(tree) = child.tree() {
                tree.forget_root(child);
            }
        }

        {
            let mut s = child.lock();
            s.parent = Arc::downgrade(self);
            s.blocked_by_sub_page = false;
            s.is_tree_root = false;
            s.release_root_scope_if_unused();
        }
        child.mark_subtree_diff_dirty();
        self.lock().sub_nodes.push(Arc::clone(child));

        child.update_parent_nodes_has_subpage_node_mark_as_root_page_if_needed();
        true
    }

    /// Move under `parent`, or out of the current parent when `None`.
    ///
    /// Unlike [`remove_sub_node`](Self::remove_sub_node), leaving a parent this
    /// way does not detach the node.
    pub fn setup_parent_node(self: &Arc<Self>, parent: Option<&Arc<VTreeNode>>) -> bool {
        match parent {
            Some(parent) => parent.push_sub_node(self),
            None => {
                if self.is_detached() {
                    return false;
                }
                match self.parent_node() {
                    Some(old_parent) => {
                        old_parent.unlink_sub_node(self);
                        self.mark_subtree_diff_dirty();
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Remove `child` and detach its whole subtree. Removing a node that is
    /// not a child is a no-op.
    pub fn remove_sub_node(&self, child: &Arc<VTreeNode>) -> bool {
        if self.is_detached() || !self.unlink_sub_node(child) {
            return false;
        }
        child.mark_subtree_detached();
        debug!(parent = %self.oid, child = %child.oid, "sub node detached");
        true
    }

    /// Take `child` out of the list and recompute flags from here upward.
    fn unlink_sub_node(&self, child: &VTreeNode) -> bool {
        let removed = {
            let mut s = self.lock();
            match s.sub_nodes.iter().position(|c| c.is_same(child)) {
                Some(index) => {
                    s.sub_nodes.remove(index);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return false;
        }
        {
            let mut s = child.lock();
            s.parent = Weak::new();
            s.blocked_by_sub_page = false;
        }
        self.refresh_sub_node_occlusion();
        if self.recompute_has_sub_page_mark() {
            self.update_parent_nodes_has_subpage_node_mark_as_root_page_if_needed();
        }
        true
    }

    pub(crate) fn mark_subtree_detached(self: &Arc<Self>) {
        self.walk(|node| {
            let mut s = node.lock();
            s.detached = true;
            s.tree = Weak::new();
        });
    }

    fn mark_subtree_diff_dirty(self: &Arc<Self>) {
        self.walk(|node| node.lock().invalidate_diff_identifier());
    }

    // --- diff identity ------------------------------------------------------

    /// Key used to match this node across rebuilds of the same subtree.
    ///
    /// Built from the parent's diff identifier, the page flag, the oid and
    /// the identifier. Recomputed lazily, at most once per invalidation.
    pub fn diff_identifier(&self) -> String {
        loop {
            let generation = {
                let s = self.lock();
                if !s.diff_identifier_should_update {
                    return s.diff_identifier.clone();
                }
                s.diff_generation
            };
            let parent = self.parent_node().map(|parent| parent.diff_identifier());
            if let Some(id) = self.commit_diff_identifier(generation, parent.as_deref()) {
                return id;
            }
        }
    }

    /// Store the identifier composed under `parent`, unless the node was
    /// invalidated after `generation` was read.
    fn commit_diff_identifier(&self, generation: u64, parent: Option<&str>) -> Option<String> {
        let mut s = self.lock();
        if !s.diff_identifier_should_update {
            return Some(s.diff_identifier.clone());
        }
        if s.diff_generation != generation {
            return None;
        }
        s.diff_identifier = compose_diff_identifier(parent, self.is_page, &self.oid, &s.identifier);
        s.diff_identifier_should_update = false;
        Some(s.diff_identifier.clone())
    }

    pub fn diff_identifier_should_update(&self) -> bool {
        self.lock().diff_identifier_should_update
    }

    // --- root lookup --------------------------------------------------------

    /// Highest node reachable upward (self included) without crossing a
    /// root-page boundary.
    ///
    /// The walk stops at the first node marked as root page, or at the
    /// absolute top. With `only_page_node`, returns the highest page node
    /// visited instead (or `None` if there was none).
    pub fn find_toppest_node(self: &Arc<Self>, only_page_node: bool) -> Option<Arc<VTreeNode>> {
        let mut current = Arc::clone(self);
        let mut top_page = self.is_page.then(|| Arc::clone(self));
        while !current.page_node_mark_as_root_page() {
            let Some(parent) = current.parent_node() else {
                break;
            };
            if parent.is_page {
                top_page = Some(Arc::clone(&parent));
            }
            current = parent;
        }
        if only_page_node { top_page } else { Some(current) }
    }

    /// Nearest root-page ancestor (self included), else the absolute root.
    pub fn effective_root(self: &Arc<Self>) -> Arc<VTreeNode> {
        let mut current = Arc::clone(self);
        while !current.page_node_mark_as_root_page() {
            match current.parent_node() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Whether any node from here up to the effective root satisfies `f`.
    fn chain_any(self: &Arc<Self>, f: impl Fn(&NodeState) -> bool) -> bool {
        let mut current = Some(Arc::clone(self));
        while let Some(node) = current {
            let (hit, boundary) = {
                let s = node.lock();
                (f(&s), s.page_node_mark_as_root_page)
            };
            if hit {
                return true;
            }
            if boundary {
                break;
            }
            current = node.parent_node();
        }
        false
    }

    /// Page-section referrer muted on this node or an ancestor within its
    /// root scope.
    pub fn is_psrefer_muted(self: &Arc<Self>) -> bool {
        self.chain_any(|s| s.psrefer_mute)
    }

    /// Referrer cascade ignored on this node or an ancestor within its root
    /// scope.
    pub fn is_refer_cascade_ignored(self: &Arc<Self>) -> bool {
        self.chain_any(|s| s.ignore_refer_cascade)
    }

    // --- referrer -----------------------------------------------------------

    /// Element path from this node to its effective root, leaf first,
    /// skipping nodes marked with [`mark_ignore_refer`](Self::mark_ignore_refer).
    pub fn spm_segments(self: &Arc<Self>) -> Vec<SpmSegment> {
        let mut segments = Vec::new();
        let mut current = Some(Arc::clone(self));
        while let Some(node) = current {
            let (ignore, position, boundary) = {
                let s = node.lock();
                (s.ignore_refer, s.position, s.page_node_mark_as_root_page)
            };
            if !ignore {
                segments.push(SpmSegment::new(node.oid.clone(), position));
            }
            if boundary {
                break;
            }
            current = node.parent_node();
        }
        segments
    }

    pub fn spm(self: &Arc<Self>) -> String {
        spm_string(&self.spm_segments())
    }

    /// The pv referrer of the effective root.
    pub fn effective_pv_refer(self: &Arc<Self>) -> Option<Arc<dyn FormattedRefer>> {
        self.effective_root().root_page_pv_formatted_refer()
    }

    fn refer_formatter(&self) -> Arc<dyn ReferFormatter> {
        self.tree()
            .map(|tree| Arc::clone(&tree.config().refer_formatter))
            .unwrap_or_else(|| Arc::new(SpmReferFormatter))
    }

    /// Referrer an interaction on this node hands to whatever it opens,
    /// formatted with the tree's [`ReferFormatter`] at sequence `actseq`.
    ///
    /// `None` when the cascade is ignored on this node or within its root
    /// scope.
    pub fn interaction_refer(self: &Arc<Self>, actseq: u64) -> Option<Arc<dyn FormattedRefer>> {
        if self.is_detached() || self.is_refer_cascade_ignored() {
            return None;
        }
        let spm = self.spm_segments();
        let psrefer_mute = self.is_psrefer_muted();
        Some(self.refer_formatter().format(&ReferContext {
            oid: &self.oid,
            is_page: self.is_page,
            spm: &spm,
            actseq,
            psrefer_mute,
        }))
    }

    /// Snapshot the pv referrer of a root, unless an external one was seeded.
    fn snapshot_root_refer(self: &Arc<Self>) {
        if self
            .root_page_pv_formatted_refer()
            .is_some_and(|refer| refer.is_external())
        {
            return;
        }
        let spm = self.spm_segments();
        let outer_actseq = self
            .parent_node()
            .and_then(|parent| parent.current_actseq())
            .unwrap_or(0);
        let psrefer_mute = self.is_psrefer_muted();
        let refer = self.refer_formatter().format(&ReferContext {
            oid: &self.oid,
            is_page: self.is_page,
            spm: &spm,
            actseq: outer_actseq,
            psrefer_mute,
        });
        self.with_live("snapshot_root_refer", |s| {
            if s.actseq_sentinel.is_some() {
                s.root_page_pv_formatted_refer = Some(refer);
            }
        });
    }

    /// Seed the pv referrer from an external link.
    ///
    /// A page node that is not yet a root is marked as one first; other
    /// nodes seed their effective root. Returns `false` when no root-scoped
    /// node is reachable.
    pub fn page_node_mark_from_refer(
        self: &Arc<Self>,
        pgrefer: impl Into<String>,
        psrefer: impl Into<String>,
    ) -> bool {
        if self.is_detached() {
            return false;
        }
        if self.is_page && !self.is_root_scope() {
            self.mark_as_root();
        }
        let root = self.effective_root();
        let refer: Arc<dyn FormattedRefer> = Arc::new(ExternalRefer::new(pgrefer, psrefer));
        root.with_live("page_node_mark_from_refer", |s| {
            if s.actseq_sentinel.is_none() {
                return false;
            }
            s.root_page_pv_formatted_refer = Some(refer);
            true
        })
        .unwrap_or(false)
    }

    // --- interaction sequence ----------------------------------------------

    /// Next interaction sequence number from the effective root's sentinel.
    ///
    /// `None` when the node is detached or no root-scoped node is reachable.
    pub fn do_increase_actseq(self: &Arc<Self>) -> Option<u64> {
        if self.is_detached() {
            return None;
        }
        let root = self.effective_root();
        let sentinel = root.actseq_sentinel()?;
        let actseq = sentinel.next();
        trace!(oid = %self.oid, root = %root.oid, actseq, "actseq increased");
        Some(actseq)
    }

    /// Current sequence of the effective root without incrementing.
    pub fn current_actseq(self: &Arc<Self>) -> Option<u64> {
        self.effective_root()
            .actseq_sentinel()
            .map(|sentinel| sentinel.current())
    }

    // --- exposure -----------------------------------------------------------

    /// Hidden → Visible transition, called right before an impression.
    ///
    /// Stamps `begin_time`, restarts `impress_max_ratio` and, when this node
    /// owns a sentinel, resets it and snapshots the pv referrer. Redundant
    /// calls while already visible do nothing and return `false`.
    pub fn node_will_impress(self: &Arc<Self>, now: Instant) -> bool {
        let sentinel = {
            let mut s = self.lock();
            if s.detached || s.visible {
                return false;
            }
            s.visible = true;
            s.begin_time = Some(now);
            s.impress_max_ratio = 0.0;
            s.actseq_sentinel.clone()
        };
        if let Some(sentinel) = sentinel {
            sentinel.reset();
            trace!(oid = %self.oid, "actseq reset on impress");
            self.snapshot_root_refer();
        }
        true
    }

    /// Visible → Hidden transition. Returns the finished span, or `None` if
    /// the node was not visible.
    pub fn node_did_hide(&self, now: Instant) -> Option<ExposureSpan> {
        self.with_live("node_did_hide", |s| {
            if !s.visible {
                return None;
            }
            s.visible = false;
            let begin = s.begin_time.take().unwrap_or(now);
            Some(ExposureSpan {
                begin,
                duration: now.saturating_duration_since(begin),
                max_ratio: s.impress_max_ratio,
            })
        })
        .flatten()
    }

    /// Feed a new on-screen measurement.
    ///
    /// `frame` is the element's full frame in screen space; `visible` is the
    /// region of the screen through which it can be seen. The node counts as
    /// visible when the covered fraction is positive, reaches the tree's
    /// threshold and the node is not occluded by a sub page.
    pub fn update_visibility(self: &Arc<Self>, frame: Rect, visible: Rect, now: Instant) -> VisibilityChange {
        let threshold = self
            .tree()
            .map(|tree| tree.config().visible_ratio_threshold)
            .unwrap_or(0.0);
        let ratio = frame.visible_ratio(&visible);
        let now_visible = ratio > 0.0 && ratio >= threshold && !self.is_occluded();

        let Some(was_visible) = self.with_live("update_visibility", |s| {
            s.view_visible_rect_on_screen = frame;
            s.visible_rect = frame.intersection(&visible);
            s.visible
        }) else {
            return VisibilityChange::Unchanged;
        };

        match (was_visible, now_visible) {
            (false, true) => {
                if self.node_will_impress(now) {
                    self.raise_max_ratio(ratio);
                    VisibilityChange::Impressed
                } else {
                    VisibilityChange::Unchanged
                }
            }
            (true, false) => self
                .node_did_hide(now)
                .map_or(VisibilityChange::Unchanged, VisibilityChange::Hidden),
            (true, true) => {
                self.raise_max_ratio(ratio);
                VisibilityChange::Unchanged
            }
            (false, false) => VisibilityChange::Unchanged,
        }
    }

    fn raise_max_ratio(&self, ratio: f32) {
        let mut s = self.lock();
        s.impress_max_ratio = s.impress_max_ratio.max(ratio);
    }

    // --- rebuild continuity -------------------------------------------------

    /// Carry runtime state over to `other`, which replaces this node after a
    /// rebuild with the same diff identity.
    ///
    /// Copies exposure state, bound-data flag, diff identifier, and the
    /// dynamic layer with its dirty flag. When both nodes own a sentinel,
    /// `other` adopts this node's sentinel and pv referrer so the interaction
    /// sequence continues.
    pub fn sync_to_node(&self, other: &VTreeNode) -> bool {
        if self.is_same(other) {
            return false;
        }
        let (
            visible,
            visible_rect,
            view_rect,
            max_ratio,
            begin_time,
            has_bind_data,
            diff_identifier,
            diff_dirty,
            dynamic_params,
            dynamic_dirty,
            sentinel,
            refer,
        ) = {
            let s = self.lock();
            (
                s.visible,
                s.visible_rect,
                s.view_visible_rect_on_screen,
                s.impress_max_ratio,
                s.begin_time,
                s.has_bind_data,
                s.diff_identifier.clone(),
                s.diff_identifier_should_update,
                s.dynamic_params.clone(),
                s.dynamic_params_dirty,
                s.actseq_sentinel.clone(),
                s.root_page_pv_formatted_refer.clone(),
            )
        };
        other
            .with_live("sync_to_node", |s| {
                s.visible = visible;
                s.visible_rect = visible_rect;
                s.view_visible_rect_on_screen = view_rect;
                s.impress_max_ratio = max_ratio;
                s.begin_time = begin_time;
                s.has_bind_data = has_bind_data;
                s.diff_identifier = diff_identifier;
                s.diff_identifier_should_update = diff_dirty;
                s.diff_generation = s.diff_generation.wrapping_add(1);
                s.dynamic_params = dynamic_params;
                s.dynamic_params_dirty = dynamic_dirty;
                s.dynamic_params_generation = s.dynamic_params_generation.wrapping_add(1);
                if s.actseq_sentinel.is_some() && sentinel.is_some() {
                    s.actseq_sentinel = sentinel;
                    s.root_page_pv_formatted_refer = refer;
                }
            })
            .is_some()
    }
}

impl fmt::Debug for VTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.lock();
        f.debug_struct("VTreeNode")
            .field("oid", &self.oid)
            .field("is_page", &self.is_page)
            .field("position", &s.position)
            .field("visible", &s.visible)
            .field("sub_nodes", &s.sub_nodes.len())
            .field("detached", &s.detached)
            .finish()
    }
}
