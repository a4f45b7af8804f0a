#![forbid(unsafe_code)]

//! The tracking tree: configuration plus the set of mounted roots.
//!
//! A [`VTree`] owns its roots; everything below a root is owned by its parent
//! node. Besides the primary root (the main window content) a tree may carry
//! overlay roots such as alerts and dialogs, ordered by [`MountPriority`] and
//! mount order. Lookups walk the roots in that order, so an overlay shadows
//! the content underneath it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::config::VTreeConfig;
use crate::error::{Result, VTreeError};
use crate::geometry::Rect;
use crate::node::VTreeNode;

/// Stacking order of a mounted root. Higher priorities are consulted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MountPriority {
    Low,
    #[default]
    Normal,
    High,
    /// Alerts and system dialogs.
    Highest,
}

#[derive(Debug)]
struct MountedRoot {
    node: Arc<VTreeNode>,
    priority: MountPriority,
    seq: u64,
    primary: bool,
}

/// A tracking tree.
#[derive(Debug)]
pub struct VTree {
    config: VTreeConfig,
    roots: RwLock<Vec<MountedRoot>>,
    mount_seq: AtomicU64,
}

impl VTree {
    /// Create an empty tree.
    pub fn new(config: VTreeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            roots: RwLock::new(Vec::new()),
            mount_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &VTreeConfig {
        &self.config
    }

    fn read_roots(&self) -> RwLockReadGuard<'_, Vec<MountedRoot>> {
        self.roots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_roots(&self) -> RwLockWriteGuard<'_, Vec<MountedRoot>> {
        self.roots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.mount_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn is_mounted(&self, node: &VTreeNode) -> bool {
        self.read_roots().iter().any(|root| root.node.is_same(node))
    }

    /// Associate `node` and its whole subtree with this tree.
    fn associate_subtree(self: &Arc<Self>, node: &Arc<VTreeNode>) {
        node.walk(|n| {
            n.associate(self);
        });
    }

    /// Remove `node` from the root list. Returns the entry if it was mounted.
    fn take_root(&self, node: &VTreeNode) -> Option<MountedRoot> {
        let mut roots = self.write_roots();
        let index = roots.iter().position(|root| root.node.is_same(node))?;
        Some(roots.remove(index))
    }

    /// Drop the root entry of `node` without detaching it.
    pub(crate) fn forget_root(&self, node: &VTreeNode) -> bool {
        let forgotten = self.take_root(node).is_some();
        if forgotten {
            debug!(oid = %node.oid(), "root entry dropped on reparent");
        }
        forgotten
    }

    // --- primary root -------------------------------------------------------

    /// Install `node` as the primary root, replacing any previous one.
    ///
    /// The node must be live and parentless. It receives its own interaction
    /// sentinel even if it is not a page.
    pub fn set_root_node(self: &Arc<Self>, node: &Arc<VTreeNode>) -> bool {
        if node.is_detached() || node.parent_node().is_some() {
            debug!(oid = %node.oid(), "set_root_node refused");
            return false;
        }
        if let Some(current) = self.root_node() {
            if current.is_same(node) {
                return false;
            }
            self.take_root(&current);
            current.clear_tree_root();
        }
        // An overlay promoted to primary keeps its node but loses its slot.
        self.take_root(node);

        self.associate_subtree(node);
        node.mark_as_tree_root();
        let seq = self.next_seq();
        self.write_roots().push(MountedRoot {
            node: Arc::clone(node),
            priority: MountPriority::Normal,
            seq,
            primary: true,
        });
        debug!(oid = %node.oid(), "primary root set");
        true
    }

    /// The primary root.
    pub fn root_node(&self) -> Option<Arc<VTreeNode>> {
        self.read_roots()
            .iter()
            .find(|root| root.primary)
            .map(|root| Arc::clone(&root.node))
    }

    // --- overlays -----------------------------------------------------------

    /// Mount `node` as an additional root. Refusals are logged and reported
    /// as `false`.
    pub fn mount_overlay(self: &Arc<Self>, node: &Arc<VTreeNode>, priority: MountPriority) -> bool {
        match self.try_mount_overlay(node, priority) {
            Ok(()) => true,
            Err(err) => {
                debug!(oid = %node.oid(), %err, "mount_overlay refused");
                false
            }
        }
    }

    /// Mount `node` as an additional root.
    ///
    /// A node that still has a parent is moved out of it first. The
    /// configured [`OverlayDefaults`](crate::config::OverlayDefaults) are
    /// applied to the overlay root.
    pub fn try_mount_overlay(self: &Arc<Self>, node: &Arc<VTreeNode>, priority: MountPriority) -> Result<()> {
        if node.is_detached() {
            return Err(VTreeError::Detached(node.oid().to_string()));
        }
        if self.is_mounted(node) {
            return Err(VTreeError::AlreadyMounted(node.oid().to_string()));
        }
        if node.parent_node().is_some() {
            node.setup_parent_node(None);
        }

        self.associate_subtree(node);
        node.mark_as_tree_root();
        let defaults = self.config.overlay_defaults;
        node.set_ignore_refer_cascade(defaults.ignore_refer_cascade);
        node.set_psrefer_mute(defaults.psrefer_mute);

        let seq = self.next_seq();
        self.write_roots().push(MountedRoot {
            node: Arc::clone(node),
            priority,
            seq,
            primary: false,
        });
        debug!(oid = %node.oid(), ?priority, "overlay mounted");
        Ok(())
    }

    /// Unmount an overlay root and detach its subtree.
    ///
    /// The primary root cannot be unmounted this way.
    pub fn unmount_overlay(&self, node: &Arc<VTreeNode>) -> bool {
        let removed = {
            let mut roots = self.write_roots();
            match roots.iter().position(|root| !root.primary && root.node.is_same(node)) {
                Some(index) => {
                    roots.remove(index);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return false;
        }
        node.clear_tree_root();
        node.mark_subtree_detached();
        debug!(oid = %node.oid(), "overlay unmounted");
        true
    }

    /// Live roots, most prominent first: priority descending, then most
    /// recently mounted first.
    pub fn roots(&self) -> Vec<Arc<VTreeNode>> {
        let mut mounted: Vec<(MountPriority, u64, Arc<VTreeNode>)> = self
            .read_roots()
            .iter()
            .map(|root| (root.priority, root.seq, Arc::clone(&root.node)))
            .collect();
        mounted.retain(|(_, _, node)| !node.is_detached() && node.parent_node().is_none());
        mounted.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        mounted.into_iter().map(|(_, _, node)| node).collect()
    }

    /// The most prominent root covering `region`.
    ///
    /// Roots that were never laid out (empty on-screen rect) are treated as
    /// covering everything.
    pub fn current_root_for(&self, region: &Rect) -> Option<Arc<VTreeNode>> {
        self.roots().into_iter().find(|root| {
            let frame = root.view_visible_rect_on_screen();
            frame.is_empty() || frame.intersects(region)
        })
    }

    // --- lookup -------------------------------------------------------------

    /// Visit every node of every live root, in [`roots`](Self::roots) order.
    pub fn walk<F: FnMut(&Arc<VTreeNode>)>(&self, mut f: F) {
        for root in self.roots() {
            root.walk(&mut f);
        }
    }

    /// Number of live nodes reachable from the roots.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_| count += 1);
        count
    }

    /// First node with `oid`, searching the most prominent root first.
    pub fn find(&self, oid: &str) -> Option<Arc<VTreeNode>> {
        let mut found = None;
        self.walk(|node| {
            if found.is_none() && node.oid() == oid {
                found = Some(Arc::clone(node));
            }
        });
        found
    }

    /// Every node with `oid`.
    pub fn find_all(&self, oid: &str) -> Vec<Arc<VTreeNode>> {
        let mut found = Vec::new();
        self.walk(|node| {
            if node.oid() == oid {
                found.push(Arc::clone(node));
            }
        });
        found
    }

    /// The node whose diff identifier equals `diff_identifier`.
    pub fn find_by_diff_identifier(&self, diff_identifier: &str) -> Option<Arc<VTreeNode>> {
        let mut found = None;
        self.walk(|node| {
            if found.is_none() && node.diff_identifier() == diff_identifier {
                found = Some(Arc::clone(node));
            }
        });
        found
    }

    // --- wiring -------------------------------------------------------------

    /// Attach `child` under `parent`, associating the child's subtree with
    /// this tree. Refusals are logged and reported as `false`.
    pub fn attach(self: &Arc<Self>, parent: &Arc<VTreeNode>, child: &Arc<VTreeNode>) -> bool {
        match self.try_attach(parent, child) {
            Ok(()) => true,
            Err(err) => {
                debug!(parent = %parent.oid(), child = %child.oid(), %err, "attach refused");
                false
            }
        }
    }

    /// Attach `child` under `parent`, reporting why the edit was refused.
    ///
    /// `parent` must already belong to this tree. A child that was mounted as
    /// a root of this tree is unmounted (not detached) first.
    pub fn try_attach(self: &Arc<Self>, parent: &Arc<VTreeNode>, child: &Arc<VTreeNode>) -> Result<()> {
        parent.check_push(child)?;
        let same_tree = parent.tree().is_some_and(|tree| Arc::ptr_eq(&tree, self));
        if !same_tree {
            return Err(VTreeError::ForeignTree(parent.oid().to_string()));
        }
        if self.take_root(child).is_some() {
            child.clear_tree_root();
        }
        parent.push_sub_node(child);
        self.associate_subtree(child);
        Ok(())
    }

    /// Remove `node` from wherever it is mounted and detach its subtree.
    pub fn detach(&self, node: &Arc<VTreeNode>) -> bool {
        if let Some(root) = self.take_root(node) {
            node.clear_tree_root();
            node.mark_subtree_detached();
            debug!(oid = %node.oid(), primary = root.primary, "root detached");
            return true;
        }
        match node.parent_node() {
            Some(parent) => parent.remove_sub_node(node),
            None => false,
        }
    }
}
