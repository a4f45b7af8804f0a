#![forbid(unsafe_code)]

//! Event payload composition.
//!
//! Turns node state into a [`TrackedEvent`] ready for serialization and
//! upload. Composition honours the node's [`LogDisableStrategy`] and never
//! produces events for detached nodes.
//!
//! [`LogDisableStrategy`]: vtrace_core::LogDisableStrategy

use std::sync::Arc;
use std::time::Duration;

use vtrace_core::event::{IMPRESS, IMPRESS_END, PAGE_VIEW, PAGE_VIEW_END};
use vtrace_core::params::Params;
use vtrace_core::refer::FormattedRefer;
use vtrace_core::{ExposureSpan, VTreeNode};

use crate::attach::EventActionConfig;

/// One event as delivered to the upload pipeline.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackedEvent {
    /// Event name (`_ev`, `_ec`, custom, ...).
    pub event: String,
    /// Oid of the reporting node.
    pub oid: String,
    /// Element path to the effective root, `|`-joined.
    pub spm: String,
    /// Sequence number of the effective root, if one is reachable.
    pub actseq: Option<u64>,
    /// Merged static < dynamic < callback params.
    pub params: Params,
    /// Referrer string of the enclosing root page view.
    pub pv_refer: Option<String>,
    /// Page-section referrer, unless muted.
    pub psrefer: Option<String>,
    /// Muted on the node or an ancestor.
    pub psrefer_mute: bool,
    /// The interaction seeds the referrer of what it opens.
    pub use_for_refer: bool,
    /// Referrer cascade ignored on the node or within its root scope.
    pub ignore_refer_cascade: bool,
    /// Referrer handed to the next page, formatted by the tree's formatter.
    pub refer: Option<String>,
    /// Length of the finished exposure (end events only).
    pub duration: Option<Duration>,
}

impl TrackedEvent {
    /// Referrer string this event hands to the next page. `None` unless the
    /// event is used for referring and the cascade is not ignored.
    pub fn refer(&self) -> Option<String> {
        self.refer.clone()
    }
}

fn compose(
    node: &Arc<VTreeNode>,
    event: &str,
    actseq: Option<u64>,
    callback: Option<&Params>,
    use_for_refer: bool,
) -> TrackedEvent {
    let pv = node.effective_pv_refer();
    let psrefer_mute = node.is_psrefer_muted();
    let ignore_refer_cascade = node.is_refer_cascade_ignored();
    let refer = if use_for_refer {
        node.interaction_refer(actseq.unwrap_or(0))
            .map(|refer| refer.refer_string())
    } else {
        None
    };
    TrackedEvent {
        event: event.to_string(),
        oid: node.oid().to_string(),
        spm: node.spm(),
        actseq,
        params: node.params_for_event(event, callback),
        pv_refer: pv.as_ref().map(|refer| refer.refer_string()),
        psrefer: if psrefer_mute {
            None
        } else {
            pv.as_ref().and_then(|refer| refer.psrefer())
        },
        psrefer_mute,
        use_for_refer,
        ignore_refer_cascade,
        refer,
        duration: None,
    }
}

fn suppressed(node: &VTreeNode, event: &str) -> bool {
    node.is_detached() || node.is_event_logging_disabled(event)
}

/// Impression (`_pv` for pages, `_ev` otherwise). Does not touch the
/// sequence.
pub fn compose_impress(node: &Arc<VTreeNode>, callback: Option<&Params>) -> Option<TrackedEvent> {
    let event = if node.is_page() { PAGE_VIEW } else { IMPRESS };
    if suppressed(node, event) {
        return None;
    }
    Some(compose(node, event, node.current_actseq(), callback, false))
}

/// Impression end (`_pd` / `_ed`) carrying the span duration.
pub fn compose_impress_end(
    node: &Arc<VTreeNode>,
    span: &ExposureSpan,
    callback: Option<&Params>,
) -> Option<TrackedEvent> {
    let event = if node.is_page() { PAGE_VIEW_END } else { IMPRESS_END };
    if suppressed(node, event) {
        return None;
    }
    let mut tracked = compose(node, event, node.current_actseq(), callback, false);
    tracked.duration = Some(span.duration);
    Some(tracked)
}

/// Interaction event such as a click.
///
/// Draws a new sequence number when `action.increase_actseq` is set. The
/// action's params sit below `callback` in the per-event layer.
pub fn compose_interaction(
    node: &Arc<VTreeNode>,
    event: &str,
    action: &EventActionConfig,
    callback: Option<&Params>,
) -> Option<TrackedEvent> {
    if suppressed(node, event) {
        return None;
    }
    let actseq = if action.increase_actseq {
        node.do_increase_actseq()
    } else {
        node.current_actseq()
    };
    let mut layer = action.params.clone();
    if let Some(callback) = callback {
        layer.extend(callback.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Some(compose(node, event, actseq, Some(&layer), action.use_for_refer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use vtrace_core::event::CLICK;
    use vtrace_core::params::params;
    use vtrace_core::{LogDisableStrategy, VTree, VTreeConfig};

    fn page_with_button(strategy: LogDisableStrategy) -> (Arc<VTree>, Arc<VTreeNode>, Arc<VTreeNode>) {
        let tree = VTree::new(VTreeConfig::default());
        let page = VTreeNode::build_virtual("page_home", true, "", 0, LogDisableStrategy::NONE, None);
        tree.set_root_node(&page);
        page.mark_as_root();
        let btn = VTreeNode::build_virtual("btn_play", false, "", 2, strategy, Some(params([("a", "1")])));
        tree.attach(&page, &btn);
        (tree, page, btn)
    }

    #[test]
    fn impress_uses_page_event_name() {
        let (_tree, page, btn) = page_with_button(LogDisableStrategy::NONE);
        page.node_will_impress(Instant::now());
        let pv = compose_impress(&page, None).unwrap();
        assert_eq!(pv.event, PAGE_VIEW);
        assert_eq!(pv.pv_refer.as_deref(), Some("[p][0]page_home"));
        let ev = compose_impress(&btn, None).unwrap();
        assert_eq!(ev.event, IMPRESS);
        assert_eq!(ev.spm, "btn_play:2|page_home");
        assert_eq!(ev.actseq, Some(0));
    }

    #[test]
    fn interaction_merges_action_and_callback_params() {
        let (_tree, _page, btn) = page_with_button(LogDisableStrategy::NONE);
        let action = EventActionConfig {
            params: params([("a", "2"), ("b", "action")]),
            ..EventActionConfig::default()
        };
        let callback = params([("b", "callback")]);
        let ec = compose_interaction(&btn, CLICK, &action, Some(&callback)).unwrap();
        assert_eq!(ec.actseq, Some(1));
        assert_eq!(ec.params, params([("a", "2"), ("b", "callback")]));
        assert_eq!(ec.refer().as_deref(), Some("[e][1]btn_play:2|page_home"));
    }

    #[test]
    fn interaction_without_increment_or_refer() {
        let (_tree, _page, btn) = page_with_button(LogDisableStrategy::NONE);
        let action = EventActionConfig {
            increase_actseq: false,
            use_for_refer: false,
            ..EventActionConfig::default()
        };
        let ec = compose_interaction(&btn, CLICK, &action, None).unwrap();
        assert_eq!(ec.actseq, Some(0));
        assert_eq!(ec.refer(), None);
    }

    #[test]
    fn disabled_and_detached_nodes_are_silent() {
        let (tree, _page, btn) = page_with_button(LogDisableStrategy::CLICK);
        assert!(compose_interaction(&btn, CLICK, &EventActionConfig::default(), None).is_none());
        assert_eq!(btn.current_actseq(), Some(0), "suppressed click draws no actseq");
        assert!(compose_impress(&btn, None).is_some());

        tree.detach(&btn);
        assert!(compose_impress(&btn, None).is_none());
    }

    #[test]
    fn impress_end_carries_duration() {
        let (_tree, _page, btn) = page_with_button(LogDisableStrategy::NONE);
        let t0 = Instant::now();
        btn.node_will_impress(t0);
        let span = btn.node_did_hide(t0 + Duration::from_millis(1500)).unwrap();
        let ed = compose_impress_end(&btn, &span, None).unwrap();
        assert_eq!(ed.event, IMPRESS_END);
        assert_eq!(ed.duration, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn refer_uses_tree_formatter() {
        use vtrace_core::refer::{ReferContext, ReferFormatter, SpmRefer, spm_string};

        #[derive(Debug)]
        struct Tagged;

        impl ReferFormatter for Tagged {
            fn format(&self, ctx: &ReferContext<'_>) -> Arc<dyn FormattedRefer> {
                Arc::new(SpmRefer {
                    is_page: ctx.is_page,
                    actseq: ctx.actseq,
                    spm: format!("tagged:{}", spm_string(ctx.spm)),
                    psrefer_mute: ctx.psrefer_mute,
                })
            }
        }

        let tree = VTree::new(VTreeConfig::default().with_refer_formatter(Arc::new(Tagged)));
        let page = VTreeNode::build_virtual("page_home", true, "", 0, LogDisableStrategy::NONE, None);
        tree.set_root_node(&page);
        page.mark_as_root();
        let btn = VTreeNode::build_virtual("btn", false, "", 1, LogDisableStrategy::NONE, None);
        tree.attach(&page, &btn);
        page.node_will_impress(Instant::now());

        let pv = compose_impress(&page, None).unwrap();
        assert_eq!(pv.pv_refer.as_deref(), Some("[p][0]tagged:page_home"));
        let ec = compose_interaction(&btn, CLICK, &EventActionConfig::default(), None).unwrap();
        assert_eq!(ec.refer().as_deref(), Some("[e][1]tagged:btn:1|page_home"));
    }

    #[test]
    fn ignored_cascade_drops_refer() {
        let (_tree, page, btn) = page_with_button(LogDisableStrategy::NONE);
        page.set_ignore_refer_cascade(true);
        let ec = compose_interaction(&btn, CLICK, &EventActionConfig::default(), None).unwrap();
        assert!(ec.use_for_refer);
        assert!(ec.ignore_refer_cascade);
        assert_eq!(ec.refer(), None);

        page.set_ignore_refer_cascade(false);
        let ec = compose_interaction(&btn, CLICK, &EventActionConfig::default(), None).unwrap();
        assert_eq!(ec.refer().as_deref(), Some("[e][2]btn_play:2|page_home"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn tracked_event_serializes() {
        let (_tree, _page, btn) = page_with_button(LogDisableStrategy::NONE);
        let ev = compose_impress(&btn, None).unwrap();
        let json = serde_json::to_string(&ev).unwrap();
        let back: TrackedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
