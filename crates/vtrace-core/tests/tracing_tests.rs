#![forbid(unsafe_code)]

//! Structured logging integration tests.
//!
//! Structural edits log at `debug`, hot-path bookkeeping at `trace`. These
//! tests capture emitted events through a `tracing_subscriber` layer.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;
use vtrace_core::{LogDisableStrategy, MountPriority, VTree, VTreeConfig, VTreeNode};

// ============================================================================
// Test Infrastructure
// ============================================================================

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: tracing::Level,
    message: String,
    oid: Option<String>,
}

#[derive(Clone, Default)]
struct EventLog {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    oid: Option<String>,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "oid" {
            self.oid = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "oid" => self.oid = Some(format!("{value:?}").trim_matches('"').to_string()),
            _ => {}
        }
    }
}

impl<S> Layer<S> for EventLog
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            oid: visitor.oid,
        });
    }
}

fn with_captured_events<F: FnOnce()>(f: F) -> Vec<CapturedEvent> {
    let log = EventLog::default();
    let events = Arc::clone(&log.events);
    let subscriber = tracing_subscriber::registry().with(log);
    tracing::subscriber::with_default(subscriber, || {
        tracing::callsite::rebuild_interest_cache();
        f();
    });
    let captured = events.lock().unwrap().clone();
    captured
}

fn node(oid: &str, is_page: bool) -> Arc<VTreeNode> {
    VTreeNode::build_virtual(oid, is_page, "", 0, LogDisableStrategy::NONE, None)
}

fn has(events: &[CapturedEvent], level: tracing::Level, message: &str, oid: &str) -> bool {
    events
        .iter()
        .any(|e| e.level == level && e.message == message && e.oid.as_deref() == Some(oid))
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn root_marking_logged_at_debug() {
    let events = with_captured_events(|| {
        let page = node("page_home", true);
        page.mark_as_root();
        page.unmark_as_root();
    });
    assert!(has(&events, tracing::Level::DEBUG, "marked as root page", "page_home"));
    assert!(has(&events, tracing::Level::DEBUG, "root page mark removed", "page_home"));
}

#[test]
fn overlay_lifecycle_logged() {
    let events = with_captured_events(|| {
        let tree = VTree::new(VTreeConfig::default());
        let alert = node("alert_logout", true);
        tree.mount_overlay(&alert, MountPriority::Highest);
        tree.mount_overlay(&alert, MountPriority::Highest);
        tree.unmount_overlay(&alert);
    });
    assert!(has(&events, tracing::Level::DEBUG, "overlay mounted", "alert_logout"));
    assert!(has(&events, tracing::Level::DEBUG, "mount_overlay refused", "alert_logout"));
    assert!(has(&events, tracing::Level::DEBUG, "overlay unmounted", "alert_logout"));
}

#[test]
fn detached_mutations_logged() {
    let events = with_captured_events(|| {
        let parent = node("list", false);
        let cell = node("cell", false);
        parent.push_sub_node(&cell);
        parent.remove_sub_node(&cell);
        cell.update_position(3);
    });
    assert!(has(&events, tracing::Level::DEBUG, "ignored mutation on detached node", "cell"));
}

#[test]
fn hot_path_logged_at_trace() {
    let events = with_captured_events(|| {
        let page = node("page_home", true);
        page.mark_as_root();
        page.node_will_impress(Instant::now());
        page.do_increase_actseq();
        page.refresh_dynamic_params_if_needed();
    });
    assert!(has(&events, tracing::Level::TRACE, "actseq reset on impress", "page_home"));
    assert!(has(&events, tracing::Level::TRACE, "actseq increased", "page_home"));
    assert!(has(&events, tracing::Level::TRACE, "dynamic params refreshed", "page_home"));
}

#[test]
fn quiet_without_structural_changes() {
    let events = with_captured_events(|| {
        let page = node("page_home", true);
        let _ = page.diff_identifier();
        let _ = page.snapshot();
    });
    assert!(events.is_empty(), "unexpected events: {events:?}");
}
