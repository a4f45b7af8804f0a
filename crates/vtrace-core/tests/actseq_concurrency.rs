//! Interaction sequencing under concurrent readers and reporters.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use vtrace_core::{LogDisableStrategy, MountPriority, VTree, VTreeConfig, VTreeNode};

fn node(oid: &str, is_page: bool, position: u32) -> Arc<VTreeNode> {
    VTreeNode::build_virtual(oid, is_page, "", position, LogDisableStrategy::NONE, None)
}

#[test]
fn siblings_share_root_sequence_without_gaps() {
    let tree = VTree::new(VTreeConfig::default());
    let page = node("page_feed", true, 0);
    tree.set_root_node(&page);
    page.mark_as_root();

    let buttons: Vec<_> = (0..6)
        .map(|i| {
            let btn = node("btn_like", false, i + 1);
            assert!(tree.attach(&page, &btn));
            btn
        })
        .collect();

    let per_thread = 250;
    let barrier = Arc::new(Barrier::new(buttons.len()));
    let handles: Vec<_> = buttons
        .iter()
        .map(|btn| {
            let btn = Arc::clone(btn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..per_thread)
                    .map(|_| btn.do_increase_actseq().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let values = handle.join().unwrap();
        assert!(values.windows(2).all(|w| w[0] < w[1]), "per-thread order");
        for value in values {
            assert!(seen.insert(value), "duplicate actseq {value}");
        }
    }
    let total = (buttons.len() * per_thread) as u64;
    assert_eq!(seen.len() as u64, total);
    assert_eq!(page.current_actseq(), Some(total));
}

#[test]
fn nested_roots_count_independently() {
    let tree = VTree::new(VTreeConfig::default());
    let window = node("window", false, 0);
    let sheet = node("sheet_share", true, 0);
    let feed_btn = node("btn_share", false, 0);
    let sheet_btn = node("btn_wechat", false, 0);
    tree.set_root_node(&window);
    tree.attach(&window, &feed_btn);
    tree.attach(&window, &sheet);
    tree.attach(&sheet, &sheet_btn);
    sheet.mark_as_root();

    let a = Arc::clone(&feed_btn);
    let b = Arc::clone(&sheet_btn);
    let ha = thread::spawn(move || (0..100).filter_map(|_| a.do_increase_actseq()).last());
    let hb = thread::spawn(move || (0..40).filter_map(|_| b.do_increase_actseq()).last());
    assert_eq!(ha.join().unwrap(), Some(100));
    assert_eq!(hb.join().unwrap(), Some(40));
    assert_eq!(window.current_actseq(), Some(100));
    assert_eq!(sheet.current_actseq(), Some(40));
}

#[test]
fn readers_observe_consistent_snapshots_while_reporting() {
    let tree = VTree::new(VTreeConfig::default());
    let root = node("window", false, 0);
    tree.set_root_node(&root);
    let alert = node("alert", true, 0);
    tree.mount_overlay(&alert, MountPriority::Highest);
    let ok = node("btn_ok", false, 1);
    tree.attach(&alert, &ok);

    let reporter = {
        let ok = Arc::clone(&ok);
        thread::spawn(move || {
            for _ in 0..500 {
                ok.do_increase_actseq();
            }
        })
    };
    let reader = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for _ in 0..500 {
                let found = tree.find("btn_ok").unwrap();
                let snap = found.snapshot();
                assert_eq!(snap.position, 1);
                assert!(!snap.detached);
                assert_eq!(found.spm(), "btn_ok:1|alert");
            }
        })
    };
    reporter.join().unwrap();
    reader.join().unwrap();
    assert_eq!(ok.current_actseq(), Some(500));

    // Re-impressing the overlay restarts its sequence.
    assert!(alert.node_will_impress(Instant::now()));
    assert_eq!(ok.current_actseq(), Some(0));
}
