//! Property tests for event composition.

use std::sync::Arc;

use proptest::prelude::*;
use vtrace::core::event::CLICK;
use vtrace::prelude::*;

fn page_with_buttons(count: usize) -> (Arc<VTree>, Vec<Arc<VTreeNode>>) {
    let tree = VTree::new(VTreeConfig::default());
    let page = VTreeNode::build_virtual("page", true, "", 0, LogDisableStrategy::NONE, None);
    tree.set_root_node(&page);
    page.mark_as_root();
    let buttons = (0..count)
        .map(|i| {
            let btn = VTreeNode::build_virtual("btn", false, "", i as u32 + 1, LogDisableStrategy::NONE, None);
            tree.attach(&page, &btn);
            btn
        })
        .collect();
    (tree, buttons)
}

proptest! {
    /// Only incrementing interactions advance the sequence, and each one
    /// observes the next value.
    #[test]
    fn actseq_counts_incrementing_interactions(
        clicks in prop::collection::vec((0usize..4, any::<bool>()), 0..60),
    ) {
        let (_tree, buttons) = page_with_buttons(4);
        let mut expected = 0u64;
        for (index, increase) in clicks {
            let action = EventActionConfig { increase_actseq: increase, ..EventActionConfig::default() };
            let event = compose_interaction(&buttons[index], CLICK, &action, None).unwrap();
            if increase {
                expected += 1;
            }
            prop_assert_eq!(event.actseq, Some(expected));
        }
    }

    /// Callback params always win over static params.
    #[test]
    fn callback_layer_wins(
        statics in prop::collection::btree_map("[a-c]", "[0-9]{1,3}", 0..3),
        callback in prop::collection::btree_map("[a-c]", "[x-z]{1,3}", 0..3),
    ) {
        let node = VTreeNode::build_virtual("btn", false, "", 0, LogDisableStrategy::NONE, Some(statics.clone()));
        let merged = node.params_for_event(CLICK, Some(&callback));
        for (key, value) in &callback {
            prop_assert_eq!(merged.get(key), Some(value));
        }
        for (key, value) in &statics {
            if !callback.contains_key(key) {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
    }
}
