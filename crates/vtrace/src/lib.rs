#![forbid(unsafe_code)]

//! vtrace public facade crate.
//!
//! Re-exports the tree model from `vtrace-core` and adds the host-facing
//! surface: element bindings, alert-style overlays and event payload
//! composition. A prelude covers day-to-day use.

pub mod attach;
pub mod report;

// --- Core re-exports -------------------------------------------------------

pub use vtrace_core::{
    DynamicParamsProvider, ExposureSpan, ExternalRefer, FormattedRefer, LogDisableStrategy,
    MountPriority, NodeSnapshot, OverlayDefaults, Params, ParamsResolver, Rect, ReferContext,
    ReferFormatter, RefreshMode, RefreshPolicy, Result, Sentinel, SpmReferFormatter, SpmSegment,
    TrackedElement, VTree, VTreeConfig, VTreeError, VTreeNode, VisibilityChange,
};
pub use vtrace_core::params::params;

// --- Facade re-exports -----------------------------------------------------

pub use attach::{BoundAction, ElementBinding, EventActionConfig, MountedOverlay, Overlay};
pub use report::{TrackedEvent, compose_impress, compose_impress_end, compose_interaction};

// --- Prelude --------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        ElementBinding, EventActionConfig, LogDisableStrategy, MountPriority, Overlay, Params,
        Rect, TrackedElement, TrackedEvent, VTree, VTreeConfig, VTreeError, VTreeNode,
        VisibilityChange, compose_impress, compose_interaction, params,
    };

    pub use crate::{core, report};
}

pub use vtrace_core as core;
