#![forbid(unsafe_code)]

//! Core: the annotated UI tracking tree, interaction sequencing, referrer
//! snapshots and parameter layering.

pub mod config;
pub mod element;
pub mod error;
pub mod event;
pub mod geometry;
pub mod node;
pub mod params;
pub mod refer;
pub mod sentinel;
pub mod tree;

pub use config::{OverlayDefaults, VTreeConfig};
pub use element::TrackedElement;
pub use error::{Result, VTreeError};
pub use event::LogDisableStrategy;
pub use geometry::Rect;
pub use node::{ExposureSpan, NodeSnapshot, VTreeNode, VisibilityChange};
pub use params::{DynamicParamsProvider, Params, ParamsResolver, RefreshMode, RefreshPolicy};
pub use refer::{ExternalRefer, FormattedRefer, ReferContext, ReferFormatter, SpmReferFormatter, SpmSegment};
pub use sentinel::Sentinel;
pub use tree::{MountPriority, VTree};
