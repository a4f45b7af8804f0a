#![forbid(unsafe_code)]

//! Referrer snapshots.
//!
//! A referrer encodes the ancestor/page context of a node at the instant it is
//! impressed. The concrete grammar belongs to the reporting layer, so the core
//! only deals in [`FormattedRefer`] capabilities produced by an injected
//! [`ReferFormatter`]. [`SpmReferFormatter`] is the default.

use std::fmt;
use std::sync::Arc;

/// One hop of the element path, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpmSegment {
    /// Element identifier.
    pub oid: String,
    /// Ordinal among siblings; `0` means unspecified.
    pub position: u32,
}

impl SpmSegment {
    /// Create a segment.
    pub fn new(oid: impl Into<String>, position: u32) -> Self {
        Self {
            oid: oid.into(),
            position,
        }
    }
}

impl fmt::Display for SpmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.position > 0 {
            write!(f, "{}:{}", self.oid, self.position)
        } else {
            f.write_str(&self.oid)
        }
    }
}

/// Join segments into the `oid[:pos]|parent[:pos]|...` path string.
#[must_use]
pub fn spm_string(segments: &[SpmSegment]) -> String {
    let mut out = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        out.push_str(&segment.to_string());
    }
    out
}

/// Everything a formatter may use when snapshotting a referrer.
#[derive(Debug, Clone)]
pub struct ReferContext<'a> {
    /// Oid of the node being impressed.
    pub oid: &'a str,
    /// Whether that node is a page.
    pub is_page: bool,
    /// Element path from the node up to its effective root, leaf first.
    pub spm: &'a [SpmSegment],
    /// Current interaction sequence of the effective root.
    pub actseq: u64,
    /// The node's page-section referrer should be muted.
    pub psrefer_mute: bool,
}

/// A referrer string snapshot.
pub trait FormattedRefer: fmt::Debug + Send + Sync {
    /// The referrer string delivered with events.
    fn refer_string(&self) -> String;

    /// Page-section referrer, if this snapshot carries one.
    fn psrefer(&self) -> Option<String> {
        None
    }

    /// Seeded from an external link rather than formatted from the tree.
    fn is_external(&self) -> bool {
        false
    }
}

/// Produces [`FormattedRefer`] snapshots from tree context.
pub trait ReferFormatter: fmt::Debug + Send + Sync {
    /// Snapshot a referrer for `ctx`.
    fn format(&self, ctx: &ReferContext<'_>) -> Arc<dyn FormattedRefer>;
}

// ---------------------------------------------------------------------------
// Default formatter
// ---------------------------------------------------------------------------

/// Referrer formatted from the element path: `[p|e][actseq]spm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpmRefer {
    /// `true` when snapshotted for a page node.
    pub is_page: bool,
    /// Sequence number at snapshot time.
    pub actseq: u64,
    /// Joined element path.
    pub spm: String,
    /// Suppress the page-section referrer.
    pub psrefer_mute: bool,
}

impl FormattedRefer for SpmRefer {
    fn refer_string(&self) -> String {
        let kind = if self.is_page { 'p' } else { 'e' };
        format!("[{kind}][{}]{}", self.actseq, self.spm)
    }

    fn psrefer(&self) -> Option<String> {
        (!self.psrefer_mute).then(|| self.spm.clone())
    }
}

/// Default [`ReferFormatter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpmReferFormatter;

impl ReferFormatter for SpmReferFormatter {
    fn format(&self, ctx: &ReferContext<'_>) -> Arc<dyn FormattedRefer> {
        Arc::new(SpmRefer {
            is_page: ctx.is_page,
            actseq: ctx.actseq,
            spm: spm_string(ctx.spm),
            psrefer_mute: ctx.psrefer_mute,
        })
    }
}

// ---------------------------------------------------------------------------
// Externally seeded
// ---------------------------------------------------------------------------

/// Referrer handed in by whoever opened the page (deep link, push, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRefer {
    /// Page referrer.
    pub pgrefer: String,
    /// Page-section referrer.
    pub psrefer: String,
}

impl ExternalRefer {
    /// Create from the two external strings.
    pub fn new(pgrefer: impl Into<String>, psrefer: impl Into<String>) -> Self {
        Self {
            pgrefer: pgrefer.into(),
            psrefer: psrefer.into(),
        }
    }
}

impl FormattedRefer for ExternalRefer {
    fn refer_string(&self) -> String {
        self.pgrefer.clone()
    }

    fn psrefer(&self) -> Option<String> {
        (!self.psrefer.is_empty()).then(|| self.psrefer.clone())
    }

    fn is_external(&self) -> bool {
        true
    }
}
