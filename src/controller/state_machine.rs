//! Declarative transition table for one release.
//!
//! The reconciler observes the recorded revision, the desired state and
//! (when nothing is recorded) whether the package manager already holds the
//! release, then asks [`plan`] which action to take. Guards are pure functions over
//! that [`ReleaseSnapshot`]; the first matching row wins, and no match means
//! the release is already where it should be.

use std::fmt;

use crate::model::{ReleaseDescriptor, RevisionRecord};

/// What to do with a release this pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseAction {
    Install,
    Upgrade,
    Uninstall,
    Unchanged,
}

impl fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Uninstall => "uninstall",
            Self::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Observed world for one release, gathered before planning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReleaseSnapshot {
    /// Revision id of the stored record, if any.
    pub recorded_revision: Option<String>,
    /// Revision id the control plane wants, if the release is desired at all.
    pub desired_revision: Option<String>,
    pub uninstall_requested: bool,
    /// The package manager already has a release under this name. Set when
    /// an earlier install succeeded but its record was never written.
    pub release_exists: bool,
}

impl ReleaseSnapshot {
    pub fn observe(
        record: Option<&RevisionRecord>,
        desired: Option<&ReleaseDescriptor>,
        release_exists: bool,
    ) -> Self {
        Self {
            recorded_revision: record.map(|r| r.revision_id.clone()),
            desired_revision: desired.map(|d| d.revision_id.clone()),
            uninstall_requested: desired.is_none(),
            release_exists: release_exists || record.is_some(),
        }
    }

    fn has_record(&self) -> bool {
        self.recorded_revision.is_some()
    }
}

/// A single row in the transition table.
pub struct Transition {
    pub action: ReleaseAction,
    pub guard: fn(&ReleaseSnapshot) -> bool,
    pub guard_name: &'static str,
}

/// Order matters: an explicit removal wins over everything else.
pub static TRANSITIONS: &[Transition] = &[
    Transition {
        action: ReleaseAction::Uninstall,
        guard: |s| s.uninstall_requested,
        guard_name: "uninstall_requested",
    },
    Transition {
        action: ReleaseAction::Install,
        guard: |s| !s.has_record() && !s.release_exists,
        guard_name: "!has_record && !release_exists",
    },
    // Also adopts a release that exists without a record.
    Transition {
        action: ReleaseAction::Upgrade,
        guard: |s| s.recorded_revision != s.desired_revision,
        guard_name: "recorded_revision != desired_revision",
    },
];

/// First transition whose guard fires, or `None` when nothing needs doing.
pub fn matching(snapshot: &ReleaseSnapshot) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| (t.guard)(snapshot))
}

pub fn plan(snapshot: &ReleaseSnapshot) -> ReleaseAction {
    matching(snapshot)
        .map(|t| t.action)
        .unwrap_or(ReleaseAction::Unchanged)
}
