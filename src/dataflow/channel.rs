//! Channel values and the per-key combinators behind join, mix and collect.
//!
//! Every (channel, key) pair resolves exactly once, either to a payload or
//! to the reason nothing will arrive. Since the key set is known before the
//! first dispatch, join and collect decide participation from resolutions
//! alone and never from arrival order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::utils::manifest::SampleRecord;

const GLOBAL_LABEL: &str = "all";

/// Handle to the output channel of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub(crate) node: NodeIndex,
    pub(crate) keyed: bool,
}

impl Channel {
    pub fn index(&self) -> NodeIndex {
        self.node
    }

    /// True for per-sample channels, false for collected (global) ones.
    pub fn is_keyed(&self) -> bool {
        self.keyed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleKey {
    Sample(String),
    Global,
}

impl SampleKey {
    pub fn label(&self) -> &str {
        match self {
            SampleKey::Sample(id) => id,
            SampleKey::Global => GLOBAL_LABEL,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, SampleKey::Global)
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Named files flowing through a channel, tagged with the sample they
/// belong to (none for outputs of global stages).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datum {
    pub sample: Option<Arc<SampleRecord>>,
    pub files: BTreeMap<String, PathBuf>,
}

impl Datum {
    pub fn new(sample: Option<Arc<SampleRecord>>, files: BTreeMap<String, PathBuf>) -> Self {
        Datum { sample, files }
    }

    pub fn sample_id(&self) -> Option<&str> {
        self.sample.as_ref().map(|s| s.id.as_str())
    }

    pub fn file(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    /// Union of both sides' files. On a name clash the left side wins.
    pub fn merge(&self, other: &Datum) -> Datum {
        let mut files = self.files.clone();
        for (name, path) in &other.files {
            files.entry(name.clone()).or_insert_with(|| path.clone());
        }
        Datum {
            sample: self.sample.clone().or_else(|| other.sample.clone()),
            files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Item(Arc<Datum>),
    Collected(Arc<Vec<Arc<Datum>>>),
}

impl Payload {
    pub fn item(&self) -> Option<&Arc<Datum>> {
        match self {
            Payload::Item(datum) => Some(datum),
            Payload::Collected(_) => None,
        }
    }
}

/// Why a (channel, key) pair carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AbsentCause {
    NoData,
    Disabled,
    Predicate,
    UpstreamFailed,
    JoinMismatch,
    Cancelled,
}

impl AbsentCause {
    /// Causes that stop a mix from falling through to later inputs.
    pub fn is_blocking(&self) -> bool {
        matches!(self, AbsentCause::UpstreamFailed | AbsentCause::Cancelled)
    }
}

impl fmt::Display for AbsentCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbsentCause::NoData => "no input data",
            AbsentCause::Disabled => "stage disabled",
            AbsentCause::Predicate => "sample not eligible",
            AbsentCause::UpstreamFailed => "upstream failure",
            AbsentCause::JoinMismatch => "join mismatch",
            AbsentCause::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Present(Payload),
    Absent(AbsentCause),
}

impl Resolution {
    pub fn absent_cause(&self) -> Option<AbsentCause> {
        match self {
            Resolution::Absent(cause) => Some(*cause),
            Resolution::Present(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Resolved(Resolution),
    /// Exactly one side delivered; the payload is that side.
    Mismatch(Payload),
}

/// Matches one key across two keyed channels.
pub fn join(left: &Resolution, right: &Resolution) -> JoinOutcome {
    match (left, right) {
        (Resolution::Present(l), Resolution::Present(r)) => match (l.item(), r.item()) {
            (Some(a), Some(b)) => JoinOutcome::Resolved(Resolution::Present(Payload::Item(Arc::new(a.merge(b))))),
            _ => JoinOutcome::Resolved(Resolution::Present(l.clone())),
        },
        (Resolution::Absent(cause), Resolution::Present(payload))
        | (Resolution::Present(payload), Resolution::Absent(cause)) => {
            if cause.is_blocking() {
                JoinOutcome::Resolved(Resolution::Absent(*cause))
            } else {
                JoinOutcome::Mismatch(payload.clone())
            }
        }
        (Resolution::Absent(l), Resolution::Absent(r)) => {
            let cause = if r.is_blocking() && !l.is_blocking() { *r } else { *l };
            JoinOutcome::Resolved(Resolution::Absent(cause))
        }
    }
}

/// First present input in declaration order. A failed or cancelled input
/// ends the search; disabled or skipped ones are passed over.
///
/// When nothing is present the first cause other than `Disabled` is kept, so
/// a skip on the active branch is not hidden by the inactive ones.
pub fn mix<'a>(inputs: impl IntoIterator<Item = &'a Resolution>) -> Resolution {
    let mut cause: Option<AbsentCause> = None;
    for resolution in inputs {
        match resolution {
            Resolution::Present(payload) => return Resolution::Present(payload.clone()),
            Resolution::Absent(c) if c.is_blocking() => return Resolution::Absent(*c),
            Resolution::Absent(c) => {
                if cause.is_none() || cause == Some(AbsentCause::Disabled) {
                    cause = Some(*c);
                }
            }
        }
    }
    Resolution::Absent(cause.unwrap_or(AbsentCause::NoData))
}

/// Gathers the present items of a keyed channel, ordered by sample id so the
/// set does not depend on completion order.
pub fn collect<'a>(inputs: impl IntoIterator<Item = &'a Resolution>) -> Payload {
    let mut items: Vec<Arc<Datum>> = inputs
        .into_iter()
        .filter_map(|resolution| match resolution {
            Resolution::Present(Payload::Item(datum)) => Some(datum.clone()),
            _ => None,
        })
        .collect();
    items.sort_by(|a, b| a.sample_id().cmp(&b.sample_id()));
    Payload::Collected(Arc::new(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, name: &str, path: &str) -> Resolution {
        let mut files = BTreeMap::new();
        files.insert(name.to_string(), PathBuf::from(path));
        let sample = Arc::new(SampleRecord::new(id));
        Resolution::Present(Payload::Item(Arc::new(Datum::new(Some(sample), files))))
    }

    #[test]
    fn test_join_merges_both_sides() {
        let left = item("S1", "trimmed_1", "/a.fq");
        let right = item("S1", "trimmed_long", "/b.fq");
        match join(&left, &right) {
            JoinOutcome::Resolved(Resolution::Present(Payload::Item(datum))) => {
                assert_eq!(datum.files.len(), 2);
                assert_eq!(datum.sample_id(), Some("S1"));
            }
            other => panic!("unexpected join outcome {:?}", other),
        }
    }

    #[test]
    fn test_join_one_sided_is_mismatch() {
        let left = item("S1", "trimmed_1", "/a.fq");
        let right = Resolution::Absent(AbsentCause::NoData);
        assert!(matches!(join(&left, &right), JoinOutcome::Mismatch(_)));
        assert!(matches!(join(&right, &left), JoinOutcome::Mismatch(_)));
    }

    #[test]
    fn test_join_failure_is_not_mismatch() {
        let left = item("S1", "trimmed_1", "/a.fq");
        let right = Resolution::Absent(AbsentCause::UpstreamFailed);
        assert_eq!(join(&left, &right), JoinOutcome::Resolved(Resolution::Absent(AbsentCause::UpstreamFailed)));
    }

    #[test]
    fn test_mix_skips_disabled_but_stops_on_failure() {
        let disabled = Resolution::Absent(AbsentCause::Disabled);
        let failed = Resolution::Absent(AbsentCause::UpstreamFailed);
        let present = item("S1", "assembly", "/asm.fa");
        assert_eq!(mix([&disabled, &present]), present);
        assert_eq!(mix([&failed, &present]), failed);
        assert_eq!(mix([&disabled, &disabled]), disabled);
        let mismatch = Resolution::Absent(AbsentCause::JoinMismatch);
        assert_eq!(mix([&disabled, &mismatch, &disabled]), mismatch);
    }

    #[test]
    fn test_collect_is_ordered_by_sample() {
        let b = item("B", "report", "/b");
        let a = item("A", "report", "/a");
        let none = Resolution::Absent(AbsentCause::Predicate);
        match collect([&b, &none, &a]) {
            Payload::Collected(items) => {
                let ids: Vec<_> = items.iter().map(|d| d.sample_id().unwrap_or_default().to_string()).collect();
                assert_eq!(ids, vec!["A", "B"]);
            }
            Payload::Item(_) => panic!("collect must yield a collected payload"),
        }
    }
}
