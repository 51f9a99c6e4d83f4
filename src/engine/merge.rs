//! Decides whether an incoming ticket list supersedes the local one.

/// Why an incoming list was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    Forced,
    LocalEmpty,
    Untimestamped,
    Newer,
    LengthChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    Apply(AcceptReason),
    /// Incoming list was empty
    IgnoreEmpty,
    /// Incoming list is not newer than what we applied last
    Stale,
}

impl MergeDecision {
    pub fn is_apply(self) -> bool {
        matches!(self, MergeDecision::Apply(_))
    }
}

/// An incoming `update_issues` / `full_state` list, reduced to what the rule looks at
#[derive(Debug, Clone, Copy)]
pub struct Incoming {
    pub len: usize,
    pub forced: bool,
    pub timestamp: Option<i64>,
}

/// Apply the merge rule.
///
/// `last_applied` is the highest timestamp applied so far. A length change only
/// counts when the incoming list is not older than that, so a late duplicate of
/// an old list cannot undo a newer one.
pub fn decide(incoming: Incoming, local_len: usize, last_applied: Option<i64>) -> MergeDecision {
    if incoming.len == 0 {
        return MergeDecision::IgnoreEmpty;
    }
    if incoming.forced {
        return MergeDecision::Apply(AcceptReason::Forced);
    }
    if local_len == 0 {
        return MergeDecision::Apply(AcceptReason::LocalEmpty);
    }
    let Some(ts) = incoming.timestamp else {
        return MergeDecision::Apply(AcceptReason::Untimestamped);
    };
    match last_applied {
        None => MergeDecision::Apply(AcceptReason::Newer),
        Some(last) if ts > last => MergeDecision::Apply(AcceptReason::Newer),
        Some(last) if ts == last && incoming.len != local_len => {
            MergeDecision::Apply(AcceptReason::LengthChanged)
        }
        Some(_) => MergeDecision::Stale,
    }
}

/// New high-water mark after applying a list
pub fn advance(last_applied: Option<i64>, timestamp: Option<i64>) -> Option<i64> {
    match (last_applied, timestamp) {
        (Some(last), Some(ts)) => Some(last.max(ts)),
        (None, ts) => ts,
        (last, None) => last,
    }
}
