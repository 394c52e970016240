//! Process filter: admits events generated in the context of one of the
//! target processes.

use netrace_core::filter::{Filter, FilterResult};
use probe_common::{
    Pid, ProbeContext,
    maps::{BpfHashMap, MapError, UpdateFlags},
    schema::{PROCESS_FILTER_TAG, PROCESS_TARGETS_MAX},
};

const INTERESTING: u64 = 1;

pub struct ProcessFilter {
    interest: BpfHashMap<u64, 1>,
}

impl std::fmt::Debug for ProcessFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessFilter")
            .field("targets", &self.interest.len())
            .finish()
    }
}

impl ProcessFilter {
    pub fn new(targets: &[Pid]) -> Result<Self, MapError> {
        let filter = Self {
            interest: BpfHashMap::new("process_interest", PROCESS_TARGETS_MAX),
        };
        for pid in targets {
            filter.track(*pid)?;
        }
        Ok(filter)
    }

    /// Add `pid` to the targets.
    pub fn track(&self, pid: Pid) -> Result<(), MapError> {
        self.interest
            .update(key(pid)?, INTERESTING, UpdateFlags::Any)
    }

    /// Remove `pid` from the targets.
    pub fn untrack(&self, pid: Pid) -> Result<(), MapError> {
        self.interest.delete(key(pid)?).map(|_| ())
    }

    pub fn is_tracked(&self, pid: Pid) -> bool {
        matches!(
            key(pid).and_then(|key| self.interest.lookup(key)),
            Ok(Some(_))
        )
    }
}

fn key(pid: Pid) -> Result<u64, MapError> {
    match pid.as_raw() {
        pid if pid > 0 => Ok(pid as u64),
        _ => Err(MapError::InvalidKey),
    }
}

impl Filter for ProcessFilter {
    fn tag(&self) -> u32 {
        PROCESS_FILTER_TAG
    }

    fn evaluate_one(&self, ctx: &ProbeContext) -> FilterResult {
        let Some(pid) = ctx.pid else {
            return FilterResult::Inconclusive;
        };
        match key(pid).and_then(|key| self.interest.lookup(key)) {
            Ok(Some(_)) => FilterResult::Match,
            Ok(None) => FilterResult::NoMatch,
            Err(_) => FilterResult::Inconclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use probe_common::{ProbeInfo, schema::ProbeKind, time::Timestamp};

    use super::*;

    fn ctx() -> ProbeContext<'static> {
        ProbeContext::new(
            ProbeInfo {
                symbol: 1,
                kind: ProbeKind::Kprobe,
            },
            Timestamp::from(1),
        )
    }

    #[test]
    fn matches_targets() {
        let filter = ProcessFilter::new(&[Pid::from_raw(10), Pid::from_raw(20)]).unwrap();
        assert_eq!(filter.tag(), PROCESS_FILTER_TAG);
        assert_eq!(
            filter.evaluate_one(&ctx().with_pid(Pid::from_raw(10))),
            FilterResult::Match
        );
        assert_eq!(
            filter.evaluate_one(&ctx().with_pid(Pid::from_raw(11))),
            FilterResult::NoMatch
        );
        assert_eq!(filter.evaluate_one(&ctx()), FilterResult::Inconclusive);
    }

    #[test]
    fn runtime_updates() {
        let filter = ProcessFilter::new(&[]).unwrap();
        filter.track(Pid::from_raw(42)).unwrap();
        assert!(filter.is_tracked(Pid::from_raw(42)));
        filter.untrack(Pid::from_raw(42)).unwrap();
        assert!(!filter.is_tracked(Pid::from_raw(42)));
    }

    #[test]
    fn invalid_pids() {
        assert_eq!(
            ProcessFilter::new(&[Pid::from_raw(0)]).err().map(|e| e.to_string()),
            Some(MapError::InvalidKey.to_string())
        );
        let too_many: Vec<_> = (1..=PROCESS_TARGETS_MAX as i32 + 1)
            .map(Pid::from_raw)
            .collect();
        assert!(matches!(
            ProcessFilter::new(&too_many),
            Err(MapError::Full(_))
        ));
    }
}
