//! Callers Counter
//!
//! Reference count of the parties interested in one logical resource. The
//! counter is a set rather than an integer, so the same caller registering
//! twice is counted once. Its emptiness is the only signal used to decide
//! whether a resource should stay subscribed to live updates.

use std::collections::HashSet;
use std::hash::Hash;

/// Set of caller ids interested in a resource.
///
/// Callers default to strings. The runtime also counts graph nodes directly by
/// [`NodeId`](crate::graph::NodeId).
#[derive(Debug, Clone)]
pub struct CallersCounter<C = String>
where
    C: Eq + Hash,
{
    callers: HashSet<C>,
}

impl<C> CallersCounter<C>
where
    C: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            callers: HashSet::new(),
        }
    }

    /// Register a caller.
    ///
    /// Returns `true` iff the set was empty beforehand, meaning this call
    /// activated the resource. Registering an existing caller is a no-op.
    pub fn inc(&mut self, caller: impl Into<C>) -> bool {
        let was_zero = self.callers.is_empty();
        self.callers.insert(caller.into());
        was_zero
    }

    /// Unregister a caller.
    ///
    /// Returns `true` iff the set is empty afterwards. Removing an unknown
    /// caller changes nothing and reports the current emptiness.
    pub fn dec(&mut self, caller: &C) -> bool {
        self.callers.remove(caller);
        self.callers.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.callers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn contains(&self, caller: &C) -> bool {
        self.callers.contains(caller)
    }

    /// Iterate over the registered callers.
    pub fn callers(&self) -> impl Iterator<Item = &C> {
        self.callers.iter()
    }
}

impl<C> Default for CallersCounter<C>
where
    C: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_inc_activates() {
        let mut counter: CallersCounter = CallersCounter::new();
        assert!(counter.is_zero());

        assert!(counter.inc("a"));
        assert!(!counter.inc("a"));
        assert_eq!(counter.len(), 1);
        assert!(!counter.is_zero());
    }

    #[test]
    fn last_dec_deactivates() {
        let mut counter: CallersCounter = CallersCounter::new();
        counter.inc("a");

        assert!(counter.dec(&"a".to_string()));
        assert!(counter.is_zero());
    }

    #[test]
    fn dec_of_unknown_caller_reports_current_state() {
        let mut counter: CallersCounter = CallersCounter::new();
        assert!(counter.dec(&"ghost".to_string()));

        counter.inc("a");
        assert!(!counter.dec(&"ghost".to_string()));
        assert_eq!(counter.len(), 1);
    }

    #[test]
    fn distinct_callers_never_report_zero_early() {
        let mut counter: CallersCounter = CallersCounter::new();
        assert!(counter.inc("a"));
        assert!(!counter.inc("b"));
        assert!(!counter.inc("c"));

        assert!(!counter.dec(&"b".to_string()));
        assert!(!counter.is_zero());
        assert!(!counter.dec(&"a".to_string()));
        assert!(!counter.is_zero());
        assert!(counter.dec(&"c".to_string()));
        assert!(counter.is_zero());
    }

    #[test]
    fn counts_arbitrary_keys() {
        let mut counter: CallersCounter<u64> = CallersCounter::new();
        assert!(counter.inc(7u64));
        assert!(counter.contains(&7));
        assert!(counter.dec(&7));
    }
}
