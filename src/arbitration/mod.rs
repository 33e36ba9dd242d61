//! Promise arbitration
//!
//! Runs detectors over assistant utterances, merges the results into a small
//! ranked candidate set, and hands out at most one candidate per sweep once
//! it clears the confidence threshold.

use crate::intent::{DetectorRegistry, PromisedAction};

/// Maximum number of pending candidates
pub const DEFAULT_CAPACITY: usize = 5;

/// Minimum probability for a candidate to be executed
pub const DEFAULT_THRESHOLD: f64 = 0.80;

/// Result of merging a detection into the candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New `(kind, parameters)` pair
    Inserted,
    /// Existing candidate replaced by a strictly more confident one
    Replaced,
    /// Existing candidate was at least as confident
    Ignored,
}

/// Bounded set of pending candidates, ranked by probability
#[derive(Debug, Clone)]
pub struct CandidateSet {
    entries: Vec<PromisedAction>,
    capacity: usize,
}

impl Default for CandidateSet {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CandidateSet {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Merge a candidate by identity, then trim to capacity.
    ///
    /// When over capacity the set is stably sorted by descending probability
    /// and the lowest entries are dropped, so ties keep insertion order.
    pub fn merge(&mut self, action: PromisedAction) -> MergeOutcome {
        let outcome = match self.entries.iter_mut().find(|c| c.same_action(&action)) {
            Some(existing) if action.probability > existing.probability => {
                *existing = action;
                MergeOutcome::Replaced
            }
            Some(_) => MergeOutcome::Ignored,
            None => {
                self.entries.push(action);
                MergeOutcome::Inserted
            }
        };

        if self.entries.len() > self.capacity {
            self.entries
                .sort_by(|a, b| b.probability.total_cmp(&a.probability));
            for dropped in self.entries.drain(self.capacity..) {
                tracing::debug!(
                    kind = %dropped.kind,
                    probability = dropped.probability,
                    "candidate evicted for capacity"
                );
            }
        }

        outcome
    }

    /// Highest-probability candidate; the earliest wins a tie
    #[must_use]
    pub fn top(&self) -> Option<&PromisedAction> {
        self.entries.iter().fold(None, |best, c| match best {
            Some(b) if b.probability >= c.probability => Some(b),
            _ => Some(c),
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PromisedAction> {
        self.entries.iter()
    }
}

/// Arbitrates among detected promises for one session
#[derive(Debug, Clone)]
pub struct PromiseArbitrator {
    detectors: DetectorRegistry,
    candidates: CandidateSet,
    threshold: f64,
    in_flight: Option<PromisedAction>,
}

impl PromiseArbitrator {
    #[must_use]
    pub fn new(detectors: DetectorRegistry, capacity: usize, threshold: f64) -> Self {
        Self {
            detectors,
            candidates: CandidateSet::new(capacity),
            threshold,
            in_flight: None,
        }
    }

    /// Run every detector against an assistant utterance and merge the hits.
    ///
    /// Detections identical to the action currently being dispatched are
    /// dropped. Returns the number of detections merged.
    pub fn observe(&mut self, text: &str, message_index: usize) -> usize {
        let mut merged = 0;

        for action in self.detectors.detect_all(text) {
            let action = action.detected_at(message_index);

            if self
                .in_flight
                .as_ref()
                .is_some_and(|running| running.same_action(&action))
            {
                tracing::debug!(kind = %action.kind, "ignoring re-detection of in-flight action");
                continue;
            }

            self.candidates.merge(action);
            merged += 1;
        }

        merged
    }

    /// Merge a candidate that did not come from text detection
    /// (e.g. a structured action returned by the agent backend)
    pub fn propose(&mut self, action: PromisedAction) -> MergeOutcome {
        self.candidates.merge(action)
    }

    /// Take the best candidate if it clears the threshold.
    ///
    /// On selection the whole set is cleared and the candidate is marked in
    /// flight until [`finish_dispatch`](Self::finish_dispatch). Returns `None`
    /// and leaves the set untouched otherwise, including while another
    /// dispatch is still running.
    pub fn select_for_execution(&mut self) -> Option<PromisedAction> {
        if self.in_flight.is_some() {
            return None;
        }

        let top = self.candidates.top()?;
        if top.probability < self.threshold {
            tracing::trace!(
                kind = %top.kind,
                probability = top.probability,
                threshold = self.threshold,
                "top candidate below threshold"
            );
            return None;
        }

        let selected = top.clone();
        self.candidates.clear();
        self.in_flight = Some(selected.clone());
        Some(selected)
    }

    /// Mark the in-flight dispatch as finished, whatever its outcome
    pub fn finish_dispatch(&mut self) -> Option<PromisedAction> {
        self.in_flight.take()
    }

    #[must_use]
    pub const fn in_flight(&self) -> Option<&PromisedAction> {
        self.in_flight.as_ref()
    }

    #[must_use]
    pub const fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    /// Drop all pending candidates (session reopened)
    pub fn reset(&mut self) {
        self.candidates.clear();
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }
}
