//! View synchronisation and timeouts

use cadence_metrics::{CounterType, SystemCounters};
use cadence_primitives::Epoch;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::BftConfig;
use crate::interfaces::TimeoutSender;
use crate::messages::{LocalTimeout, NewView};
use crate::types::View;
use crate::validator::{ValidationState, ValidatorSet};

/// Tracks the current view and arms one timeout per view entered.
///
/// Timeouts are never cancelled. A timeout firing for a view other than the
/// current one is ignored.
pub struct Pacemaker {
    epoch: Epoch,
    current_view: View,
    last_sync_view: View,
    pending_new_views: BTreeMap<View, ValidationState<()>>,
    consecutive_timeouts: u32,
    timeout_sender: Arc<dyn TimeoutSender>,
    config: BftConfig,
    counters: Arc<SystemCounters>,
}

impl Pacemaker {
    /// Create a pacemaker at the genesis view. Nothing is scheduled until the
    /// first QC is processed.
    pub fn new(
        epoch: Epoch,
        timeout_sender: Arc<dyn TimeoutSender>,
        config: BftConfig,
        counters: Arc<SystemCounters>,
    ) -> Self {
        Self {
            epoch,
            current_view: View::GENESIS,
            last_sync_view: View::GENESIS,
            pending_new_views: BTreeMap::new(),
            consecutive_timeouts: 0,
            timeout_sender,
            config,
            counters,
        }
    }

    /// Current view
    pub fn current_view(&self) -> View {
        self.current_view
    }

    /// Views that ended in a timeout since the last QC
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// A QC for `view` was seen. Moves to the following view when that is
    /// ahead of the current one.
    pub fn process_qc(&mut self, view: View) -> Option<View> {
        if view < self.current_view {
            return None;
        }
        self.consecutive_timeouts = 0;
        self.update_view(view.next());
        Some(self.current_view)
    }

    /// The local timer for `view` fired. Returns the view moved to, or `None`
    /// when the timeout is stale.
    pub fn process_local_timeout(&mut self, view: View) -> Option<View> {
        if view != self.current_view {
            tracing::trace!(%view, current = %self.current_view, "LOCAL_TIMEOUT: stale");
            return None;
        }
        self.counters.increment(CounterType::BftTimeouts);
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        self.update_view(view.next());
        Some(self.current_view)
    }

    /// Count a verified new-view. Once new-views for the same view carry a
    /// quorum of power, moves to that view and returns it.
    pub fn process_new_view(
        &mut self,
        new_view: &NewView,
        validator_set: &Arc<ValidatorSet>,
    ) -> Option<View> {
        let view = new_view.view;
        if view <= self.last_sync_view || view < self.current_view {
            tracing::trace!(%view, current = %self.current_view, "NEW_VIEW: stale");
            return None;
        }
        let state = self
            .pending_new_views
            .entry(view)
            .or_insert_with(|| ValidationState::new(Arc::clone(validator_set)));
        if !state.add(new_view.author, ()) || !state.is_complete() {
            return None;
        }

        self.last_sync_view = view;
        self.pending_new_views = self.pending_new_views.split_off(&view.next());
        self.update_view(view);
        Some(view)
    }

    /// Leave `view` without a timeout, used when this replica will not lead
    /// the next view and has already voted.
    pub fn process_next_view(&mut self, view: View) {
        if view >= self.current_view {
            self.update_view(view.next());
        }
    }

    fn update_view(&mut self, next: View) {
        if next <= self.current_view {
            return;
        }
        self.current_view = next;
        self.pending_new_views = self.pending_new_views.split_off(&next);
        let after = self.config.timeout_for(self.consecutive_timeouts);
        tracing::trace!(view = %next, timeout_ms = after.as_millis() as u64, "Entering view");
        self.timeout_sender.schedule_timeout(
            LocalTimeout {
                epoch: self.epoch,
                view: next,
            },
            after,
        );
    }
}
