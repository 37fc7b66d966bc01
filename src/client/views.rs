//! Client-side belief about which replica currently leads each pilot role.

use crate::client::messages::{PilotId, ReplicaId, ViewId};

use rand::seq::SliceRandom;
use rand::Rng;

use tokio::time::{Duration, Instant};

/// Number of pilot roles tracked.
pub const NUM_PILOTS: usize = 2;

/// A view notification or record for one pilot.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct View {
    pub view_id: ViewId,
    pub pilot_id: PilotId,
    pub replica_id: ReplicaId,
    pub active: bool,
}

/// Tracker of the two pilots' views, plus per-pilot GET_VIEW probe
/// bookkeeping. Owned exclusively by its session.
#[derive(Debug)]
pub struct ViewTracker {
    /// Current view records, indexed by pilot ID.
    views: [View; NUM_PILOTS],

    /// When a GET_VIEW probe was last sent out for each pilot.
    last_probe: [Option<Instant>; NUM_PILOTS],

    /// Minimum gap between two probes for the same pilot.
    probe_cooldown: Duration,
}

impl ViewTracker {
    /// Creates a tracker with both pilots active in view 0, led by the given
    /// replicas.
    pub fn new(leaders: [ReplicaId; NUM_PILOTS], probe_cooldown: Duration) -> Self {
        ViewTracker {
            views: [
                View {
                    view_id: 0,
                    pilot_id: 0,
                    replica_id: leaders[0],
                    active: true,
                },
                View {
                    view_id: 0,
                    pilot_id: 1,
                    replica_id: leaders[1],
                    active: true,
                },
            ],
            last_probe: [None; NUM_PILOTS],
            probe_cooldown,
        }
    }

    /// Gets the current view record of a pilot.
    #[inline]
    pub fn view(&self, pilot: usize) -> &View {
        &self.views[pilot]
    }

    /// Returns the believed leader if the pilot is active.
    pub fn active_leader(&self, pilot: usize) -> Option<ReplicaId> {
        let view = &self.views[pilot];
        if view.active {
            Some(view.replica_id)
        } else {
            None
        }
    }

    /// Applies a view-change notification. Only a strictly greater view ID
    /// takes effect; the record is then overwritten and marked active.
    /// Returns whether anything changed.
    pub fn apply(&mut self, update: &View) -> bool {
        let pilot = match usize::try_from(update.pilot_id) {
            Ok(p) if p < NUM_PILOTS => p,
            _ => {
                pf_warn!("view update for invalid pilot {}", update.pilot_id);
                return false;
            }
        };

        let view = &mut self.views[pilot];
        if update.view_id <= view.view_id {
            pf_trace!(
                "stale view for pilot {}: {} <= {}",
                pilot,
                update.view_id,
                view.view_id
            );
            return false;
        }

        pf_info!(
            "new view for pilot {}: view {} replica {}",
            pilot,
            update.view_id,
            update.replica_id
        );
        view.view_id = update.view_id;
        view.replica_id = update.replica_id;
        view.active = true;
        true
    }

    /// Marks a pilot inactive after a failed write to its leader.
    pub fn deactivate(&mut self, pilot: usize) {
        let view = &mut self.views[pilot];
        if view.active {
            pf_debug!(
                "pilot {} leader {} unreachable in view {}",
                pilot,
                view.replica_id,
                view.view_id
            );
        }
        view.active = false;
    }

    /// Whether a GET_VIEW probe for the pilot may be sent at `now`.
    pub fn probe_due(&self, pilot: usize, now: Instant) -> bool {
        match self.last_probe[pilot] {
            None => true,
            Some(sent) => now.duration_since(sent) >= self.probe_cooldown,
        }
    }

    /// Records that a probe for the pilot went out at `now`.
    pub fn probe_sent(&mut self, pilot: usize, now: Instant) {
        self.last_probe[pilot] = Some(now);
    }

    /// Earliest instant at which some inactive pilot becomes eligible for
    /// another probe, if any pilot is inactive.
    pub fn next_probe_due(&self) -> Option<Instant> {
        (0..NUM_PILOTS)
            .filter(|&p| !self.views[p].active)
            .map(|p| match self.last_probe[p] {
                None => Instant::now(),
                Some(sent) => sent + self.probe_cooldown,
            })
            .min()
    }

    /// Candidate replicas to probe about a pilot's view, in the order they
    /// should be tried: uniformly shuffled, excluding the replica whose index
    /// equals the pilot ID.
    pub fn probe_candidates(
        pilot: usize,
        population: usize,
        rng: &mut impl Rng,
    ) -> Vec<usize> {
        let mut candidates: Vec<usize> =
            (0..population).filter(|&r| r != pilot).collect();
        candidates.shuffle(rng);
        candidates
    }
}

#[cfg(test)]
mod views_tests {
    use super::*;

    fn tracker() -> ViewTracker {
        ViewTracker::new([2, 3], Duration::from_secs(60))
    }

    fn update(view_id: ViewId, pilot_id: PilotId, replica_id: ReplicaId) -> View {
        View {
            view_id,
            pilot_id,
            replica_id,
            active: true,
        }
    }

    #[test]
    fn initial_views() {
        let t = tracker();
        assert_eq!(t.active_leader(0), Some(2));
        assert_eq!(t.active_leader(1), Some(3));
        assert_eq!(t.view(1).view_id, 0);
        assert_eq!(t.view(1).pilot_id, 1);
    }

    #[test]
    fn higher_view_reactivates() {
        let mut t = tracker();
        t.deactivate(0);
        assert_eq!(t.active_leader(0), None);
        assert!(t.apply(&update(1, 0, 5)));
        assert_eq!(t.active_leader(0), Some(5));
        assert_eq!(t.view(0).view_id, 1);
        // the other pilot is untouched
        assert_eq!(t.active_leader(1), Some(3));
    }

    #[test]
    fn higher_view_bumps_active() {
        let mut t = tracker();
        assert!(t.apply(&update(4, 1, 0)));
        assert_eq!(t.active_leader(1), Some(0));
        assert_eq!(t.view(1).view_id, 4);
    }

    #[test]
    fn lower_view_ignored() {
        let mut t = tracker();
        assert!(t.apply(&update(6, 1, 4)));
        let before = *t.view(1);
        assert!(!t.apply(&update(3, 1, 1)));
        assert_eq!(*t.view(1), before);
    }

    #[test]
    fn equal_view_ignored_even_if_inactive() {
        let mut t = tracker();
        assert!(t.apply(&update(2, 0, 4)));
        t.deactivate(0);
        assert!(!t.apply(&update(2, 0, 1)));
        assert_eq!(t.view(0).replica_id, 4);
        assert!(!t.view(0).active);
    }

    #[test]
    fn out_of_order_updates_monotonic() {
        let mut t = tracker();
        for (vid, rid) in [(3, 1), (1, 4), (5, 0), (2, 2), (5, 3), (4, 5)] {
            t.apply(&update(vid, 0, rid));
        }
        assert_eq!(t.view(0).view_id, 5);
        assert_eq!(t.view(0).replica_id, 0);
    }

    #[test]
    fn invalid_pilot_ignored() {
        let mut t = tracker();
        assert!(!t.apply(&update(9, 2, 1)));
        assert!(!t.apply(&update(9, -1, 1)));
        assert_eq!(t.view(0).view_id, 0);
        assert_eq!(t.view(1).view_id, 0);
    }

    #[test]
    fn probe_cooldown() {
        let mut t = ViewTracker::new([0, 1], Duration::from_millis(500));
        let now = Instant::now();
        assert!(t.probe_due(1, now));
        t.probe_sent(1, now);
        assert!(!t.probe_due(1, now + Duration::from_millis(499)));
        assert!(t.probe_due(1, now + Duration::from_millis(500)));
        // cooldown is per pilot
        assert!(t.probe_due(0, now));
    }

    #[test]
    fn next_probe_due_only_inactive() {
        let mut t = ViewTracker::new([0, 1], Duration::from_millis(500));
        assert_eq!(t.next_probe_due(), None);
        let now = Instant::now();
        t.deactivate(1);
        t.probe_sent(1, now);
        assert_eq!(t.next_probe_due(), Some(now + Duration::from_millis(500)));
    }

    #[test]
    fn probe_candidates_exclude_pilot_index() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let c = ViewTracker::probe_candidates(0, 5, &mut rng);
            assert_eq!(c.len(), 4);
            assert!(!c.contains(&0));
            let c = ViewTracker::probe_candidates(1, 5, &mut rng);
            assert!(!c.contains(&1));
        }
        assert!(ViewTracker::probe_candidates(0, 1, &mut rng).is_empty());
    }
}
