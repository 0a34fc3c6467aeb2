// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Desync detection: comparing remote frame hashes against local history.
//!
//! Ordering rule: a desync at frame `d` is reported only after the local
//! hash for `d` has been finalised. A remote hash arriving before local
//! execution reaches `d` is parked and re-checked once the history catches
//! up.
//!
//! The detector commits to a single "first desync" per match; later
//! divergences are ignored until [`DesyncDetector::reset`].
//!
//! Concurrency: every method takes `&self`; the internal state sits behind
//! mutexes so a background comparison task may feed the detector while the
//! main thread polls the single-slot mailbox each tick. In the in-loop
//! configuration the same thread does both and the locks are uncontended.

use std::sync::Mutex;

use crate::hash::HashHistory;

/// First observed divergence for a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesyncInfo {
    /// Frame whose hashes differ.
    pub frame: u64,
    /// Hash this peer computed.
    pub local_hash: u64,
    /// Hash the remote peer reported.
    pub remote_hash: u64,
    /// Player id of the diverging peer.
    pub remote_player: u8,
}

#[derive(Default)]
struct Inner {
    /// Remote hashes waiting for local execution to reach their frame.
    parked: Vec<(u8, u64, u64)>,
    /// Set once the first desync has been reported.
    latched: bool,
}

/// Hash comparison with parking and a single-slot mailbox.
#[derive(Default)]
pub struct DesyncDetector {
    inner: Mutex<Inner>,
    mailbox: Mutex<Option<DesyncInfo>>,
}

impl DesyncDetector {
    /// Fresh detector with an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one remote `(player, frame, hash)` tuple, comparing it against
    /// local history or parking it until the local hash exists.
    pub fn submit_remote_hash(&self, player: u8, frame: u64, hash: u64, history: &HashHistory) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.latched {
            return;
        }
        match history.get(frame) {
            Some(local) => self.compare(&mut inner, player, frame, local, hash),
            None => {
                let finalised = history.latest().is_some_and(|(lf, _)| lf >= frame);
                if finalised {
                    // The frame left retention unverified; nothing to compare
                    // against any more.
                    return;
                }
                inner.parked.push((player, frame, hash));
            }
        }
    }

    /// Re-check parked hashes whose frames the local history has reached.
    /// Call once per tick after the frame hash is recorded.
    pub fn drain_parked(&self, history: &HashHistory) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.latched {
            inner.parked.clear();
            return;
        }
        let Some((latest, _)) = history.latest() else {
            return;
        };
        let mut still_parked = Vec::new();
        let pending = std::mem::take(&mut inner.parked);
        for (player, frame, hash) in pending {
            if inner.latched || frame > latest {
                still_parked.push((player, frame, hash));
                continue;
            }
            if let Some(local) = history.get(frame) {
                self.compare(&mut inner, player, frame, local, hash);
            }
        }
        inner.parked = still_parked;
    }

    fn compare(&self, inner: &mut Inner, player: u8, frame: u64, local: u64, remote: u64) {
        if local == remote || inner.latched {
            return;
        }
        inner.latched = true;
        if let Ok(mut slot) = self.mailbox.lock() {
            *slot = Some(DesyncInfo {
                frame,
                local_hash: local,
                remote_hash: remote,
                remote_player: player,
            });
        }
    }

    /// Take the reported desync, if one is waiting. The main thread polls
    /// this once per tick.
    #[must_use]
    pub fn poll(&self) -> Option<DesyncInfo> {
        self.mailbox.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Whether a desync has been reported this match.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.inner.lock().map(|i| i.latched).unwrap_or(false)
    }

    /// Forget everything (match reset).
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.parked.clear();
            inner.latched = false;
        }
        if let Ok(mut slot) = self.mailbox.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with(frames: &[(u64, u64)]) -> HashHistory {
        let mut h = HashHistory::new();
        for &(f, v) in frames {
            h.record(f, v);
        }
        h
    }

    #[test]
    fn matching_hashes_stay_silent() {
        let detector = DesyncDetector::new();
        let history = history_with(&[(50, 123)]);
        detector.submit_remote_hash(1, 50, 123, &history);
        assert_eq!(detector.poll(), None);
        assert!(!detector.is_latched());
    }

    #[test]
    fn first_divergence_is_reported_exactly_once() {
        let detector = DesyncDetector::new();
        let history = history_with(&[(50, 123), (70, 456)]);

        detector.submit_remote_hash(1, 50, 999, &history);
        assert_eq!(
            detector.poll(),
            Some(DesyncInfo {
                frame: 50,
                local_hash: 123,
                remote_hash: 999,
                remote_player: 1,
            })
        );

        // A second divergence is ignored until reset.
        detector.submit_remote_hash(1, 70, 888, &history);
        assert_eq!(detector.poll(), None);

        detector.reset();
        detector.submit_remote_hash(1, 70, 888, &history);
        assert!(detector.poll().is_some());
    }

    #[test]
    fn early_remote_hash_is_parked_until_local_catches_up() {
        let detector = DesyncDetector::new();
        let mut history = history_with(&[(10, 1)]);

        // Frame 12 is ahead of local execution: park it.
        detector.submit_remote_hash(1, 12, 777, &history);
        detector.drain_parked(&history);
        assert_eq!(detector.poll(), None, "nothing to compare yet");

        history.record(11, 2);
        history.record(12, 3);
        detector.drain_parked(&history);
        assert_eq!(
            detector.poll(),
            Some(DesyncInfo {
                frame: 12,
                local_hash: 3,
                remote_hash: 777,
                remote_player: 1,
            })
        );
    }

    #[test]
    fn parked_match_resolves_silently() {
        let detector = DesyncDetector::new();
        let mut history = history_with(&[(10, 1)]);
        detector.submit_remote_hash(1, 12, 3, &history);
        history.record(11, 2);
        history.record(12, 3);
        detector.drain_parked(&history);
        assert_eq!(detector.poll(), None);
        assert!(!detector.is_latched());
    }
}
