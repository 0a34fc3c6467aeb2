// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tempo-session: the match around the engine.
//!
//! Owns the coarse phase machine (`Lobby -> Loading -> Countdown -> InMatch
//! -> GameOver`), the mailbox between transport and the input ring, peer
//! liveness, and the desync-to-exporter flow. Only `InMatch` engages the
//! rollback loop; every other phase drains incoming messages and skips
//! systems.
//!
//! Concurrency: the session is single-threaded. Transport hands datagrams
//! in between ticks via [`MatchSession::receive_datagram`]; they are queued
//! and flushed into the engine at the next tick boundary. Outgoing messages
//! accumulate until the driver drains them, also between ticks.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, info, warn};

use tempo_core::{
    export_debug_bundle, DebugBundle, DesyncDetector, DesyncInfo, Engine, InputError, PlayerInput,
    TickFault, MAX_PLAYERS,
};
use tempo_proto::{decode_datagram, encode_datagram, HashMsg, InputMsg, Msg};

/// Pending remote inputs kept between ticks. Bounded; overflow drops the
/// oldest frame in favour of newer traffic.
const PENDING_INPUT_CAP: usize = 256;
/// Pending remote hashes kept between ticks.
const PENDING_HASH_CAP: usize = 256;

/// Session tunables on top of the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Frames of silence after which a peer counts as timed out.
    pub peer_timeout_frames: u64,
    /// Countdown length before the rollback loop engages.
    pub countdown_frames: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_timeout_frames: 300,
            countdown_frames: 180,
        }
    }
}

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOverReason {
    /// Cross-peer divergence (or a rollback past budget, which is surfaced
    /// the same way).
    Desync {
        /// Frame the divergence was pinned to.
        frame: u64,
    },
    /// A match-scoped engine fault other than desync.
    Fault,
    /// The match ran to its natural end.
    Finished,
}

/// Coarse match phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Waiting for peers; nothing simulates.
    Lobby,
    /// Assets and state are being prepared.
    Loading,
    /// Fixed-length countdown; inputs drain, systems skip.
    Countdown {
        /// Frames left before `InMatch`.
        remaining: u32,
    },
    /// The rollback loop is live.
    InMatch,
    /// Terminal; the replay stays on disk for reproduction.
    GameOver {
        /// Why the match ended.
        reason: GameOverReason,
    },
}

/// Events surfaced to the embedding layer after each tick.
#[derive(Debug)]
pub enum SessionEvent {
    /// The phase changed (also emitted for `GameOver`).
    PhaseChanged(MatchPhase),
    /// First divergence of the match.
    Desync(DesyncInfo),
    /// A match-scoped engine fault.
    Fault(TickFault),
    /// A peer has been silent past the timeout.
    PeerTimeout {
        /// The silent peer.
        player: u8,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct PeerState {
    connected: bool,
    last_seen_frame: u64,
    timed_out: bool,
}

/// The match session.
pub struct MatchSession {
    engine: Engine,
    detector: DesyncDetector,
    phase: MatchPhase,
    cfg: SessionConfig,
    pending_inputs: Vec<InputMsg>,
    pending_hashes: Vec<HashMsg>,
    outgoing: VecDeque<Bytes>,
    peers: [PeerState; MAX_PLAYERS],
    last_bundle: Option<DebugBundle>,
}

impl MatchSession {
    /// Wrap an engine in a fresh lobby-phase session.
    #[must_use]
    pub fn new(engine: Engine, cfg: SessionConfig) -> Self {
        let mut peers = [PeerState::default(); MAX_PLAYERS];
        for (slot, peer) in peers
            .iter_mut()
            .enumerate()
            .take(engine.config().player_count)
        {
            peer.connected = slot != usize::from(engine.config().local_player);
        }
        Self {
            engine,
            detector: DesyncDetector::new(),
            phase: MatchPhase::Lobby,
            cfg,
            pending_inputs: Vec::new(),
            pending_hashes: Vec::new(),
            outgoing: VecDeque::new(),
            peers,
            last_bundle: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// The wrapped engine (read access for observers and recorders).
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The most recent diagnostic bundle, if a desync occurred. The
    /// bug-report adapter uploads and clears it.
    pub fn take_debug_bundle(&mut self) -> Option<DebugBundle> {
        self.last_bundle.take()
    }

    /// Advance `Lobby -> Loading` once peers are assembled.
    pub fn begin_loading(&mut self) {
        if self.phase == MatchPhase::Lobby {
            self.set_phase(MatchPhase::Loading);
        }
    }

    /// Advance `Loading -> Countdown` once state is prepared.
    pub fn finish_loading(&mut self) {
        if self.phase == MatchPhase::Loading {
            self.set_phase(MatchPhase::Countdown {
                remaining: self.cfg.countdown_frames,
            });
        }
    }

    /// Concede or complete the match.
    pub fn finish_match(&mut self) {
        self.set_phase(MatchPhase::GameOver {
            reason: GameOverReason::Finished,
        });
    }

    fn set_phase(&mut self, phase: MatchPhase) {
        if self.phase != phase {
            info!(?phase, "session phase change");
            self.phase = phase;
        }
    }

    // ── Boundary: local input ───────────────────────────────────

    /// Capture local input. In `InMatch` it is scheduled with the input
    /// delay, broadcast to peers, and the scheduled frame returned. In any
    /// other phase the input is drained and `None` returned.
    pub fn submit_local_input(&mut self, input: PlayerInput) -> Option<u64> {
        if self.phase != MatchPhase::InMatch {
            return None;
        }
        match self.engine.submit_local_input(input) {
            Ok(frame) => {
                let msg = Msg::Input(InputMsg {
                    player: self.engine.config().local_player,
                    frame: u32::try_from(frame).unwrap_or(u32::MAX),
                    input,
                });
                self.outgoing.push_back(Bytes::from(encode_datagram(&msg)));
                Some(frame)
            }
            Err(err) => {
                warn!(%err, "local input rejected");
                None
            }
        }
    }

    // ── Boundary: transport ─────────────────────────────────────

    /// Accept one datagram from transport. Malformed datagrams are logged
    /// and dropped; the match continues.
    pub fn receive_datagram(&mut self, bytes: &[u8]) {
        match decode_datagram(bytes) {
            Ok(Msg::Input(msg)) => {
                self.submit_remote_input(msg.player, msg.frame, msg.input);
            }
            Ok(Msg::Hash(msg)) => {
                self.submit_remote_hash(msg.player, msg.frame, msg.hash);
            }
            Err(err) => warn!(%err, "dropping malformed datagram"),
        }
    }

    /// Queue a remote player's confirmed input for the next tick boundary.
    pub fn submit_remote_input(&mut self, player: u8, frame: u32, input: PlayerInput) {
        self.mark_seen(player);
        self.queue_input(InputMsg {
            player,
            frame,
            input,
        });
    }

    /// Queue a remote player's frame hash for desync comparison.
    pub fn submit_remote_hash(&mut self, player: u8, frame: u32, hash: u64) {
        self.mark_seen(player);
        self.queue_hash(HashMsg {
            player,
            frame,
            hash,
        });
    }

    fn mark_seen(&mut self, player: u8) {
        if let Some(peer) = self.peers.get_mut(usize::from(player)) {
            peer.last_seen_frame = self.engine.current_frame();
            peer.timed_out = false;
        }
    }

    /// Queue a remote input with last-writer-wins per `(player, frame)`.
    /// When the queue overruns, the oldest frame is discarded in favour of
    /// newer traffic; an older-than-everything arrival is dropped outright.
    fn queue_input(&mut self, msg: InputMsg) {
        if let Some(slot) = self
            .pending_inputs
            .iter_mut()
            .find(|m| m.player == msg.player && m.frame == msg.frame)
        {
            *slot = msg;
            return;
        }
        if self.pending_inputs.len() == PENDING_INPUT_CAP {
            let Some(oldest) = self
                .pending_inputs
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.frame)
                .map(|(i, _)| i)
            else {
                return;
            };
            if self.pending_inputs[oldest].frame >= msg.frame {
                debug!(frame = msg.frame, "input queue overrun; dropping arrival");
                return;
            }
            debug!(
                dropped = self.pending_inputs[oldest].frame,
                "input queue overrun; dropping oldest"
            );
            self.pending_inputs.swap_remove(oldest);
        }
        self.pending_inputs.push(msg);
    }

    fn queue_hash(&mut self, msg: HashMsg) {
        if let Some(slot) = self
            .pending_hashes
            .iter_mut()
            .find(|m| m.player == msg.player && m.frame == msg.frame)
        {
            *slot = msg;
            return;
        }
        if self.pending_hashes.len() == PENDING_HASH_CAP {
            let Some(oldest) = self
                .pending_hashes
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.frame)
                .map(|(i, _)| i)
            else {
                return;
            };
            if self.pending_hashes[oldest].frame >= msg.frame {
                return;
            }
            self.pending_hashes.swap_remove(oldest);
        }
        self.pending_hashes.push(msg);
    }

    /// Drain everything queued for transport.
    pub fn take_outgoing_messages(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.outgoing.drain(..)
    }

    // ── The per-frame step ──────────────────────────────────────

    /// One session step: flush mailboxes, advance the phase machine, run
    /// the engine when in match, compare hashes, surface events.
    pub fn tick(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        self.flush_pending_inputs(&mut events);

        match self.phase {
            MatchPhase::Lobby | MatchPhase::Loading | MatchPhase::GameOver { .. } => {}
            MatchPhase::Countdown { remaining } => {
                if remaining <= 1 {
                    self.set_phase(MatchPhase::InMatch);
                    events.push(SessionEvent::PhaseChanged(MatchPhase::InMatch));
                } else {
                    self.phase = MatchPhase::Countdown {
                        remaining: remaining - 1,
                    };
                }
            }
            MatchPhase::InMatch => {
                self.step_match(&mut events);
            }
        }

        events
    }

    fn flush_pending_inputs(&mut self, events: &mut Vec<SessionEvent>) {
        // Outside the match, inputs drain without reaching the ring.
        if self.phase != MatchPhase::InMatch {
            self.pending_inputs.clear();
            return;
        }
        let pending = std::mem::take(&mut self.pending_inputs);
        for msg in pending {
            let result =
                self.engine
                    .submit_remote_input(msg.player, u64::from(msg.frame), msg.input);
            match result {
                Ok(()) => {}
                Err(err @ InputError::FutureInput { .. }) => {
                    // Beyond lookahead: keep it for a later flush instead of
                    // making the peer resend.
                    debug!(%err, "parking future input");
                    self.pending_inputs.push(msg);
                }
                Err(err @ InputError::Expired { .. }) => {
                    // A confirmed input the ring can no longer honour is a
                    // lost timeline: surface it like a budget overrun.
                    warn!(%err, "confirmed input expired; hard desync");
                    self.fail_match(
                        TickFault::SnapshotMiss(u64::from(msg.frame)),
                        u64::from(msg.frame),
                        events,
                    );
                    return;
                }
                Err(err) => warn!(%err, "dropping remote input"),
            }
        }
    }

    fn step_match(&mut self, events: &mut Vec<SessionEvent>) {
        match self.engine.tick() {
            Ok(outcome) => {
                let msg = Msg::Hash(HashMsg {
                    player: self.engine.config().local_player,
                    frame: u32::try_from(outcome.frame()).unwrap_or(u32::MAX),
                    hash: outcome.hash(),
                });
                self.outgoing.push_back(Bytes::from(encode_datagram(&msg)));
            }
            Err(fault) => {
                let frame = self.engine.current_frame();
                self.fail_match(fault, frame, events);
                return;
            }
        }

        self.compare_hashes(events);
        self.check_peer_timeouts(events);
    }

    /// Feed remote hashes whose frames are fully confirmed locally into the
    /// detector; park the rest for a later tick.
    fn compare_hashes(&mut self, events: &mut Vec<SessionEvent>) {
        let frontier = self.engine.confirmed_frontier();
        let pending = std::mem::take(&mut self.pending_hashes);
        for msg in pending {
            let comparable = frontier.is_some_and(|g| u64::from(msg.frame) <= g);
            if comparable {
                self.detector.submit_remote_hash(
                    msg.player,
                    u64::from(msg.frame),
                    msg.hash,
                    self.engine.hash_history(),
                );
            } else {
                self.pending_hashes.push(msg);
            }
        }
        self.detector.drain_parked(self.engine.hash_history());

        if let Some(info) = self.detector.poll() {
            info!(
                frame = info.frame,
                local = format_args!("{:#018x}", info.local_hash),
                remote = format_args!("{:#018x}", info.remote_hash),
                player = info.remote_player,
                "desync detected"
            );
            // Diagnostic per-system resimulation, then the bundle. Both are
            // best-effort on an already-lost match.
            let _ = self.engine.resimulate_with_system_hashes(info.frame);
            self.last_bundle = Some(export_debug_bundle(&mut self.engine, info.frame));
            events.push(SessionEvent::Desync(info));
            self.set_phase(MatchPhase::GameOver {
                reason: GameOverReason::Desync { frame: info.frame },
            });
            events.push(SessionEvent::PhaseChanged(self.phase));
        }
    }

    fn fail_match(&mut self, fault: TickFault, frame: u64, events: &mut Vec<SessionEvent>) {
        warn!(%fault, frame, "match-scoped fault; exporting and stopping");
        self.last_bundle = Some(export_debug_bundle(&mut self.engine, frame));
        events.push(SessionEvent::Fault(fault));
        let reason = match fault {
            TickFault::RollbackBudgetExceeded { .. } | TickFault::SnapshotMiss(_) => {
                GameOverReason::Desync { frame }
            }
            TickFault::Snapshot(_) | TickFault::CommandOverflow { .. } => GameOverReason::Fault,
        };
        self.set_phase(MatchPhase::GameOver { reason });
        events.push(SessionEvent::PhaseChanged(self.phase));
    }

    fn check_peer_timeouts(&mut self, events: &mut Vec<SessionEvent>) {
        let current = self.engine.current_frame();
        for (slot, peer) in self
            .peers
            .iter_mut()
            .enumerate()
            .take(self.engine.config().player_count)
        {
            if !peer.connected || peer.timed_out {
                continue;
            }
            if current.saturating_sub(peer.last_seen_frame) > self.cfg.peer_timeout_frames {
                peer.timed_out = true;
                let player = u8::try_from(slot).unwrap_or(0);
                warn!(player, "peer timed out");
                events.push(SessionEvent::PeerTimeout { player });
            }
        }
    }
}
