// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Debug bundle export for a diverged frame.
//!
//! Runs on the main thread, only on request, after a desync has already
//! been reported. Every step is best-effort: a failed restore or a missing
//! history entry is recorded and the exporter moves on. Nothing in here may
//! take the game down.
//!
//! The dump is hand-formatted JSONL — one object per line. `serde_json` is
//! banned in this crate because its output is not part of any determinism
//! boundary we want to freeze; manual formatting keeps the dependency
//! surface of the core unchanged.

use std::fmt::Write as _;

use crate::engine::Engine;
use crate::hash::HASH_HISTORY_FRAMES;

/// Frames of per-system hash context included before the target frame.
const PER_SYSTEM_CONTEXT: u64 = 9;
/// Frames of input history included before the target frame.
const INPUT_CONTEXT: u64 = 20;

/// Everything collected for one diverged frame.
#[derive(Debug, Clone)]
pub struct DebugBundle {
    /// Frame the bundle targets.
    pub frame: u64,
    /// Whether the snapshot ring still covered the frame and restore
    /// succeeded.
    pub restore_ok: bool,
    /// JSONL dump: header, tables, systems, hashes, inputs.
    pub jsonl: String,
}

/// Collect the diagnostic bundle for `frame`.
///
/// Steps, in order, each skipped on failure without aborting the rest:
/// 1. attempt a restore to `frame` (recorded in `restore_ok`),
/// 2. JSON dump of every table,
/// 3. system-name list and per-system hashes for the preceding frames,
/// 4. input history and frame-hash history.
pub fn export_debug_bundle(engine: &mut Engine, frame: u64) -> DebugBundle {
    let restore_ok = engine.try_restore_exact(frame);

    let mut jsonl = String::new();
    let _ = writeln!(
        jsonl,
        r#"{{"kind":"header","frame":{},"restore_ok":{},"schema_digest":{},"player_count":{}}}"#,
        frame,
        restore_ok,
        engine.world().schema_digest(),
        engine.config().player_count
    );

    // Table dumps reflect the restored state when the restore succeeded,
    // otherwise whatever state the engine was left in; the header records
    // which of the two the reader is looking at.
    for table in engine.world().tables() {
        table.dump_json(&mut jsonl);
        jsonl.push('\n');
    }

    let names = engine.system_names();
    let _ = write!(jsonl, r#"{{"kind":"systems","names":["#);
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            jsonl.push(',');
        }
        let _ = write!(jsonl, r#""{name}""#);
    }
    jsonl.push_str("]}\n");

    for f in frame.saturating_sub(PER_SYSTEM_CONTEXT)..=frame {
        if let Some(hashes) = engine.per_system_hashes(f) {
            let _ = write!(jsonl, r#"{{"kind":"per_system_hashes","frame":{f},"hashes":["#);
            for (i, h) in hashes.iter().enumerate() {
                if i > 0 {
                    jsonl.push(',');
                }
                let _ = write!(jsonl, r#""{}""#, hex::encode(h.to_le_bytes()));
            }
            jsonl.push_str("]}\n");
        }
    }

    for f in frame.saturating_sub(INPUT_CONTEXT)..=frame {
        for player in 0..engine.config().player_count {
            let p = u8::try_from(player).unwrap_or(0);
            if let Some(input) = engine.input_at(f, p) {
                let _ = writeln!(
                    jsonl,
                    r#"{{"kind":"input","frame":{},"player":{},"bytes":"{}"}}"#,
                    f,
                    p,
                    hex::encode(bytemuck::bytes_of(&input))
                );
            }
        }
    }

    let newest = engine
        .hash_history()
        .latest()
        .map_or(frame, |(f, _)| f.max(frame));
    for (f, h) in engine.hash_history().tail(newest, HASH_HISTORY_FRAMES.min(60)) {
        let _ = writeln!(
            jsonl,
            r#"{{"kind":"frame_hash","frame":{},"hash":"{}"}}"#,
            f,
            hex::encode(h.to_le_bytes())
        );
    }

    DebugBundle {
        frame,
        restore_ok,
        jsonl,
    }
}
