// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! CLI entry point for the headless replayer.
//!
//! `tempo-replay <replay_path> [iterations] [--rollback]` — exit 0 when
//! every re-execution reproduces the recorded hashes, non-zero with one
//! diagnostic line otherwise.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tempo_cli::replayer;

/// Validate deterministic re-execution (or rollback equivalence) of a
/// recorded Tempo match.
#[derive(Debug, Parser)]
#[command(name = "tempo-replay", version)]
struct Cli {
    /// Replay file to verify. The `TEMPO_REPLAY` environment variable
    /// overrides this path.
    replay_path: PathBuf,

    /// Number of times to repeat the verification.
    #[arg(default_value_t = 1)]
    iterations: u32,

    /// Deliver remote inputs late to force rollbacks, then verify the
    /// replayed timeline still matches the recorded hashes.
    #[arg(long)]
    rollback: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    replayer::run(&replayer::Request {
        replay_path: cli.replay_path,
        iterations: cli.iterations,
        rollback: cli.rollback,
    })
}
