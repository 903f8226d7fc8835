//! Command-line interface, parsed with clap.

use std::path::PathBuf;

use advsec_core::job::JobKind;
use clap::{Parser, Subcommand};

/// Launch and follow model-security testing jobs.
#[derive(Debug, Parser)]
#[command(name = "advsec-console", version, about, arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Launch a job and follow it to a terminal state.
    Submit {
        /// Job kind: attack, evaluation, finetuning or batch_test.
        kind: JobKind,

        /// JSON file holding the job parameters.
        params: PathBuf,
    },

    /// Follow an already-running job.
    Watch {
        /// Job kind: attack, evaluation, finetuning or batch_test.
        kind: JobKind,

        job_id: String,
    },

    /// Check that the backend is reachable.
    Health,
}
