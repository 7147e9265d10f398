//! Hidden plumbing commands. Not part of the user-facing surface.

use clap::{Args, Subcommand};
use cradle::error::Result;
use cradle::lifecycle::{supervisor, Engine};

#[derive(Subcommand, Debug)]
pub enum InternalCmd {
    /// Supervise a detached container: drain logs, apply restart policy.
    Supervise(SuperviseCmd),
}

impl InternalCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        match self {
            InternalCmd::Supervise(cmd) => supervisor::supervise(engine, &cmd.id).await,
        }
    }
}

#[derive(Args, Debug)]
pub struct SuperviseCmd {
    /// Full container ID.
    pub id: String,
}
