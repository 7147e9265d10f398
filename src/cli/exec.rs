//! Exec command: run a process inside a running container.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::{Engine, ExecOpts};

#[derive(Args, Debug)]
pub struct ExecCmd {
    /// Keep stdin open.
    #[arg(short, long)]
    pub interactive: bool,

    /// Allocate a pseudo-TTY.
    #[arg(short, long)]
    pub tty: bool,

    /// Set an environment variable (KEY=VALUE).
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// User (name or uid, optionally :group).
    #[arg(short, long)]
    pub user: Option<String>,

    /// Container to exec into.
    pub container: String,

    /// Command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl ExecCmd {
    pub async fn run(self, engine: &Engine) -> Result<i32> {
        let opts = ExecOpts {
            args: self.command,
            env: self.env,
            workdir: self.workdir,
            user: self.user,
            tty: self.tty,
            interactive: self.interactive,
        };
        engine.exec(&self.container, &opts).await
    }
}
