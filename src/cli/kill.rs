//! Kill command.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct KillCmd {
    /// Signal to send (name or number).
    #[arg(short, long, default_value = "KILL")]
    pub signal: String,

    /// Containers to signal.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl KillCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        for token in &self.containers {
            engine.kill(token, &self.signal).await?;
            let record = engine.resolve(token)?;
            println!("{}", record.name.as_deref().unwrap_or(record.short_id()));
        }
        Ok(())
    }
}
