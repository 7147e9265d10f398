//! Pause and unpause commands.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct PauseCmd {
    /// Containers to pause.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl PauseCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        for token in &self.containers {
            engine.pause(token).await?;
            let record = engine.resolve(token)?;
            println!("{}", record.name.as_deref().unwrap_or(record.short_id()));
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct UnpauseCmd {
    /// Containers to unpause.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl UnpauseCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        for token in &self.containers {
            engine.unpause(token).await?;
            let record = engine.resolve(token)?;
            println!("{}", record.name.as_deref().unwrap_or(record.short_id()));
        }
        Ok(())
    }
}
