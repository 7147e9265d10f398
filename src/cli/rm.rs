//! Remove command.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct RmCmd {
    /// Kill a running container before removing it.
    #[arg(short, long)]
    pub force: bool,

    /// Also remove the container's anonymous volumes.
    #[arg(short, long)]
    pub volumes: bool,

    /// Containers to remove.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl RmCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        for token in &self.containers {
            let record = engine.resolve(token)?;
            engine.remove(&record.id, self.force, self.volumes).await?;
            println!("{}", record.name.as_deref().unwrap_or(record.short_id()));
        }
        Ok(())
    }
}
