//! Stop command.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct StopCmd {
    /// Seconds to wait before SIGKILL (0 kills immediately).
    #[arg(short, long, default_value = "10")]
    pub time: u64,

    /// Containers to stop.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl StopCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        for token in &self.containers {
            engine.stop(token, self.time).await?;
            let record = engine.resolve(token)?;
            println!("{}", record.name.as_deref().unwrap_or(record.short_id()));
        }
        Ok(())
    }
}
