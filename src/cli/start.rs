//! Start command.

use clap::Args;
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct StartCmd {
    /// Attach the terminal instead of starting detached.
    #[arg(short, long)]
    pub attach: bool,

    /// Containers to start (name, ID, or unique ID prefix).
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl StartCmd {
    pub async fn run(self, engine: &Engine) -> Result<i32> {
        if self.attach {
            if self.containers.len() > 1 {
                return Err(Error::invalid("--attach takes exactly one container"));
            }
            let code = engine
                .start_foreground(&self.containers[0], false)
                .await?
                .unwrap_or(0);
            return Ok(code);
        }

        for token in &self.containers {
            let record = engine.start_detached(token).await?;
            println!("{}", record.name.as_deref().unwrap_or(record.short_id()));
        }
        Ok(0)
    }
}
