//! Wait command: block until containers exit and print their codes.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct WaitCmd {
    /// Containers to wait for.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

impl WaitCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        for token in &self.containers {
            let code = engine.wait(token).await?;
            println!("{}", code);
        }
        Ok(())
    }
}
