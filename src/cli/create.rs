//! Create command: register a container without starting it.

use super::flags::ContainerFlags;
use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct CreateCmd {
    #[command(flatten)]
    pub flags: ContainerFlags,

    /// Image reference (or rootfs path with --rootfs).
    pub image: String,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl CreateCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        // A created container is started later, so its stdio defaults to
        // the detached shape.
        let opts = self.flags.to_create_opts(&self.image, &self.command, true)?;
        let record = engine.create(&opts).await?;
        println!("{}", record.id);
        Ok(())
    }
}
