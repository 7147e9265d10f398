//! Run command: create a container and start it.

use super::flags::ContainerFlags;
use clap::Args;
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct RunCmd {
    /// Run detached and print the container ID.
    #[arg(short, long)]
    pub detach: bool,

    /// Remove the container after it exits.
    #[arg(long)]
    pub rm: bool,

    #[command(flatten)]
    pub flags: ContainerFlags,

    /// Image reference (or rootfs path with --rootfs).
    pub image: String,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunCmd {
    pub async fn run(self, engine: &Engine) -> Result<i32> {
        if self.detach && self.rm {
            return Err(Error::invalid("--rm cannot be combined with --detach"));
        }
        let opts = self
            .flags
            .to_create_opts(&self.image, &self.command, self.detach)?;
        let record = engine.create(&opts).await?;

        if self.detach {
            let started = engine.start_detached(&record.id).await?;
            println!("{}", started.id);
            return Ok(0);
        }

        match engine.start_foreground(&record.id, self.rm).await? {
            Some(code) => Ok(code),
            // Detached with Ctrl-P Ctrl-Q; the task keeps running.
            None => {
                println!("{}", record.id);
                Ok(0)
            }
        }
    }
}
