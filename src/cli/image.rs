//! Image commands: pull, list, tag, remove.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;
use cradle::resolver;

#[derive(Args, Debug)]
pub struct PullCmd {
    /// Image reference to pull.
    pub image: String,
}

impl PullCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        engine.runtime.pull_image(&self.image).await?;
        println!("{}", self.image);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ImagesCmd {
    /// Only print image names.
    #[arg(short, long)]
    pub quiet: bool,
}

impl ImagesCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let mut images = engine.runtime.list_images().await?;
        images.sort_by(|a, b| a.name.cmp(&b.name));

        if self.quiet {
            for img in images {
                println!("{}", img.name);
            }
            return Ok(());
        }
        println!("{:<48} DIGEST", "REPOSITORY");
        for img in images {
            let hex = img.digest_hex();
            println!("{:<48} {}", img.name, &hex[..12.min(hex.len())]);
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct TagCmd {
    /// Existing image reference.
    pub source: String,

    /// New reference pointing at the same content.
    pub target: String,
}

impl TagCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let images = engine.runtime.list_images().await?;
        let source = resolver::resolve_image(&images, &self.source)?;
        engine.runtime.tag_image(&source.name, &self.target).await
    }
}

#[derive(Args, Debug)]
pub struct RmiCmd {
    /// Images to remove.
    #[arg(required = true)]
    pub images: Vec<String>,
}

impl RmiCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let known = engine.runtime.list_images().await?;
        for token in &self.images {
            let image = resolver::resolve_image(&known, token)?;
            engine.runtime.remove_image(&image.name).await?;
            println!("Untagged: {}", image.name);
        }
        Ok(())
    }
}
