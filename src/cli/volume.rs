//! Volume management commands.

use clap::{Args, Subcommand};
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;
use std::collections::BTreeMap;

#[derive(Subcommand, Debug)]
pub enum VolumeCmd {
    /// Create a volume.
    Create(VolumeCreateCmd),

    /// List volumes.
    #[command(alias = "ls")]
    List(VolumeListCmd),

    /// Remove volumes.
    #[command(alias = "rm")]
    Remove(VolumeRemoveCmd),

    /// Show volumes as JSON.
    Inspect(VolumeInspectCmd),
}

impl VolumeCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        match self {
            VolumeCmd::Create(cmd) => cmd.run(engine),
            VolumeCmd::List(cmd) => cmd.run(engine),
            VolumeCmd::Remove(cmd) => cmd.run(engine),
            VolumeCmd::Inspect(cmd) => cmd.run(engine),
        }
    }
}

#[derive(Args, Debug)]
pub struct VolumeCreateCmd {
    /// Set a label (key=value).
    #[arg(short = 'l', long = "label")]
    pub label: Vec<String>,

    /// Volume name.
    pub name: String,
}

impl VolumeCreateCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let mut labels = BTreeMap::new();
        for item in &self.label {
            let (k, v) = item.split_once('=').ok_or_else(|| {
                Error::invalid(format!("invalid label {:?}: expected key=value", item))
            })?;
            labels.insert(k.to_string(), v.to_string());
        }
        let volume = engine.volumes.create(&self.name, labels)?;
        println!("{}", volume.name);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct VolumeListCmd {
    /// Only print volume names.
    #[arg(short, long)]
    pub quiet: bool,
}

impl VolumeListCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let volumes = engine.volumes.list()?;
        if self.quiet {
            for v in volumes {
                println!("{}", v.name);
            }
            return Ok(());
        }
        println!("{:<40} MOUNTPOINT", "VOLUME NAME");
        for v in volumes {
            println!("{:<40} {}", v.name, v.mountpoint.display());
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct VolumeRemoveCmd {
    /// Volumes to remove.
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl VolumeRemoveCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let records = engine.store.list_records()?;
        for name in &self.names {
            let in_use = records.iter().any(|r| {
                r.named_volumes.iter().any(|v| v == name)
                    || r.anonymous_volumes.iter().any(|v| v == name)
            });
            engine.volumes.remove(name, in_use)?;
            println!("{}", name);
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct VolumeInspectCmd {
    /// Volumes to inspect.
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl VolumeInspectCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let mut views = Vec::new();
        for name in &self.names {
            let volume = engine
                .volumes
                .get(name)?
                .ok_or_else(|| Error::Volume(format!("no such volume: {}", name)))?;
            views.push(volume);
        }
        println!("{}", serde_json::to_string_pretty(&views)?);
        Ok(())
    }
}
