//! Network management commands.

use clap::{Args, Subcommand};
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;
use cradle::net::CreateNetworkOpts;
use std::collections::BTreeMap;

#[derive(Subcommand, Debug)]
pub enum NetworkCmd {
    /// Create a network.
    Create(NetworkCreateCmd),

    /// List networks.
    #[command(alias = "ls")]
    List(NetworkListCmd),

    /// Remove networks.
    #[command(alias = "rm")]
    Remove(NetworkRemoveCmd),

    /// Show network configuration as JSON.
    Inspect(NetworkInspectCmd),
}

impl NetworkCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        match self {
            NetworkCmd::Create(cmd) => cmd.run(engine),
            NetworkCmd::List(cmd) => cmd.run(engine),
            NetworkCmd::Remove(cmd) => cmd.run(engine),
            NetworkCmd::Inspect(cmd) => cmd.run(engine),
        }
    }
}

#[derive(Args, Debug)]
pub struct NetworkCreateCmd {
    /// Subnet in CIDR form (allocated from the pool when omitted).
    #[arg(long)]
    pub subnet: Option<String>,

    /// Gateway address (requires --subnet).
    #[arg(long)]
    pub gateway: Option<String>,

    /// Set a label (key=value).
    #[arg(short = 'l', long = "label")]
    pub label: Vec<String>,

    /// Network name.
    pub name: String,
}

impl NetworkCreateCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let mut labels = BTreeMap::new();
        for item in &self.label {
            let (k, v) = item.split_once('=').ok_or_else(|| {
                Error::invalid(format!("invalid label {:?}: expected key=value", item))
            })?;
            labels.insert(k.to_string(), v.to_string());
        }
        let opts = CreateNetworkOpts {
            subnet: self.subnet,
            gateway: self.gateway,
            labels,
        };
        let cfg = engine.networks.create(&self.name, &opts)?;
        println!("{}", cfg.name);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct NetworkListCmd {
    /// Only print network names.
    #[arg(short, long)]
    pub quiet: bool,
}

impl NetworkListCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let networks = engine.networks.list()?;
        if self.quiet {
            for net in networks {
                println!("{}", net.name);
            }
            return Ok(());
        }
        println!("{:<20} {:<20} SUBNETS", "NAME", "ID");
        for net in networks {
            let id = net.id.as_deref().map(|i| &i[..12.min(i.len())]).unwrap_or("-");
            println!("{:<20} {:<20} {}", net.name, id, net.subnets.join(", "));
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct NetworkRemoveCmd {
    /// Networks to remove.
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl NetworkRemoveCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let records = engine.store.list_records()?;
        for name in &self.names {
            let in_use = records
                .iter()
                .any(|r| r.network_names().any(|n| n == name));
            engine.networks.remove(name, in_use)?;
            println!("{}", name);
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct NetworkInspectCmd {
    /// Networks to inspect.
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl NetworkInspectCmd {
    fn run(self, engine: &Engine) -> Result<()> {
        let mut views = Vec::new();
        for name in &self.names {
            let net = engine.networks.get(name)?;
            views.push(serde_json::json!({
                "name": net.name,
                "id": net.id,
                "labels": net.labels,
                "file": net.file,
                "subnets": net.subnets,
                "config": net.doc,
            }));
        }
        println!("{}", serde_json::to_string_pretty(&views)?);
        Ok(())
    }
}
