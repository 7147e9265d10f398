//! Compose commands.

use clap::{Args, Subcommand};
use cradle::compose::{Driver, Project};
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;
use cradle::logging::{self, ReadOpts};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ComposeCmd {
    /// Compose file.
    #[arg(short, long, default_value = "compose.yaml")]
    pub file: PathBuf,

    /// Project name (defaults to the file's `name:` or its directory).
    #[arg(short, long = "project-name")]
    pub project_name: Option<String>,

    #[command(subcommand)]
    pub action: ComposeAction,
}

#[derive(Subcommand, Debug)]
pub enum ComposeAction {
    /// Create and start the project's containers.
    Up(UpCmd),

    /// Stop and remove the project's containers and networks.
    Down(DownCmd),

    /// List the project's containers.
    Ps,

    /// Show project logs.
    Logs(ComposeLogsCmd),

    /// Print the validated project configuration.
    Config(ConfigCmd),

    /// Pull every service image.
    Pull,

    /// Push every service image to its registry.
    Push,

    /// Signal the project's running containers.
    Kill(ComposeKillCmd),
}

#[derive(Args, Debug)]
pub struct UpCmd {
    /// Start detached instead of streaming logs.
    #[arg(short, long)]
    pub detach: bool,

    /// Replica count override (service=N).
    #[arg(long)]
    pub scale: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DownCmd {
    /// Also remove the project's volumes.
    #[arg(short, long)]
    pub volumes: bool,
}

#[derive(Args, Debug)]
pub struct ComposeLogsCmd {
    /// Stream new entries until interrupted.
    #[arg(short, long)]
    pub follow: bool,

    /// Prefix each line with its timestamp.
    #[arg(short, long)]
    pub timestamps: bool,

    /// Suppress the service-name prefix.
    #[arg(long = "no-log-prefix")]
    pub no_log_prefix: bool,

    /// Show entries since a timestamp or duration.
    #[arg(long)]
    pub since: Option<String>,

    /// Only the last N lines per container.
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ConfigCmd {
    /// Print per-service configuration hashes instead.
    #[arg(long)]
    pub hash: bool,
}

#[derive(Args, Debug)]
pub struct ComposeKillCmd {
    /// Signal to send (name or number).
    #[arg(short, long, default_value = "KILL")]
    pub signal: String,
}

impl ComposeCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let project = Project::load(&self.file, self.project_name.as_deref())?;
        let driver = Driver::new(engine, project);

        match self.action {
            ComposeAction::Up(cmd) => {
                let scale = parse_scale(&cmd.scale)?;
                driver.up(&scale).await?;
                if !cmd.detach {
                    driver
                        .logs(ReadOpts::default(), true, false, false)
                        .await?;
                }
                Ok(())
            }
            ComposeAction::Down(cmd) => driver.down(cmd.volumes).await,
            ComposeAction::Ps => {
                println!("{:<28} {:<16} {:<12} IMAGE", "NAME", "SERVICE", "STATUS");
                for record in driver.containers()? {
                    println!(
                        "{:<28} {:<16} {:<12} {}",
                        record.name.as_deref().unwrap_or(record.short_id()),
                        record
                            .labels
                            .get(cradle::compose::SERVICE_LABEL)
                            .map(String::as_str)
                            .unwrap_or("-"),
                        record.status,
                        record.image.as_deref().unwrap_or("-"),
                    );
                }
                Ok(())
            }
            ComposeAction::Logs(cmd) => {
                let now = chrono::Utc::now();
                let opts = ReadOpts {
                    tail: cmd.tail,
                    since: cmd
                        .since
                        .as_deref()
                        .map(|s| logging::parse_time_filter(s, now))
                        .transpose()?,
                    until: None,
                };
                driver
                    .logs(opts, cmd.follow, cmd.timestamps, cmd.no_log_prefix)
                    .await
            }
            ComposeAction::Config(cmd) => {
                print!("{}", driver.config(cmd.hash)?);
                Ok(())
            }
            ComposeAction::Pull => driver.pull().await,
            ComposeAction::Push => driver.push().await,
            ComposeAction::Kill(cmd) => driver.kill(&cmd.signal).await,
        }
    }
}

fn parse_scale(items: &[String]) -> Result<BTreeMap<String, usize>> {
    let mut scale = BTreeMap::new();
    for item in items {
        let (svc, n) = item
            .split_once('=')
            .ok_or_else(|| Error::invalid(format!("invalid --scale {:?}: expected service=N", item)))?;
        let n: usize = n
            .parse()
            .map_err(|_| Error::invalid(format!("invalid --scale count {:?}", n)))?;
        scale.insert(svc.to_string(), n);
    }
    Ok(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scale() {
        let scale = parse_scale(&["web=3".to_string()]).unwrap();
        assert_eq!(scale.get("web"), Some(&3));
        assert!(parse_scale(&["web".to_string()]).is_err());
        assert!(parse_scale(&["web=many".to_string()]).is_err());
    }
}
