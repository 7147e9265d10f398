//! List containers.

use clap::Args;
use cradle::error::Result;
use cradle::lifecycle::Engine;
use cradle::store::record::{ContainerRecord, ContainerStatus};

#[derive(Args, Debug)]
pub struct PsCmd {
    /// Show all containers, not just running ones.
    #[arg(short, long)]
    pub all: bool,

    /// Only print container IDs.
    #[arg(short, long)]
    pub quiet: bool,

    /// Print full IDs instead of the 12-char form.
    #[arg(long = "no-trunc")]
    pub no_trunc: bool,
}

impl PsCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let records = engine.store.list_records()?;
        let records: Vec<&ContainerRecord> = records
            .iter()
            .filter(|r| {
                self.all
                    || matches!(
                        r.status,
                        ContainerStatus::Running | ContainerStatus::Paused
                    )
            })
            .collect();

        if self.quiet {
            for r in records {
                println!("{}", if self.no_trunc { &r.id } else { r.short_id() });
            }
            return Ok(());
        }

        println!(
            "{:<14} {:<24} {:<16} {:<16} {:<24} NAMES",
            "CONTAINER ID", "IMAGE", "CREATED", "STATUS", "PORTS"
        );
        for r in records {
            let id = if self.no_trunc {
                r.id.clone()
            } else {
                r.short_id().to_string()
            };
            let ports = r
                .ports
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            println!(
                "{:<14} {:<24} {:<16} {:<16} {:<24} {}",
                id,
                r.image.as_deref().unwrap_or("-"),
                ago(r.created_at),
                status_of(r),
                ports,
                r.name.as_deref().unwrap_or(""),
            );
        }
        Ok(())
    }
}

fn status_of(r: &ContainerRecord) -> String {
    match r.status {
        ContainerStatus::Stopped => match r.exit_code {
            Some(code) => format!("Exited ({})", code),
            None => "Stopped".to_string(),
        },
        ContainerStatus::Running => match r.started_at {
            Some(t) => format!("Up {}", ago(t)),
            None => "Up".to_string(),
        },
        ContainerStatus::Paused => "Paused".to_string(),
        ContainerStatus::Created => "Created".to_string(),
    }
}

/// Rough relative age, seconds resolution dropped past a minute.
fn ago(t: chrono::DateTime<chrono::Utc>) -> String {
    let secs = (chrono::Utc::now() - t).num_seconds().max(0) as u64;
    let rounded = match secs {
        0..=59 => secs,
        60..=3599 => secs / 60 * 60,
        3600..=86399 => secs / 3600 * 3600,
        _ => secs / 86400 * 86400,
    };
    format!(
        "{} ago",
        humantime::format_duration(std::time::Duration::from_secs(rounded))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        let mut r = ContainerRecord::new("a".repeat(64), "default");
        assert_eq!(status_of(&r), "Created");
        r.status = ContainerStatus::Stopped;
        r.exit_code = Some(137);
        assert_eq!(status_of(&r), "Exited (137)");
    }

    #[test]
    fn test_running_status_format() {
        let mut r = ContainerRecord::new("b".repeat(64), "default");
        r.status = ContainerStatus::Running;
        r.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
        let re = regex::Regex::new(r"^Up \d+s ago$").unwrap();
        assert!(re.is_match(&status_of(&r)));
    }

    #[test]
    fn test_ago_rounds() {
        let t = chrono::Utc::now() - chrono::Duration::seconds(3700);
        assert_eq!(ago(t), "1h ago");
    }
}
