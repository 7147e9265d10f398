//! Logs command.

use clap::Args;
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;
use cradle::logging::{self, FollowEvent, ReadOpts};

#[derive(Args, Debug)]
pub struct LogsCmd {
    /// Stream new entries until interrupted.
    #[arg(short, long)]
    pub follow: bool,

    /// Show entries since a timestamp or duration (e.g. 10m).
    #[arg(long)]
    pub since: Option<String>,

    /// Show entries until a timestamp or duration.
    #[arg(long)]
    pub until: Option<String>,

    /// Only the last N lines.
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,

    /// Prefix each line with its timestamp.
    #[arg(short, long)]
    pub timestamps: bool,

    /// Container to read.
    pub container: String,
}

impl LogsCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let record = engine.resolve(&self.container)?;
        let path = record.log_path.clone().ok_or_else(|| {
            Error::Logs(format!(
                "container {} was started in the foreground and has no log file",
                record.short_id()
            ))
        })?;

        let now = chrono::Utc::now();
        let opts = ReadOpts {
            tail: self.tail,
            since: self
                .since
                .as_deref()
                .map(|s| logging::parse_time_filter(s, now))
                .transpose()?,
            until: self
                .until
                .as_deref()
                .map(|s| logging::parse_time_filter(s, now))
                .transpose()?,
        };

        if path.exists() {
            for entry in logging::read_entries(&path, &opts)? {
                println!("{}", logging::render(&entry, self.timestamps));
            }
        }
        if !self.follow {
            return Ok(());
        }

        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let mut events = logging::follow(&path, offset, opts)?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                event = events.recv() => match event {
                    None => return Ok(()),
                    Some(FollowEvent::Entry(entry)) => {
                        println!("{}", logging::render(&entry, self.timestamps));
                    }
                    Some(FollowEvent::Lost(msg)) => {
                        return Err(Error::Logs(format!("follow lost: {}", msg)));
                    }
                },
            }
        }
    }
}
