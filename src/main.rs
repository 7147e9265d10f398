//! cradle CLI entry point.

use clap::{Args, Parser, Subcommand};
use cradle::config::{CgroupManager, ConfigFile, GlobalFlags, GlobalOptions};
use cradle::lifecycle::Engine;
use cradle::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// cradle - Docker-style CLI for containerd hosts
#[derive(Parser, Debug)]
#[command(name = "cradle")]
#[command(about = "Docker-style CLI for containerd hosts")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// containerd socket path.
    #[arg(long, global = true)]
    address: Option<String>,

    /// containerd namespace.
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Snapshotter name.
    #[arg(long, global = true)]
    snapshotter: Option<String>,

    /// CNI plugin binary directory.
    #[arg(long = "cni-path", global = true)]
    cni_path: Option<PathBuf>,

    /// CNI network config directory.
    #[arg(long = "cni-netconfpath", global = true)]
    cni_netconfpath: Option<PathBuf>,

    /// Data root directory.
    #[arg(long = "data-root", global = true)]
    data_root: Option<PathBuf>,

    /// Cgroup manager (systemd, cgroupfs, none).
    #[arg(long = "cgroup-manager", global = true)]
    cgroup_manager: Option<String>,

    /// Registry to access over plain HTTP.
    #[arg(long = "insecure-registry", global = true)]
    insecure_registry: Vec<String>,
}

impl GlobalArgs {
    fn to_flags(&self) -> Result<GlobalFlags> {
        Ok(GlobalFlags {
            address: self.address.clone(),
            namespace: self.namespace.clone(),
            snapshotter: self.snapshotter.clone(),
            cni_path: self.cni_path.clone(),
            cni_netconfpath: self.cni_netconfpath.clone(),
            data_root: self.data_root.clone(),
            cgroup_manager: self
                .cgroup_manager
                .as_deref()
                .map(str::parse::<CgroupManager>)
                .transpose()?,
            insecure_registry: self.insecure_registry.clone(),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command in a new container.
    Run(cli::run::RunCmd),

    /// Create a container without starting it.
    Create(cli::create::CreateCmd),

    /// Start created or stopped containers.
    Start(cli::start::StartCmd),

    /// Stop running containers (stop signal, then SIGKILL).
    Stop(cli::stop::StopCmd),

    /// Send a signal to running containers.
    Kill(cli::kill::KillCmd),

    /// Remove containers.
    Rm(cli::rm::RmCmd),

    /// List containers.
    Ps(cli::ps::PsCmd),

    /// Show containers or images as JSON.
    Inspect(cli::inspect::InspectCmd),

    /// Fetch a container's logs.
    Logs(cli::logs::LogsCmd),

    /// Run a command inside a running container.
    Exec(cli::exec::ExecCmd),

    /// Show a container's published ports.
    Port(cli::port::PortCmd),

    /// Suspend all processes in containers.
    Pause(cli::pause::PauseCmd),

    /// Resume paused containers.
    Unpause(cli::pause::UnpauseCmd),

    /// Wait for containers to exit and print their exit codes.
    Wait(cli::wait::WaitCmd),

    /// Manage CNI networks.
    #[command(subcommand)]
    Network(cli::network::NetworkCmd),

    /// Manage volumes.
    #[command(subcommand)]
    Volume(cli::volume::VolumeCmd),

    /// Pull an image from a registry.
    Pull(cli::image::PullCmd),

    /// List images.
    Images(cli::image::ImagesCmd),

    /// Tag an image.
    Tag(cli::image::TagCmd),

    /// Remove images.
    Rmi(cli::image::RmiCmd),

    /// Run multi-container projects from a compose file.
    Compose(cli::compose::ComposeCmd),

    /// Internal plumbing.
    #[command(subcommand, hide = true)]
    Internal(cli::internal::InternalCmd),
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not errors; bad flags are a usage error.
            let code = if e.use_stderr() { 125 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_logging();
    tracing::debug!(version = cradle::VERSION, "starting cradle");

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let flags = cli.global.to_flags()?;
    let file = ConfigFile::load(&ConfigFile::default_path())?;
    let opts = GlobalOptions::resolve(&file, &flags);
    let engine = Engine::connect(opts).await?;

    match cli.command {
        Commands::Run(cmd) => cmd.run(&engine).await,
        Commands::Start(cmd) => cmd.run(&engine).await,
        Commands::Exec(cmd) => cmd.run(&engine).await,
        Commands::Create(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Stop(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Kill(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Rm(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Ps(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Inspect(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Logs(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Port(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Pause(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Unpause(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Wait(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Network(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Volume(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Pull(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Images(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Tag(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Rmi(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Compose(cmd) => cmd.run(&engine).await.map(|_| 0),
        Commands::Internal(cmd) => cmd.run(&engine).await.map(|_| 0),
    }
}

/// Initialize the tracing subscriber. `CRADLE_LOG` wins over `RUST_LOG`.
fn init_logging() {
    let filter = std::env::var("CRADLE_LOG")
        .map(EnvFilter::new)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("cradle=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parse_defaults() {
        let cli = Cli::try_parse_from(["cradle", "run", "alpine", "sh", "-c", "true"]).unwrap();
        let Commands::Run(cmd) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(cmd.image, "alpine");
        assert_eq!(cmd.command, vec!["sh", "-c", "true"]);
        assert!(!cmd.detach);
        assert_eq!(cmd.flags.restart, "no");
        assert_eq!(cmd.flags.pull, "missing");
    }

    #[test]
    fn test_global_flags_anywhere() {
        let cli =
            Cli::try_parse_from(["cradle", "ps", "--namespace", "builds", "--all"]).unwrap();
        assert_eq!(cli.global.namespace.as_deref(), Some("builds"));

        let cli = Cli::try_parse_from([
            "cradle",
            "--address",
            "/run/c.sock",
            "internal",
            "supervise",
            "abc",
        ])
        .unwrap();
        assert_eq!(cli.global.address.as_deref(), Some("/run/c.sock"));
    }

    #[test]
    fn test_stop_timeout_default() {
        let cli = Cli::try_parse_from(["cradle", "stop", "web"]).unwrap();
        let Commands::Stop(cmd) = cli.command else {
            panic!("expected stop");
        };
        assert_eq!(cmd.time, 10);
        assert_eq!(cmd.containers, vec!["web"]);
    }

    #[test]
    fn test_compose_push_parses() {
        let cli = Cli::try_parse_from(["cradle", "compose", "push"]).unwrap();
        let Commands::Compose(cmd) = cli.command else {
            panic!("expected compose");
        };
        assert!(matches!(cmd.action, cli::compose::ComposeAction::Push));
    }

    #[test]
    fn test_compose_down_rmi_is_rejected() {
        assert!(Cli::try_parse_from(["cradle", "compose", "down", "--rmi", "all"]).is_err());
    }

    #[test]
    fn test_unknown_flag_is_parse_error() {
        assert!(Cli::try_parse_from(["cradle", "run", "--no-such-flag", "alpine"]).is_err());
    }

    #[test]
    fn test_ps_flags() {
        let cli = Cli::try_parse_from(["cradle", "ps", "-aq", "--no-trunc"]).unwrap();
        let Commands::Ps(cmd) = cli.command else {
            panic!("expected ps");
        };
        assert!(cmd.all && cmd.quiet && cmd.no_trunc);
    }
}
