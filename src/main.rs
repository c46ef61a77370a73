use clap::{Parser, Subcommand};
use log::{error, info};
use minilab::configuration::config::{LabConfig, Topology};
use minilab::controller::LabController;
use minilab::error_handling::types::LabError;
use minilab::network_engine::{NetnsEngine, SystemRunner};
use minilab::session_management::ConsoleSession;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "minilab")]
#[command(version = "0.1.0")]
#[command(about = "Network lab manager with isolated, manageable hosts")]
struct Args {
    /// Lab configuration file (rootfs, lab_dir, ssh).
    #[arg(
        long,
        short,
        env = "MINILAB_CONFIG",
        default_value = "config.yaml",
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Build the lab, open the CLI, and tear everything down on exit.
    Run { topology: PathBuf },
    /// Unmount what a previous run left behind.
    Cleanup {
        /// Also delete every host's directory tree.
        #[arg(long)]
        reset: bool,
        topology: PathBuf,
    },
    /// Same as `cleanup --reset`.
    Reset { topology: PathBuf },
}

impl Command {
    fn topology(&self) -> &PathBuf {
        match self {
            Command::Run { topology }
            | Command::Cleanup { topology, .. }
            | Command::Reset { topology } => topology,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    println!(
        "
███╗   ███╗██╗███╗   ██╗██╗██╗      █████╗ ██████╗
████╗ ████║██║████╗  ██║██║██║     ██╔══██╗██╔══██╗
██╔████╔██║██║██╔██╗ ██║██║██║     ███████║██████╔╝
██║╚██╔╝██║██║██║╚██╗██║██║██║     ██╔══██║██╔══██╗
██║ ╚═╝ ██║██║██║ ╚████║██║███████╗██║  ██║██████╔╝
╚═╝     ╚═╝╚═╝╚═╝  ╚═══╝╚═╝╚══════╝╚═╝  ╚═╝╚═════╝
===================================================
     Network lab manager with manageable hosts
===================================================
"
    );

    let args = Args::parse();

    if !nix::unistd::geteuid().is_root() {
        error!("minilab needs root privileges for namespaces, mounts and iptables");
        std::process::exit(1);
    }

    if let Err(e) = execute(args).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn execute(args: Args) -> Result<(), LabError> {
    info!("Importing configuration");
    let config = match args.command {
        Command::Run { .. } => LabConfig::from_file(&args.config)?,
        Command::Cleanup { .. } | Command::Reset { .. } => {
            LabConfig::from_file_for_cleanup(&args.config)?
        }
    };
    let topology = Topology::from_file(args.command.topology())?;
    info!("Configuration imported successfully");

    let runner = Arc::new(SystemRunner::new());
    let engine = NetnsEngine::new(runner.clone());

    match args.command {
        Command::Run { .. } => {
            let mut controller = LabController::new(config, topology, engine, runner)?;
            let mut session = ConsoleSession::stdio();
            controller.run(&mut session).await
        }
        Command::Cleanup { reset, .. } => {
            let mut controller = LabController::for_cleanup(config, topology, engine, runner);
            controller.cleanup(reset).await
        }
        Command::Reset { .. } => {
            let mut controller = LabController::for_cleanup(config, topology, engine, runner);
            controller.cleanup(true).await
        }
    }
}
