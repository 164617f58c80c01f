use anyhow::Result;
use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use debroot::{HostKernel, InitScript, Lifecycle, LifecyclePaths, LifecycleResult, ServiceAction};
use log::{info, warn, LevelFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("action").required(true).args(["start_ssh", "stop_ssh"])))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Set up the Debian root and start its SSH daemon
    #[arg(long = "start-ssh")]
    start_ssh: bool,

    /// Stop the SSH daemon and tear the Debian root down
    #[arg(long = "stop-ssh")]
    stop_ssh: bool,
}

fn init_logger(verbose: bool) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
            _ => {
                // Anything but exactly one action does nothing.
                init_logger(false);
                warn!("Expected --start-ssh or --stop-ssh, doing nothing");
                return Ok(());
            }
        },
    };

    init_logger(cli.verbose);

    let action = if cli.start_ssh {
        ServiceAction::Start
    } else {
        ServiceAction::Stop
    };

    let kernel = HostKernel;
    let mut lifecycle = Lifecycle::new(&kernel, LifecyclePaths::default());
    let service = InitScript::new(&lifecycle.paths().mount_target);

    info!("ssh {} requested", action);

    match lifecycle.run(action, &service) {
        LifecycleResult::Success => info!("ssh {} done", action),
        LifecycleResult::AlreadyInState => info!("Debian root was already up"),
        LifecycleResult::PartialFailure(err) => return Err(err.into()),
    }

    Ok(())
}
