use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};

use zfs_unlocker::destination::{Defaults, TargetGroup};
use zfs_unlocker::error::PassphraseError;
use zfs_unlocker::machine::MachineConfig;
use zfs_unlocker::orchestrator::Orchestrator;

const USAGE_ERROR: u8 = 2;

/// Unlock remote encrypted ZFS root filesystems over ssh.
///
/// Reads the passphrase from standard input, then watches every given target
/// forever: when a server reboots into its initramfs unlock prompt, the
/// passphrase is entered; once the server is up, the session is held open so
/// the next reboot is noticed immediately.
#[derive(Debug, Parser)]
#[command(name = "zfs-unlocker", version, about)]
struct Cli {
    /// A target to watch, as `[user@]host[:port]`. Comma-separate several
    /// destinations to treat them as alternative routes to one server;
    /// repeat the flag for additional servers.
    #[arg(
        short = 'd',
        long = "destination",
        value_name = "DEST[,DEST...]",
        required = true
    )]
    destinations: Vec<String>,

    /// User for destinations that do not name one.
    #[arg(long, value_name = "USER", default_value = "root")]
    user: String,

    /// The ssh client binary to invoke.
    #[arg(long, value_name = "PROGRAM", default_value = "ssh")]
    ssh_program: String,

    /// Command to run when a shell prompt appears. Without it, a shell
    /// prompt is taken to mean the filesystem is already unlocked.
    #[arg(long, value_name = "COMMAND")]
    unlock_command: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let defaults = Defaults {
        user: Some(cli.user.clone()),
    };
    let mut groups = Vec::with_capacity(cli.destinations.len());
    for destination in &cli.destinations {
        match TargetGroup::from_strings(destination.split(','), &defaults) {
            Ok(group) => groups.push(group),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(USAGE_ERROR);
            }
        }
    }

    let passphrase = match read_passphrase().await {
        Ok(passphrase) => Arc::new(passphrase),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(USAGE_ERROR);
        }
    };

    let mut config = MachineConfig::default();
    config.client.program = cli.ssh_program;
    config.unlock_command = cli.unlock_command;

    match Orchestrator::new(config, passphrase).run(groups).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// The first line of standard input is the passphrase. An interactive user
/// gets a hint on stderr; a piped caller gets silence.
async fn read_passphrase() -> Result<SecretString, PassphraseError> {
    if std::io::stdin().is_terminal() {
        eprintln!("Please provide a passphrase on stdin, and press Enter.");
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or(PassphraseError::MissingFirstLine)?;
    Ok(SecretString::from(line))
}
