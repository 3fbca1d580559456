//! security-token - manage hardware-backed machine identities.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use security_token_core::{Config, Core, CredentialSource, Keystore};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Manage machine identities held in a PKCS#11 token
#[derive(Parser)]
#[command(name = "security-token")]
#[command(about = "Manage hardware-backed machine identities", long_about = None)]
struct Cli {
    /// Configuration file (default: search ., ~/.manetu, /etc/manetu)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity
    Generate {
        /// Organization recorded in the certificate
        #[arg(short, long)]
        provider: String,
    },

    /// List provisioned identities
    List,

    /// Print an identity certificate as PEM
    Show {
        /// Serial number (default: earliest issued identity)
        serial: Option<String>,
    },

    /// Delete an identity
    Delete {
        /// Serial number
        serial: String,
    },

    /// Log in and print the session token
    Login {
        #[command(subcommand)]
        method: LoginMethod,
    },
}

#[derive(Subcommand)]
enum LoginMethod {
    /// Use an identity held in the token
    Pkcs11 {
        /// Serial number (default: earliest issued identity)
        #[arg(short, long)]
        serial: Option<String>,
    },

    /// Use a PKCS#8 EC private key and certificate
    X509 {
        /// Private key PEM, or its path with --path
        #[arg(short, long)]
        key: String,

        /// Certificate PEM, or its path with --path
        #[arg(short, long)]
        cert: String,

        /// Treat --key and --cert as file paths
        #[arg(long)]
        path: bool,
    },
}

fn main() -> CliResult {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output only.
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (config, path) = Config::discover(cli.config.as_deref())?;
    info!(config = %path.display(), "Loaded configuration");

    let core = Core::open(&config)?;

    // Close the session on every path before reporting the command result.
    let result = run(&core, cli.command);
    let closed = core.close();
    command_outcome(result, closed)
}

/// The command's own failure wins over a failure to close the session.
fn command_outcome(result: CliResult, closed: security_token_core::Result<()>) -> CliResult {
    match (result, closed) {
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "Failed to close keystore session");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), closed) => closed.map_err(Into::into),
    }
}

fn run<K: Keystore>(core: &Core<K>, command: Commands) -> CliResult {
    match command {
        Commands::Generate { provider } => {
            let token = core.generate(&provider)?;
            println!("Serial: {}", token.serial());
            println!("MRN:    {}", token.mrn());
        }
        Commands::List => {
            list_identities(core)?;
        }
        Commands::Show { serial } => {
            print!("{}", core.show(serial.as_deref())?);
        }
        Commands::Delete { serial } => {
            let outcome = core.delete(&serial)?;
            debug!(?outcome, "Delete finished");
            if outcome.key_pair_removed {
                println!("Deleted {}", serial);
            }
        }
        Commands::Login { method } => {
            let token = match method {
                LoginMethod::Pkcs11 { serial } => core.login_keystore(serial.as_deref())?,
                LoginMethod::X509 { key, cert, path } => {
                    let source = if path {
                        CredentialSource::Path
                    } else {
                        CredentialSource::Inline
                    };
                    core.login_x509(&key, &cert, source)?
                }
            };
            println!("{}", token.as_str());
        }
    }

    Ok(())
}

fn list_identities<K: Keystore>(core: &Core<K>) -> CliResult {
    let identities = core.list()?;

    println!("Identities ({}):", identities.len());
    println!("{:<95}  {:<16}  {}", "SERIAL", "PROVIDER", "CREATED");
    println!("{}", "-".repeat(135));

    for identity in identities {
        println!(
            "{:<95}  {:<16}  {}",
            identity.serial,
            identity.providers,
            identity.created.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}
