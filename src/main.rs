use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::error;
use serde_json::json;

use bucket_cert_lib::config::ProvisionConfig;
use bucket_cert_lib::issuance::RunError;
use bucket_cert_lib::issuance::run::{certificate_status, provision};
use bucket_cert_lib::logging;

/// Exit status when the bucket was left without a certificate.
const EXIT_MANUAL_REMEDIATION: u8 = 2;

/// Issue and install an HTTP-01 certificate for a bucket-hosted domain.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON config file; `provision` is implied when no command is given
    #[arg(env = "BUCKET_CERT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a certificate and install it on the bucket
    Provision {
        #[arg(env = "BUCKET_CERT_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Report whether the bucket currently has a certificate installed
    Status {
        #[arg(env = "BUCKET_CERT_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let remediation = err
                .downcast_ref::<RunError>()
                .is_some_and(RunError::requires_manual_remediation);
            if remediation {
                ExitCode::from(EXIT_MANUAL_REMEDIATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Some(Command::Status { config }) => {
            let config = load(config)?;
            let installed = certificate_status(&config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "bucket": config.bucket_ref().to_string(),
                    "certificate_installed": installed,
                }))?
            );
        }
        Some(Command::Provision { config }) => provision_with(load(config)?)?,
        None => provision_with(load(args.config)?)?,
    }
    Ok(())
}

fn provision_with(config: ProvisionConfig) -> Result<()> {
    let report = provision(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load(path: Option<PathBuf>) -> Result<ProvisionConfig> {
    ProvisionConfig::load(path.as_deref()).context("invalid configuration")
}
