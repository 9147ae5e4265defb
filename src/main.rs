//! mtup - MikroTik RouterOS firmware upgrade CLI tool.
//!
//! Runs one operation against one device and prints its outcome as JSON on
//! stdout. Exits non-zero when the operation failed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use mtup::config::{self, Args, Command, Config};
use mtup::operations::DeviceClient;
use mtup::result::{OperationFailure, OperationResult};
use mtup::transport::{OpenSshConnector, askpass_reply};
use mtup::{SystemClock, logging};

fn main() -> Result<()> {
    // ssh re-invokes this binary as its askpass helper
    if let Some(secret) = askpass_reply() {
        println!("{secret}");
        return Ok(());
    }

    let args = Args::parse();
    logging::init(&args.log_format, &args.log_level);

    info!(
        version = config::VERSION,
        commit = config::COMMIT,
        build_date = config::BUILD_DATE,
        "mtup starting"
    );

    let config = Config::from_args(args).context("Invalid configuration")?;
    config.display();

    let client = DeviceClient::new(
        Arc::new(OpenSshConnector::default()),
        Arc::new(SystemClock),
        config.endpoint.clone(),
    )
    .with_settings(config.settings)
    .with_context(config.context.clone());

    let outcome = dispatch(&client, config.command);
    let (result, failed) = match outcome {
        Ok(result) => (result, false),
        Err(failure) => {
            let OperationFailure { error, result } = failure;
            error!(error = %error, kind = ?error.kind(), "Operation failed");
            (*result, true)
        }
    };

    print_result(&result)?;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn dispatch(
    client: &DeviceClient,
    command: Command,
) -> std::result::Result<OperationResult, OperationFailure> {
    match command {
        Command::Upgrade {
            version,
            mode,
            repo_url,
            source_root,
        } => client.upgrade(&version, config::provision_settings(mode, repo_url, source_root)),
        Command::Info => client.info(),
        Command::Run { commands } => client.run(&commands),
        Command::Backup { name, download_dir } => client.backup(&name, &download_dir),
        Command::Upload { files, remote_dir } => client.upload(&files, &remote_dir),
        Command::Download { files, local_dir } => client.download(&files, &local_dir),
    }
}

fn print_result(result: &OperationResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
    println!("{json}");
    info!(
        operation = result.operation(),
        success = result.success(),
        duration_seconds = result.duration_seconds(),
        "{}",
        result.message()
    );
    Ok(())
}
