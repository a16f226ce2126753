/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fs;

use tlsrpt_reporter::{config::Config, Reporter, UnwrapFailure};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = parse_config();
    enable_tracing();

    tracing::info!(
        "Starting TLS-RPT reporter v{}...",
        env!("CARGO_PKG_VERSION")
    );

    let reporter = Reporter::new(config).failed("Invalid configuration");
    if let Err(err) = reporter.run().await {
        tracing::error!(context = "run", event = "failed", reason = %err);
        std::process::exit(1);
    }
}

fn parse_config() -> Config {
    let mut config_path = None;
    let mut found_param = false;

    for arg in std::env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            if key.starts_with("--config") {
                config_path = value.trim().to_string().into();
                break;
            } else {
                failed(&format!("Invalid command line argument: {key}"));
            }
        } else if found_param {
            config_path = arg.into();
            break;
        } else if arg.starts_with("--config") {
            found_param = true;
        } else {
            failed(&format!("Invalid command line argument: {arg}"));
        }
    }

    Config::parse(
        &fs::read_to_string(config_path.failed("Missing parameter --config=<path-to-config>."))
            .failed("Could not read configuration file"),
    )
    .failed("Invalid configuration file")
}

fn enable_tracing() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .finish(),
    )
    .failed("Failed to set subscriber");
}

fn failed(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}
