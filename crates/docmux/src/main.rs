//! docmux binary.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use docmux::config::Options;
use docmux::{BrokerCommand, ExitStatus};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DOCMUX_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("docmux={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn main() -> ExitCode {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitStatus::Usage.into()
            } else {
                ExitStatus::Ok.into()
            };
        }
    };

    init_tracing();

    let config = match options.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("docmux: {e}\n");
            let _ = Options::command().print_help();
            return ExitStatus::Usage.into();
        }
    };

    match run(config) {
        Ok(status) => status.into(),
        Err(e) => {
            tracing::error!("docmux failed: {e:#}");
            ExitStatus::Software.into()
        }
    }
}

fn run(config: docmux::MasterConfig) -> anyhow::Result<ExitStatus> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let spawner = Arc::new(BrokerCommand::new(config.supervisor.broker.clone()));
    runtime.block_on(docmux::serve(config, spawner, CancellationToken::new()))
}
