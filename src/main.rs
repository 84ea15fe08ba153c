use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "vcrproxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy and admin servers.
    Serve {
        /// Path to config YAML; `./vcr-proxy.yaml` is used when present.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured log level.
        #[arg(long)]
        log_level: Option<String>,
    },
}

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = match vcrproxy::config::Config::load(config.as_deref()) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("configuration error: {err:#}");
                    return ExitCode::from(EXIT_CONFIG_ERROR);
                }
            };
            if let Err(err) = vcrproxy::logging::init(&config, log_level.as_deref()) {
                eprintln!("configuration error: {err:#}");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }

            let proxy = match vcrproxy::proxy::serve(&config).await {
                Ok(proxy) => proxy,
                Err(err) => {
                    eprintln!("{err:#}");
                    let code = if err.downcast_ref::<vcrproxy::proxy::PortBindError>().is_some() {
                        EXIT_BIND_FAILURE
                    } else {
                        EXIT_CONFIG_ERROR
                    };
                    return ExitCode::from(code);
                }
            };

            eprintln!(
                "listening on {} (admin on {})",
                proxy.listen_addr, proxy.admin_listen_addr
            );
            if let Err(err) = tokio::signal::ctrl_c().await {
                eprintln!("wait for ctrl-c: {err}");
            }
            proxy.shutdown().await;
            ExitCode::SUCCESS
        }
    }
}
