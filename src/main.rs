//! proxyauth - proxy-header credential backend and auto-auth agent

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use proxyauth::{
    agent::{self, Host, HostClient},
    cli::{Cli, Command, OutputFormat, login_request, normalize_args},
    config::Config,
    server::{Server, shutdown_signal},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Agent { exit_after_auth }) => run_agent(config, exit_after_auth).await,
        Some(Command::Login {
            method,
            path,
            address,
            format,
            fields,
        }) => run_login(&config, &method, &path, address, format, &fields).await,
        Some(Command::Serve { host, port }) => run_server(config, host, port).await,
        None => run_server(config, None, None).await,
    }
}

/// Run the HTTP host
async fn run_server(mut config: Config, host: Option<String>, port: Option<u16>) -> ExitCode {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        mount = %config.server.mount,
        roles = config.backend.roles.len(),
        "Starting proxyauth server"
    );

    if let Err(e) = Server::new(config).run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Run the auto-auth agent
async fn run_agent(mut config: Config, exit_after_auth: bool) -> ExitCode {
    if exit_after_auth {
        config.agent.exit_after_auth = true;
    }

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));

    let result = agent::run(&config.agent, cancel.clone()).await;
    cancel.cancel();
    let _ = signals.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Agent error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// One-shot login
async fn run_login(
    config: &Config,
    method: &str,
    path: &str,
    address: Option<String>,
    format: OutputFormat,
    fields: &[String],
) -> ExitCode {
    let request = match login_request(method, path, fields) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let address = address.unwrap_or_else(|| config.agent.vault.address.clone());
    let client = match HostClient::new(&address) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let secret = match client.login(&request).await {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            eprintln!("Error: host returned an empty response");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Error authenticating: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&secret).map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(&secret).map_err(|e| e.to_string()),
        OutputFormat::Token => Ok(secret.token().unwrap_or_default().to_string()),
    };
    match rendered {
        Ok(text) => {
            println!("{}", text.trim_end());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
