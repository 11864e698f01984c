//! truenas-rpc - Issue JSON-RPC calls against a TrueNAS appliance.
//!
//! Connects, authenticates, runs one call (or job) and prints the result as
//! pretty JSON on stdout. Logs go to stderr.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use truenas_rpc::config::{
    credentials_from, API_KEY_ENV, HOST_ENV, INSECURE_ENV, PASSWORD_ENV, USERNAME_ENV,
};
use truenas_rpc::{Client, ClientConfig};

#[derive(Debug, Parser)]
#[command(name = "truenas-rpc", version, about)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConnectionArgs {
    /// Host name or ws:// / wss:// URL of the appliance
    #[arg(long, env = HOST_ENV, global = true)]
    host: Option<String>,

    /// API key (takes precedence over username/password)
    #[arg(long, env = API_KEY_ENV, global = true, hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = USERNAME_ENV, global = true)]
    username: Option<String>,

    #[arg(long, env = PASSWORD_ENV, global = true, hide_env_values = true)]
    password: Option<String>,

    /// Skip TLS certificate validation
    #[arg(long, env = INSECURE_ENV, global = true)]
    insecure: bool,

    /// Per-call timeout in seconds (0 disables it)
    #[arg(long, default_value_t = 30, global = true)]
    timeout: u64,

    /// Dial attempts before giving up
    #[arg(long, default_value_t = 1, global = true)]
    retries: u32,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call a method and print its result
    Call {
        method: String,
        /// Positional parameters; each is parsed as JSON, else taken as a string
        params: Vec<String>,
    },
    /// Call a job-backed method and print the finished job's result
    Job {
        method: String,
        params: Vec<String>,
        /// Job wait timeout in seconds (0 disables it)
        #[arg(long, default_value_t = 3600)]
        job_timeout: u64,
    },
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn build_config(args: &ConnectionArgs) -> Result<ClientConfig> {
    let host = args
        .host
        .as_deref()
        .with_context(|| format!("no host given: pass --host or set {}", HOST_ENV))?;
    let credentials = credentials_from(
        args.api_key.clone(),
        args.username.clone(),
        args.password.clone(),
    )?;

    Ok(ClientConfig::new(host, credentials)?
        .with_insecure(args.insecure)
        .with_call_timeout(seconds(args.timeout)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "truenas_rpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let mut config = build_config(&cli.connection)?;

    let (method, params) = match &cli.command {
        Command::Call { method, params } => (method, params),
        Command::Job {
            method,
            params,
            job_timeout,
        } => {
            config = config.with_job_timeout(seconds(*job_timeout));
            (method, params)
        }
    };
    let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();

    let client = Client::connect_with_retry(&config, cli.connection.retries)
        .await
        .with_context(|| format!("failed to connect to {}", config.endpoint))?;

    let result = match &cli.command {
        Command::Call { .. } => client.call::<Value>(method, params).await,
        Command::Job { .. } => client.call_job::<Value>(method, params).await,
    };
    client.close().await;

    let value = result.with_context(|| format!("{} failed", method))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
