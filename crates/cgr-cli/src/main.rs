// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::SchemaKind;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "cgr", version, about = "Capability routing gateway CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of a running gateway daemon, for the live commands.
    #[arg(long, global = true, default_value = "http://127.0.0.1:3001")]
    url: String,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch the daemon's system health snapshot.
    Health,

    /// List capabilities known to the daemon.
    Capabilities {
        /// Only include descriptors carrying this tag.
        #[arg(long)]
        tag: Option<String>,
        /// Only include descriptors with this execution mode.
        #[arg(long)]
        mode: Option<String>,
    },

    /// Invoke a capability against a running daemon.
    Invoke {
        /// Capability id to invoke.
        capability_id: String,
        /// JSON inputs, as a literal string.
        #[arg(long, default_value = "{}")]
        inputs: String,
        /// Skip the response cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Print a JSON schema to stdout.
    Schema {
        /// Which schema to print.
        #[arg(value_enum)]
        kind: SchemaArg,
    },

    /// Validate a local descriptor or receipt JSON file.
    Validate {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Inspect a receipt file and report whether its id recomputes cleanly.
    Inspect {
        /// Path to the receipt JSON file.
        file: PathBuf,
    },

    /// Verify a receipt file against the original inputs and/or outputs.
    Verify {
        /// Path to the receipt JSON file.
        file: PathBuf,
        /// Path to the original inputs JSON file.
        #[arg(long)]
        inputs: Option<PathBuf>,
        /// Path to the original outputs JSON file.
        #[arg(long)]
        outputs: Option<PathBuf>,
    },

    /// Diff two receipt files.
    Diff {
        /// First receipt file.
        file1: PathBuf,
        /// Second receipt file.
        file2: PathBuf,
    },

    /// Validate an optional TOML config override against `GatewayConfig`.
    ConfigCheck {
        /// Path to a TOML config override file.
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum SchemaArg {
    /// CapabilityDescriptor schema.
    Descriptor,
    /// InvocationRequest schema.
    Request,
    /// Receipt schema.
    Receipt,
    /// GatewayConfig schema.
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("cgr=debug")
    } else {
        EnvFilter::new("cgr=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Health => cmd_health(&cli.url).await,
        Commands::Capabilities { tag, mode } => cmd_capabilities(&cli.url, tag, mode).await,
        Commands::Invoke {
            capability_id,
            inputs,
            no_cache,
        } => cmd_invoke(&cli.url, capability_id, inputs, no_cache).await,
        Commands::Schema { kind } => cmd_schema(kind),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Inspect { file } => cmd_inspect(&file),
        Commands::Verify { file, inputs, outputs } => {
            cmd_verify(&file, inputs.as_deref(), outputs.as_deref())
        }
        Commands::Diff { file1, file2 } => cmd_diff(&file1, &file2),
        Commands::ConfigCheck { file } => cmd_config_check(file.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn cmd_health(base_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{base_url}/system/health"))
        .send()
        .await
        .context("request system health")?;
    let body: serde_json::Value = resp.json().await.context("parse health response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_capabilities(base_url: &str, tag: Option<String>, mode: Option<String>) -> Result<()> {
    let client = reqwest::Client::new();
    let mut query = Vec::new();
    if let Some(tag) = &tag {
        query.push(("tag", tag.clone()));
    }
    if let Some(mode) = &mode {
        query.push(("mode", mode.clone()));
    }
    let resp = client
        .get(format!("{base_url}/capabilities"))
        .query(&query)
        .send()
        .await
        .context("request capability list")?;
    let body: serde_json::Value = resp.json().await.context("parse capability list")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_invoke(base_url: &str, capability_id: String, inputs: String, no_cache: bool) -> Result<()> {
    let inputs: serde_json::Value =
        serde_json::from_str(&inputs).context("parse --inputs as JSON")?;
    let request = cgr_core::InvocationRequest {
        capability_id,
        inputs,
        preferences: serde_json::Value::Null,
        caller_identity: None,
        priority: cgr_core::Priority::Normal,
        dedup_key: None,
        no_cache,
    };
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base_url}/invoke"))
        .json(&request)
        .send()
        .await
        .context("send invoke request")?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("parse invoke response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("daemon returned {status}");
    }
    Ok(())
}

fn cmd_schema(kind: SchemaArg) -> Result<()> {
    let sk = match kind {
        SchemaArg::Descriptor => SchemaKind::Descriptor,
        SchemaArg::Request => SchemaKind::Request,
        SchemaArg::Receipt => SchemaKind::Receipt,
        SchemaArg::Config => SchemaKind::Config,
    };
    println!("{}", commands::schema_json(sk)?);
    Ok(())
}

fn cmd_validate(file: &std::path::Path) -> Result<()> {
    match commands::validate_file(file)? {
        commands::ValidatedType::Descriptor => println!("valid: capability descriptor"),
        commands::ValidatedType::Receipt => println!("valid: receipt"),
    }
    Ok(())
}

fn cmd_inspect(file: &std::path::Path) -> Result<()> {
    let (receipt, report) = commands::inspect_receipt_file(file)?;
    println!("capability_id: {}", receipt.capability_id);
    println!("executor_id:   {}", receipt.executor_id);
    println!("success:       {}", receipt.success);
    println!("receipt_id:    {}", receipt.receipt_id);
    if report.receipt_id_valid {
        println!("hash:          VALID");
    } else {
        println!("hash:          INVALID");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}

fn cmd_verify(
    file: &std::path::Path,
    inputs: Option<&std::path::Path>,
    outputs: Option<&std::path::Path>,
) -> Result<()> {
    let (_receipt, report) = commands::verify_receipt_file(file, inputs, outputs)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.all_valid() {
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}

fn cmd_diff(file1: &std::path::Path, file2: &std::path::Path) -> Result<()> {
    println!("{}", commands::receipt_diff(file1, file2)?);
    Ok(())
}

fn cmd_config_check(file: Option<&std::path::Path>) -> Result<()> {
    let diagnostics = commands::config_check(file)?;
    let mut has_error = false;
    for diagnostic in &diagnostics {
        println!("{diagnostic}");
        has_error |= diagnostic.starts_with("error:");
    }
    if has_error {
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}
