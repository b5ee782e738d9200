//! svchost CLI - tools for working with service modules
//!
//! Commands:
//!   svchost inspect <wasm>                        - Display a module's interface
//!   svchost call --module name=path ... <fn> [args] - Run one call against a service

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use svchost::runtime::ModuleSummary;
use svchost::{CallArgs, CallParameters, Envs, ServiceConfig, ServiceHost};

/// An empty core module, used when no control module is given.
const EMPTY_CONTROL_MODULE: &[u8] = b"\0asm\x01\0\0\0";

#[derive(Parser)]
#[command(name = "svchost")]
#[command(about = "Host multi-module WebAssembly services", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect a WASM module and display its interface metadata
    Inspect {
        /// Path to the WASM file
        wasm_file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Register a service and call one function on its facade
    Call {
        /// Service module as `import_name=path`; the last one is the facade
        #[arg(long = "module", short = 'm', value_parser = parse_key_value::<PathBuf>, required = true)]
        modules: Vec<(String, PathBuf)>,

        /// Control module; defaults to an empty module
        #[arg(long)]
        control: Option<PathBuf>,

        /// Service config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Environment variable passed to every module, `KEY=VALUE`
        #[arg(long = "env", short = 'e', value_parser = parse_key_value::<String>)]
        envs: Vec<(String, String)>,

        /// Call parameters (JSON file)
        #[arg(long)]
        params: Option<PathBuf>,

        /// Service id to register under
        #[arg(long, default_value = "cli")]
        service_id: String,

        /// Function to call on the facade module
        function: String,

        /// Arguments as a JSON array or object
        #[arg(default_value = "[]")]
        args: String,
    },
}

fn parse_key_value<V: From<String>>(raw: &str) -> Result<(String, V), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), V::from(value.to_string())))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { wasm_file, json } => inspect_command(&wasm_file, json),
        Commands::Call {
            modules,
            control,
            config,
            envs,
            params,
            service_id,
            function,
            args,
        } => {
            let request = CallRequest {
                modules,
                control,
                config,
                envs: envs.into_iter().collect(),
                params,
                service_id,
                function,
                args,
            };
            call_command(request).await
        }
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn inspect_command(wasm_file: &Path, json: bool) -> anyhow::Result<()> {
    let wasm_bytes = read_file(wasm_file)?;
    let summary = ModuleSummary::from_wasm(&wasm_bytes)
        .map_err(|e| anyhow!("Failed to parse WASM: {}", e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &ModuleSummary) {
    match (&summary.interface, &summary.interface_error) {
        (Some(interface), _) => {
            println!("functions:");
            for func in &interface.functions {
                println!("  {}({})", func.name, func.params.join(", "));
            }
        }
        (None, Some(error)) => println!("functions: unavailable ({error})"),
        (None, None) => println!("functions: unavailable"),
    }

    if !summary.imports.is_empty() {
        println!("imports:");
        for import in &summary.imports {
            let module = import.module.as_deref().unwrap_or_default();
            println!("  {}::{} ({})", module, import.name, import.kind);
        }
    }

    if !summary.exports.is_empty() {
        println!("exports:");
        for export in &summary.exports {
            println!("  {} ({})", export.name, export.kind);
        }
    }
}

struct CallRequest {
    modules: Vec<(String, PathBuf)>,
    control: Option<PathBuf>,
    config: Option<PathBuf>,
    envs: Envs,
    params: Option<PathBuf>,
    service_id: String,
    function: String,
    args: String,
}

async fn call_command(request: CallRequest) -> anyhow::Result<()> {
    let control = match &request.control {
        Some(path) => read_file(path)?,
        None => EMPTY_CONTROL_MODULE.to_vec(),
    };

    let mut modules = Vec::with_capacity(request.modules.len());
    for (name, path) in &request.modules {
        modules.push((name.clone(), read_file(path)?));
    }

    let config = request
        .config
        .as_deref()
        .map(ServiceConfig::load)
        .transpose()?;

    let call_parameters = match &request.params {
        Some(path) => {
            let raw = read_file(path)?;
            Some(
                serde_json::from_slice::<CallParameters>(&raw)
                    .with_context(|| format!("Invalid call parameters in {}", path.display()))?,
            )
        }
        None => None,
    };

    let args = CallArgs::from_json_str(&request.args)?;
    let envs = (!request.envs.is_empty()).then_some(request.envs);

    let host = ServiceHost::new()?;
    host.init(control).await?;
    host.create_service(modules, request.service_id.as_str(), config, envs)
        .await?;

    let outcome = host
        .call_service(
            request.service_id.as_str(),
            request.function.as_str(),
            args,
            call_parameters,
        )
        .await;
    host.terminate().await?;

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value.to_json()?)?);
    Ok(())
}
