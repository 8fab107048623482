//! # VeloRPC CLI Entry Point
//!
//! Runs a demo provider, calls remote methods and inspects the registry.
//!
//! ## Usage
//!
//! ```bash
//! # Export the demo Greeter service on port 9001
//! velorpc provider --port 9001
//!
//! # Call it (prints the result as JSON)
//! velorpc call Greeter greet --arg String=world
//!
//! # List the registered Greeter instances
//! velorpc discover Greeter
//! ```
//!
//! ## Configuration
//!
//! Every command builds its `RpcConfig` from built-in defaults, then the
//! properties file given with `--config`, then `RPC_*` environment
//! variables, then `--set key=value` overrides:
//!
//! ```bash
//! RPC_REGISTRY_ADDRESS=http://10.0.0.2:2379 velorpc --set serializer=json call Greeter greet -a String=world
//! ```
//!
//! Commands run as separate processes, so they only meet through a shared
//! registry such as etcd. `registry.kind=memory` keeps the registry inside
//! one process: a `call` or `discover` cannot see a provider started by
//! another `velorpc` invocation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;
use velorpc_client::RpcClient;
use velorpc_common::{ReferenceConfig, RpcConfig, DEFAULT_SERVICE_GROUP, DEFAULT_SERVICE_VERSION};
use velorpc_registry::{registry_strategies, Registry};
use velorpc_server::{Provider, ServiceExport};

#[derive(FromArgs)]
/// VeloRPC - service registry backed RPC
struct Cli {
    /// properties file with `rpc.*` settings
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// override one setting, e.g. `--set serializer=json`; repeatable (registry.kind=memory is per process)
    #[argh(option, short = 's', long = "set")]
    overrides: Vec<String>,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Provider(ProviderArgs),
    Call(CallArgs),
    Discover(DiscoverArgs),
}

/// Arguments for running the demo provider.
///
/// The provider exports `Greeter` with `greet(String)` and `add(int, int)`,
/// registers it and serves until Ctrl-C, then unregisters.
#[derive(FromArgs)]
#[argh(subcommand, name = "provider")]
/// export the demo Greeter service until interrupted
struct ProviderArgs {
    /// port to listen on; 0 picks a free one
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// service group to register under
    #[argh(option, short = 'g', default = "DEFAULT_SERVICE_GROUP.to_string()")]
    group: String,

    /// service version to register under
    #[argh(option, short = 'v', default = "DEFAULT_SERVICE_VERSION.to_string()")]
    version: String,

    /// instance weight for weighted load balancing
    #[argh(option, short = 'w', default = "1")]
    weight: u32,
}

/// Arguments for a single call.
///
/// Each `--arg TYPE=VALUE` adds one parameter; the result is printed to
/// stdout as JSON so it can be piped.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// invoke a remote method and print the result as JSON
struct CallArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// parameter as TYPE=VALUE, VALUE being JSON or a plain string; repeatable
    #[argh(option, short = 'a', long = "arg")]
    args: Vec<String>,

    /// service group
    #[argh(option, short = 'g', default = "DEFAULT_SERVICE_GROUP.to_string()")]
    group: String,

    /// service version
    #[argh(option, short = 'v', default = "DEFAULT_SERVICE_VERSION.to_string()")]
    version: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "discover")]
/// list the registered instances of a service as JSON
struct DiscoverArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// service group
    #[argh(option, short = 'g', default = "DEFAULT_SERVICE_GROUP.to_string()")]
    group: String,

    /// service version
    #[argh(option, short = 'v', default = "DEFAULT_SERVICE_VERSION.to_string()")]
    version: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and discover keep stdout clean for piping
    if matches!(cli.command, Commands::Provider(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = velorpc_cli::load_config(cli.config.as_deref(), std::env::vars(), &cli.overrides)?;

    match cli.command {
        Commands::Provider(args) => run_provider(config, args).await,
        Commands::Call(args) => run_call(config, args).await,
        Commands::Discover(args) => run_discover(config, args).await,
    }
}

async fn connect_registry(config: &RpcConfig) -> Result<Arc<dyn Registry>> {
    let registry = registry_strategies().resolve(Some(config.registry.kind.as_str()));
    registry.init(&config.registry).await?;
    Ok(registry)
}

async fn run_provider(mut config: RpcConfig, args: ProviderArgs) -> Result<()> {
    if let Some(port) = args.port {
        config.server_port = port;
    }
    tracing::info!(
        "Starting provider '{}' ({} registry at {})",
        config.name,
        config.registry.kind,
        config.registry.address
    );

    let registry = connect_registry(&config).await?;
    let provider = Provider::new(config, registry.clone());
    provider.export(
        ServiceExport::new("Greeter")
            .with_group(args.group)
            .with_version(args.version)
            .with_weight(args.weight),
        Arc::new(velorpc_cli::greeter()),
    );

    let addr = provider.start().await?;
    tracing::info!("Listening on {}, press Ctrl-C to stop", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    provider.shutdown().await;
    registry.destroy().await;
    Ok(())
}

async fn run_call(config: RpcConfig, args: CallArgs) -> Result<()> {
    let mut parameter_types = Vec::with_capacity(args.args.len());
    let mut values = Vec::with_capacity(args.args.len());
    for arg in &args.args {
        let (type_name, value) = velorpc_cli::parse_call_arg(arg)?;
        parameter_types.push(type_name);
        values.push(value);
    }
    let parameter_types: Vec<&str> = parameter_types.iter().map(String::as_str).collect();

    let client = RpcClient::connect(config).await?;
    let reference = ReferenceConfig::new(&args.service)
        .with_group(&args.group)
        .with_version(&args.version);
    let result = client
        .proxy(reference)
        .invoke(&args.method, &parameter_types, values)
        .await;
    client.registry().destroy().await;

    println!("{}", serde_json::to_string(&result?.to_json())?);
    Ok(())
}

async fn run_discover(config: RpcConfig, args: DiscoverArgs) -> Result<()> {
    let registry = connect_registry(&config).await?;
    let service_key = velorpc_common::service_key(&args.service, &args.group, &args.version);
    let instances = registry.discover(&service_key).await;
    registry.destroy().await;

    println!("{}", serde_json::to_string_pretty(&instances?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_provider() {
        let cli: Cli = Cli::from_args(&["velorpc"], &["provider", "-p", "9001"]).unwrap();
        match cli.command {
            Commands::Provider(ProviderArgs {
                port,
                group,
                version,
                weight,
            }) => {
                assert_eq!(port, Some(9001));
                assert_eq!(group, "default");
                assert_eq!(version, "1.0");
                assert_eq!(weight, 1);
            }
            _ => panic!("Expected Provider command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let cli: Cli = Cli::from_args(
            &["velorpc"],
            &["call", "Greeter", "greet", "--arg", "String=world", "-g", "blue"],
        )
        .unwrap();
        match cli.command {
            Commands::Call(CallArgs {
                service,
                method,
                args,
                group,
                version,
            }) => {
                assert_eq!(service, "Greeter");
                assert_eq!(method, "greet");
                assert_eq!(args, vec!["String=world".to_string()]);
                assert_eq!(group, "blue");
                assert_eq!(version, "1.0");
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_global_options() {
        let cli: Cli = Cli::from_args(
            &["velorpc"],
            &[
                "--config",
                "velorpc.properties",
                "--set",
                "serializer=json",
                "-s",
                "registry.kind=memory",
                "discover",
                "Greeter",
            ],
        )
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("velorpc.properties")));
        assert_eq!(cli.overrides, vec!["serializer=json", "registry.kind=memory"]);
        assert!(matches!(cli.command, Commands::Discover(DiscoverArgs { ref service, .. }) if service == "Greeter"));
    }

    #[test]
    fn test_help_warns_memory_registry_is_per_process() {
        let help = match Cli::from_args(&["velorpc"], &["--help"]) {
            Err(early_exit) => early_exit.output,
            Ok(_) => panic!("--help should exit early"),
        };
        // Descriptions are wrapped
        let help = help.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(help.contains("--set serializer=json"), "{}", help);
        assert!(help.contains("registry.kind=memory is per process"), "{}", help);
    }

    #[test]
    fn test_cli_call_requires_method() {
        assert!(Cli::from_args(&["velorpc"], &["call", "Greeter"]).is_err());
    }
}
