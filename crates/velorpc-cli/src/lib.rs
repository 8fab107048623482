//! # VeloRPC CLI
//!
//! Helpers behind the `velorpc` binary: assembling an [`RpcConfig`] from a
//! properties file, the environment and command-line overrides, parsing
//! call arguments, and the demo `Greeter` service the `provider` command
//! exports.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use velorpc_common::{RpcConfig, Value};
use velorpc_server::MethodTable;

/// Parses `key=value` lines. Blank lines and lines starting with `#` or `!`
/// are skipped; `:` is accepted as separator too.
///
/// Only that subset of the Java `.properties` format is understood: escape
/// sequences are kept verbatim and a trailing `\` does not continue a value
/// on the next line. Each line stands alone.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let (key, value) = line.split_at(split);
            Some((key.trim().to_string(), value[1..].trim().to_string()))
        })
        .collect()
}

/// Defaults, then the properties file, then `RPC_*` variables from `env`,
/// then `overrides` given as `key=value`.
pub fn load_config<I>(file: Option<&Path>, env: I, overrides: &[String]) -> Result<RpcConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut config = RpcConfig::default();

    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        config.apply_properties(&parse_properties(&text))?;
    }

    config.apply_env(env)?;

    for entry in overrides {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid override '{}': expected key=value", entry))?;
        let key = key.trim();
        config.set(key.strip_prefix("rpc.").unwrap_or(key), value)?;
    }

    config.validate()?;
    Ok(config)
}

/// Parses a call argument of the form `TYPE=VALUE`.
///
/// `VALUE` is read as JSON when it parses as JSON and taken as a plain
/// string otherwise, so `String=world` and `int=42` both work.
pub fn parse_call_arg(arg: &str) -> Result<(String, Value)> {
    let (type_name, raw) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid argument '{}': expected TYPE=VALUE", arg))?;
    let type_name = type_name.trim();
    if type_name.is_empty() {
        return Err(anyhow!("Invalid argument '{}': missing parameter type", arg));
    }

    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::from(raw),
    };
    Ok((type_name.to_string(), value))
}

/// The service exported by `velorpc provider`.
pub fn greeter() -> MethodTable {
    MethodTable::new("Greeter")
        .method("greet", &["String"], "String", |args| async move {
            let name = args.first().and_then(Value::as_str).unwrap_or("nobody").to_string();
            Ok(Value::from(format!("hello {}", name)))
        })
        .method("add", &["int", "int"], "int", |args| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::Int(sum))
        })
}
