//! Docker networks and volumes

use serde_json::Value;

use super::cli::Cli;
use crate::error::{Error, Result};

/// Settings for `docker network create`.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub driver: Option<String>,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    pub attachable: bool,
    pub internal: bool,
}

/// Settings for `docker volume create`.
#[derive(Debug, Clone, Default)]
pub struct VolumeConfig {
    pub driver: Option<String>,
    pub labels: Vec<(String, String)>,
}

pub(crate) async fn create_network(cli: &Cli, name: &str, config: &NetworkConfig) -> Result<()> {
    let mut args = vec!["network".to_string(), "create".to_string()];
    if let Some(driver) = &config.driver {
        args.push("--driver".to_string());
        args.push(driver.clone());
    }
    if let Some(subnet) = &config.subnet {
        args.push("--subnet".to_string());
        args.push(subnet.clone());
    }
    if let Some(gateway) = &config.gateway {
        args.push("--gateway".to_string());
        args.push(gateway.clone());
    }
    if let Some(ip_range) = &config.ip_range {
        args.push("--ip-range".to_string());
        args.push(ip_range.clone());
    }
    if config.attachable {
        args.push("--attachable".to_string());
    }
    if config.internal {
        args.push("--internal".to_string());
    }
    args.push(name.to_string());

    cli.run_checked(name, &args).await?;
    Ok(())
}

pub(crate) async fn remove_network(cli: &Cli, name: &str) -> Result<()> {
    cli.run_checked(name, ["network", "rm", name]).await?;
    Ok(())
}

pub(crate) async fn list_networks(cli: &Cli) -> Result<Vec<String>> {
    let output = cli
        .run_checked("networks", ["network", "ls", "--format", "{{.Name}}"])
        .await?;
    Ok(output.lines().map(str::to_string).collect())
}

pub(crate) async fn inspect_network(cli: &Cli, name: &str) -> Result<Value> {
    let raw = cli.run_checked(name, ["network", "inspect", name]).await?;
    let parsed: Value = serde_json::from_str(&raw)?;
    parsed
        .as_array()
        .and_then(|list| list.first().cloned())
        .ok_or_else(|| Error::Connection {
            host: name.to_string(),
            message: "empty network inspect response".to_string(),
        })
}

pub(crate) async fn create_volume(cli: &Cli, name: &str, config: &VolumeConfig) -> Result<()> {
    let mut args = vec!["volume".to_string(), "create".to_string()];
    if let Some(driver) = &config.driver {
        args.push("--driver".to_string());
        args.push(driver.clone());
    }
    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(name.to_string());

    cli.run_checked(name, &args).await?;
    Ok(())
}

pub(crate) async fn remove_volume(cli: &Cli, name: &str, force: bool) -> Result<()> {
    let mut args = vec!["volume".to_string(), "rm".to_string()];
    if force {
        args.push("-f".to_string());
    }
    args.push(name.to_string());

    cli.run_checked(name, &args).await?;
    Ok(())
}

pub(crate) async fn list_volumes(cli: &Cli) -> Result<Vec<String>> {
    let output = cli
        .run_checked("volumes", ["volume", "ls", "--format", "{{.Name}}"])
        .await?;
    Ok(output.lines().map(str::to_string).collect())
}

pub(crate) async fn inspect_volume(cli: &Cli, name: &str) -> Result<Value> {
    let raw = cli.run_checked(name, ["volume", "inspect", name]).await?;
    let parsed: Value = serde_json::from_str(&raw)?;
    parsed
        .as_array()
        .and_then(|list| list.first().cloned())
        .ok_or_else(|| Error::Connection {
            host: name.to_string(),
            message: "empty volume inspect response".to_string(),
        })
}
