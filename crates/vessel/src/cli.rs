//! CLI command definitions and handlers.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use ipnet::Ipv4Net;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;

use vessel_common::VesselPaths;
use vessel_network::{
    BridgeLink, Context, FileKeyValueStore, IpCommandLink, NetworkConfig, NullLink, Scope,
    ScopeData, ScopeType, TrustLevel,
};

/// Vessel - container network control plane
#[derive(Parser)]
#[command(name = "vessel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for vessel data
    #[arg(long, global = true, env = "VESSEL_ROOT")]
    pub root: Option<PathBuf>,

    /// Network configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Bridge interface carrying bridge scope gateways
    #[arg(long, global = true, default_value = "vessel0")]
    pub bridge_link: String,

    /// Track bridge gateways in memory instead of on the host
    #[arg(long, global = true)]
    pub no_link: bool,

    /// Print machine readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect the network configuration
    Config {
        /// Config action.
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Manage network scopes
    Scope {
        /// Scope action.
        #[command(subcommand)]
        action: ScopeCommand,
    },
}

/// Configuration commands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration
    Check,
}

/// Scope commands.
#[derive(Subcommand)]
pub enum ScopeCommand {
    /// List scopes
    Ls,

    /// Show one scope
    Inspect {
        /// Scope name or ID prefix
        name: String,
    },

    /// Create a scope
    Create {
        /// Scope name
        #[arg(long)]
        name: String,

        /// Scope type (bridge, external)
        #[arg(long = "type", default_value = "bridge")]
        scope_type: ScopeType,

        /// Subnet in CIDR form
        #[arg(long)]
        subnet: Option<Ipv4Net>,

        /// Gateway address
        #[arg(long)]
        gateway: Option<Ipv4Addr>,

        /// DNS server
        #[arg(long)]
        dns: Vec<Ipv4Addr>,

        /// Address pool, as a CIDR or a range
        #[arg(long)]
        pool: Vec<String>,

        /// Firewall policy (open, peers, published, outbound, closed)
        #[arg(long)]
        trust: Option<TrustLevel>,

        /// Never route default traffic through this scope
        #[arg(long)]
        internal: bool,
    },

    /// Remove a scope
    Rm {
        /// Scope name or ID prefix
        name: String,
    },
}

#[derive(Tabled)]
struct ScopeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "TYPE")]
    scope_type: String,
    #[tabled(rename = "SUBNET")]
    subnet: String,
    #[tabled(rename = "GATEWAY")]
    gateway: String,
    #[tabled(rename = "BUILTIN")]
    builtin: bool,
}

impl From<&Arc<Scope>> for ScopeRow {
    fn from(scope: &Arc<Scope>) -> Self {
        Self {
            name: scope.name().to_string(),
            id: scope.id().to_string().chars().take(12).collect(),
            scope_type: scope.scope_type().to_string(),
            subnet: scope.subnet().map(|s| s.to_string()).unwrap_or_default(),
            gateway: Some(scope.gateway())
                .filter(|gw| !gw.is_unspecified())
                .map(|gw| gw.to_string())
                .unwrap_or_default(),
            builtin: scope.builtin(),
        }
    }
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let paths = self
            .root
            .as_ref()
            .map_or_else(VesselPaths::new, VesselPaths::with_root);
        let config = self.load_config(&paths)?;

        match &self.command {
            Commands::Config {
                action: ConfigCommand::Check,
            } => {
                config.validate()?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    println!(
                        "Configuration is valid: bridge pool {} (/{} per network), {} container network(s)",
                        config.bridge_pool(),
                        config.bridge_width(),
                        config.container_networks.len()
                    );
                }
                Ok(())
            }

            Commands::Scope { action } => {
                let ctx = self.context(&paths, config).await?;
                self.scope(&ctx, action).await
            }
        }
    }

    fn load_config(&self, paths: &VesselPaths) -> Result<NetworkConfig> {
        let path = self.config.clone().unwrap_or_else(|| paths.network_config());
        if path.exists() {
            tracing::debug!(path = %path.display(), "Loading network configuration");
            return NetworkConfig::from_file(&path)
                .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e));
        }

        if self.config.is_some() {
            return Err(eyre!("Configuration file {} not found", path.display()));
        }
        Ok(NetworkConfig::default())
    }

    async fn context(&self, paths: &VesselPaths, config: NetworkConfig) -> Result<Context> {
        let kv = FileKeyValueStore::open(paths.kv_store("network")).await?;
        let link: Arc<dyn BridgeLink> = if self.no_link {
            Arc::new(NullLink::new())
        } else {
            Arc::new(IpCommandLink::new(self.bridge_link.clone()))
        };

        let ctx = Context::builder(config)
            .with_kv(Arc::new(kv))
            .with_bridge_link(link)
            .build()
            .await?;
        Ok(ctx)
    }

    async fn scope(&self, ctx: &Context, action: &ScopeCommand) -> Result<()> {
        let cancel = CancellationToken::new();

        match action {
            ScopeCommand::Ls => {
                let scopes = ctx.scopes(None).await?;
                if self.json {
                    let records: Vec<_> = scopes.iter().map(|s| s.record()).collect();
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else {
                    let rows: Vec<ScopeRow> = scopes.iter().map(ScopeRow::from).collect();
                    println!("{}", Table::new(rows));
                }
                Ok(())
            }

            ScopeCommand::Inspect { name } => {
                let scopes = ctx.scopes(Some(name.as_str())).await?;
                let records: Vec<_> = scopes.iter().map(|s| s.record()).collect();
                println!("{}", serde_json::to_string_pretty(&records)?);
                Ok(())
            }

            ScopeCommand::Create {
                name,
                scope_type,
                subnet,
                gateway,
                dns,
                pool,
                trust,
                internal,
            } => {
                let data = ScopeData {
                    scope_type: *scope_type,
                    name: name.clone(),
                    subnet: *subnet,
                    gateway: *gateway,
                    dns: dns.clone(),
                    trust_level: trust.unwrap_or_default(),
                    pools: pool.clone(),
                    internal: *internal,
                    ..ScopeData::default()
                };

                let scope = ctx.new_scope(&cancel, data).await?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&scope.record())?);
                } else {
                    println!(
                        "Created scope {} ({}) subnet {}",
                        scope.name(),
                        scope.id(),
                        scope.subnet().map_or_else(|| "dynamic".to_string(), |s| s.to_string())
                    );
                }
                Ok(())
            }

            ScopeCommand::Rm { name } => {
                ctx.delete_scope(&cancel, name).await?;
                println!("Removed scope {}", name);
                Ok(())
            }
        }
    }
}
