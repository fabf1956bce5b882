//! modproxy: a caching gateway for module proxy servers
//!
//! Built on Cloudflare's Pingora framework. Requests are served from the
//! local module tree, the disk cache, or an ordered list of upstream proxies.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, TracingConfig};
use pingora::prelude::*;
use pingora_proxy::http_proxy_service;
use proxy::{ModProxy, Router};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

mod telemetry;

const DEFAULT_CONFIG: &str = "modproxy.toml";

#[derive(Parser)]
#[command(name = "modproxy")]
#[command(author, version, about = "A caching gateway for module proxy servers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (modproxy.toml is used when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides global.log_level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Test configuration and exit
    #[arg(short, long)]
    test: bool,

    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line values that take precedence over the configuration file
#[derive(Args, Clone, Default)]
struct Overrides {
    /// Listen address, e.g. ":8081" or "127.0.0.1:8081"
    #[arg(long, global = true)]
    listen: Option<String>,

    /// Upstream proxy URL, repeat for failover order
    #[arg(long = "proxy", value_name = "URL", value_parser = parse_upstream, global = true)]
    proxies: Vec<String>,

    /// Comma-separated patterns of module paths served from the local tree
    #[arg(long, global = true)]
    exclude: Option<String>,

    /// Directory for cached module files
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, validate_only) = match &cli.command {
        Some(Commands::Validate { config }) => (config.clone().or(cli.config.clone()), true),
        Some(Commands::Run { config }) => (config.clone().or(cli.config.clone()), false),
        None => (cli.config.clone(), cli.test),
    };

    let config = load_config(config_path.as_deref(), &cli.overrides)?;
    let level = telemetry::parse_level(cli.log_level.as_deref().unwrap_or(&config.global.log_level));

    if validate_only {
        telemetry::init_tracing(level, &TracingConfig::default())?;
        return validate_config(&config);
    }

    run_server(config, level)
}

fn parse_upstream(raw: &str) -> std::result::Result<String, String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid upstream URL {:?}: {}", raw, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.to_string()),
        other => Err(format!("unsupported upstream scheme '{}'", other)),
    }
}

/// Read the configuration file (if any) and apply command-line overrides
fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config from {:?}", DEFAULT_CONFIG))?,
        None => Config::default(),
    };

    apply_overrides(&mut config, overrides);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: &Overrides) {
    if let Some(listen) = &overrides.listen {
        config.server.listen = vec![listen.clone()];
    }
    if !overrides.proxies.is_empty() {
        config.proxy.upstreams = overrides.proxies.clone();
    }
    if let Some(exclude) = &overrides.exclude {
        config.proxy.exclude = exclude.clone();
    }
    if let Some(cache_dir) = &overrides.cache_dir {
        config.proxy.cache_dir = cache_dir.clone();
    }
}

/// Pingora wants a host; ":8081" means every interface
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

fn run_server(config: Config, level: tracing::Level) -> Result<()> {
    // Runtime for the OTLP batch exporter; Pingora runs its own
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let telemetry_provider = {
        let _guard = rt.enter();
        telemetry::init_tracing(level, &config.global.tracing)?
    };

    info!("Starting modproxy");

    if config.is_direct_only() {
        warn!("No upstream configured, serving every request from the local module tree");
    }
    info!(
        upstreams = ?config.proxy.upstreams,
        exclude = %config.proxy.exclude,
        cache_dir = ?config.proxy.cache_dir,
        local_root = ?config.local.root,
        "Configuration loaded"
    );

    let router = Router::from_config(&config).context("Failed to build router")?;
    let proxy = ModProxy::new(router);

    let mut server = Server::new(None).context("Failed to create Pingora server")?;
    server.bootstrap();

    let mut service = http_proxy_service(&server.configuration, proxy);
    for addr in &config.server.listen {
        let addr = listen_addr(addr);
        info!(address = %addr, "Adding listener");
        service.add_tcp(&addr);
    }
    server.add_service(service);

    // Keep the exporter and its runtime alive for the lifetime of the server
    let _telemetry_guard = (telemetry_provider, rt);

    info!("modproxy started successfully");
    server.run_forever();
}

fn validate_config(config: &Config) -> Result<()> {
    Router::from_config(config).context("Failed to build router")?;

    println!("Configuration is valid!");
    for addr in &config.server.listen {
        println!("  Listen: {}", addr);
    }
    if config.is_direct_only() {
        println!("  Upstreams: none (direct only)");
    }
    for (i, upstream) in config.proxy.upstreams.iter().enumerate() {
        println!("  Upstream {}: {}", i, upstream);
    }
    if !config.proxy.exclude.is_empty() {
        println!("  Direct patterns: {}", config.proxy.exclude);
    }
    println!("  Cache: {:?}", config.proxy.cache_dir);
    println!("  Local modules: {:?}", config.local.root);

    Ok(())
}
