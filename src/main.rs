//! HeronMQ - MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   heronmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (TOML)
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use heronmq::broker::{Broker, BrokerConfig};
use heronmq::config::Config;
use heronmq::interceptor::BrokerInterceptor;
use heronmq::security::{
    AcceptAllAuthenticator, ConfigAuthenticator, DynAuthenticator, DynAuthorizator,
    PermitAllAuthorizator, TopicPolicyAuthorizator,
};
use heronmq::store::MemoryStore;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// HeronMQ - MQTT v3.1/v3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "heronmq")]
#[command(version = "0.1.0")]
#[command(about = "MQTT v3.1/v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // CLI overrides config, config overrides defaults
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let broker_config = BrokerConfig {
        bind_addr: args.bind.unwrap_or(file_config.server.bind),
        max_packet_size: file_config.server.max_packet_size,
        outbound_queue: file_config.server.outbound_queue,
        connect_timeout: Duration::from_secs(file_config.server.connect_timeout),
        allow_anonymous: file_config.auth.allow_anonymous,
    };

    info!("Starting HeronMQ MQTT broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);

    let authenticator: DynAuthenticator = if file_config.auth.users.is_empty() {
        info!("  Authentication: accept-all");
        Arc::new(AcceptAllAuthenticator)
    } else {
        info!(
            "  Authentication: {} users configured (anonymous: {})",
            file_config.auth.users.len(),
            file_config.auth.allow_anonymous
        );
        Arc::new(ConfigAuthenticator::new(&file_config.auth))
    };

    let authorizator: DynAuthorizator =
        match TopicPolicyAuthorizator::from_config(&file_config.authz) {
            Some(policy) => {
                info!(
                    "  Authorization: restricted to topic {:?}, QoS {:?}",
                    file_config.authz.allowed_topic, file_config.authz.allowed_qos
                );
                Arc::new(policy)
            }
            None => {
                info!("  Authorization: permit-all");
                Arc::new(PermitAllAuthorizator)
            }
        };

    let broker = Broker::with_providers(
        broker_config,
        Arc::new(MemoryStore::new()),
        authenticator,
        authorizator,
        Arc::new(BrokerInterceptor::new()),
    )?;

    tokio::select! {
        result = broker.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C");
            broker.shutdown();
        }
    }

    Ok(())
}
