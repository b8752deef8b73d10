use a3s_config_service::config::{RemoteClientSettings, ServiceConfig};
use a3s_config_service::{ConfigServer, ParserRegistry, RemoteConfiguration};
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// A3S Config Service — remote configuration distribution
#[derive(Parser)]
#[command(name = "a3s-config-service", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the distribution service and the fetch endpoint
    Serve {
        /// Path to service configuration file (.hcl)
        #[arg(short, long, default_value = "service.hcl")]
        config: String,

        /// Override listen address (e.g., 0.0.0.0:8088)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Validate a service configuration file without starting
    Validate {
        /// Path to service configuration file (.hcl)
        #[arg(short, long, default_value = "service.hcl")]
        config: String,
    },
    /// Load a client configuration once and print the merged key/values
    Dump {
        /// Path to client settings file (.hcl)
        #[arg(short, long, default_value = "client.hcl")]
        config: String,

        /// Only print keys at or below this prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> a3s_config_service::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate_config(&config).await,
        Commands::Dump { config, prefix } => {
            init_tracing(&cli.log_level);
            dump_config(&config, prefix.as_deref()).await
        }
        Commands::Serve { config, listen } => {
            init_tracing(&cli.log_level);
            serve(&config, listen).await
        }
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();
}

async fn serve(path: &str, listen: Option<String>) -> a3s_config_service::Result<()> {
    tracing::info!("A3S Config Service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(config = path, "Loading configuration");

    let mut config = ServiceConfig::from_file(path).await?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    let server = ConfigServer::new(config)?;
    server.start().await?;

    tracing::info!("Config service ready — press Ctrl+C to stop");
    server.wait_for_shutdown().await;
    Ok(())
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> a3s_config_service::Result<()> {
    if !Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        std::process::exit(1);
    }

    let config = match ServiceConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!("  Listen:      {}", config.listen);
    if let Some(ref file) = config.provider.file {
        let extensions = if file.extensions.is_empty() {
            "*".to_string()
        } else {
            file.extensions.join(", ")
        };
        println!(
            "  Provider:    file {} (extensions: {}, recursive: {})",
            file.root.display(),
            extensions,
            file.include_subdirectories
        );
    }
    match (&config.redis, &config.rabbitmq) {
        (None, None) => println!("  Publisher:   none (detection only)"),
        (redis, rabbitmq) => {
            if redis.is_some() {
                println!("  Publisher:   redis");
            }
            if let Some(rabbitmq) = rabbitmq {
                println!(
                    "  Publisher:   rabbitmq {}:{} exchange:{}",
                    rabbitmq.hostname, rabbitmq.port, rabbitmq.exchange
                );
            }
        }
    }

    Ok(())
}

/// Load a client configuration and print every merged key
async fn dump_config(path: &str, prefix: Option<&str>) -> a3s_config_service::Result<()> {
    let settings = RemoteClientSettings::from_file(path).await?;
    let config = RemoteConfiguration::load(settings, ParserRegistry::default()).await?;

    let entries = config.keys_with_prefix(prefix.unwrap_or(""));
    for (key, value) in &entries {
        println!("{} = {}", key, value);
    }
    tracing::info!(keys = entries.len(), "Configuration dumped");
    Ok(())
}
