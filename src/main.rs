//! `mediarelay` CLI - run the server or resolve a single page

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mediarelay::{start_server, Config, Resolver, ServiceRole};

#[derive(Parser)]
#[command(name = "mediarelay")]
#[command(about = "Resolve provider pages to direct media URLs and proxy the streams")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/mediarelay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Components to expose
        #[arg(long, value_enum, default_value_t = ServiceRole::All)]
        role: ServiceRole,
    },

    /// Resolve one provider page and print the result as JSON
    Resolve {
        /// Provider page URL
        url: String,

        /// movie or tv, for the log only
        #[arg(long)]
        media_type: Option<String>,

        /// TMDB id, for the log only
        #[arg(long)]
        tmdb_id: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `resolve` output stays clean JSON
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind, role } => cmd_serve(config, bind, role).await?,
        Commands::Resolve {
            url,
            media_type,
            tmdb_id,
        } => cmd_resolve(config, &url, media_type.as_deref(), tmdb_id.as_deref()).await?,
        Commands::Config => cmd_config(&config)?,
    }

    Ok(())
}

async fn cmd_serve(mut config: Config, bind: Option<SocketAddr>, role: ServiceRole) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    start_server(config, role).await
}

async fn cmd_resolve(
    config: Config,
    url: &str,
    media_type: Option<&str>,
    tmdb_id: Option<&str>,
) -> Result<()> {
    let provider_url = url::Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    info!(provider_url = %provider_url, media_type, tmdb_id, "Resolving stream");

    let resolver = Resolver::new(config.resolver);
    let result = resolver.resolve(provider_url.as_str()).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}
