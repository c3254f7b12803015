use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ideaworks::config::IdeaworksConfig;
use ideaworks::server::start_server;
use ideaworks::store::StudioDb;

#[derive(Parser)]
#[command(name = "ideaworks", about = "Idea-to-document generation service")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and background sweeper.
    Serve,
    /// Create a tenant and print its API token.
    AddTenant {
        name: String,
        /// Explicit API token; generated when omitted.
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ideaworks=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = IdeaworksConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => start_server(config).await,
        Command::AddTenant { name, token } => {
            let db = StudioDb::new(std::path::Path::new(&config.server.db_path))
                .with_context(|| format!("Failed to open database at {}", config.server.db_path))?;
            let token = token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let tenant = db.create_tenant(&name, &token)?;
            println!("Created tenant {} (id {})", tenant.name, tenant.id);
            println!("API token: {token}");
            Ok(())
        }
    }
}
