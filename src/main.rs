use clap::{Parser, Subcommand};
use futures::StreamExt;
use llama_gateway::{
    normalize, render_prompt, serve, AppState, GatewayConfig, LlamaCppEngine, RawMessage, Result,
    TextGenerator,
};
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llama-gateway")]
#[command(about = "OpenAI- and Claude-compatible API server for a local llama.cpp model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        config: GatewayConfig,
    },
    /// Run one completion through the prompt template and print it
    Complete {
        text: String,
        /// Optional system instruction
        #[arg(long)]
        system: Option<String>,
        #[command(flatten)]
        config: GatewayConfig,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let engine =
                LlamaCppEngine::load(&config.llama_bin, &config.model_path, config.gpu_layers)
                    .await?;
            let addr = config.resolve_addr().await?;
            if config.api_key().is_some() {
                tracing::info!("API key authentication enabled");
            }
            serve(AppState::new(Arc::new(engine), config), addr).await?
        }
        Commands::Complete {
            text,
            system,
            config,
        } => run_completion(config, system, text).await?,
    }

    Ok(())
}

async fn run_completion(config: GatewayConfig, system: Option<String>, text: String) -> Result<()> {
    let engine =
        LlamaCppEngine::load(&config.llama_bin, &config.model_path, config.gpu_layers).await?;

    let mut raw = Vec::new();
    if let Some(system) = system {
        raw.push(RawMessage::new("system", system));
    }
    raw.push(RawMessage::new("user", text));
    let prompt = render_prompt(&normalize(&raw));

    let mut stream = engine
        .generate_stream(prompt, config.options(None, None))
        .await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        write!(stdout, "{}", chunk?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    Ok(())
}
