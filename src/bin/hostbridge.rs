use clap::{Parser, Subcommand};
use futures::StreamExt;
use hostbridge::{
    engine::EchoLoader, BridgeBuilder, BridgeConfig, Error, Family, InternalResult,
};
use std::{io::Write, path::PathBuf, sync::Arc};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hostbridge.json")]
    config: PathBuf,

    /// Capability family to talk to
    #[arg(short, long, default_value = "llm")]
    family: Family,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One-shot generation
    Complete {
        input: String,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Streaming generation, printed as it arrives
    Stream {
        input: String,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Resources available for the family
    List,
    /// Load a resource explicitly
    Load { name: String },
    /// Lifecycle state of the family
    Status,
}

async fn run(cli: &Cli) -> InternalResult<()> {
    let config = if cli.config.exists() {
        BridgeConfig::from_file(&cli.config)?
    } else {
        BridgeConfig::default()
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    // The echo engine stands in for native engines on both families.
    let bridge = BridgeBuilder::new(config)
        .capability(Family::Llm, Arc::new(EchoLoader))
        .capability(Family::Tts, Arc::new(EchoLoader))
        .build_headless()?;
    let mux = bridge.multiplexer().clone();

    let outcome = match &cli.command {
        Command::Complete { input, max_tokens } => mux
            .complete(cli.family, input, *max_tokens)
            .await
            .map(|text| println!("{}", text)),
        Command::Stream { input, max_tokens } => {
            let mut stream = mux.generate(cli.family, input, *max_tokens);
            let mut stdout = std::io::stdout();
            let mut outcome = Ok(());
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        print!("{}", chunk);
                        let _ = stdout.flush();
                    }
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            println!();
            outcome
        }
        Command::List => mux.list(cli.family).await.map(|names| {
            for name in names {
                println!("{}", name);
            }
        }),
        Command::Load { name } => mux
            .load(cli.family, name)
            .await
            .map(|resource| println!("loaded {}", resource)),
        Command::Status => mux.status(cli.family).await.and_then(|status| {
            serde_json::to_string_pretty(&status)
                .map(|json| println!("{}", json))
                .map_err(|e| hostbridge::CallError::InvalidResponse(e.to_string()))
        }),
    };

    bridge.shutdown().await;
    outcome.map_err(Error::from)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
