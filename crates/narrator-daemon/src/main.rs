use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use narrator_daemon::{
    alignment::{AlignmentMode, MfaAligner},
    bridge::Bridge,
    capability::log_recommendation,
    config::AppConfig,
    service::{NarrationRequest, NarrationService},
    tts::{self, spawn_warmup},
};

#[derive(Parser)]
#[command(name = "narrator-daemon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket bridge (default).
    Serve,
    /// Narrate a text file into audio.wav, captions.srt and captions.vtt.
    Render(RenderArgs),
}

#[derive(Args)]
struct RenderArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "auto")]
    engine: String,
    #[arg(long, default_value = "af_heart")]
    voice: String,
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    #[arg(long)]
    max_chars: Option<usize>,
    /// Skip forced alignment and time captions from chunk durations.
    #[arg(long)]
    fast: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Render(args) => render(config, args).await,
    }
}

fn build_service(config: AppConfig) -> Result<Arc<NarrationService>> {
    let registry = tts::create_backends(&config);
    let aligner = Arc::new(MfaAligner::from_config(&config.alignment));
    Ok(Arc::new(NarrationService::new(config, registry, aligner)?))
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting narrator daemon");
    log_recommendation(&config.system);

    let service = build_service(config)?;
    let warmup = spawn_warmup(service.registry().clone(), service.pool().clone());
    tokio::spawn(async move {
        match warmup.finished().await {
            Some(report) if report.failed.is_empty() => {
                info!(engines = ?report.warmed, "Backends warmed up")
            }
            Some(report) => warn!(failed = ?report.failed, "Some backends failed to warm up"),
            None => warn!("Warm-up task went away without reporting"),
        }
    });
    let _sweepers = service.spawn_maintenance();

    let mut bridge = Bridge::bind(&service.config().bridge, service.clone()).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(?err, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        }
        result = bridge.closed() => {
            if let Err(err) = result {
                error!(?err, "Bridge stopped");
            }
        }
    }

    Ok(())
}

async fn render(config: AppConfig, args: RenderArgs) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let service = build_service(config)?;
    let mut request = NarrationRequest::new(text);
    request.engine = args.engine;
    request.voice = args.voice;
    request.speed = args.speed;
    request.max_chars = args.max_chars;
    if args.fast {
        request.alignment_mode = AlignmentMode::Fast;
    }

    let narration = service
        .narrate(&request)
        .await
        .context("narration failed")?;
    narration.artifacts.write_to_dir(&args.out)?;

    println!(
        "{} chunks with {}: {:.2}s of audio in {:.2}s (RTF {:.3}) -> {}",
        narration.chunks,
        narration.engine,
        narration.audio_secs,
        narration.wall_secs,
        narration.rtf(),
        args.out.display()
    );
    if !narration.failed_chunks.is_empty() {
        warn!(chunks = ?narration.failed_chunks, "Some chunks were replaced by silence");
    }
    Ok(())
}
