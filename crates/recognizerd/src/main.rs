use anyhow::{Context, Result};
use clap::Parser;
use recognizer_core::{Notifier, Pipeline};
use recognizer_io::mqtt::{CONNECT_WAIT, DISCONNECT_GRACE};
use recognizer_io::{
    load_references, Config, FfmpegGrabber, FileDiagnosticSink, FileWatcher, LoadOptions,
    MqttNotifier, NoopNotifier, RekognitionBackend, RunMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod engine;
mod watch_loop;

#[cfg(test)]
mod testing;

use engine::{spawn_engine, EngineHandle};

/// Recognizer daemon.
#[derive(Parser)]
#[command(name = "recognizerd", version, about = "Face recognition decision daemon")]
struct Args {
    /// Config file (default: $RECOGNIZER_CONFIG, then ./config.toml, then ./configs/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Front end to run: file_watcher or api.
    #[arg(long)]
    mode: Option<RunMode>,

    /// Capture detection output instead of publishing decisions.
    #[arg(long)]
    discovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = LoadOptions {
        path: args.config,
        run_mode: args.mode,
        discovery: args.discovery.then_some(true),
    };

    let config = Config::load(&options).context("loading configuration")?;
    tracing::info!(config = %config.summary(), "recognizerd starting");

    let references = load_references(&config.references)
        .await
        .context("loading reference images")?;
    let backend = Arc::new(RekognitionBackend::from_env(config.aws_region.as_deref()).await);

    let mqtt = config.mqtt.as_ref().map(|c| Arc::new(MqttNotifier::connect(c)));
    let notifier: Arc<dyn Notifier> = match &mqtt {
        Some(client) => {
            if !client.wait_connected(CONNECT_WAIT).await {
                tracing::warn!("MQTT broker not reachable yet, retrying in the background");
            }
            client.clone() as Arc<dyn Notifier>
        }
        None => Arc::new(NoopNotifier),
    };

    let mut pipeline = Pipeline::new(
        backend,
        notifier,
        references,
        config.label_policy.clone(),
        config.pipeline_settings(),
    );
    if let Some(path) = config.diagnostics_file() {
        tracing::info!(path = %path.display(), "writing discovery records to file");
        pipeline = pipeline.with_diagnostics(Arc::new(FileDiagnosticSink::new(path)));
    }
    let engine = spawn_engine(pipeline);

    let reloader = tokio::spawn(reload_on_hangup(options, engine.clone()));

    match config.run_mode {
        RunMode::FileWatcher => {
            let target = config
                .target_image_path
                .clone()
                .context("target_image_path is required in file_watcher mode")?;
            let watcher = FileWatcher::new(target, config.target_image_poll);
            tracing::info!("recognizerd ready");
            tokio::select! {
                _ = watch_loop::run(watcher, engine.clone()) => {}
                signal = tokio::signal::ctrl_c() => signal?,
            }
        }
        RunMode::Api => {
            let state = api::ApiState {
                engine: engine.clone(),
                frames: Arc::new(FfmpegGrabber::new(&config.api.ffmpeg, config.api.grab_timeout)),
                run_mode: config.run_mode,
            };
            tracing::info!("recognizerd ready");
            api::serve(config.api.listen, state, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "waiting for ctrl-c failed");
                }
            })
            .await?;
        }
    }

    tracing::info!("recognizerd shutting down");
    reloader.abort();
    if let Some(client) = mqtt {
        client.shutdown(DISCONNECT_GRACE).await;
    }

    Ok(())
}

/// Re-read the config file on SIGHUP and swap references and label policy.
/// Other settings need a restart.
#[cfg(unix)]
async fn reload_on_hangup(options: LoadOptions, engine: EngineHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        tracing::info!("SIGHUP received, reloading references and label policy");
        if let Err(e) = reload(&options, &engine).await {
            tracing::error!(error = %format!("{e:#}"), "reload failed, keeping previous configuration");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn reload_on_hangup(_options: LoadOptions, _engine: EngineHandle) -> Result<()> {
    std::future::pending().await
}

async fn reload(options: &LoadOptions, engine: &EngineHandle) -> Result<()> {
    let config = Config::load(options).context("loading configuration")?;
    let references = load_references(&config.references)
        .await
        .context("loading reference images")?;
    engine.reload(references, config.label_policy).await?;
    Ok(())
}
