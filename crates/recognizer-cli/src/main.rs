use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recognizer_core::backend::with_deadline;
use recognizer_core::{Image, Notifier, Pipeline, PipelineError, RecognitionBackend};
use recognizer_io::mqtt::{CONNECT_WAIT, DISCONNECT_GRACE};
use recognizer_io::{
    format, load_references, Config, FfmpegGrabber, FileDiagnosticSink, FrameSource, LoadOptions,
    MqttNotifier, NoopNotifier, RekognitionBackend, RunMode,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "recognizer", version, about = "Recognizer operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print it without secrets
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run one recognition against the configured references
    Recognize {
        /// JPEG or PNG snapshot
        image: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Capture detection output instead of publishing
        #[arg(long)]
        discovery: bool,
    },
    /// Print the faces and labels the backend sees in an image
    Labels {
        image: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Grab one frame from a stream URL and save it
    Grab {
        url: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,
        /// Seconds to wait for the frame
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => {
            let config = Config::load(&LoadOptions {
                path: config,
                ..LoadOptions::default()
            })?;
            println!("{}", serde_json::to_string_pretty(&config.summary())?);
        }
        Commands::Recognize {
            image,
            config,
            discovery,
        } => recognize(&image, config, discovery).await?,
        Commands::Labels { image, config } => labels(&image, config).await?,
        Commands::Grab {
            url,
            output,
            ffmpeg,
            timeout,
        } => {
            let grabber = FfmpegGrabber::new(ffmpeg, Duration::from_secs(timeout));
            let frame = grabber.grab(&url).await?;
            let (width, height) = format::dimensions(frame.as_bytes())?;
            tokio::fs::write(&output, frame.as_bytes())
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("{}x{} frame written to {}", width, height, output.display());
        }
    }

    Ok(())
}

/// The CLI hands images to the pipeline directly, so no watch target is needed.
fn cli_options(config: Option<PathBuf>, discovery: bool) -> LoadOptions {
    LoadOptions {
        path: config,
        run_mode: Some(RunMode::Api),
        discovery: discovery.then_some(true),
    }
}

async fn read_image(path: &Path) -> Result<Image> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    format::ensure_supported(&bytes).with_context(|| format!("{}", path.display()))?;
    Ok(Image::from(bytes))
}

async fn recognize(image: &Path, config: Option<PathBuf>, discovery: bool) -> Result<()> {
    let config = Config::load(&cli_options(config, discovery)).context("loading configuration")?;
    let image = read_image(image).await?;
    let references = load_references(&config.references)
        .await
        .context("loading reference images")?;
    let backend = Arc::new(RekognitionBackend::from_env(config.aws_region.as_deref()).await);

    let mqtt = config.mqtt.as_ref().map(|c| Arc::new(MqttNotifier::connect(c)));
    let notifier: Arc<dyn Notifier> = match &mqtt {
        Some(client) => {
            if !client.wait_connected(CONNECT_WAIT).await {
                tracing::warn!("MQTT broker not reachable, the decision will not be published");
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
        pipeline = pipeline.with_diagnostics(Arc::new(FileDiagnosticSink::new(path)));
    }
    let result = pipeline.process(&image).await;

    if let Some(client) = mqtt {
        client.shutdown(DISCONNECT_GRACE).await;
    }

    match result {
        Ok(assessment) => {
            println!("{}", serde_json::to_string_pretty(&assessment)?);
            Ok(())
        }
        Err(PipelineError::NotRecognized { reason, assessment }) => {
            println!("{}", serde_json::to_string_pretty(&assessment)?);
            bail!("{reason}")
        }
        Err(err) => Err(err.into()),
    }
}

async fn labels(image: &Path, config: Option<PathBuf>) -> Result<()> {
    let config = Config::load(&cli_options(config, true)).context("loading configuration")?;
    let image = read_image(image).await?;
    let backend = RekognitionBackend::from_env(config.aws_region.as_deref()).await;

    let faces = with_deadline(config.call_timeout, backend.detect_faces(&image)).await?;
    let labels = with_deadline(config.call_timeout, backend.detect_labels(&image)).await?;
    let verdict = config.label_policy.evaluate(&labels);

    let report = serde_json::json!({
        "face_count": faces.face_count,
        "labels": labels,
        "policy": match verdict.violation() {
            Some(violation) => serde_json::json!({ "passed": false, "violation": violation }),
            None => serde_json::json!({ "passed": true }),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
