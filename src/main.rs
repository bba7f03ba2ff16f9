//! lumeo CLI - enhance low-light photos.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lumeo::model::{
    save_parameters, Device, EnhancementNetwork, KaimingInit, NetworkConfig, Recorder,
};
use lumeo::{Config, Enhancer, PublicError};

/// Enhance low-light photos with a U-Net.
#[derive(Parser, Debug)]
#[command(name = "lumeo")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enhance an image and write the result.
    Enhance {
        /// Input image path.
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output image path. The format always matches the input.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Content type claimed for the upload.
        #[arg(long, value_name = "MIME")]
        content_type: Option<String>,
    },

    /// Report brightness and low-light classification as JSON.
    Analyze {
        /// Input image path.
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Declared content type. Defaults to one guessed from the extension.
        #[arg(long, value_name = "MIME")]
        content_type: Option<String>,
    },

    /// Write freshly initialized network weights.
    InitWeights {
        /// Output safetensors path.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Random seed for reproducibility.
        #[arg(long, value_name = "INT")]
        seed: Option<u64>,
    },
}

/// Pipeline settings, read from flags or the environment once at startup.
#[derive(Args, Debug)]
struct Settings {
    /// Maximum upload size in MiB.
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value = "10", global = true)]
    max_file_size_mb: usize,

    /// Maximum accepted width or height in pixels.
    #[arg(long, env = "MAX_IMAGE_DIMENSION", default_value = "4096", global = true)]
    max_dimension: u32,

    /// Network input resolution (multiple of 16).
    #[arg(long, env = "IMG_SIZE", default_value = "256", global = true)]
    img_size: u32,

    /// Weight file path.
    #[arg(long, env = "MODEL_PATH", value_name = "PATH", global = true)]
    model_path: Option<PathBuf>,

    /// Compute device.
    #[arg(long, env = "DEVICE", default_value = "cpu", global = true)]
    device: String,

    /// Brightness below which an image counts as low-light.
    #[arg(long, env = "LOW_LIGHT_THRESHOLD", default_value = "0.3", global = true)]
    low_light_threshold: f64,

    /// Output JPEG quality (1-100).
    #[arg(short, long, env = "OUTPUT_QUALITY", default_value = "75", global = true)]
    quality: u8,
}

impl Settings {
    fn to_config(&self) -> lumeo::Result<Config> {
        Ok(Config {
            max_file_size: self.max_file_size_mb.saturating_mul(1024 * 1024),
            max_dimension: self.max_dimension,
            input_size: self.img_size,
            low_light_threshold: self.low_light_threshold,
            output_quality: self.quality,
            weights_path: self.model_path.clone(),
            device: self.device.parse::<Device>()?,
            ..Config::default()
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lumeo={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(err) = run(&cli) {
        if let Some(lib_err) = err.downcast_ref::<lumeo::Error>() {
            let public = PublicError::from_error(lib_err);
            match serde_json::to_string(&public) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{}", public.message),
            }
        } else {
            tracing::error!("{err:#}");
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Enhance {
            input,
            output,
            content_type,
        } => enhance(cli, input, output, content_type.as_deref()),
        Command::Analyze {
            input,
            content_type,
        } => analyze(cli, input, content_type.as_deref()),
        Command::InitWeights { output, seed } => init_weights(output, *seed),
    }
}

fn enhance(cli: &Cli, input: &Path, output: &Path, content_type: Option<&str>) -> Result<()> {
    let enhancer = Enhancer::new(cli.settings.to_config()?)?;
    let declared = content_type.or_else(|| guess_content_type(input));

    let file = fs::File::open(input)
        .with_context(|| format!("Failed to open input: {}", input.display()))?;

    let spinner = spinner("Enhancing image...");
    let result = enhancer.enhance_reader(file, declared);
    spinner.finish_and_clear();
    let enhanced = result?;

    fs::write(output, &enhanced.bytes)
        .with_context(|| format!("Failed to write output: {}", output.display()))?;
    enhancer.shutdown();

    println!("{}", serde_json::to_string_pretty(&enhanced)?);
    tracing::info!(
        "Enhanced {} -> {}",
        input.display(),
        output.display()
    );

    Ok(())
}

fn analyze(cli: &Cli, input: &Path, content_type: Option<&str>) -> Result<()> {
    let enhancer = Enhancer::new(cli.settings.to_config()?)?;
    let declared = content_type
        .or_else(|| guess_content_type(input))
        .unwrap_or("application/octet-stream");

    let file = fs::File::open(input)
        .with_context(|| format!("Failed to open input: {}", input.display()))?;
    let bytes = enhancer.read_upload(file)?;
    let report = enhancer.analyze(&bytes, declared)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_weights(output: &Path, seed: Option<u64>) -> Result<()> {
    let init = seed.map_or_else(KaimingInit::from_os_rng, KaimingInit::seeded);
    let mut recorder = Recorder::new(init);
    EnhancementNetwork::build(NetworkConfig::default(), &mut recorder)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    save_parameters(output, &recorder.into_parameters())?;

    tracing::info!("Wrote initialized weights to {}", output.display());
    Ok(())
}

fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
