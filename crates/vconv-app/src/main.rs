//! vconv - re-encode the video track of an MP4 file
//!
//! Entry point of the command line converter.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vconv_core::{mime, MediaLocator};
use vconv_media::MediaProbe;
use vconv_pipeline::{ConversionEvent, ConverterConfig, VideoConverter};

#[derive(Parser, Debug)]
#[command(name = "vconv", version, about = "Decode and re-encode video files")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert the first video track of a file.
    Convert(ConvertArgs),
    /// Print the tracks of a file as JSON.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Source file path or file:// URI.
    input: String,

    /// Output media type.
    #[arg(long, default_value = mime::VIDEO_AVC)]
    mime: String,

    /// Directory for the converted file. Overrides the configuration.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// ffmpeg binary. Overrides the configuration.
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Source file path or file:// URI.
    input: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Convert(args) => cmd_convert(args),
        Command::Probe(args) => cmd_probe(args),
    }
}

fn cmd_convert(args: ConvertArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ConverterConfig::load(path)
            .with_context(|| format!("load config '{}'", path.display()))?,
        None => ConverterConfig::default(),
    };
    if args.output_dir.is_some() {
        config.output_dir = args.output_dir;
    }
    if args.ffmpeg.is_some() {
        config.ffmpeg_path = args.ffmpeg;
    }

    let source = MediaLocator::parse(&args.input)?;
    if !vconv_media::ffmpeg::is_available(config.ffmpeg_path.as_deref()) {
        warn!("ffmpeg was not found; decoding and encoding will fail");
    }

    let converter = VideoConverter::new(config)?;
    info!(source = %source, output_dir = %converter.resolver().output_dir().display(), "converting");
    let handle = converter.spawn(source, args.mime);

    let mut last_percent = None;
    for event in handle.events().iter() {
        match event {
            ConversionEvent::Progress(fraction) => {
                let percent = (fraction * 100.0).floor() as u32;
                if last_percent != Some(percent) {
                    eprint!("\rconverting: {percent:3}%");
                    last_percent = Some(percent);
                }
            }
            ConversionEvent::Completed(output) => {
                eprintln!();
                println!("{output}");
                break;
            }
            ConversionEvent::Failed(message) => {
                eprintln!();
                bail!("conversion failed: {message}");
            }
        }
    }

    let report = handle.join()?;
    info!(
        samples = report.samples_written,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "done"
    );
    Ok(())
}

fn cmd_probe(args: ProbeArgs) -> Result<()> {
    let source = MediaLocator::parse(&args.input)?;
    let probe = MediaProbe::probe(source.path())
        .with_context(|| format!("probe '{source}'"))?;
    println!("{}", probe.to_json()?);
    Ok(())
}
