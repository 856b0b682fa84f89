use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use storyreel::pipe::audio_duration_us;
use storyreel::{StoryMaker, StoryPage, StorySettings};

#[derive(Parser, Debug)]
#[command(name = "storyreel", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Produce a story video from a manifest (requires `ffmpeg` on PATH).
    Render(RenderArgs),
    /// Print the duration of an audio file.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Input story manifest JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output media path.
    #[arg(long)]
    out: PathBuf,

    /// Replace the output file if it exists.
    #[arg(long)]
    overwrite: bool,

    /// Skip the video track and produce audio only.
    #[arg(long)]
    audio_only: bool,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Audio file to inspect.
    path: PathBuf,
}

/// On-disk manifest: settings overrides plus the page list. Relative asset
/// paths resolve against the manifest's directory.
#[derive(Deserialize, Debug)]
struct Manifest {
    #[serde(default)]
    settings: StorySettings,
    pages: Vec<StoryPage>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Probe(args) => cmd_probe(args),
    }
}

fn read_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let f = File::open(path).with_context(|| format!("open manifest '{}'", path.display()))?;
    let r = BufReader::new(f);
    let manifest: Manifest = serde_json::from_reader(r).with_context(|| "parse manifest JSON")?;
    Ok(manifest)
}

fn resolve(root: &Path, path: &mut Option<PathBuf>) {
    if let Some(p) = path {
        if p.is_relative() {
            *p = root.join(&p);
        }
    }
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut manifest = read_manifest(&args.in_path)?;
    let root = args.in_path.parent().unwrap_or_else(|| Path::new("."));

    manifest.settings.overwrite |= args.overwrite;
    if args.audio_only {
        manifest.settings.include_video = false;
    }
    resolve(root, &mut manifest.settings.caption_font);

    for page in &mut manifest.pages {
        resolve(root, &mut page.image);
        resolve(root, &mut page.narration);
        resolve(root, &mut page.soundtrack);
        if page.narration_duration_us == 0 {
            if let Some(narration) = &page.narration {
                page.narration_duration_us = audio_duration_us(narration)?;
            }
        }
    }

    let mut maker = StoryMaker::new(&args.out, manifest.settings, manifest.pages)?;
    let progress = maker.progress_handle();
    let finished = Arc::new(AtomicBool::new(false));

    let watcher = {
        let finished = Arc::clone(&finished);
        std::thread::spawn(move || {
            while !finished.load(Ordering::Acquire) {
                info!(
                    overall = format!("{:.0}%", progress.progress() * 100.0),
                    audio = format!("{:.0}%", progress.audio_progress() * 100.0),
                    video = format!("{:.0}%", progress.video_progress() * 100.0),
                    "producing"
                );
                std::thread::sleep(Duration::from_millis(500));
            }
        })
    };

    let result = maker.churn();
    finished.store(true, Ordering::Release);
    let _ = watcher.join();
    result?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}

fn cmd_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let duration_us = audio_duration_us(&args.path)?;
    println!(
        "{}: {:.3}s",
        args.path.display(),
        duration_us as f64 / 1_000_000.0
    );
    Ok(())
}
