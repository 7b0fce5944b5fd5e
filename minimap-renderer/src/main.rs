use anyhow::{Context, anyhow};
use clap::{App, Arg};
use indicatif::{ProgressBar, ProgressStyle};

use warships_minimap_renderer::config::RendererConfig;
use warships_minimap_renderer::job::{self, ProgressSink};

struct CliSink {
    bar: ProgressBar,
}

impl CliSink {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}%")
                .expect("static template is valid")
                .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl ProgressSink for CliSink {
    fn status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    fn progress(&self, fraction: f64) {
        self.bar.set_position((fraction * 100.0) as u64);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let matches = App::new("Minimap Renderer")
        .about("Renders a battle replay as an annotated minimap timelapse video")
        .arg(
            Arg::with_name("REPLAY")
                .help("The replay file to render (or a zip of two replays with --dual)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .help("Output MP4 file path")
                .short("o")
                .long("output")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("DUAL")
                .help("Merge two opposing recordings of the same battle (input is a zip)")
                .long("dual"),
        )
        .arg(
            Arg::with_name("ASSETS")
                .help("Directory holding per-version resource bundles")
                .short("a")
                .long("assets")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("Path to a TOML config file")
                .short("c")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("PRINT_CONFIG")
                .help("Print a commented default config and exit")
                .long("print-config"),
        )
        .arg(
            Arg::with_name("FPS")
                .help("Output frame rate")
                .long("fps")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("QUALITY")
                .help("Encoder quality, 1-10")
                .short("q")
                .long("quality")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("LOGS")
                .help("Render the extended damage/ribbon/achievement/death log panel")
                .long("logs"),
        )
        .arg(
            Arg::with_name("FAST_FORWARD")
                .help("Fixed-60fps mode with background music")
                .long("fast-forward"),
        )
        .arg(
            Arg::with_name("KILL_HIGHLIGHT")
                .help("Sync audio to the first kill scored by the recording player")
                .long("kill-highlight"),
        )
        .get_matches();

    if matches.is_present("PRINT_CONFIG") {
        print!("{}", RendererConfig::generate_default_toml());
        return Ok(());
    }

    let mut config = match matches.value_of("CONFIG") {
        Some(path) => RendererConfig::load(std::path::Path::new(path))?,
        None => RendererConfig::default(),
    };
    config.apply_cli_overrides(&matches);

    let replay_path = matches.value_of("REPLAY").expect("REPLAY is required");
    let output = matches.value_of("OUTPUT").expect("OUTPUT is required");
    let data = std::fs::read(replay_path)
        .with_context(|| format!("failed to read {replay_path}"))?;

    let sink = CliSink::new();
    let assets_root = config.assets_root.clone();
    let result = if matches.is_present("DUAL") {
        job::render_dual(&data, &assets_root, &sink)
    } else {
        job::render_single(&data, &assets_root, config.into_render_options(), &sink)
    };
    sink.bar.finish_and_clear();

    let output_data = result.map_err(|e| anyhow!("{e}"))?;
    std::fs::write(output, &output_data.video)
        .with_context(|| format!("failed to write {output}"))?;

    println!(
        "Render {} finished in {} -> {} ({} bytes)",
        output_data.render_id,
        output_data.elapsed,
        output,
        output_data.video.len()
    );
    Ok(())
}
