use cinegrid::cli::Args;
use cinegrid::config::{CONFIG_FILE, PreviewResolution, ViewerConfig};
use cinegrid::core::diagnostic::LoggingSurface;
use cinegrid::core::slot_events::{PhaseChanged, SlotFailed};
use cinegrid::core::source::HttpFrameSource;
use cinegrid::core::transition::{Phase, Tier};
use cinegrid::entities::SlotId;
use cinegrid::paths::{self, PathConfig};
use cinegrid::ViewerSession;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Host refresh period (~60 Hz)
const TICK: Duration = Duration::from_millis(16);
/// Status line period
const STATUS_EVERY: Duration = Duration::from_secs(1);

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| paths::data_file("cinegrid.log", path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .filter_module("reqwest", log::LevelFilter::Info)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("reqwest", log::LevelFilter::Info)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Stored preferences with command-line overrides on top.
fn effective_config(args: &Args, path_config: &PathConfig) -> Result<ViewerConfig> {
    let config_path = paths::config_file(CONFIG_FILE, path_config);
    info!("Config path: {}", config_path.display());

    let mut config = ViewerConfig::load_or_default(&config_path);
    if let Some(layout) = args.layout {
        config.layout = layout;
    }
    if let Some(fps) = args.fps {
        config.target_frame_rate = fps;
    }
    if let Some(px) = args.resolution {
        let res = PreviewResolution::nearest(px);
        if res.pixels() != px {
            warn!("Preview resolution {} not supported, using {}", px, res.pixels());
        }
        config.preview_resolution = res;
    }
    if let Some(n) = args.concurrency {
        config.max_concurrent_preloads = n;
    }
    let config = config.clamped();

    if args.save_config {
        config.save(&config_path)?;
        info!("Saved configuration to {}", config_path.display());
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {:#}", e);
    }

    init_logging(&args, &path_config)?;
    info!("cinegrid {} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let config = effective_config(&args, &path_config)?;

    let timeout = args.timeout.map(Duration::from_secs);
    let source = HttpFrameSource::new(args.base_url.clone(), timeout)
        .context("Failed to build HTTP client")?
        .with_whole_instance(config.whole_instance_preview);

    let mut session = ViewerSession::new(config, Arc::new(source), Arc::new(LoggingSurface))
        .context("Failed to start viewer session")?;

    session.events().subscribe::<PhaseChanged, _>(|e| {
        info!("{}: {} -> {}", e.slot, e.from, e.to);
    });
    session.events().subscribe::<SlotFailed, _>(|e| {
        error!("{}: {:?} tier failed: {}", e.slot, e.tier, e.message);
    });

    if args.instances.is_empty() {
        warn!("No instances given (-i STUDY/SERIES/SOP:FRAMES); nothing to play");
    }
    let mut assigned = Vec::new();
    for (i, instance) in args.instances.iter().enumerate() {
        let slot = SlotId::new(i);
        if i >= session.slot_count() {
            warn!("Layout {} has no {}, skipping {}", session.config().layout, slot, instance);
            continue;
        }
        session.assign(slot, instance.clone())?;
        assigned.push(slot);
    }

    let started = Instant::now();
    let deadline = args.duration.map(|s| started + Duration::from_secs_f64(s.max(0.0)));
    let mut last_status = started;

    loop {
        let now = Instant::now();
        session.tick(now);

        if now.duration_since(last_status) >= STATUS_EVERY {
            last_status = now;
            for &slot in &assigned {
                let Some(state) = session.slot(slot) else { continue };
                let pct = |tier| {
                    session
                        .progress(slot, tier)
                        .map(|p| format!("{:.0}%", p.fraction() * 100.0))
                        .unwrap_or_else(|| "-".into())
                };
                info!(
                    "{}: {} frame {}/{} preview {} diagnostic {}",
                    slot,
                    state.phase,
                    state.current_frame_index + 1,
                    state.frame_count,
                    pct(Tier::Preview),
                    pct(Tier::Diagnostic)
                );
            }
        }

        if deadline.is_some_and(|d| now >= d) {
            info!("Duration elapsed");
            break;
        }
        let settled = assigned
            .iter()
            .all(|&s| session.phase(s) == Some(Phase::DiagnosticActive) || session.slot_error(s).is_some());
        if deadline.is_none() && settled {
            info!("All slots settled after {:.1}s", started.elapsed().as_secs_f64());
            break;
        }

        std::thread::sleep(TICK);
    }

    session.shutdown();
    Ok(())
}
