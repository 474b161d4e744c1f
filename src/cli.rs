use clap::Parser;
use std::path::PathBuf;

use crate::config::GridLayout;
use crate::entities::InstanceRef;

/// Headless dual-tier cine player: streams instances into a grid and logs playback
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Base URL of the frame service (e.g. http://localhost:8042/dicom-web)
    #[arg(value_name = "URL")]
    pub base_url: String,

    /// Instance to play, as STUDY/SERIES/SOP:FRAMES (repeat to fill more slots)
    #[arg(short = 'i', long = "instance", value_name = "INSTANCE", value_parser = parse_instance)]
    pub instances: Vec<InstanceRef>,

    /// Grid layout: 1x1, 2x2, 2x3, 3x3 or 4x4 (default: from config)
    #[arg(short = 'g', long = "layout", value_name = "RxC")]
    pub layout: Option<GridLayout>,

    /// Target frame rate, 1..60 (default: from config)
    #[arg(long = "fps", value_name = "N")]
    pub fps: Option<u32>,

    /// Preview resolution: 128, 256 or 512 (default: from config)
    #[arg(short = 'r', long = "resolution", value_name = "PX")]
    pub resolution: Option<u32>,

    /// Max concurrent preview preloads, 1..16 (default: from config)
    #[arg(short = 'j', long = "concurrency", value_name = "N")]
    pub concurrency: Option<usize>,

    /// Per-request timeout in seconds (default: none)
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Stop after this many seconds (default: run until every slot is diagnostic)
    #[arg(short = 'd', long = "duration", value_name = "SECS")]
    pub duration: Option<f64>,

    /// Write the effective configuration back to cinegrid.json
    #[arg(long = "save-config")]
    pub save_config: bool,

    /// Enable debug logging to file (default: cinegrid.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

/// Parse `STUDY/SERIES/SOP:FRAMES`.
pub fn parse_instance(s: &str) -> Result<InstanceRef, String> {
    let (path, frames) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}': expected STUDY/SERIES/SOP:FRAMES", s))?;
    let frames: usize = frames
        .parse()
        .map_err(|_| format!("'{}': frame count must be a positive integer", s))?;
    if frames == 0 {
        return Err(format!("'{}': frame count must be at least 1", s));
    }

    let ids: Vec<&str> = path.split('/').collect();
    match ids.as_slice() {
        [study, series, sop] if !study.is_empty() && !series.is_empty() && !sop.is_empty() => {
            Ok(InstanceRef::new(*study, *series, *sop, frames))
        }
        _ => Err(format!("'{}': expected three '/'-separated ids", s)),
    }
}
