//! Viewer configuration and its JSON preference file.
//!
//! Every field is hot-swappable through `ViewerSession::set_config`; values
//! are clamped rather than rejected, both on load and on apply.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::core::preload::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENT, MAX_CONCURRENT_LIMIT};
use crate::core::scheduler::{MAX_FPS, MIN_FPS};

/// Preference file name inside the config dir.
pub const CONFIG_FILE: &str = "cinegrid.json";

/// Grid size of the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GridLayout {
    #[serde(rename = "1x1")]
    Single,
    #[default]
    #[serde(rename = "2x2")]
    Quad,
    #[serde(rename = "2x3")]
    Six,
    #[serde(rename = "3x3")]
    Nine,
    #[serde(rename = "4x4")]
    Sixteen,
}

impl GridLayout {
    pub const ALL: [GridLayout; 5] = [Self::Single, Self::Quad, Self::Six, Self::Nine, Self::Sixteen];

    /// (rows, columns)
    pub fn dims(self) -> (usize, usize) {
        match self {
            Self::Single => (1, 1),
            Self::Quad => (2, 2),
            Self::Six => (2, 3),
            Self::Nine => (3, 3),
            Self::Sixteen => (4, 4),
        }
    }

    pub fn slot_count(self) -> usize {
        let (r, c) = self.dims();
        r * c
    }
}

impl fmt::Display for GridLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (r, c) = self.dims();
        write!(f, "{}x{}", r, c)
    }
}

impl FromStr for GridLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|l| l.to_string() == s)
            .ok_or_else(|| format!("unknown layout '{}' (expected 1x1, 2x2, 2x3, 3x3 or 4x4)", s))
    }
}

/// Longest edge of decoded preview rasters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PreviewResolution {
    Low,
    #[default]
    Medium,
    High,
}

impl PreviewResolution {
    pub fn pixels(self) -> u32 {
        match self {
            Self::Low => 128,
            Self::Medium => 256,
            Self::High => 512,
        }
    }

    /// Nearest supported size.
    pub fn nearest(px: u32) -> Self {
        match px {
            0..=191 => Self::Low,
            192..=383 => Self::Medium,
            _ => Self::High,
        }
    }
}

impl TryFrom<u32> for PreviewResolution {
    type Error = String;

    fn try_from(px: u32) -> std::result::Result<Self, Self::Error> {
        match px {
            128 => Ok(Self::Low),
            256 => Ok(Self::Medium),
            512 => Ok(Self::High),
            other => Err(format!("unsupported preview resolution {} (expected 128, 256 or 512)", other)),
        }
    }
}

impl From<PreviewResolution> for u32 {
    fn from(r: PreviewResolution) -> u32 {
        r.pixels()
    }
}

/// Runtime configuration of a viewer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewerConfig {
    pub layout: GridLayout,
    /// Shared playback rate, 1..=60
    pub target_frame_rate: u32,
    pub preview_resolution: PreviewResolution,
    /// In-flight preview jobs, 1..=16
    pub max_concurrent_preloads: usize,
    /// Frames per multipart request
    pub batch_size: usize,
    /// Prefer the whole-instance preview endpoint when the source has one
    pub whole_instance_preview: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            layout: GridLayout::default(),
            target_frame_rate: 30,
            preview_resolution: PreviewResolution::default(),
            max_concurrent_preloads: DEFAULT_MAX_CONCURRENT,
            batch_size: DEFAULT_BATCH_SIZE,
            whole_instance_preview: true,
        }
    }
}

impl ViewerConfig {
    /// Copy with every numeric field inside its allowed range.
    pub fn clamped(&self) -> Self {
        Self {
            target_frame_rate: self.target_frame_rate.clamp(MIN_FPS, MAX_FPS),
            max_concurrent_preloads: self.max_concurrent_preloads.clamp(1, MAX_CONCURRENT_LIMIT),
            batch_size: self.batch_size.clamp(1, 64),
            ..self.clone()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config.clamped())
    }

    /// Load, falling back to defaults when the file is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{:#}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config: {}", path.display()))?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }
}
