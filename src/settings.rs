//! Player settings
//!
//! Handles loading/saving of playback settings as XML files.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::video::{ClockInput, LoopMode};

/// How decoded frames reach the texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UploadMode {
    /// Async upload when the backend supports it
    #[default]
    Auto,
    /// Prefer async upload; falls back to sync when unsupported
    Async,
    /// Always copy from the host's end-of-frame hook
    Sync,
}

/// Playback settings for one player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "HapPlayerSettings")]
pub struct PlayerSettings {
    /// Movie to play
    #[serde(rename = "filePath", default)]
    pub file_path: PathBuf,

    /// Start time in seconds
    #[serde(rename = "time", default)]
    pub time: f64,

    /// Playback speed (negative plays backwards)
    #[serde(rename = "speed", default = "default_speed")]
    pub speed: f64,

    /// Host ticks per second
    #[serde(rename = "tickRate", default = "default_tick_rate")]
    pub tick_rate: f64,

    #[serde(rename = "loopMode", default)]
    pub loop_mode: LoopMode,

    #[serde(rename = "uploadMode", default)]
    pub upload_mode: UploadMode,
}

fn default_speed() -> f64 {
    1.0
}

fn default_tick_rate() -> f64 {
    60.0
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            file_path: PathBuf::new(),
            time: 0.0,
            speed: default_speed(),
            tick_rate: default_tick_rate(),
            loop_mode: LoopMode::default(),
            upload_mode: UploadMode::default(),
        }
    }
}

impl PlayerSettings {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Replace values that would stall or break the clock
    pub fn sanitize(&mut self) {
        if !(self.tick_rate.is_finite() && self.tick_rate > 0.0) {
            self.tick_rate = default_tick_rate();
        }
        if !self.speed.is_finite() {
            self.speed = default_speed();
        }
        if !self.time.is_finite() {
            self.time = 0.0;
        }
    }

    /// Per-tick time step
    pub fn delta(&self) -> f64 {
        self.speed / self.tick_rate
    }

    /// Clock input for a tick at `time`
    pub fn clock_input(&self, time: f64) -> ClockInput {
        ClockInput {
            time,
            delta: self.delta(),
            loop_mode: self.loop_mode,
            external_time: None,
        }
    }

    /// Parse settings from XML text
    pub fn from_xml(xml: &str) -> Result<Self, SettingsError> {
        let mut settings: Self = from_str(xml)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Serialize settings to XML text with a declaration
    pub fn to_xml(&self) -> Result<String, SettingsError> {
        let xml = to_string(self)?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", xml))
    }

    /// Load settings from an XML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        Self::from_xml(&contents)
    }

    /// Save settings to an XML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        fs::write(path, self.to_xml()?)?;
        Ok(())
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parse error: {0}")]
    XmlParse(#[from] quick_xml::DeError),
    #[error("XML write error: {0}")]
    XmlWrite(#[from] quick_xml::SeError),
}
