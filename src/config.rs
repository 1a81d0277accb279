//! Channel configuration, detection tuning constants and the settings snapshot
//! the coordinator reads on every (re)activation.

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Motion signal kinds the engine knows how to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
    LinearAcceleration,
    SignificantMotion,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::SignificantMotion,
        SensorKind::Accelerometer,
        SensorKind::Gyroscope,
        SensorKind::LinearAcceleration,
    ];

    /// Stable slot index used by the coordinator's channel table.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            SensorKind::SignificantMotion => 0,
            SensorKind::Accelerometer => 1,
            SensorKind::Gyroscope => 2,
            SensorKind::LinearAcceleration => 3,
        }
    }

    /// Whether peaks must alternate direction (dot product < 0).
    pub fn tracks_direction(self) -> bool {
        matches!(self, SensorKind::Accelerometer | SensorKind::LinearAcceleration)
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorKind::Accelerometer => write!(f, "Accelerometer"),
            SensorKind::Gyroscope => write!(f, "Gyroscope"),
            SensorKind::LinearAcceleration => write!(f, "LinearAcceleration"),
            SensorKind::SignificantMotion => write!(f, "SignificantMotion"),
        }
    }
}

/// One motion channel. Immutable once built; settings updates replace it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorChannelConfig {
    kind: SensorKind,
    display_name: String,
    magnitude_threshold: f32,
    requires_wake_capable_hardware: bool,
    enabled: bool,
}

impl SensorChannelConfig {
    pub fn new(
        kind: SensorKind,
        display_name: impl Into<String>,
        magnitude_threshold: f32,
        requires_wake_capable_hardware: bool,
        enabled: bool,
    ) -> Result<Self, EngineError> {
        let config = Self {
            kind,
            display_name: display_name.into(),
            magnitude_threshold,
            requires_wake_capable_hardware,
            enabled,
        };
        config.validate()?;
        Ok(config)
    }

    /// Factory default for a kind: prefers wake-capable hardware, disabled.
    pub fn default_for(kind: SensorKind) -> Self {
        let (name, threshold) = match kind {
            SensorKind::SignificantMotion => ("Significant Motion", 0.0),
            SensorKind::Accelerometer => ("Accelerometer", 10.0),
            SensorKind::Gyroscope => ("Gyroscope", 3.0),
            SensorKind::LinearAcceleration => ("Linear Acceleration", 8.0),
        };
        Self {
            kind,
            display_name: name.to_string(),
            magnitude_threshold: threshold,
            requires_wake_capable_hardware: true,
            enabled: false,
        }
    }

    /// Copy with a different enabled flag.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }

    /// Copy with a different threshold.
    pub fn with_threshold(&self, magnitude_threshold: f32) -> Result<Self, EngineError> {
        let config = Self {
            magnitude_threshold,
            ..self.clone()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn magnitude_threshold(&self) -> f32 {
        self.magnitude_threshold
    }

    pub fn requires_wake_capable_hardware(&self) -> bool {
        self.requires_wake_capable_hardware
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self) -> Result<(), EngineError> {
        if !self.magnitude_threshold.is_finite() || self.magnitude_threshold < 0.0 {
            return Err(EngineError::InvalidSettings(format!(
                "{}: threshold must be a finite value >= 0, got {}",
                self.kind, self.magnitude_threshold
            )));
        }
        Ok(())
    }
}

/// Snapshot of the user's saved choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Ordered channel list; at most one entry per kind.
    pub channels: Vec<SensorChannelConfig>,
    pub sound_enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channels: SensorKind::ALL
                .iter()
                .map(|&kind| SensorChannelConfig::default_for(kind))
                .collect(),
            sound_enabled: false,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = [false; SensorKind::ALL.len()];
        for channel in &self.channels {
            channel.validate()?;
            let slot = &mut seen[channel.kind.index()];
            if *slot {
                return Err(EngineError::InvalidSettings(format!(
                    "duplicate channel {}",
                    channel.kind
                )));
            }
            *slot = true;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let settings: EngineSettings = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::InvalidSettings(e.to_string()))
    }

    /// Channels the coordinator should try to activate, in saved order.
    pub fn enabled_channels(&self) -> impl Iterator<Item = &SensorChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Zero enabled channels and sound off; the surrounding service may stop itself.
    pub fn nothing_enabled(&self) -> bool {
        !self.sound_enabled && self.enabled_channels().next().is_none()
    }

    /// Replace the entry for `config.kind()`, appending it if absent.
    pub fn set_channel(&mut self, config: SensorChannelConfig) {
        match self.channels.iter_mut().find(|c| c.kind == config.kind) {
            Some(existing) => *existing = config,
            None => self.channels.push(config),
        }
    }
}

/// Detection constants. Shared by all detectors of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionTuning {
    /// Peaks closer than this are ringing, not a new peak.
    pub min_inter_peak_gap_ms: u64,
    /// Peaks further apart than this start a new sequence.
    pub max_inter_peak_gap_ms: u64,
    pub required_peaks: u32,
    /// Mean absolute amplitude (16-bit PCM units) a frame must exceed.
    pub sound_threshold: f32,
    pub min_sound_duration_ms: u64,
    pub max_sound_duration_ms: u64,
    /// How long the screen-bright, wake-causing lock is held.
    pub screen_wake_pulse: Duration,
    pub sample_rate: u32,
    /// Samples per audio frame.
    pub frame_size: usize,
}

impl Default for DetectionTuning {
    fn default() -> Self {
        Self {
            min_inter_peak_gap_ms: 150,
            max_inter_peak_gap_ms: 500,
            required_peaks: 4,
            sound_threshold: 4000.0,
            min_sound_duration_ms: 1000,
            max_sound_duration_ms: 3000,
            screen_wake_pulse: Duration::from_millis(3000),
            sample_rate: 16000,
            frame_size: 1024, // 64ms at 16kHz
        }
    }
}

impl DetectionTuning {
    /// Wall time covered by one audio frame.
    pub fn frame_period(&self) -> Duration {
        let rate = self.sample_rate.max(1) as u64;
        Duration::from_micros(self.frame_size as u64 * 1_000_000 / rate)
    }
}

/// Read side of the external preference store.
pub trait SettingsStore: Send + Sync {
    fn snapshot(&self) -> EngineSettings;
}

/// In-memory settings holder; the persisting layer lives outside the engine.
pub struct StaticSettings {
    settings: RwLock<EngineSettings>,
}

impl StaticSettings {
    pub fn new(settings: EngineSettings) -> Result<Self, EngineError> {
        settings.validate()?;
        Ok(Self {
            settings: RwLock::new(settings),
        })
    }

    pub fn replace(&self, settings: EngineSettings) -> Result<(), EngineError> {
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    pub fn update<F>(&self, edit: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut EngineSettings),
    {
        let mut next = self.settings.read().clone();
        edit(&mut next);
        self.replace(next)
    }
}

impl SettingsStore for StaticSettings {
    fn snapshot(&self) -> EngineSettings {
        self.settings.read().clone()
    }
}
