use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

pub const MIN_FREQUENCY: f32 = 10.0;
pub const MAX_FREQUENCY: f32 = 10_000.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SoundError {
    #[error("invalid sound descriptor: {0}")]
    Descriptor(String),
    #[error("sound field '{field}' out of range ({value})")]
    OutOfRange { field: &'static str, value: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Square,
    Triangle,
    Sawtooth,
    Noise,
}

impl Waveform {
    pub fn to_bits(self) -> u32 {
        match self {
            Waveform::Square => 0,
            Waveform::Triangle => 1,
            Waveform::Sawtooth => 2,
            Waveform::Noise => 3,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Waveform::Triangle,
            2 => Waveform::Sawtooth,
            3 => Waveform::Noise,
            _ => Waveform::Square,
        }
    }
}

/// A single note as described by a guest table. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Sound {
    pub waveform: Waveform,
    pub volume: f32,
    pub duty: f32,
    pub attack: f32,
    pub duration: f32,
    pub decay: f32,
    pub frequency: f32,
    /// Hz per second.
    pub slide: f32,
    pub vibrato_depth: f32,
    pub vibrato_frequency: f32,
    #[serde(rename = "loop")]
    pub looping: bool,
}

impl Default for Sound {
    fn default() -> Self {
        Self {
            waveform: Waveform::Square,
            volume: 1.0,
            duty: 0.5,
            attack: 0.0,
            duration: 1.0,
            decay: 0.0,
            frequency: 440.0,
            slide: 0.0,
            vibrato_depth: 0.0,
            vibrato_frequency: 0.0,
            looping: false,
        }
    }
}

impl Sound {
    pub fn from_value(value: &Value) -> Result<Self, SoundError> {
        if !matches!(value, Value::Table(_)) {
            return Err(SoundError::Descriptor(format!(
                "table expected, got {}",
                value.type_name()
            )));
        }
        let sound: Sound = serde_json::from_value(value.to_json())
            .map_err(|e| SoundError::Descriptor(e.to_string()))?;
        sound.validate()?;
        Ok(sound)
    }

    pub fn validate(&self) -> Result<(), SoundError> {
        let unit = [("volume", self.volume), ("duty", self.duty)];
        for (field, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(SoundError::OutOfRange { field, value });
            }
        }
        let non_negative = [
            ("attack", self.attack),
            ("duration", self.duration),
            ("decay", self.decay),
            ("frequency", self.frequency),
            ("vibrato_depth", self.vibrato_depth),
            ("vibrato_frequency", self.vibrato_frequency),
        ];
        for (field, value) in non_negative {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(SoundError::OutOfRange { field, value });
            }
        }
        if !self.slide.is_finite() {
            return Err(SoundError::OutOfRange {
                field: "slide",
                value: self.slide,
            });
        }
        Ok(())
    }

    /// Length of attack, sustain and decay together.
    pub fn total_seconds(&self) -> f32 {
        self.attack + self.duration + self.decay
    }

    pub fn total_samples(&self, sample_rate: u32) -> u64 {
        (self.total_seconds() as f64 * sample_rate as f64).round() as u64
    }

    /// Envelope gain at `t` seconds into the sound, volume included.
    pub fn envelope(&self, t: f32) -> f32 {
        let gain = if t < self.attack {
            t / self.attack
        } else if t < self.attack + self.duration {
            1.0
        } else if self.decay > 0.0 {
            let into_decay = t - self.attack - self.duration;
            (1.0 - into_decay / self.decay).max(0.0)
        } else {
            0.0
        };
        gain * self.volume
    }
}
