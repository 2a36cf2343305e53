#![forbid(unsafe_code)]

//! User settings channel: `{ enabled, bufferSize }`.
//!
//! Settings arrive as JSON from the host's storage layer. Persistence is the
//! host's business; the engine only validates and diffs.

use serde::{Deserialize, Serialize};

use crate::adapter::ViewportMargin;

/// Viewport buffer in 1..=10 steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BufferSize(u8);

impl BufferSize {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;
    pub const DEFAULT: Self = Self(3);

    pub fn new(value: u8) -> Result<Self, SettingsError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SettingsError::BufferSizeOutOfRange(value))
        }
    }

    /// Clamp any integer into range.
    #[must_use]
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(i64::from(Self::MIN), i64::from(Self::MAX)) as u8)
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Viewport window margin for this buffer size.
    #[must_use]
    pub fn margin(self, px_per_step: f64) -> ViewportMargin {
        ViewportMargin {
            vertical_px: f64::from(self.0) * px_per_step,
        }
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for BufferSize {
    type Error = SettingsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BufferSize> for u8 {
    fn from(value: BufferSize) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub buffer_size: BufferSize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: BufferSize::DEFAULT,
        }
    }
}

impl Settings {
    pub fn from_json_str(s: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(s).map_err(|e| SettingsError::Json(e.to_string()))
    }

    /// Fields that differ between `self` and `next`.
    #[must_use]
    pub fn diff(&self, next: &Self) -> SettingsChange {
        SettingsChange {
            enabled: (self.enabled != next.enabled).then_some(next.enabled),
            buffer_size: (self.buffer_size != next.buffer_size).then_some(next.buffer_size),
        }
    }
}

/// A settings change notification. `None` fields are unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsChange {
    pub enabled: Option<bool>,
    pub buffer_size: Option<BufferSize>,
}

impl SettingsChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.buffer_size.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    BufferSizeOutOfRange(u8),
    Json(String),
}

impl core::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferSizeOutOfRange(v) => write!(
                f,
                "buffer size {v} outside {}..={}",
                BufferSize::MIN,
                BufferSize::MAX
            ),
            Self::Json(msg) => write!(f, "settings JSON error: {msg}"),
        }
    }
}

impl std::error::Error for SettingsError {}
