// src/inventory/sensor.rs
//
// Pairs activations of the two gate sensors into a movement direction.
// Sensor 1 firing before sensor 2 means the object left (OUT); otherwise it came IN.
// A lone activation waits for its partner indefinitely.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SensorId {
    One,
    Two,
}

impl SensorId {
    pub fn number(&self) -> u8 {
        match self {
            SensorId::One => 1,
            SensorId::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Unknown,
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Unknown => write!(f, "UNKNOWN"),
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    OneActivated(SensorId),
}

/// A completed sensor pairing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub direction: Direction,
    /// Absolute time between the two activations
    pub delta_ms: f64,
    pub sensor1_at: DateTime<Local>,
    pub sensor2_at: DateTime<Local>,
}

impl Resolution {
    /// The later of the two activations.
    pub fn trigger_time(&self) -> DateTime<Local> {
        self.sensor1_at.max(self.sensor2_at)
    }
}

#[derive(Debug, Default)]
struct CorrelatorInner {
    sensor1: Option<DateTime<Local>>,
    sensor2: Option<DateTime<Local>>,
    last_direction: Option<Direction>,
    last_resolution: Option<Resolution>,
}

// ============================================================================
// Correlator
// ============================================================================

#[derive(Debug, Default)]
pub struct SensorCorrelator {
    inner: Mutex<CorrelatorInner>,
}

impl SensorCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an activation. Returns the resolution once both sensors have fired.
    pub fn activate(&self, sensor: SensorId, at: DateTime<Local>) -> Option<Resolution> {
        let mut inner = self.lock();
        match sensor {
            SensorId::One => inner.sensor1 = Some(at),
            SensorId::Two => inner.sensor2 = Some(at),
        }

        let (Some(sensor1_at), Some(sensor2_at)) = (inner.sensor1, inner.sensor2) else {
            return None;
        };

        let direction = if sensor1_at < sensor2_at {
            Direction::Out
        } else {
            Direction::In
        };
        let delta_ms = (sensor2_at - sensor1_at)
            .num_microseconds()
            .map(|us| us.abs() as f64 / 1000.0)
            .unwrap_or(f64::MAX);

        let resolution = Resolution {
            direction,
            delta_ms,
            sensor1_at,
            sensor2_at,
        };
        inner.sensor1 = None;
        inner.sensor2 = None;
        inner.last_direction = Some(direction);
        inner.last_resolution = Some(resolution.clone());
        Some(resolution)
    }

    pub fn state(&self) -> CorrelatorState {
        let inner = self.lock();
        match (inner.sensor1, inner.sensor2) {
            (Some(_), None) => CorrelatorState::OneActivated(SensorId::One),
            (None, Some(_)) => CorrelatorState::OneActivated(SensorId::Two),
            _ => CorrelatorState::Idle,
        }
    }

    pub fn last_direction(&self) -> Direction {
        self.lock().last_direction.unwrap_or(Direction::Unknown)
    }

    /// Activation times of the most recent resolution, if any.
    pub fn last_resolution(&self) -> Option<Resolution> {
        self.lock().last_resolution.clone()
    }

    /// Forget the last direction. Pending activations and the last
    /// resolution's timestamps are kept.
    pub fn clear_direction(&self) {
        self.lock().last_direction = None;
    }
}

// ============================================================================
// Tests
// ============================================================================
