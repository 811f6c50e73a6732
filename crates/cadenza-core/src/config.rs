// Machine description and the derived planner limits.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kinematics::{DeltaTowers, GantryVariant, Kinematics};
use crate::segment::{NUM_AXES, X_AXIS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("delta diagonal rod ({rod} mm) must exceed the horizontal radius ({radius} mm)")]
    RodTooShort { rod: f64, radius: f64 },
    #[error("software endstop minimum exceeds maximum on axis {0}")]
    EndstopOrder(usize),
}

/// Machine description as loaded from a config file.
///
/// Axis order is x, y, z, e throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub kinematics: KinematicsConfig,

    /// Step-timer frequency in ticks per second.
    #[serde(default = "default_timer_hz")]
    pub timer_hz: f64,

    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: [f64; NUM_AXES],

    /// Per-axis feedrate ceiling in mm/s.
    #[serde(default = "default_max_feedrate")]
    pub max_feedrate: [f64; NUM_AXES],

    /// Per-axis acceleration limits in mm/s^2 for printing moves
    /// (extruder pushing) and travel moves.
    #[serde(default = "default_acceleration")]
    pub acceleration_print: [f64; NUM_AXES],
    #[serde(default = "default_acceleration")]
    pub acceleration_travel: [f64; NUM_AXES],

    /// Instantaneous velocity change allowed at a junction (mm/s).
    #[serde(default = "default_max_jerk")]
    pub max_jerk: f64,
    #[serde(default = "default_max_z_jerk")]
    pub max_z_jerk: f64,

    /// Lower bound for safe start/stop speeds (mm/s).
    #[serde(default = "default_min_speed")]
    pub min_speed: f64,

    #[serde(default)]
    pub backlash: BacklashConfig,

    #[serde(default)]
    pub extruder: ExtruderConfig,

    /// Software endstop box in mm; moves are clamped into it when set.
    #[serde(default)]
    pub endstops: Option<SoftEndstopConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            kinematics: KinematicsConfig::default(),
            timer_hz: default_timer_hz(),
            steps_per_mm: default_steps_per_mm(),
            max_feedrate: default_max_feedrate(),
            acceleration_print: default_acceleration(),
            acceleration_travel: default_acceleration(),
            max_jerk: default_max_jerk(),
            max_z_jerk: default_max_z_jerk(),
            min_speed: default_min_speed(),
            backlash: BacklashConfig::default(),
            extruder: ExtruderConfig::default(),
            endstops: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KinematicsConfig {
    #[default]
    Cartesian,
    Corexy {
        #[serde(default)]
        variant: GantryVariant,
    },
    Delta(DeltaConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Diagonal rod length in mm.
    pub diagonal_rod: f64,
    /// Horizontal distance from bed center to a tower in mm.
    pub horizontal_radius: f64,
    /// Carriage travel in mm, bounds the tower soft clamp.
    #[serde(default = "default_carriage_travel")]
    pub carriage_travel: f64,
    /// Sub-segment rates for printing and travel moves.
    #[serde(default = "default_segments_print")]
    pub segments_per_second_print: f64,
    #[serde(default = "default_segments_travel")]
    pub segments_per_second_travel: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BacklashConfig {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtruderConfig {
    /// Speed the extruder may start at from standstill (mm/s).
    #[serde(default = "default_max_start_feedrate")]
    pub max_start_feedrate: f64,
    /// Pressure advance; absent disables the feature.
    #[serde(default)]
    pub advance: Option<AdvanceConfig>,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self {
            max_start_feedrate: default_max_start_feedrate(),
            advance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdvanceConfig {
    /// Linear coefficient applied to the extrusion rate.
    #[serde(default)]
    pub linear: f64,
    /// Quadratic coefficient applied to the squared extrusion rate.
    #[serde(default)]
    pub quadratic: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SoftEndstopConfig {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

fn default_timer_hz() -> f64 {
    16_000_000.0
}

fn default_steps_per_mm() -> [f64; NUM_AXES] {
    [80.0, 80.0, 400.0, 95.0]
}

fn default_max_feedrate() -> [f64; NUM_AXES] {
    [200.0, 200.0, 5.0, 50.0]
}

fn default_acceleration() -> [f64; NUM_AXES] {
    [1000.0, 1000.0, 100.0, 5000.0]
}

fn default_max_jerk() -> f64 {
    20.0
}

fn default_max_z_jerk() -> f64 {
    0.3
}

fn default_min_speed() -> f64 {
    1.0
}

fn default_max_start_feedrate() -> f64 {
    10.0
}

fn default_carriage_travel() -> f64 {
    300.0
}

fn default_segments_print() -> f64 {
    180.0
}

fn default_segments_travel() -> f64 {
    70.0
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_hz <= 0.0 {
            return Err(ConfigError::NonPositive("timer_hz"));
        }
        if self.steps_per_mm.iter().any(|&v| v <= 0.0) {
            return Err(ConfigError::NonPositive("steps_per_mm"));
        }
        if self.max_feedrate.iter().any(|&v| v <= 0.0) {
            return Err(ConfigError::NonPositive("max_feedrate"));
        }
        if self
            .acceleration_print
            .iter()
            .chain(self.acceleration_travel.iter())
            .any(|&v| v <= 0.0)
        {
            return Err(ConfigError::NonPositive("acceleration"));
        }
        if self.max_jerk <= 0.0 || self.max_z_jerk <= 0.0 {
            return Err(ConfigError::NonPositive("jerk"));
        }
        if self.min_speed <= 0.0 {
            return Err(ConfigError::NonPositive("min_speed"));
        }
        if self.extruder.max_start_feedrate <= 0.0 {
            return Err(ConfigError::NonPositive("extruder.max_start_feedrate"));
        }
        if let KinematicsConfig::Delta(delta) = &self.kinematics {
            if delta.diagonal_rod <= delta.horizontal_radius {
                return Err(ConfigError::RodTooShort {
                    rod: delta.diagonal_rod,
                    radius: delta.horizontal_radius,
                });
            }
            if delta.segments_per_second_print <= 0.0 || delta.segments_per_second_travel <= 0.0 {
                return Err(ConfigError::NonPositive("segments_per_second"));
            }
        }
        if let Some(endstops) = &self.endstops {
            for axis in 0..3 {
                if endstops.min[axis] > endstops.max[axis] {
                    return Err(ConfigError::EndstopOrder(axis));
                }
            }
        }
        Ok(())
    }
}

/// Validated, precomputed machine limits handed to the planner by
/// reference. Changing the configuration means building a new `Machine`
/// once the queue has drained.
#[derive(Debug, Clone)]
pub struct Machine {
    pub kinematics: Kinematics,
    pub timer_hz: f64,
    pub steps_per_mm: [f64; NUM_AXES],
    pub inv_steps_per_mm: [f64; NUM_AXES],
    pub max_feedrate: [f64; NUM_AXES],
    /// Acceleration limits in steps/s^2.
    pub accel_steps_print: [f64; NUM_AXES],
    pub accel_steps_travel: [f64; NUM_AXES],
    pub max_jerk: f64,
    pub max_z_jerk: f64,
    pub min_speed: f64,
    /// Backlash distance per axis in mm, plus the enabled-axis mask.
    pub backlash: [f64; 3],
    pub backlash_enabled: u8,
    pub extruder: ExtruderLimits,
    pub endstops: Option<SoftEndstopSteps>,
    pub segments_per_second_print: f64,
    pub segments_per_second_travel: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtruderLimits {
    pub max_start_feedrate: f64,
    pub advance_enabled: bool,
    pub advance_linear: f64,
    pub advance_quadratic: f64,
}

/// Software endstop box converted to steps.
#[derive(Debug, Clone, Copy)]
pub struct SoftEndstopSteps {
    pub min: [i32; 3],
    pub max: [i32; 3],
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut inv_steps_per_mm = [0.0; NUM_AXES];
        let mut accel_steps_print = [0.0; NUM_AXES];
        let mut accel_steps_travel = [0.0; NUM_AXES];
        for i in 0..NUM_AXES {
            inv_steps_per_mm[i] = 1.0 / config.steps_per_mm[i];
            accel_steps_print[i] = config.acceleration_print[i] * config.steps_per_mm[i];
            accel_steps_travel[i] = config.acceleration_travel[i] * config.steps_per_mm[i];
        }
        let (kinematics, segments_print, segments_travel) = match &config.kinematics {
            KinematicsConfig::Cartesian => (Kinematics::Cartesian, 0.0, 0.0),
            KinematicsConfig::Corexy { variant } => (Kinematics::CoreXy(*variant), 0.0, 0.0),
            KinematicsConfig::Delta(delta) => {
                let towers = DeltaTowers::new(
                    delta.diagonal_rod,
                    delta.horizontal_radius,
                    config.steps_per_mm[X_AXIS],
                    (delta.carriage_travel * config.steps_per_mm[X_AXIS]) as i32,
                );
                (
                    Kinematics::Delta(towers),
                    delta.segments_per_second_print,
                    delta.segments_per_second_travel,
                )
            }
        };
        let backlash = [config.backlash.x, config.backlash.y, config.backlash.z];
        let mut backlash_enabled = 0u8;
        for (i, &b) in backlash.iter().enumerate() {
            if b > 0.0 {
                backlash_enabled |= 1 << i;
            }
        }
        let advance = config.extruder.advance;
        let extruder = ExtruderLimits {
            max_start_feedrate: config.extruder.max_start_feedrate,
            advance_enabled: advance.is_some(),
            advance_linear: advance.map(|a| a.linear).unwrap_or(0.0),
            advance_quadratic: advance.map(|a| a.quadratic).unwrap_or(0.0),
        };
        let endstops = config.endstops.map(|e| {
            let mut min = [0i32; 3];
            let mut max = [0i32; 3];
            for i in 0..3 {
                min[i] = (e.min[i] * config.steps_per_mm[i]) as i32;
                max[i] = (e.max[i] * config.steps_per_mm[i]) as i32;
            }
            SoftEndstopSteps { min, max }
        });
        Ok(Self {
            kinematics,
            timer_hz: config.timer_hz,
            steps_per_mm: config.steps_per_mm,
            inv_steps_per_mm,
            max_feedrate: config.max_feedrate,
            accel_steps_print,
            accel_steps_travel,
            max_jerk: config.max_jerk,
            max_z_jerk: config.max_z_jerk,
            min_speed: config.min_speed,
            backlash,
            backlash_enabled,
            extruder,
            endstops,
            segments_per_second_print: segments_print,
            segments_per_second_travel: segments_travel,
        })
    }
}
