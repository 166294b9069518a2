//! TOML machine configuration with validation.
//!
//! Loads the machine description (delta geometry, motion limits, pin
//! assignments, thermal parameters, DMA tuning) from a single TOML file
//! and runs a validation pass before anything touches hardware. A sample
//! lives under `config/triad.toml`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::consts::{DEFAULT_TICK_US, HEATER_PWM_PERIOD_US, TEMP_CYCLE_US};
use crate::io::PinSpec;

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {0}")]
    Io(String),
    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Parameter validation error.
    #[error("config validation: {0}")]
    Validation(String),
}

// ─── Geometry ───────────────────────────────────────────────────────

/// Linear-delta geometry parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeometryConfig {
    /// Horizontal distance from bed center to each tower [µm].
    pub r_um: i64,
    /// Length of the rods linking carriages to the effector [µm].
    pub l_um: i64,
    /// Carriage height with the effector homed at bed center [µm].
    pub h_um: i64,
    /// Radius of the usable build cylinder [µm].
    pub build_rad_um: i64,
    /// Tower motor steps per meter of carriage travel.
    pub steps_per_m: u32,
    /// Extruder motor steps per meter of filament.
    pub steps_per_m_ext: u32,
}

// ─── Motion limits ──────────────────────────────────────────────────

fn default_home_dir() -> [i8; 3] {
    [1, 1, 1]
}

fn default_true() -> bool {
    true
}

/// Motion rate and acceleration limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Maximum acceleration along the move path [µm/s²].
    pub max_accel_um_s2: f64,
    /// Maximum coordinated move rate [mm/s].
    pub max_move_rate_mm_s: f64,
    /// Maximum extrude/retract rate [mm/s].
    pub max_ext_rate_mm_s: f64,
    /// Homing feed rate [mm/s].
    pub home_rate_mm_s: f64,
    /// Carriage travel direction during homing, per tower (+1 = up).
    #[serde(default = "default_home_dir")]
    pub home_dir: [i8; 3],
    /// Reject motion commands until the machine has homed once.
    #[serde(default = "default_true")]
    pub home_before_first_move: bool,
}

// ─── Pins ───────────────────────────────────────────────────────────

/// Endstop input pull direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    #[default]
    Off,
    Up,
    Down,
}

/// A step/direction driver pin pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepDirPins {
    /// STEP line (pulse per microstep).
    pub step: u8,
    /// DIR line.
    pub dir: u8,
    /// Swap the meaning of the DIR level.
    #[serde(default)]
    pub invert_dir: bool,
}

/// An endstop switch input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EndstopConfig {
    /// Input pin.
    pub pin: u8,
    /// Invert reads (switch pulls the line low when struck).
    #[serde(default)]
    pub invert: bool,
    /// Internal pull resistor.
    #[serde(default)]
    pub pull: PullMode,
}

/// Complete pin assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinsConfig {
    /// Tower A/B/C step+dir pairs.
    pub towers: [StepDirPins; 3],
    /// Extruder step+dir pair.
    pub extruder: StepDirPins,
    /// Shared stepper driver enable line.
    pub enable: PinSpec,
    /// Tower A/B/C endstops.
    pub endstops: [EndstopConfig; 3],
    /// Hotend heater MOSFET gate.
    pub hotend: PinSpec,
    /// Part cooling fan.
    pub fan: PinSpec,
    /// RC-discharge thermistor sense pin.
    pub thermistor: u8,
}

// ─── Thermal ────────────────────────────────────────────────────────

/// PID gains for the heater loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Clamp on the integral accumulator's contribution to the output.
    pub integral_cap: f64,
}

fn default_sample_period_us() -> u64 {
    TEMP_CYCLE_US
}

fn default_pwm_period_us() -> u64 {
    HEATER_PWM_PERIOD_US
}

fn default_runaway_min_rise_c() -> f64 {
    5.0
}

fn default_runaway_window_s() -> f64 {
    120.0
}

/// RC thermistor and heater control parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThermalConfig {
    /// Series resistance in the discharge path [Ω].
    pub ra_ohm: f64,
    /// Discharge capacitor [pF].
    pub c_pico: f64,
    /// Supply voltage [mV].
    pub vcc_mv: f64,
    /// Input threshold where the pin reads low [mV].
    pub thresh_mv: f64,
    /// Thermistor reference temperature [°C].
    pub t0_c: f64,
    /// Thermistor resistance at the reference temperature [Ω].
    pub r0_ohm: f64,
    /// Thermistor β coefficient [K].
    pub beta: f64,
    /// Heater PID gains.
    pub pid: PidConfig,
    /// Low-pass time constant applied to raw temperature [s].
    pub lpf_time_const_s: f64,
    /// Sampling cadence [µs].
    #[serde(default = "default_sample_period_us")]
    pub sample_period_us: u64,
    /// Slow-PWM period of the heater output [µs].
    #[serde(default = "default_pwm_period_us")]
    pub pwm_period_us: u64,
    /// Minimum temperature rise expected during heat-up [°C].
    #[serde(default = "default_runaway_min_rise_c")]
    pub runaway_min_rise_c: f64,
    /// Window in which the rise must be observed [s].
    #[serde(default = "default_runaway_window_s")]
    pub runaway_window_s: f64,
}

// ─── DMA ────────────────────────────────────────────────────────────

fn default_dma_channel() -> u8 {
    3
}

fn default_tick_us() -> u64 {
    DEFAULT_TICK_US
}

fn default_ring_slots() -> usize {
    8192
}

fn default_safety_margin_slots() -> usize {
    64
}

/// DMA pulse-emitter tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DmaConfig {
    /// DMA channel to claim.
    #[serde(default = "default_dma_channel")]
    pub channel: u8,
    /// Pacing tick [µs] (DREQ data-consumption period).
    #[serde(default = "default_tick_us")]
    pub tick_us: u64,
    /// Control-block ring size [slots].
    #[serde(default = "default_ring_slots")]
    pub ring_slots: usize,
    /// Slots kept between the producer tail and the engine read pointer.
    #[serde(default = "default_safety_margin_slots")]
    pub safety_margin_slots: usize,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            channel: default_dma_channel(),
            tick_us: default_tick_us(),
            ring_slots: default_ring_slots(),
            safety_margin_slots: default_safety_margin_slots(),
        }
    }
}

// ─── Machine config root ────────────────────────────────────────────

/// Complete validated machine description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub geometry: GeometryConfig,
    pub motion: MotionConfig,
    /// Bed-level rotation rows over a fixed 1e9 denominator.
    /// Identity when omitted; machine-specific calibration input.
    #[serde(default)]
    pub bed_level: Option<[[i64; 3]; 3]>,
    pub pins: PinsConfig,
    pub thermal: ThermalConfig,
    #[serde(default)]
    pub dma: DmaConfig,
}

/// Load and validate a machine configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<MachineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
    let config: MachineConfig =
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    info!(
        path = %path.display(),
        r_um = config.geometry.r_um,
        l_um = config.geometry.l_um,
        "machine config loaded"
    );
    Ok(config)
}

impl MachineConfig {
    /// Run all validation rules; returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.geometry;
        if g.r_um <= 0 || g.l_um <= 0 || g.h_um <= 0 || g.build_rad_um <= 0 {
            return Err(ConfigError::Validation(
                "geometry dimensions must be positive".into(),
            ));
        }
        if g.l_um <= g.r_um {
            return Err(ConfigError::Validation(format!(
                "rod length {} µm must exceed tower radius {} µm",
                g.l_um, g.r_um
            )));
        }
        // Worst case: a point on the build circle opposite a tower.
        if g.l_um < g.r_um + g.build_rad_um {
            return Err(ConfigError::Validation(format!(
                "build radius {} µm unreachable: l_um must be >= r_um + build_rad_um",
                g.build_rad_um
            )));
        }
        if g.steps_per_m == 0 || g.steps_per_m_ext == 0 {
            return Err(ConfigError::Validation("steps_per_m must be nonzero".into()));
        }

        let m = &self.motion;
        if m.max_accel_um_s2 <= 0.0
            || m.max_move_rate_mm_s <= 0.0
            || m.max_ext_rate_mm_s <= 0.0
            || m.home_rate_mm_s <= 0.0
        {
            return Err(ConfigError::Validation(
                "motion rates and acceleration must be positive".into(),
            ));
        }
        for (i, d) in m.home_dir.iter().enumerate() {
            if *d != 1 && *d != -1 {
                return Err(ConfigError::Validation(format!(
                    "home_dir[{i}] must be +1 or -1, got {d}"
                )));
            }
        }

        let t = &self.thermal;
        if t.ra_ohm <= 0.0 || t.c_pico <= 0.0 || t.r0_ohm <= 0.0 || t.beta <= 0.0 {
            return Err(ConfigError::Validation(
                "thermistor parameters must be positive".into(),
            ));
        }
        if t.thresh_mv <= 0.0 || t.thresh_mv >= t.vcc_mv {
            return Err(ConfigError::Validation(format!(
                "thermistor threshold {} mV must lie below vcc {} mV",
                t.thresh_mv, t.vcc_mv
            )));
        }
        if t.pid.kp < 0.0 || t.pid.ki < 0.0 || t.pid.kd < 0.0 || t.pid.integral_cap < 0.0 {
            return Err(ConfigError::Validation("PID gains must be non-negative".into()));
        }
        if t.lpf_time_const_s < 0.0 {
            return Err(ConfigError::Validation("LPF time constant must be >= 0".into()));
        }
        if t.sample_period_us == 0 || t.pwm_period_us == 0 {
            return Err(ConfigError::Validation(
                "thermal periods must be nonzero".into(),
            ));
        }

        let d = &self.dma;
        if d.channel > 14 {
            return Err(ConfigError::Validation(format!(
                "DMA channel {} out of range 0..=14",
                d.channel
            )));
        }
        if d.tick_us == 0 {
            return Err(ConfigError::Validation("dma.tick_us must be nonzero".into()));
        }
        if d.ring_slots <= d.safety_margin_slots {
            return Err(ConfigError::Validation(format!(
                "ring_slots {} must exceed safety_margin_slots {}",
                d.ring_slots, d.safety_margin_slots
            )));
        }

        self.validate_pins()
    }

    /// All GPIO assignments must be unique and addressable through
    /// GPSET0/GPCLR0 (pins 0–31).
    fn validate_pins(&self) -> Result<(), ConfigError> {
        let p = &self.pins;
        let mut seen: Vec<(u8, &str)> = Vec::new();
        let mut claim = |pin: u8, what: &'static str| -> Result<(), ConfigError> {
            if pin > 31 {
                return Err(ConfigError::Validation(format!(
                    "{what}: pin {pin} outside the GPSET0/GPCLR0 bank (0-31)"
                )));
            }
            if let Some((_, other)) = seen.iter().find(|(n, _)| *n == pin) {
                return Err(ConfigError::Validation(format!(
                    "pin {pin} assigned to both {other} and {what}"
                )));
            }
            seen.push((pin, what));
            Ok(())
        };

        let tower_names = ["tower A", "tower B", "tower C"];
        for (pins, name) in p.towers.iter().zip(tower_names) {
            claim(pins.step, name)?;
            claim(pins.dir, name)?;
        }
        claim(p.extruder.step, "extruder")?;
        claim(p.extruder.dir, "extruder")?;
        claim(p.enable.pin, "stepper enable")?;
        for (endstop, name) in p.endstops.iter().zip(tower_names) {
            claim(endstop.pin, name)?;
        }
        claim(p.hotend.pin, "hotend")?;
        claim(p.fan.pin, "fan")?;
        claim(p.thermistor, "thermistor")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> String {
        r#"
[geometry]
r_um = 111000
l_um = 221000
h_um = 467330
build_rad_um = 85000
steps_per_m = 25060
steps_per_m_ext = 80000

[motion]
max_accel_um_s2 = 1200000.0
max_move_rate_mm_s = 50.0
max_ext_rate_mm_s = 60.0
home_rate_mm_s = 10.0

[pins]
towers = [
    { step = 22, dir = 23 },
    { step = 19, dir = 21 },
    { step = 13, dir = 15 },
]
extruder = { step = 2, dir = 5 }
enable = { pin = 16, invert_writes = true }
endstops = [
    { pin = 18, invert = true, pull = "down" },
    { pin = 24, invert = true, pull = "down" },
    { pin = 26, invert = true, pull = "down" },
]
hotend = { pin = 10, invert_writes = true }
fan = { pin = 8 }
thermistor = 7

[thermal]
ra_ohm = 665.0
c_pico = 2200000.0
vcc_mv = 3300.0
thresh_mv = 1600.0
t0_c = 25.0
r0_ohm = 100000.0
beta = 3950.0
pid = { kp = 0.018, ki = 0.00025, kd = 0.001, integral_cap = 1.0 }
lpf_time_const_s = 3.0
"#
        .to_string()
    }

    fn parse(toml_text: &str) -> MachineConfig {
        toml::from_str(toml_text).expect("sample config must parse")
    }

    #[test]
    fn sample_config_is_valid() {
        let config = parse(&sample_toml());
        config.validate().expect("sample config must validate");
        assert_eq!(config.geometry.r_um, 111_000);
        assert_eq!(config.dma.channel, 3); // default section
        assert_eq!(config.motion.home_dir, [1, 1, 1]);
        assert!(config.motion.home_before_first_move);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.pins.thermistor, 7);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/triad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn rejects_duplicate_pin() {
        let mut config = parse(&sample_toml());
        config.pins.fan.pin = config.pins.hotend.pin;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)), "{err}");
    }

    #[test]
    fn rejects_pin_above_bank_zero() {
        let mut config = parse(&sample_toml());
        config.pins.fan.pin = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unreachable_build_radius() {
        let mut config = parse(&sample_toml());
        config.geometry.build_rad_um = 200_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_threshold_above_vcc() {
        let mut config = parse(&sample_toml());
        config.thermal.thresh_mv = 3400.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_home_dir() {
        let mut config = parse(&sample_toml());
        config.motion.home_dir = [1, 0, 1];
        assert!(config.validate().is_err());
    }
}
