//! Compiled-in limits and the caller-supplied configuration structs.
//!
//! The constants size every fixed buffer in the crate. The structs deserialize
//! with defaults for missing fields so the simulator can hand over partial
//! objects straight from JavaScript.

use serde::{Deserialize, Serialize};

pub const CORE_NAME: &str = "engraver-core";
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cartesian axes tracked by the supervisor (X, Y, Z). Only X and Y are driven.
pub const AXIS_COUNT: usize = 3;

// ── Protocol ─────────────────────────────────────────────────────────────

/// Longest line payload the framer keeps. Longer lines are tagged overflow.
pub const LINE_MAX: usize = 96;
/// Completed lines buffered when no immediate line sink is used.
pub const LINE_QUEUE_DEPTH: usize = 8;
/// Bytes pulled from the serial port per supervisor poll.
pub const RX_CHUNK: usize = 64;

// ── Planner ──────────────────────────────────────────────────────────────

pub const PLANNER_QUEUE_DEPTH: usize = 8;

// ── Interpreter ──────────────────────────────────────────────────────────

/// Feedrate (mm/min) reported before any F word was seen.
pub const DEFAULT_FEEDRATE: f64 = 100.0;
/// G words accepted in a single block, e.g. `G90 G94 G1`.
pub const MAX_G_WORDS: usize = 4;
/// Speed used for G0 moves when turning them into planner blocks.
pub const RAPID_FEED_MM_MIN: f64 = 3_000.0;
/// S value mapped to full spindle PWM.
pub const SPINDLE_MAX_RPM: f64 = 1_000.0;

// ── Arcs ─────────────────────────────────────────────────────────────────

pub const ARC_SEGMENT_LEN_MM: f64 = 0.5;
pub const ARC_RADIUS_MIN_MM: f64 = 0.001;
pub const ARC_MAX_SEGMENTS: usize = 10_000;

// ── Stepper ──────────────────────────────────────────────────────────────

/// Step interval used when a block carries no entry speed.
pub const DEFAULT_STEP_INTERVAL_US: u32 = 1_000;
pub const DEFAULT_ACCELERATION: f64 = 36_000.0; // mm/min^2

// ── Soft limits (machine coordinates, mm) ────────────────────────────────

pub const SOFT_LIMIT_X: (f64, f64) = (0.0, 200.0);
pub const SOFT_LIMIT_Y: (f64, f64) = (0.0, 200.0);
pub const SOFT_LIMIT_Z: (f64, f64) = (-50.0, 0.0);

/// How completed lines leave the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LineDelivery {
    /// Lines wait in a bounded FIFO until popped.
    #[default]
    Queue,
    /// Lines are handed to the sink as soon as their terminator arrives.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub to_uppercase: bool,
    pub strip_paren_comments: bool,
    pub strip_semicolon_comments: bool,
    /// When false, lines starting with `$` are swallowed by the framer.
    pub allow_dollar_commands: bool,
    pub delivery: LineDelivery,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            to_uppercase: true,
            strip_paren_comments: true,
            strip_semicolon_comments: true,
            allow_dollar_commands: true,
            delivery: LineDelivery::Queue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    pub step_pulse_us: u32,
    pub dir_setup_us: u32,
    pub idle_disable: bool,
    pub idle_timeout_ms: u32,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            step_pulse_us: 10,
            dir_setup_us: 5,
            idle_disable: true,
            idle_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub limits_enabled: bool,
    pub soft_limits_enabled: bool,
    pub spindle_enabled: bool,
    pub planner_depth: usize,
    pub protocol: ProtocolConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            limits_enabled: true,
            soft_limits_enabled: false,
            spindle_enabled: true,
            planner_depth: PLANNER_QUEUE_DEPTH,
            protocol: ProtocolConfig::default(),
        }
    }
}
