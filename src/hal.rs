//! Narrow hardware contract used by the core.
//!
//! The step-generation context and the supervisor context each hold their own
//! handle: the step side only needs [`StepperHal`], the supervisor needs the
//! full [`Hal`]. Nothing here blocks except the bounded microsecond waits of
//! [`Clock::delay_us`].

use serde::{Deserialize, Serialize};

use crate::config::AXIS_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Axis {
    pub const ALL: [Axis; AXIS_COUNT] = [Axis::X, Axis::Y, Axis::Z];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub const fn from_index(idx: usize) -> Option<Axis> {
        match idx {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            _ => None,
        }
    }
}

/// Snapshot of the safety inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inputs {
    pub limit_x: bool,
    pub limit_y: bool,
    pub limit_z: bool,
    pub estop: bool,
}

impl Inputs {
    pub fn any_limit(&self) -> bool {
        self.limit_x || self.limit_y || self.limit_z
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpindleDirection {
    #[default]
    Off,
    Cw,
    Ccw,
}

/// Monotonic time. Both counters wrap; compare with `wrapping_sub`.
pub trait Clock {
    fn millis(&mut self) -> u32;
    fn micros(&mut self) -> u32;
    /// Bounded busy-wait used for pulse width and direction setup.
    fn delay_us(&mut self, us: u32);
}

pub trait StepperHal: Clock {
    fn enable(&mut self, on: bool);
    /// `positive == true` drives the axis towards increasing step counts.
    fn set_direction(&mut self, axis: Axis, positive: bool);
    fn pulse(&mut self, axis: Axis);
    fn clear_pulse(&mut self, axis: Axis);
}

pub trait Hal: StepperHal {
    fn read_inputs(&mut self) -> Inputs;
    /// Housekeeping hook for the board layer (serial DMA, debouncing, ...).
    fn poll(&mut self);
    /// `pwm` is normalized to `0.0..=1.0`.
    fn set_spindle(&mut self, dir: SpindleDirection, pwm: f64);
    /// Non-blocking read; returns how many bytes were copied into `dst`.
    fn serial_read(&mut self, dst: &mut [u8]) -> usize;
    fn serial_write(&mut self, src: &[u8]) -> usize;
}
