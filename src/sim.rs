//! Simulated board backing the browser build and the tests.
//!
//! Every clone of a [`SimHal`] points at the same board, so the step task and
//! the supervisor can each own a handle, like two drivers sharing one MCU.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AXIS_COUNT;
use crate::hal::{Axis, Clock, Hal, Inputs, SpindleDirection, StepperHal};

#[derive(Debug, Default)]
struct Board {
    now_us: u64,
    enabled: bool,
    direction: [bool; AXIS_COUNT],
    pulse_high: [bool; AXIS_COUNT],
    pulses: [u64; AXIS_COUNT],
    inputs: Inputs,
    spindle: SpindleDirection,
    spindle_pwm: f64,
    polls: u64,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SimHal {
    board: Arc<Mutex<Board>>,
}

impl SimHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.board.lock().now_us += us;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1_000);
    }

    pub fn now_us(&self) -> u64 {
        self.board.lock().now_us
    }

    pub fn set_inputs(&self, inputs: Inputs) {
        self.board.lock().inputs = inputs;
    }

    pub fn inputs(&self) -> Inputs {
        self.board.lock().inputs
    }

    pub fn motors_enabled(&self) -> bool {
        self.board.lock().enabled
    }

    pub fn direction(&self, axis: Axis) -> bool {
        self.board.lock().direction[axis.index()]
    }

    pub fn pulse_high(&self, axis: Axis) -> bool {
        self.board.lock().pulse_high[axis.index()]
    }

    pub fn pulse_count(&self, axis: Axis) -> u64 {
        self.board.lock().pulses[axis.index()]
    }

    pub fn spindle(&self) -> (SpindleDirection, f64) {
        let b = self.board.lock();
        (b.spindle, b.spindle_pwm)
    }

    pub fn poll_count(&self) -> u64 {
        self.board.lock().polls
    }

    /// Queue bytes as if they arrived on the serial line.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.board.lock().rx.extend(bytes.iter().copied());
    }

    /// Drain everything written to the serial line so far.
    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut self.board.lock().tx)
    }
}

impl Clock for SimHal {
    fn millis(&mut self) -> u32 {
        (self.board.lock().now_us / 1_000) as u32
    }

    fn micros(&mut self) -> u32 {
        self.board.lock().now_us as u32
    }

    fn delay_us(&mut self, us: u32) {
        self.advance_us(u64::from(us));
    }
}

impl StepperHal for SimHal {
    fn enable(&mut self, on: bool) {
        self.board.lock().enabled = on;
    }

    fn set_direction(&mut self, axis: Axis, positive: bool) {
        self.board.lock().direction[axis.index()] = positive;
    }

    fn pulse(&mut self, axis: Axis) {
        let mut b = self.board.lock();
        b.pulse_high[axis.index()] = true;
        b.pulses[axis.index()] += 1;
    }

    fn clear_pulse(&mut self, axis: Axis) {
        self.board.lock().pulse_high[axis.index()] = false;
    }
}

impl Hal for SimHal {
    fn read_inputs(&mut self) -> Inputs {
        self.board.lock().inputs
    }

    fn poll(&mut self) {
        self.board.lock().polls += 1;
    }

    fn set_spindle(&mut self, dir: SpindleDirection, pwm: f64) {
        let mut b = self.board.lock();
        b.spindle = dir;
        b.spindle_pwm = if dir == SpindleDirection::Off { 0.0 } else { pwm.clamp(0.0, 1.0) };
    }

    fn serial_read(&mut self, dst: &mut [u8]) -> usize {
        let mut b = self.board.lock();
        let n = dst.len().min(b.rx.len());
        for (slot, byte) in dst.iter_mut().zip(b.rx.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn serial_write(&mut self, src: &[u8]) -> usize {
        self.board.lock().tx.extend_from_slice(src);
        src.len()
    }
}
