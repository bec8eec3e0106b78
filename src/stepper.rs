//! Step generation for one planner block at a time.
//!
//! `update` is the hot path: it must be called at least as often as the
//! shortest step interval and never blocks beyond the configured pulse width.

use serde::Serialize;
use thiserror::Error;

use crate::config::{AXIS_COUNT, DEFAULT_STEP_INTERVAL_US, StepperConfig};
use crate::hal::{Axis, StepperHal};
use crate::kinematics::Kinematics;
use crate::planner::{BlockViolation, PlannerBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StepperState {
    #[default]
    Idle,
    Running,
    Hold,
    Stopping,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("stepper is busy")]
    NotIdle,
    #[error("invalid block: {0}")]
    InvalidBlock(BlockViolation),
    #[error("kinematics cannot execute block")]
    Unreachable,
}

#[derive(Debug)]
pub struct Stepper<K> {
    config: StepperConfig,
    kinematics: K,
    state: StepperState,
    block: Option<PlannerBlock>,
    direction_bits: u8,
    step_count: [u32; AXIS_COUNT],
    target_steps: [u32; AXIS_COUNT],
    /// Absolute motor position in steps.
    position: [i32; AXIS_COUNT],
    last_step_us: u32,
    step_interval_us: u32,
    current_speed: f64,
    motors_enabled: bool,
    idle_since_ms: Option<u32>,
}

impl<K: Kinematics> Stepper<K> {
    pub fn new(config: StepperConfig, kinematics: K) -> Self {
        Self {
            config,
            kinematics,
            state: StepperState::Idle,
            block: None,
            direction_bits: 0,
            step_count: [0; AXIS_COUNT],
            target_steps: [0; AXIS_COUNT],
            position: [0; AXIS_COUNT],
            last_step_us: 0,
            step_interval_us: DEFAULT_STEP_INTERVAL_US,
            current_speed: 0.0,
            motors_enabled: false,
            idle_since_ms: None,
        }
    }

    /// Drop the current block and return to IDLE. Position is kept.
    pub fn reset<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        self.state = StepperState::Idle;
        self.block = None;
        self.step_count = [0; AXIS_COUNT];
        self.target_steps = [0; AXIS_COUNT];
        self.current_speed = 0.0;
        clear_pulses(hal);
        if self.config.idle_disable {
            hal.enable(false);
            self.motors_enabled = false;
        }
    }

    /// Take ownership of `block` and start stepping it.
    ///
    /// Fails without any state change unless the stepper is IDLE and the
    /// block is valid and executable.
    pub fn load<H: StepperHal + ?Sized>(&mut self, hal: &mut H, block: PlannerBlock) -> Result<(), LoadError> {
        if self.state != StepperState::Idle {
            return Err(LoadError::NotIdle);
        }
        if let Err(violation) = block.check() {
            console_warn!("stepper: rejected block ({})", violation);
            return Err(LoadError::InvalidBlock(violation));
        }
        let Some(plan) = self.kinematics.block_steps(&block) else {
            console_warn!("stepper: block not reachable by kinematics");
            return Err(LoadError::Unreachable);
        };

        self.target_steps = plan.steps;
        self.direction_bits = plan.direction_bits;
        self.step_count = [0; AXIS_COUNT];

        for axis in Axis::ALL {
            hal.set_direction(axis, plan.direction_bits & axis.bit() != 0);
        }
        hal.delay_us(self.config.dir_setup_us);

        self.step_interval_us = step_interval_us(&block);
        self.current_speed = block.entry_speed;

        if !self.motors_enabled {
            hal.enable(true);
            self.motors_enabled = true;
        }

        self.block = Some(block);
        self.idle_since_ms = None;
        self.state = StepperState::Running;
        self.last_step_us = hal.micros();
        Ok(())
    }

    pub fn update<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        match self.state {
            StepperState::Idle => {
                if !(self.config.idle_disable && self.motors_enabled) {
                    return;
                }
                if let Some(since) = self.idle_since_ms {
                    if hal.millis().wrapping_sub(since) >= self.config.idle_timeout_ms {
                        hal.enable(false);
                        self.motors_enabled = false;
                    }
                }
            }
            StepperState::Running => {
                let now = hal.micros();
                if now.wrapping_sub(self.last_step_us) < self.step_interval_us {
                    return;
                }

                for axis in Axis::ALL {
                    let i = axis.index();
                    if self.step_count[i] < self.target_steps[i] {
                        hal.pulse(axis);
                        self.step_count[i] += 1;
                        if self.direction_bits & axis.bit() != 0 {
                            self.position[i] = self.position[i].wrapping_add(1);
                        } else {
                            self.position[i] = self.position[i].wrapping_sub(1);
                        }
                    }
                }
                hal.delay_us(self.config.step_pulse_us);
                clear_pulses(hal);
                self.last_step_us = now;

                if self.step_count == self.target_steps {
                    self.finish(hal);
                }
            }
            StepperState::Hold => {}
            StepperState::Stopping => {
                clear_pulses(hal);
                self.finish(hal);
            }
        }
    }

    fn finish<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        self.block = None;
        self.state = StepperState::Idle;
        self.current_speed = 0.0;
        self.idle_since_ms = Some(hal.millis());
    }

    pub fn hold(&mut self) {
        if self.state == StepperState::Running {
            self.state = StepperState::Hold;
        }
    }

    pub fn resume<H: StepperHal + ?Sized>(&mut self, hal: &mut H) {
        if self.state == StepperState::Hold {
            self.state = StepperState::Running;
            self.last_step_us = hal.micros();
        }
    }

    /// Takes effect on the next `update`.
    pub fn stop(&mut self) {
        self.state = StepperState::Stopping;
    }

    pub fn enable_motors<H: StepperHal + ?Sized>(&mut self, hal: &mut H, on: bool) {
        hal.enable(on);
        self.motors_enabled = on;
        if !on && self.state != StepperState::Idle {
            self.stop();
        }
    }

    pub fn set_position(&mut self, steps: [i32; AXIS_COUNT]) {
        self.position = steps;
    }

    pub fn state(&self) -> StepperState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == StepperState::Idle
    }

    pub fn is_executing(&self) -> bool {
        self.block.is_some()
    }

    pub fn current_block(&self) -> Option<&PlannerBlock> {
        self.block.as_ref()
    }

    pub fn motors_enabled(&self) -> bool {
        self.motors_enabled
    }

    pub fn position(&self) -> [i32; AXIS_COUNT] {
        self.position
    }

    pub fn cart_position(&self) -> [f64; AXIS_COUNT] {
        self.kinematics.steps_to_cart(self.position)
    }

    pub fn step_count(&self) -> [u32; AXIS_COUNT] {
        self.step_count
    }

    pub fn target_steps(&self) -> [u32; AXIS_COUNT] {
        self.target_steps
    }

    pub fn step_interval_us(&self) -> u32 {
        self.step_interval_us
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    pub fn config(&self) -> &StepperConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: StepperConfig) {
        self.config = config;
    }

    pub fn kinematics(&self) -> &K {
        &self.kinematics
    }
}

fn clear_pulses<H: StepperHal + ?Sized>(hal: &mut H) {
    for axis in Axis::ALL {
        hal.clear_pulse(axis);
    }
}

/// Microseconds between step events at the block's entry speed.
fn step_interval_us(block: &PlannerBlock) -> u32 {
    if !(block.entry_speed > 0.0) {
        return DEFAULT_STEP_INTERVAL_US;
    }
    let steps_per_mm = if block.millimeters > 0.0 && block.step_event_count > 0 {
        f64::from(block.step_event_count) / block.millimeters
    } else {
        1.0
    };
    let steps_per_sec = block.entry_speed / 60.0 * steps_per_mm;
    let us = 1_000_000.0 / steps_per_sec;
    if us >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        (us as u32).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::Cartesian;
    use crate::sim::SimHal;

    fn x_block(steps: u32, positive: bool) -> PlannerBlock {
        PlannerBlock {
            step_event_count: steps,
            direction_bits: if positive { Axis::X.bit() } else { 0 },
            ..PlannerBlock::default()
        }
    }

    fn stepper() -> Stepper<Cartesian> {
        Stepper::new(StepperConfig::default(), Cartesian::default())
    }

    /// Step until idle, advancing the clock by one interval per update.
    fn run_to_idle(st: &mut Stepper<Cartesian>, hal: &mut SimHal) -> usize {
        let mut updates = 0;
        while !st.is_idle() {
            hal.advance_us(u64::from(st.step_interval_us()));
            st.update(hal);
            updates += 1;
            assert!(updates < 1_000_000, "stepper never finished");
        }
        updates
    }

    #[test]
    fn thousand_steps_on_x_then_idle() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(1000, true)).unwrap();
        assert_eq!(st.state(), StepperState::Running);
        assert_eq!(st.step_interval_us(), DEFAULT_STEP_INTERVAL_US);
        assert!(hal.motors_enabled());
        assert!(hal.direction(Axis::X));

        let updates = run_to_idle(&mut st, &mut hal);
        assert_eq!(updates, 1000);
        assert_eq!(st.step_count()[0], 1000);
        assert_eq!(st.position(), [1000, 0, 0]);
        assert_eq!(hal.pulse_count(Axis::X), 1000);
        assert!(!hal.pulse_high(Axis::X));
        assert!(!st.is_executing());
        assert_eq!(st.current_speed(), 0.0);
    }

    #[test]
    fn no_step_before_interval_elapses() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(10, true)).unwrap();
        hal.advance_us(999);
        st.update(&mut hal);
        assert_eq!(hal.pulse_count(Axis::X), 0);
        hal.advance_us(1);
        st.update(&mut hal);
        assert_eq!(hal.pulse_count(Axis::X), 1);
    }

    #[test]
    fn negative_direction_counts_down() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(5, false)).unwrap();
        run_to_idle(&mut st, &mut hal);
        assert_eq!(st.position(), [-5, 0, 0]);
        assert!(!hal.direction(Axis::X));
    }

    #[test]
    fn load_is_rejected_unless_idle_and_valid() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        let bad = PlannerBlock {
            entry_speed: -1.0,
            ..x_block(10, true)
        };
        assert_eq!(
            st.load(&mut hal, bad),
            Err(LoadError::InvalidBlock(BlockViolation::NegativeEntrySpeed))
        );
        assert!(st.is_idle());
        assert!(!hal.motors_enabled());

        st.load(&mut hal, x_block(10, true)).unwrap();
        assert_eq!(st.load(&mut hal, x_block(3, true)), Err(LoadError::NotIdle));
        assert_eq!(st.target_steps(), [10, 0, 0]);
    }

    #[test]
    fn interval_follows_entry_speed_and_resolution() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        let kin = Cartesian::new(80.0);
        let block = PlannerBlock::for_move(&kin, (0.0, 0.0), (1.0, 0.0), 600.0);
        st.load(&mut hal, block).unwrap();
        // 600 mm/min * 80 steps/mm = 800 steps/s
        assert_eq!(st.step_interval_us(), 1250);
        assert_eq!(st.current_speed(), 600.0);
    }

    #[test]
    fn hold_pauses_and_resume_continues() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(4, true)).unwrap();
        hal.advance_us(1_000);
        st.update(&mut hal);
        st.hold();
        assert_eq!(st.state(), StepperState::Hold);
        hal.advance_us(10_000);
        st.update(&mut hal);
        assert_eq!(hal.pulse_count(Axis::X), 1);

        st.resume(&mut hal);
        assert_eq!(st.state(), StepperState::Running);
        st.update(&mut hal);
        assert_eq!(hal.pulse_count(Axis::X), 1, "resume re-arms the step timer");
        run_to_idle(&mut st, &mut hal);
        assert_eq!(st.position(), [4, 0, 0]);
    }

    #[test]
    fn hold_and_resume_ignore_other_states() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.hold();
        assert_eq!(st.state(), StepperState::Idle);
        st.resume(&mut hal);
        assert_eq!(st.state(), StepperState::Idle);
    }

    #[test]
    fn stop_resolves_on_next_update() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(100, true)).unwrap();
        st.stop();
        assert_eq!(st.state(), StepperState::Stopping);
        st.update(&mut hal);
        assert!(st.is_idle());
        assert!(!st.is_executing());
        assert_eq!(hal.pulse_count(Axis::X), 0);
    }

    #[test]
    fn disabling_motors_mid_block_stops() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(100, true)).unwrap();
        st.enable_motors(&mut hal, false);
        assert!(!hal.motors_enabled());
        assert_eq!(st.state(), StepperState::Stopping);
        st.update(&mut hal);
        assert!(st.is_idle());
    }

    #[test]
    fn motors_power_down_after_idle_timeout() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, x_block(1, true)).unwrap();
        run_to_idle(&mut st, &mut hal);
        assert!(st.motors_enabled());

        hal.advance_ms(u64::from(st.config().idle_timeout_ms) - 1);
        st.update(&mut hal);
        assert!(hal.motors_enabled());
        hal.advance_ms(1);
        st.update(&mut hal);
        assert!(!hal.motors_enabled());
        assert!(!st.motors_enabled());
    }

    #[test]
    fn idle_disable_can_be_turned_off() {
        let mut hal = SimHal::new();
        let config = StepperConfig {
            idle_disable: false,
            ..StepperConfig::default()
        };
        let mut st = Stepper::new(config, Cartesian::default());
        st.load(&mut hal, x_block(1, true)).unwrap();
        run_to_idle(&mut st, &mut hal);
        hal.advance_ms(120_000);
        st.update(&mut hal);
        assert!(hal.motors_enabled());
    }

    #[test]
    fn zero_step_block_completes_immediately() {
        let mut hal = SimHal::new();
        let mut st = stepper();
        st.load(&mut hal, PlannerBlock::default()).unwrap();
        assert_eq!(run_to_idle(&mut st, &mut hal), 1);
        assert_eq!(st.position(), [0, 0, 0]);
    }

    #[test]
    fn cart_position_uses_kinematics() {
        let mut hal = SimHal::new();
        let mut st = Stepper::new(StepperConfig::default(), Cartesian::new(10.0));
        st.load(&mut hal, x_block(25, true)).unwrap();
        run_to_idle(&mut st, &mut hal);
        assert_eq!(st.cart_position(), [2.5, 0.0, 0.0]);
    }
}
