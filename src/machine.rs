//! Browser simulator: one engraver on a [`SimHal`] board.
//!
//! JavaScript drives it with `send` for G-code text and `tick` for wall time.
//! Interpreter moves become planner blocks held here until the supervisor's
//! queue has room, so long programs can be pasted in one go.

use std::collections::VecDeque;

use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::config::{AXIS_COUNT, RAPID_FEED_MM_MIN, StepperConfig, SupervisorConfig};
use crate::gcode::{GcodeState, MotionSink, MoveKind};
use crate::hal::{Axis, Inputs, SpindleDirection};
use crate::kinematics::Cartesian;
use crate::planner::PlannerBlock;
use crate::report::{Alarm, StatusReport, SystemState};
use crate::sim::SimHal;
use crate::step_task::StepTask;
use crate::stepper::StepperState;
use crate::supervisor::{Supervisor, assemble};

/// Granularity of the simulated step interrupt.
const STEP_SERVICE_US: u64 = 50;
/// Supervisor main-loop period.
const POLL_PERIOD_US: u64 = 1_000;
/// Longest stretch of time one `tick` will simulate.
const MAX_TICK_MS: f64 = 250.0;

/// Interpreter output waiting for planner space.
#[derive(Debug, Default)]
struct MoveBuffer {
    kinematics: Cartesian,
    blocks: VecDeque<PlannerBlock>,
}

impl MotionSink for MoveBuffer {
    fn line_to(&mut self, from: (f64, f64), to: (f64, f64), kind: MoveKind) {
        let speed = match kind {
            MoveKind::Rapid => RAPID_FEED_MM_MIN,
            MoveKind::Feed(f) => f,
        };
        let block = PlannerBlock::for_move(&self.kinematics, from, to, speed);
        if block.step_event_count > 0 {
            self.blocks.push_back(block);
        }
    }

    fn cancel(&mut self) {
        self.blocks.clear();
    }
}

#[derive(Serialize)]
pub struct MachineSnapshot {
    pub report: StatusReport,
    pub gcode: GcodeState,
    pub stepper: StepperState,
    pub motor_steps: [i32; AXIS_COUNT],
    pub motor_position: [f64; AXIS_COUNT],
    pub motors_enabled: bool,
    pub spindle: SpindleDirection,
    pub spindle_pwm: f64,
    pub inputs: Inputs,
    pub homed: bool,
    pub pending_moves: usize,
    pub queued_blocks: usize,
    pub lines_processed: u32,
    pub errors: u32,
    pub uptime_ms: u32,
}

#[wasm_bindgen]
pub struct Machine {
    hal: SimHal,
    supervisor: Supervisor<SimHal, Cartesian>,
    steps: StepTask<SimHal, Cartesian>,
    moves: MoveBuffer,
    carry_us: f64,
    next_poll_us: u64,
}

#[wasm_bindgen]
impl Machine {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default(), StepperConfig::default(), Cartesian::default())
    }

    /// Rebuild the machine from JS config objects. Missing fields take
    /// defaults; like a power cycle, position and homing are lost.
    pub fn configure(&mut self, supervisor: JsValue, stepper: JsValue, steps_per_mm: f64) {
        let supervisor: SupervisorConfig = serde_wasm_bindgen::from_value(supervisor).unwrap_or_default();
        let stepper: StepperConfig = serde_wasm_bindgen::from_value(stepper).unwrap_or_default();
        let kinematics = if steps_per_mm.is_finite() && steps_per_mm > 0.0 {
            Cartesian::new(steps_per_mm)
        } else {
            Cartesian::default()
        };
        *self = Self::with_config(supervisor, stepper, kinematics);
    }

    /// Feed text as if it arrived on the serial port.
    pub fn send(&mut self, text: &str) {
        for line in text.split_inclusive('\n') {
            self.supervisor.receive_with(line.as_bytes(), &mut self.moves);
        }
        self.feed_planner();
    }

    pub fn tick(&mut self, dt_ms: f64) {
        if !(dt_ms > 0.0) {
            return;
        }
        let mut remaining_us = dt_ms.min(MAX_TICK_MS) * 1_000.0 + self.carry_us;
        while remaining_us >= STEP_SERVICE_US as f64 {
            remaining_us -= STEP_SERVICE_US as f64;
            self.hal.advance_us(STEP_SERVICE_US);
            self.steps.service();

            if self.hal.now_us() >= self.next_poll_us {
                self.pump();
                self.next_poll_us = self.hal.now_us() + POLL_PERIOD_US;
            }
        }
        self.carry_us = remaining_us;
    }

    pub fn status_report(&self) -> String {
        self.supervisor.status_report().to_string()
    }

    /// Everything written to the serial port since the last call.
    pub fn take_output(&mut self) -> String {
        String::from_utf8_lossy(&self.hal.take_tx()).into_owned()
    }

    pub fn set_estop(&mut self, on: bool) {
        let mut inputs = self.hal.inputs();
        inputs.estop = on;
        self.hal.set_inputs(inputs);
        if on {
            self.supervisor.trigger_alarm(Alarm::Estop);
            self.moves.blocks.clear();
        }
    }

    /// `axis`: 0 = X, 1 = Y, 2 = Z. Other indices are ignored.
    pub fn set_limit(&mut self, axis: usize, on: bool) {
        let mut inputs = self.hal.inputs();
        match Axis::from_index(axis) {
            Some(Axis::X) => inputs.limit_x = on,
            Some(Axis::Y) => inputs.limit_y = on,
            Some(Axis::Z) => inputs.limit_z = on,
            None => return,
        }
        self.hal.set_inputs(inputs);
    }

    pub fn home_all(&mut self) -> bool {
        self.supervisor.start_homing(Axis::X.bit() | Axis::Y.bit())
    }

    pub fn soft_reset(&mut self) {
        self.supervisor.soft_reset();
        self.moves.blocks.clear();
    }

    pub fn clear_alarm(&mut self) -> bool {
        self.supervisor.clear_alarm()
    }

    pub fn is_idle(&self) -> bool {
        self.supervisor.is_idle() && self.moves.blocks.is_empty() && !self.supervisor.motion().is_busy()
    }

    pub fn get_full_state(&self) -> JsValue {
        serde_wasm_bindgen::to_value(&self.snapshot()).unwrap_or(JsValue::NULL)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn with_config(supervisor: SupervisorConfig, stepper: StepperConfig, kinematics: Cartesian) -> Self {
        let hal = SimHal::new();
        let (supervisor, steps) = assemble(hal.clone(), supervisor, stepper, kinematics);
        Self {
            hal,
            supervisor,
            steps,
            moves: MoveBuffer {
                kinematics,
                blocks: VecDeque::new(),
            },
            carry_us: 0.0,
            next_poll_us: 0,
        }
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let stepper = self.steps.stepper();
        let (spindle, spindle_pwm) = self.hal.spindle();
        MachineSnapshot {
            report: self.supervisor.status_report(),
            gcode: *self.supervisor.interpreter().state(),
            stepper: stepper.state(),
            motor_steps: stepper.position(),
            motor_position: stepper.cart_position(),
            motors_enabled: self.hal.motors_enabled(),
            spindle,
            spindle_pwm,
            inputs: self.hal.inputs(),
            homed: self.supervisor.is_homed(),
            pending_moves: self.moves.blocks.len(),
            queued_blocks: self.supervisor.planner().len(),
            lines_processed: self.supervisor.lines_processed(),
            errors: self.supervisor.errors(),
            uptime_ms: self.supervisor.uptime_ms(),
        }
    }

    pub fn state(&self) -> SystemState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &Supervisor<SimHal, Cartesian> {
        &self.supervisor
    }

    pub fn hal(&self) -> &SimHal {
        &self.hal
    }

    /// One supervisor main-loop pass.
    fn pump(&mut self) {
        // planner first, so a program never looks finished while moves wait here
        self.feed_planner();
        self.supervisor.poll_with(&mut self.moves);
        self.feed_planner();
    }

    fn feed_planner(&mut self) {
        if self.supervisor.is_alarmed() {
            self.moves.blocks.clear();
            return;
        }
        while let Some(block) = self.moves.blocks.pop_front() {
            if self.supervisor.queue_block(block).is_err() {
                self.moves.blocks.push_front(block);
                break;
            }
        }
    }
}
