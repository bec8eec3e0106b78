//! Top-level machine state, safety interlocks and the serial command path.
//!
//! The supervisor owns the framer, the interpreter and the planner queue, and
//! talks to the step context only through a [`BlockSender`]. ALARM is sticky:
//! the only way out is [`Supervisor::clear_alarm`] (or a soft reset).

use heapless::Vec;
use thiserror::Error;

use crate::config::{
    AXIS_COUNT, CORE_NAME, CORE_VERSION, RX_CHUNK, SOFT_LIMIT_X, SOFT_LIMIT_Y, SOFT_LIMIT_Z,
    SPINDLE_MAX_RPM, StepperConfig, SupervisorConfig,
};
use crate::error::GcodeError;
use crate::gcode::{Interpreter, MotionSink, parse};
use crate::hal::{Axis, Hal, SpindleDirection};
use crate::kinematics::Kinematics;
use crate::planner::{BlockViolation, PlannerBlock, PlannerQueue};
use crate::protocol::{FrameSink, Framer, Line, RealtimeCommand};
use crate::report::{Alarm, StatusReport, SystemState};
use crate::step_task::{BlockSender, StepTask, channel};

/// Why a line was not executed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    #[error("{0}")]
    Gcode(GcodeError),
    #[error("line rejected in {0} state")]
    Locked(SystemState),
    #[error("target outside soft limits")]
    SoftLimit,
}

impl LineError {
    /// Number sent back as `error:<code>`.
    pub const fn code(self) -> u8 {
        match self {
            LineError::Gcode(e) => e.code(),
            LineError::Locked(_) => 8,
            LineError::SoftLimit => 9,
        }
    }
}

impl From<GcodeError> for LineError {
    fn from(e: GcodeError) -> Self {
        LineError::Gcode(e)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum QueueError {
    #[error("blocks not accepted in {0} state")]
    Locked(SystemState),
    #[error("invalid block: {0}")]
    Invalid(BlockViolation),
    #[error("planner queue is full")]
    Full(PlannerBlock),
}

/// Realtime commands and immediately delivered lines from one input chunk.
#[derive(Default)]
struct Inbox {
    realtime: Vec<RealtimeCommand, RX_CHUNK>,
    lines: Vec<Line, { RX_CHUNK / 2 }>,
}

impl FrameSink for Inbox {
    fn realtime(&mut self, cmd: RealtimeCommand) {
        // one command per byte, so a chunk never overfills this
        let _ = self.realtime.push(cmd);
    }

    fn line(&mut self, line: Line) {
        if self.lines.push(line).is_err() {
            console_warn!("inbox full, dropped line");
        }
    }
}

pub struct Supervisor<H, K> {
    hal: H,
    framer: Framer,
    interpreter: Interpreter<K>,
    planner: PlannerQueue,
    motion: BlockSender,
    state: SystemState,
    alarm: Option<Alarm>,
    homed: bool,
    limits_enabled: bool,
    soft_limits_enabled: bool,
    spindle_enabled: bool,
    machine: [f64; AXIS_COUNT],
    work_offset: [f64; AXIS_COUNT],
    lines_processed: u32,
    errors: u32,
    uptime_ms: u32,
}

/// Build a supervisor and the step task it drives, sharing one board.
pub fn assemble<H, K>(
    hal: H,
    config: SupervisorConfig,
    stepper: StepperConfig,
    kinematics: K,
) -> (Supervisor<H, K>, StepTask<H, K>)
where
    H: Hal + Clone,
    K: Kinematics + Clone,
{
    let (tx, rx) = channel();
    let task = StepTask::new(hal.clone(), stepper, kinematics.clone(), rx);
    (Supervisor::new(hal, config, kinematics, tx), task)
}

impl<H: Hal, K: Kinematics> Supervisor<H, K> {
    pub fn new(hal: H, config: SupervisorConfig, kinematics: K, motion: BlockSender) -> Self {
        console_log!("{} {} ready", CORE_NAME, CORE_VERSION);
        Self {
            hal,
            framer: Framer::new(config.protocol),
            interpreter: Interpreter::new(kinematics),
            planner: PlannerQueue::with_depth(config.planner_depth),
            motion,
            state: SystemState::Idle,
            alarm: None,
            homed: false,
            limits_enabled: config.limits_enabled,
            soft_limits_enabled: config.soft_limits_enabled,
            spindle_enabled: config.spindle_enabled,
            machine: [0.0; AXIS_COUNT],
            work_offset: [0.0; AXIS_COUNT],
            lines_processed: 0,
            errors: 0,
            uptime_ms: 0,
        }
    }

    // ── State machine ────────────────────────────────────────────────────

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn alarm(&self) -> Option<Alarm> {
        self.alarm
    }

    pub fn is_idle(&self) -> bool {
        self.state == SystemState::Idle
    }

    pub fn is_alarmed(&self) -> bool {
        self.state == SystemState::Alarm
    }

    /// Requested transition. ALARM can only be entered through
    /// [`trigger_alarm`](Self::trigger_alarm) and left through
    /// [`clear_alarm`](Self::clear_alarm).
    pub fn set_state(&mut self, next: SystemState) -> bool {
        let allowed = match (self.state, next) {
            (SystemState::Alarm, _) | (_, SystemState::Alarm) => false,
            (from, SystemState::Homing) => from == SystemState::Idle,
            (from, SystemState::Running) => matches!(from, SystemState::Idle | SystemState::Hold),
            _ => true,
        };
        if !allowed {
            console_warn!("state change {} -> {} refused", self.state, next);
            return false;
        }
        console_log!("state {} -> {}", self.state, next);
        self.state = next;
        self.sync_hold();
        true
    }

    /// Unconditional safety stop.
    pub fn trigger_alarm(&mut self, cause: Alarm) {
        self.state = SystemState::Alarm;
        self.alarm = Some(cause);

        self.hal.enable(false);
        self.motion.abort();
        self.motion.motors_off();

        self.interpreter.spindle_off();
        self.hal.set_spindle(SpindleDirection::Off, 0.0);

        self.planner.clear();

        console_warn!("ALARM:{} {}", cause.code(), cause);
        self.write(format!("ALARM:{}\r\n", cause.code()).as_bytes());
    }

    pub fn clear_alarm(&mut self) -> bool {
        if self.state != SystemState::Alarm {
            return false;
        }
        self.alarm = None;
        self.state = SystemState::Idle;
        self.sync_hold();
        console_log!("alarm cleared");
        true
    }

    pub fn feed_hold(&mut self) {
        if matches!(self.state, SystemState::Running | SystemState::Jog) {
            self.state = SystemState::Hold;
            self.sync_hold();
        }
    }

    pub fn cycle_start(&mut self) {
        if self.state == SystemState::Hold {
            self.state = SystemState::Running;
            self.sync_hold();
        }
    }

    /// Reinitialise the interpreter and planner without forgetting where the
    /// machine is or that it was homed.
    pub fn soft_reset(&mut self) {
        self.motion.abort();
        self.planner.clear();
        self.interpreter.reset();
        self.interpreter.set_position(self.machine[0], self.machine[1]);
        self.state = SystemState::Idle;
        self.alarm = None;
        self.sync_hold();
        self.apply_spindle();
        console_log!("soft reset");
    }

    fn sync_hold(&mut self) {
        let hold = matches!(self.state, SystemState::Hold | SystemState::Door | SystemState::Sleep);
        self.motion.set_hold(hold);
    }

    // ── Lines ────────────────────────────────────────────────────────────

    pub fn process_line(&mut self, line: &str) -> Result<(), LineError> {
        self.process_line_with(line, &mut ())
    }

    /// Run one G-code line; segments it commits go to `sink`.
    pub fn process_line_with<S: MotionSink + ?Sized>(&mut self, line: &str, sink: &mut S) -> Result<(), LineError> {
        let result = match self.state {
            SystemState::Idle | SystemState::Running => self.execute_line(line, sink),
            SystemState::Check => {
                // every checked line counts, parsed or not
                self.lines_processed = self.lines_processed.wrapping_add(1);
                return parse(line).map(|_| ()).map_err(|e| {
                    self.errors = self.errors.wrapping_add(1);
                    LineError::from(e)
                });
            }
            other => Err(LineError::Locked(other)),
        };

        match result {
            Ok(()) => {
                self.lines_processed = self.lines_processed.wrapping_add(1);
                if self.state == SystemState::Idle {
                    self.state = SystemState::Running;
                }
            }
            Err(_) => self.errors = self.errors.wrapping_add(1),
        }
        result
    }

    fn execute_line<S: MotionSink + ?Sized>(&mut self, line: &str, sink: &mut S) -> Result<(), LineError> {
        let block = parse(line)?;

        if self.soft_limits_enabled {
            if let Some((x, y)) = self.interpreter.target_of(&block) {
                if !self.check_soft_limits(x, y, self.machine[Axis::Z.index()]) {
                    self.trigger_alarm(Alarm::SoftLimit);
                    return Err(LineError::SoftLimit);
                }
            }
        }

        self.interpreter.execute_with(&block, sink)?;
        self.apply_spindle();
        Ok(())
    }

    fn apply_spindle(&mut self) {
        let gc = self.interpreter.state();
        let dir = if self.spindle_enabled {
            gc.spindle.direction()
        } else {
            SpindleDirection::Off
        };
        let pwm = if dir == SpindleDirection::Off {
            0.0
        } else {
            (gc.spindle_speed / SPINDLE_MAX_RPM).clamp(0.0, 1.0)
        };
        self.hal.set_spindle(dir, pwm);
    }

    /// Validated enqueue for the step context.
    pub fn queue_block(&mut self, block: PlannerBlock) -> Result<(), QueueError> {
        if !matches!(self.state, SystemState::Idle | SystemState::Running | SystemState::Hold) {
            return Err(QueueError::Locked(self.state));
        }
        block.check().map_err(QueueError::Invalid)?;
        self.planner.push(block).map_err(|full| QueueError::Full(full.0))
    }

    // ── Serial path ──────────────────────────────────────────────────────

    pub fn receive(&mut self, bytes: &[u8]) {
        self.receive_with(bytes, &mut ());
    }

    /// Frame `bytes` and answer each line. Input is taken one line at a
    /// time so a realtime byte never overtakes a line that ended before it.
    /// Within a line, realtime commands act before the line itself.
    pub fn receive_with<S: MotionSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S) {
        for chunk in bytes.chunks(RX_CHUNK) {
            for piece in chunk.split_inclusive(|b| *b == b'\n') {
                let mut inbox = Inbox::default();
                self.framer.feed(piece, &mut inbox);

                for cmd in inbox.realtime {
                    self.realtime(cmd);
                    if cmd == RealtimeCommand::Reset {
                        sink.cancel();
                    }
                }
                for line in inbox.lines {
                    self.handle_line(&line, sink);
                }
                while let Some(line) = self.framer.pop_line() {
                    self.handle_line(&line, sink);
                }
            }
        }
    }

    pub fn realtime(&mut self, cmd: RealtimeCommand) {
        match cmd {
            RealtimeCommand::Reset => {
                self.soft_reset();
                self.write(format!("\r\n{} {}\r\n", CORE_NAME, CORE_VERSION).as_bytes());
            }
            RealtimeCommand::StatusQuery => {
                let report = self.status_report();
                self.write(format!("{}\r\n", report).as_bytes());
            }
            RealtimeCommand::FeedHold => self.feed_hold(),
            RealtimeCommand::CycleStart => self.cycle_start(),
        }
    }

    fn handle_line<S: MotionSink + ?Sized>(&mut self, line: &Line, sink: &mut S) {
        let result = if line.is_overflow() {
            self.errors = self.errors.wrapping_add(1);
            Err(LineError::Gcode(GcodeError::Overflow))
        } else if let Some(cmd) = line.as_str().strip_prefix('$') {
            self.system_command(cmd)
        } else {
            self.process_line_with(line.as_str(), sink)
        };

        match result {
            Ok(()) => self.write(b"ok\r\n"),
            Err(e) => self.write(format!("error:{}\r\n", e.code()).as_bytes()),
        }
    }

    fn system_command(&mut self, cmd: &str) -> Result<(), LineError> {
        match cmd.trim() {
            "X" => {
                self.clear_alarm();
                Ok(())
            }
            "H" => {
                if self.start_homing(Axis::X.bit() | Axis::Y.bit()) {
                    Ok(())
                } else {
                    Err(LineError::Locked(self.state))
                }
            }
            "C" => match self.state {
                SystemState::Check => {
                    self.set_state(SystemState::Idle);
                    Ok(())
                }
                SystemState::Idle => {
                    self.set_state(SystemState::Check);
                    Ok(())
                }
                other => Err(LineError::Locked(other)),
            },
            _ => Ok(()),
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hal.serial_write(bytes);
    }

    // ── Periodic work ────────────────────────────────────────────────────

    pub fn poll(&mut self) {
        self.poll_with(&mut ());
    }

    pub fn poll_with<S: MotionSink + ?Sized>(&mut self, sink: &mut S) {
        self.uptime_ms = self.hal.millis();
        self.hal.poll();

        if self.limits_enabled && self.state == SystemState::Running {
            let inputs = self.hal.read_inputs();
            if inputs.estop {
                self.trigger_alarm(Alarm::Estop);
            } else if inputs.any_limit() {
                self.trigger_alarm(Alarm::HardLimit);
            }
        }

        let rejected = self.motion.take_rejected();
        if rejected > 0 && self.state != SystemState::Alarm {
            console_warn!("step task refused {} block(s)", rejected);
            self.trigger_alarm(Alarm::SoftLimit);
        }

        let mut rx = [0u8; RX_CHUNK];
        let n = self.hal.serial_read(&mut rx);
        if n > 0 {
            self.receive_with(&rx[..n], sink);
        }

        if self.state != SystemState::Alarm && self.motion.slot_free() {
            if let Some(block) = self.planner.pop() {
                if let Err(block) = self.motion.try_send(block) {
                    // the slot was free a moment ago; keep the block for next poll
                    let _ = self.planner.push(block);
                }
            }
        }

        if self.state == SystemState::Running
            && self.interpreter.state().program_complete
            && self.planner.is_empty()
            && !self.motion.is_busy()
        {
            self.interpreter.clear_program_complete();
            self.state = SystemState::Idle;
            console_log!("program complete");
        }

        let (x, y) = self.interpreter.position();
        self.machine[Axis::X.index()] = x;
        self.machine[Axis::Y.index()] = y;
    }

    // ── Homing and limits ────────────────────────────────────────────────

    /// Completes immediately: the seek itself belongs to the board layer.
    pub fn start_homing(&mut self, axis_mask: u8) -> bool {
        if self.state != SystemState::Idle {
            console_warn!("homing refused in {} state", self.state);
            return false;
        }
        if !self.interpreter.kinematics().validate_homing_axes(axis_mask) {
            console_warn!("homing refused for axis mask {:#05b}", axis_mask);
            return false;
        }

        self.state = SystemState::Homing;
        self.machine = [0.0; AXIS_COUNT];
        self.interpreter.set_position(0.0, 0.0);
        self.motion.zero_position();
        self.homed = true;
        self.state = SystemState::Idle;
        console_log!("homing complete");
        true
    }

    pub fn is_homed(&self) -> bool {
        self.homed
    }

    pub fn set_limits_enabled(&mut self, on: bool) {
        self.limits_enabled = on;
    }

    pub fn set_soft_limits_enabled(&mut self, on: bool) {
        self.soft_limits_enabled = on;
    }

    pub fn set_spindle_enabled(&mut self, on: bool) {
        self.spindle_enabled = on;
        self.apply_spindle();
    }

    /// Pure predicate; never raises an alarm by itself.
    pub fn check_soft_limits(&self, x: f64, y: f64, z: f64) -> bool {
        if !self.soft_limits_enabled {
            return true;
        }
        let within = |v: f64, (lo, hi): (f64, f64)| v >= lo && v <= hi;
        within(x, SOFT_LIMIT_X) && within(y, SOFT_LIMIT_Y) && within(z, SOFT_LIMIT_Z)
    }

    // ── Positions and reporting ──────────────────────────────────────────

    pub fn machine_position(&self) -> [f64; AXIS_COUNT] {
        self.machine
    }

    pub fn work_position(&self) -> [f64; AXIS_COUNT] {
        let mut out = self.machine;
        for (w, off) in out.iter_mut().zip(self.work_offset) {
            *w -= off;
        }
        out
    }

    pub fn set_work_offset(&mut self, x: f64, y: f64, z: f64) {
        self.work_offset = [x, y, z];
    }

    pub fn status_report(&self) -> StatusReport {
        let gc = self.interpreter.state();
        StatusReport {
            state: self.state,
            alarm: self.alarm,
            machine: self.machine,
            work: self.work_position(),
            feed: gc.feedrate,
            spindle: gc.spindle_speed,
        }
    }

    /// Status line into a caller buffer; 0 if it does not fit.
    pub fn write_status(&self, buf: &mut [u8]) -> usize {
        self.status_report().write_to(buf)
    }

    pub fn lines_processed(&self) -> u32 {
        self.lines_processed
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn uptime_ms(&self) -> u32 {
        self.uptime_ms
    }

    pub fn interpreter(&self) -> &Interpreter<K> {
        &self.interpreter
    }

    pub fn planner(&self) -> &PlannerQueue {
        &self.planner
    }

    pub fn motion(&self) -> &BlockSender {
        &self.motion
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }
}
