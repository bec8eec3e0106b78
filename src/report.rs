//! Machine state names, alarm causes and the `<...>` status line.

use std::fmt;

use serde::Serialize;

use crate::config::AXIS_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SystemState {
    #[default]
    Idle,
    Running,
    Hold,
    Jog,
    Alarm,
    Homing,
    Check,
    Sleep,
    Door,
}

impl SystemState {
    /// Name used in status reports.
    pub const fn name(self) -> &'static str {
        match self {
            SystemState::Idle => "Idle",
            SystemState::Running => "Run",
            SystemState::Hold => "Hold",
            SystemState::Jog => "Jog",
            SystemState::Alarm => "Alarm",
            SystemState::Homing => "Home",
            SystemState::Check => "Check",
            SystemState::Sleep => "Sleep",
            SystemState::Door => "Door",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Alarm {
    HardLimit = 1,
    SoftLimit = 2,
    Estop = 3,
    ProbeFail = 4,
    HomingFail = 5,
    Overflow = 6,
    SpindleStall = 7,
}

impl Alarm {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Alarm> {
        match code {
            1 => Some(Alarm::HardLimit),
            2 => Some(Alarm::SoftLimit),
            3 => Some(Alarm::Estop),
            4 => Some(Alarm::ProbeFail),
            5 => Some(Alarm::HomingFail),
            6 => Some(Alarm::Overflow),
            7 => Some(Alarm::SpindleStall),
            _ => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Alarm::HardLimit => "Hard limit triggered",
            Alarm::SoftLimit => "Soft limit exceeded",
            Alarm::Estop => "Emergency stop",
            Alarm::ProbeFail => "Probe cycle failed",
            Alarm::HomingFail => "Homing cycle failed",
            Alarm::Overflow => "Buffer overflow",
            Alarm::SpindleStall => "Spindle stall detected",
        }
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Description of an optional alarm; no alarm reads as "None".
pub fn alarm_string(alarm: Option<Alarm>) -> &'static str {
    alarm.map_or("None", Alarm::description)
}

/// Snapshot for one `?` query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: SystemState,
    pub alarm: Option<Alarm>,
    pub machine: [f64; AXIS_COUNT],
    pub work: [f64; AXIS_COUNT],
    pub feed: f64,
    pub spindle: f64,
}

impl StatusReport {
    /// Write the report into `buf`. Returns the length, or 0 if it did not fit.
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut w = SliceWriter { buf, len: 0 };
        match fmt::write(&mut w, format_args!("{}", self)) {
            Ok(()) => w.len,
            Err(_) => 0,
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [mx, my, mz] = self.machine;
        let [wx, wy, wz] = self.work;
        write!(
            f,
            "<{}|MPos:{:.3},{:.3},{:.3}|WPos:{:.3},{:.3},{:.3}|F:{:.1}|S:{:.0}",
            self.state, mx, my, mz, wx, wy, wz, self.feed, self.spindle
        )?;
        if self.state == SystemState::Alarm {
            if let Some(alarm) = self.alarm {
                write!(f, "|A:{}", alarm.code())?;
            }
        }
        f.write_str(">")
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        let dst = self.buf.get_mut(self.len..end).ok_or(fmt::Error)?;
        dst.copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}
