//! G-code words to modal state and straight-line motion.
//!
//! [`parse`] is pure. [`Interpreter::execute_with`] validates the whole block
//! before touching anything, so a failing line leaves the modal state exactly
//! as it was and emits no motion.

use heapless::Vec;
use serde::Serialize;

use crate::arc::{ArcError, ArcSegments, Winding};
use crate::config::{ARC_MAX_SEGMENTS, DEFAULT_FEEDRATE, MAX_G_WORDS};
use crate::error::GcodeError;
use crate::hal::SpindleDirection;
use crate::kinematics::Kinematics;

/// One parsed line. Absent words are `None`, never a magic number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub g: Vec<f64, MAX_G_WORDS>,
    /// Last M word on the line.
    pub m: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub i: Option<f64>,
    pub j: Option<f64>,
    pub r: Option<f64>,
    pub f: Option<f64>,
    pub s: Option<f64>,
    pub p: Option<f64>,
}

impl Block {
    pub fn is_empty(&self) -> bool {
        *self == Block::default()
    }

    fn has_axis_words(&self) -> bool {
        self.x.is_some() || self.y.is_some()
    }
}

/// Value of one word: `[ws][+|-]digits[.digits]`, no exponent. Returns it
/// with the number of bytes consumed. Digit runs too long for an `f64` are
/// rejected rather than read as infinity.
fn scan_word_value(bytes: &[u8]) -> Result<(f64, usize), GcodeError> {
    let lead = bytes.iter().take_while(|b| b.is_ascii_whitespace()).count();
    let rest = &bytes[lead..];

    let mut end = usize::from(matches!(rest.first(), Some(b'+' | b'-')));
    let mut digits = 0usize;
    let mut seen_dot = false;
    for &b in &rest[end..] {
        match b {
            b'0'..=b'9' => digits += 1,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    if digits == 0 {
        return Err(GcodeError::Parse);
    }

    let text = std::str::from_utf8(&rest[..end]).map_err(|_| GcodeError::Parse)?;
    let value: f64 = text.parse().map_err(|_| GcodeError::Parse)?;
    if !value.is_finite() {
        return Err(GcodeError::Parse);
    }
    Ok((value, lead + end))
}

/// Tokenize one line into a [`Block`]. Letters outside the supported word set
/// are skipped up to the next whitespace.
pub fn parse(line: &str) -> Result<Block, GcodeError> {
    let bytes = line.as_bytes();
    let mut block = Block::default();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let letter = bytes[i].to_ascii_uppercase();
        i += 1;

        let slot = match letter {
            b'G' | b'M' | b'X' | b'Y' | b'I' | b'J' | b'R' | b'F' | b'S' | b'P' => letter,
            _ => {
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                continue;
            }
        };

        let (v, len) = scan_word_value(&bytes[i..])?;
        i += len;

        match slot {
            b'G' => block.g.push(v).map_err(|_| GcodeError::Overflow)?,
            b'M' => block.m = Some(v),
            b'X' => block.x = Some(v),
            b'Y' => block.y = Some(v),
            b'I' => block.i = Some(v),
            b'J' => block.j = Some(v),
            b'R' => block.r = Some(v),
            b'F' => block.f = Some(v),
            b'S' => block.s = Some(v),
            _ => block.p = Some(v),
        }
    }

    Ok(block)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MotionMode {
    Rapid,
    #[default]
    Linear,
    ArcCw,
    ArcCcw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CoordMode {
    #[default]
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FeedMode {
    #[default]
    UnitsPerMinute,
    InverseTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SpindleState {
    #[default]
    Off,
    Cw,
    Ccw,
}

impl SpindleState {
    pub fn direction(self) -> SpindleDirection {
        match self {
            SpindleState::Off => SpindleDirection::Off,
            SpindleState::Cw => SpindleDirection::Cw,
            SpindleState::Ccw => SpindleDirection::Ccw,
        }
    }
}

/// Modal memory of the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GcodeState {
    pub position: (f64, f64),
    pub motion_mode: MotionMode,
    pub coord_mode: CoordMode,
    pub feed_mode: FeedMode,
    pub spindle: SpindleState,
    /// mm/min
    pub feedrate: f64,
    pub spindle_speed: f64,
    pub feedrate_set: bool,
    pub program_complete: bool,
}

impl Default for GcodeState {
    fn default() -> Self {
        Self {
            position: (0.0, 0.0),
            motion_mode: MotionMode::Linear,
            coord_mode: CoordMode::Absolute,
            feed_mode: FeedMode::UnitsPerMinute,
            spindle: SpindleState::Off,
            feedrate: DEFAULT_FEEDRATE,
            spindle_speed: 0.0,
            feedrate_set: false,
            program_complete: false,
        }
    }
}

impl GcodeState {
    /// X/Y words resolved against the current position and coordinate mode.
    fn resolve_target(&self, block: &Block) -> (f64, f64) {
        let (mut x, mut y) = self.position;
        match self.coord_mode {
            CoordMode::Absolute => {
                if let Some(v) = block.x {
                    x = v;
                }
                if let Some(v) = block.y {
                    y = v;
                }
            }
            CoordMode::Relative => {
                if let Some(v) = block.x {
                    x += v;
                }
                if let Some(v) = block.y {
                    y += v;
                }
            }
        }
        (x, y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveKind {
    Rapid,
    /// Programmed feedrate in mm/min.
    Feed(f64),
}

/// Receives every straight segment the interpreter commits.
pub trait MotionSink {
    fn line_to(&mut self, from: (f64, f64), to: (f64, f64), kind: MoveKind);

    fn dwell(&mut self, _seconds: f64) {}

    /// Drop motion buffered downstream. Called on soft reset.
    fn cancel(&mut self) {}
}

impl MotionSink for () {
    fn line_to(&mut self, _from: (f64, f64), _to: (f64, f64), _kind: MoveKind) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GWord {
    Motion(MotionMode),
    Dwell,
    Coord(CoordMode),
    Feed(FeedMode),
}

fn classify_g(n: f64) -> Result<GWord, GcodeError> {
    if n.fract() != 0.0 || n < 0.0 {
        return Err(GcodeError::UnsupportedCommand);
    }
    match n as u32 {
        0 => Ok(GWord::Motion(MotionMode::Rapid)),
        1 => Ok(GWord::Motion(MotionMode::Linear)),
        2 => Ok(GWord::Motion(MotionMode::ArcCw)),
        3 => Ok(GWord::Motion(MotionMode::ArcCcw)),
        4 => Ok(GWord::Dwell),
        90 => Ok(GWord::Coord(CoordMode::Absolute)),
        91 => Ok(GWord::Coord(CoordMode::Relative)),
        93 => Ok(GWord::Feed(FeedMode::InverseTime)),
        94 => Ok(GWord::Feed(FeedMode::UnitsPerMinute)),
        _ => Err(GcodeError::UnsupportedCommand),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MWord {
    ProgramEnd,
    ProgramRewind,
    Spindle(SpindleState),
}

fn classify_m(n: f64) -> Result<MWord, GcodeError> {
    if n.fract() != 0.0 || n < 0.0 {
        return Err(GcodeError::UnknownCommand);
    }
    match n as u32 {
        2 => Ok(MWord::ProgramEnd),
        30 => Ok(MWord::ProgramRewind),
        3 => Ok(MWord::Spindle(SpindleState::Cw)),
        4 => Ok(MWord::Spindle(SpindleState::Ccw)),
        5 => Ok(MWord::Spindle(SpindleState::Off)),
        _ => Err(GcodeError::UnknownCommand),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    None,
    Motion(MotionMode),
    Dwell,
}

/// Everything about a block that can be decided without executing it.
struct Plan {
    action: Action,
    coord: Option<CoordMode>,
    feed: Option<FeedMode>,
    m: Option<MWord>,
}

fn plan(block: &Block, modal_motion: MotionMode) -> Result<Plan, GcodeError> {
    let mut out = Plan {
        action: Action::None,
        coord: None,
        feed: None,
        m: block.m.map(classify_m).transpose()?,
    };

    for &n in &block.g {
        let word = classify_g(n)?;
        let action = match word {
            GWord::Motion(mode) => Action::Motion(mode),
            GWord::Dwell => Action::Dwell,
            GWord::Coord(mode) => {
                out.coord = Some(mode);
                continue;
            }
            GWord::Feed(mode) => {
                out.feed = Some(mode);
                continue;
            }
        };
        if out.action != Action::None {
            return Err(GcodeError::InvalidParameter);
        }
        out.action = action;
    }

    // Axis words without a motion word reuse the modal motion mode.
    if out.action == Action::None && block.has_axis_words() {
        out.action = Action::Motion(modal_motion);
    }

    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Interpreter<K> {
    state: GcodeState,
    kinematics: K,
}

impl<K: Kinematics> Interpreter<K> {
    pub fn new(kinematics: K) -> Self {
        Self {
            state: GcodeState::default(),
            kinematics,
        }
    }

    /// Back to startup modal state at the origin.
    pub fn reset(&mut self) {
        self.state = GcodeState::default();
    }

    pub fn state(&self) -> &GcodeState {
        &self.state
    }

    pub fn position(&self) -> (f64, f64) {
        self.state.position
    }

    pub fn set_position(&mut self, x: f64, y: f64) {
        self.state.position = (x, y);
    }

    /// Force the spindle off without going through a block (alarms).
    pub fn spindle_off(&mut self) {
        self.state.spindle = SpindleState::Off;
    }

    pub fn clear_program_complete(&mut self) {
        self.state.program_complete = false;
    }

    pub fn kinematics(&self) -> &K {
        &self.kinematics
    }

    /// Endpoint of the move `block` would make, or `None` if it does not move.
    pub fn target_of(&self, block: &Block) -> Option<(f64, f64)> {
        let plan = plan(block, self.state.motion_mode).ok()?;
        if !matches!(plan.action, Action::Motion(_)) {
            return None;
        }
        let mut st = self.state;
        if let Some(mode) = plan.coord {
            st.coord_mode = mode;
        }
        Some(st.resolve_target(block))
    }

    pub fn execute(&mut self, block: &Block) -> Result<(), GcodeError> {
        self.execute_with(block, &mut ())
    }

    /// Run one block. On error the state is untouched and `sink` saw nothing.
    pub fn execute_with<S: MotionSink + ?Sized>(&mut self, block: &Block, sink: &mut S) -> Result<(), GcodeError> {
        let plan = plan(block, self.state.motion_mode)?;
        let mut st = self.state;

        if let Some(mode) = plan.coord {
            st.coord_mode = mode;
        }
        if let Some(mode) = plan.feed {
            st.feed_mode = mode;
        }

        if let Some(f) = block.f {
            if !(f > 0.0) || !f.is_finite() {
                return Err(GcodeError::InvalidParameter);
            }
            st.feedrate = f;
            st.feedrate_set = true;
        }

        match plan.action {
            Action::None => {}
            Action::Dwell => {
                let p = block.p.ok_or(GcodeError::MissingParameter)?;
                if p < 0.0 {
                    return Err(GcodeError::InvalidParameter);
                }
                sink.dwell(p);
            }
            Action::Motion(mode @ (MotionMode::Rapid | MotionMode::Linear)) => {
                if mode == MotionMode::Linear && !st.feedrate_set {
                    return Err(GcodeError::MissingParameter);
                }
                let target = st.resolve_target(block);
                let kind = match mode {
                    MotionMode::Rapid => MoveKind::Rapid,
                    _ => MoveKind::Feed(st.feedrate),
                };
                self.emit_linear(st.position, target, kind, sink);
                st.motion_mode = mode;
                st.position = target;
            }
            Action::Motion(mode) => {
                if !st.feedrate_set {
                    return Err(GcodeError::MissingParameter);
                }
                let target = st.resolve_target(block);
                let winding = if mode == MotionMode::ArcCw {
                    Winding::Clockwise
                } else {
                    Winding::CounterClockwise
                };
                let arc = if let Some(r) = block.r {
                    ArcSegments::from_radius(st.position, target, r, winding)
                } else if block.i.is_some() || block.j.is_some() {
                    let offset = (block.i.unwrap_or(0.0), block.j.unwrap_or(0.0));
                    ArcSegments::from_center(st.position, target, offset, winding)
                } else {
                    return Err(GcodeError::MissingParameter);
                };
                let arc = arc.map_err(|_: ArcError| GcodeError::InvalidTarget)?;

                let kind = MoveKind::Feed(st.feedrate);
                let mut from = st.position;
                for point in arc {
                    sink.line_to(from, point, kind);
                    from = point;
                }
                st.motion_mode = mode;
                st.position = target;
            }
        }

        match plan.m {
            Some(MWord::ProgramEnd) => {
                st.spindle = SpindleState::Off;
                st.program_complete = true;
            }
            Some(MWord::ProgramRewind) => {
                st.spindle = SpindleState::Off;
                st.program_complete = true;
                st.position = (0.0, 0.0);
            }
            Some(MWord::Spindle(state)) => {
                st.spindle = state;
                if state != SpindleState::Off {
                    if let Some(s) = block.s {
                        st.spindle_speed = s;
                    }
                }
            }
            None => {
                if let Some(s) = block.s {
                    st.spindle_speed = s;
                }
            }
        }

        self.state = st;
        Ok(())
    }

    pub fn process_line(&mut self, line: &str) -> Result<(), GcodeError> {
        self.process_line_with(line, &mut ())
    }

    pub fn process_line_with<S: MotionSink + ?Sized>(&mut self, line: &str, sink: &mut S) -> Result<(), GcodeError> {
        let block = parse(line)?;
        self.execute_with(&block, sink)
    }

    /// Straight move, split when the machine wants short segments.
    fn emit_linear<S: MotionSink + ?Sized>(&self, from: (f64, f64), to: (f64, f64), kind: MoveKind, sink: &mut S) {
        let dx = to.0 - from.0;
        let dy = to.1 - from.1;
        let dist = dx.hypot(dy);
        if dist == 0.0 {
            return;
        }

        let pieces = match self.kinematics.max_segment_len() {
            Some(max) if max > 0.0 => ((dist / max).ceil() as usize).clamp(1, ARC_MAX_SEGMENTS),
            _ => 1,
        };

        let mut prev = from;
        for k in 1..=pieces {
            let next = if k == pieces {
                to
            } else {
                let t = k as f64 / pieces as f64;
                (from.0 + dx * t, from.1 + dy * t)
            };
            sink.line_to(prev, next, kind);
            prev = next;
        }
    }
}
