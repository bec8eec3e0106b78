//! Machine geometry, injected into both the interpreter and the stepper.

use crate::config::AXIS_COUNT;
use crate::hal::Axis;
use crate::planner::PlannerBlock;

/// Per-motor step counts and direction bits for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepPlan {
    pub steps: [u32; AXIS_COUNT],
    pub direction_bits: u8,
}

pub trait Kinematics {
    /// Cartesian mm -> absolute motor steps.
    fn cart_to_steps(&self, cart: [f64; AXIS_COUNT]) -> [i32; AXIS_COUNT];

    /// Absolute motor steps -> Cartesian mm.
    fn steps_to_cart(&self, steps: [i32; AXIS_COUNT]) -> [f64; AXIS_COUNT];

    /// Motor steps for a block, or `None` if this machine cannot execute it.
    fn block_steps(&self, block: &PlannerBlock) -> Option<StepPlan>;

    fn validate_homing_axes(&self, axis_mask: u8) -> bool;

    /// Longest straight segment the machine wants to receive.
    fn max_segment_len(&self) -> Option<f64> {
        None
    }
}

const ALL_AXES_MASK: u8 = 0b111;

/// Signed Cartesian step deltas of a block. Blocks with no per-axis steps
/// put their whole step count on X.
fn signed_cart_steps(block: &PlannerBlock) -> [i64; AXIS_COUNT] {
    let mut steps = block.steps;
    if steps.iter().all(|s| *s == 0) {
        steps[Axis::X.index()] = block.step_event_count;
    }
    let mut out = [0i64; AXIS_COUNT];
    for axis in Axis::ALL {
        let n = i64::from(steps[axis.index()]);
        out[axis.index()] = if block.direction_bits & axis.bit() != 0 { n } else { -n };
    }
    out
}

fn plan_from_signed(signed: [i64; AXIS_COUNT]) -> Option<StepPlan> {
    let mut plan = StepPlan::default();
    for axis in Axis::ALL {
        let v = signed[axis.index()];
        plan.steps[axis.index()] = u32::try_from(v.unsigned_abs()).ok()?;
        if v > 0 {
            plan.direction_bits |= axis.bit();
        }
    }
    Some(plan)
}

/// One motor per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cartesian {
    pub steps_per_mm: [f64; AXIS_COUNT],
    pub max_segment_len: Option<f64>,
}

impl Cartesian {
    pub fn new(steps_per_mm: f64) -> Self {
        Self {
            steps_per_mm: [steps_per_mm; AXIS_COUNT],
            max_segment_len: None,
        }
    }
}

impl Default for Cartesian {
    fn default() -> Self {
        Self::new(80.0)
    }
}

impl Kinematics for Cartesian {
    fn cart_to_steps(&self, cart: [f64; AXIS_COUNT]) -> [i32; AXIS_COUNT] {
        let mut out = [0; AXIS_COUNT];
        for i in 0..AXIS_COUNT {
            out[i] = (cart[i] * self.steps_per_mm[i]).round() as i32;
        }
        out
    }

    fn steps_to_cart(&self, steps: [i32; AXIS_COUNT]) -> [f64; AXIS_COUNT] {
        let mut out = [0.0; AXIS_COUNT];
        for i in 0..AXIS_COUNT {
            out[i] = f64::from(steps[i]) / self.steps_per_mm[i];
        }
        out
    }

    fn block_steps(&self, block: &PlannerBlock) -> Option<StepPlan> {
        plan_from_signed(signed_cart_steps(block))
    }

    fn validate_homing_axes(&self, axis_mask: u8) -> bool {
        axis_mask != 0 && axis_mask & !ALL_AXES_MASK == 0
    }

    fn max_segment_len(&self) -> Option<f64> {
        self.max_segment_len
    }
}

/// CoreXY belt layout: motor A = X + Y, motor B = X - Y, Z direct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreXy {
    /// Cartesian steps per mm for the XY pair and for Z.
    pub xy_steps_per_mm: f64,
    pub z_steps_per_mm: f64,
    pub max_segment_len: Option<f64>,
}

impl CoreXy {
    pub fn new(xy_steps_per_mm: f64, z_steps_per_mm: f64) -> Self {
        Self {
            xy_steps_per_mm,
            z_steps_per_mm,
            max_segment_len: Some(1.0),
        }
    }
}

impl Kinematics for CoreXy {
    fn cart_to_steps(&self, cart: [f64; AXIS_COUNT]) -> [i32; AXIS_COUNT] {
        let x = cart[0] * self.xy_steps_per_mm;
        let y = cart[1] * self.xy_steps_per_mm;
        [
            (x + y).round() as i32,
            (x - y).round() as i32,
            (cart[2] * self.z_steps_per_mm).round() as i32,
        ]
    }

    fn steps_to_cart(&self, steps: [i32; AXIS_COUNT]) -> [f64; AXIS_COUNT] {
        let a = f64::from(steps[0]);
        let b = f64::from(steps[1]);
        [
            (a + b) * 0.5 / self.xy_steps_per_mm,
            (a - b) * 0.5 / self.xy_steps_per_mm,
            f64::from(steps[2]) / self.z_steps_per_mm,
        ]
    }

    fn block_steps(&self, block: &PlannerBlock) -> Option<StepPlan> {
        let [dx, dy, dz] = signed_cart_steps(block);
        plan_from_signed([dx + dy, dx - dy, dz])
    }

    // X and Y share both belts, so they home together.
    fn validate_homing_axes(&self, axis_mask: u8) -> bool {
        let xy = Axis::X.bit() | Axis::Y.bit();
        let partial_xy = axis_mask & xy != 0 && axis_mask & xy != xy;
        axis_mask != 0 && axis_mask & !ALL_AXES_MASK == 0 && !partial_xy
    }

    fn max_segment_len(&self) -> Option<f64> {
        self.max_segment_len
    }
}
