//! Planner blocks and the fixed-capacity queue that owns them.
//!
//! A block is the unit of motion handed from the interpreter side to the
//! stepper. There is no look-ahead solver: speeds are whatever the producer
//! put in, checked against the invariants in [`PlannerBlock::check`].

use heapless::Deque;
use serde::Serialize;
use thiserror::Error;

use crate::config::{AXIS_COUNT, DEFAULT_ACCELERATION, PLANNER_QUEUE_DEPTH};
use crate::hal::Axis;
use crate::kinematics::Kinematics;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PlannerBlock {
    /// mm/min
    pub entry_speed: f64,
    pub nominal_speed: f64,
    pub exit_speed: f64,
    /// mm/min^2
    pub acceleration: f64,
    pub max_entry_speed: f64,
    pub millimeters: f64,
    /// Bit n set means axis n moves in the positive direction.
    pub direction_bits: u8,
    pub step_event_count: u32,
    /// Per-axis step magnitudes in Cartesian space. All zero means the
    /// kinematics decides how `step_event_count` is distributed.
    pub steps: [u32; AXIS_COUNT],
    pub recalculate: bool,
    pub nominal_length: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockViolation {
    #[error("entry speed is negative")]
    NegativeEntrySpeed,
    #[error("nominal speed is negative")]
    NegativeNominalSpeed,
    #[error("exit speed is negative")]
    NegativeExitSpeed,
    #[error("acceleration is negative")]
    NegativeAcceleration,
    #[error("max entry speed is negative")]
    NegativeMaxEntrySpeed,
    #[error("distance is negative")]
    NegativeDistance,
    #[error("entry speed exceeds max entry speed")]
    EntryAboveMaxEntry,
    #[error("entry speed exceeds nominal speed")]
    EntryAboveNominal,
    #[error("exit speed exceeds nominal speed")]
    ExitAboveNominal,
    #[error("block field is not a finite number")]
    NotFinite,
}

impl PlannerBlock {
    /// Zero every field: the complete-stop block.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Checks all invariants without touching the block.
    pub fn check(&self) -> Result<(), BlockViolation> {
        let fields = [
            self.entry_speed,
            self.nominal_speed,
            self.exit_speed,
            self.acceleration,
            self.max_entry_speed,
            self.millimeters,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(BlockViolation::NotFinite);
        }
        if self.entry_speed < 0.0 {
            return Err(BlockViolation::NegativeEntrySpeed);
        }
        if self.nominal_speed < 0.0 {
            return Err(BlockViolation::NegativeNominalSpeed);
        }
        if self.exit_speed < 0.0 {
            return Err(BlockViolation::NegativeExitSpeed);
        }
        if self.acceleration < 0.0 {
            return Err(BlockViolation::NegativeAcceleration);
        }
        if self.max_entry_speed < 0.0 {
            return Err(BlockViolation::NegativeMaxEntrySpeed);
        }
        if self.millimeters < 0.0 {
            return Err(BlockViolation::NegativeDistance);
        }
        if self.max_entry_speed > 0.0 && self.entry_speed > self.max_entry_speed {
            return Err(BlockViolation::EntryAboveMaxEntry);
        }
        if self.nominal_speed > 0.0 {
            if self.entry_speed > self.nominal_speed {
                return Err(BlockViolation::EntryAboveNominal);
            }
            if self.exit_speed > self.nominal_speed {
                return Err(BlockViolation::ExitAboveNominal);
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Constant-speed block for a straight segment in the XY plane.
    pub fn for_move<K: Kinematics + ?Sized>(
        kin: &K,
        from: (f64, f64),
        to: (f64, f64),
        speed_mm_min: f64,
    ) -> Self {
        let a = kin.cart_to_steps([from.0, from.1, 0.0]);
        let b = kin.cart_to_steps([to.0, to.1, 0.0]);

        let mut steps = [0u32; AXIS_COUNT];
        let mut direction_bits = 0u8;
        for axis in Axis::ALL {
            // saturated step counts can be a full i32 range apart
            let delta = i64::from(b[axis.index()]) - i64::from(a[axis.index()]);
            steps[axis.index()] = u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX);
            if delta > 0 {
                direction_bits |= axis.bit();
            }
        }

        let speed = if speed_mm_min.is_finite() { speed_mm_min.max(0.0) } else { 0.0 };
        Self {
            entry_speed: speed,
            nominal_speed: speed,
            exit_speed: speed,
            acceleration: DEFAULT_ACCELERATION,
            max_entry_speed: speed,
            millimeters: (to.0 - from.0).hypot(to.1 - from.1),
            direction_bits,
            step_event_count: steps.iter().copied().max().unwrap_or(0),
            steps,
            recalculate: false,
            nominal_length: true,
        }
    }
}

/// Null-aware validator: a missing block is never valid.
pub fn validate(block: Option<&PlannerBlock>) -> bool {
    block.is_some_and(PlannerBlock::is_valid)
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("planner queue is full")]
pub struct QueueFull(pub PlannerBlock);

/// FIFO of owned blocks. Blocks leave by value, so a block is never shared
/// between the queue and the stepper.
#[derive(Debug)]
pub struct PlannerQueue {
    blocks: Deque<PlannerBlock, PLANNER_QUEUE_DEPTH>,
    depth: usize,
}

impl Default for PlannerQueue {
    fn default() -> Self {
        Self::with_depth(PLANNER_QUEUE_DEPTH)
    }
}

impl PlannerQueue {
    /// `depth` is clamped to `1..=PLANNER_QUEUE_DEPTH`.
    pub fn with_depth(depth: usize) -> Self {
        Self {
            blocks: Deque::new(),
            depth: depth.clamp(1, PLANNER_QUEUE_DEPTH),
        }
    }

    pub fn push(&mut self, block: PlannerBlock) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull(block));
        }
        self.blocks.push_back(block).map_err(QueueFull)
    }

    pub fn pop(&mut self) -> Option<PlannerBlock> {
        self.blocks.pop_front()
    }

    pub fn peek(&self) -> Option<&PlannerBlock> {
        self.blocks.front()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.depth
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::Cartesian;

    fn valid_block() -> PlannerBlock {
        PlannerBlock {
            entry_speed: 100.0,
            nominal_speed: 200.0,
            exit_speed: 50.0,
            acceleration: 500.0,
            max_entry_speed: 150.0,
            millimeters: 10.0,
            step_event_count: 1000,
            ..PlannerBlock::default()
        }
    }

    #[test]
    fn zeroed_block_is_a_valid_stop_block() {
        let mut block = valid_block();
        block.direction_bits = 0b11;
        block.recalculate = true;
        block.reset();
        assert_eq!(block, PlannerBlock::default());
        assert!(block.is_valid());
        assert!(validate(Some(&block)));
    }

    #[test]
    fn move_across_the_whole_step_range_saturates() {
        let block = PlannerBlock::for_move(&Cartesian::default(), (-3e7, 0.0), (3e7, 0.0), 600.0);
        assert_eq!(block.steps, [u32::MAX, 0, 0]);
        assert_eq!(block.step_event_count, u32::MAX);
        assert_eq!(block.direction_bits, Axis::X.bit());

        let back = PlannerBlock::for_move(&Cartesian::default(), (3e7, 0.0), (-3e7, 0.0), 600.0);
        assert_eq!(back.steps[0], u32::MAX);
        assert_eq!(back.direction_bits, 0);
    }

    #[test]
    fn missing_block_is_rejected() {
        assert!(!validate(None));
    }

    #[test]
    fn each_invariant_is_enforced() {
        let cases: [(fn(&mut PlannerBlock), BlockViolation); 9] = [
            (|b| b.entry_speed = -1.0, BlockViolation::NegativeEntrySpeed),
            (|b| b.nominal_speed = -1.0, BlockViolation::NegativeNominalSpeed),
            (|b| b.exit_speed = -1.0, BlockViolation::NegativeExitSpeed),
            (|b| b.acceleration = -1.0, BlockViolation::NegativeAcceleration),
            (|b| b.max_entry_speed = -1.0, BlockViolation::NegativeMaxEntrySpeed),
            (|b| b.millimeters = -0.1, BlockViolation::NegativeDistance),
            (|b| b.entry_speed = 151.0, BlockViolation::EntryAboveMaxEntry),
            (
                |b| {
                    b.max_entry_speed = 0.0;
                    b.entry_speed = 250.0;
                },
                BlockViolation::EntryAboveNominal,
            ),
            (|b| b.exit_speed = 201.0, BlockViolation::ExitAboveNominal),
        ];
        for (mutate, expected) in cases {
            let mut block = valid_block();
            mutate(&mut block);
            let before = block;
            assert_eq!(block.check(), Err(expected));
            assert_eq!(block, before, "check must not mutate");
        }
    }

    #[test]
    fn limits_only_apply_when_set() {
        let block = PlannerBlock {
            entry_speed: 500.0,
            exit_speed: 900.0,
            ..PlannerBlock::default()
        };
        assert!(block.is_valid());
    }

    #[test]
    fn nan_fields_are_rejected() {
        let block = PlannerBlock { millimeters: f64::NAN, ..valid_block() };
        assert_eq!(block.check(), Err(BlockViolation::NotFinite));
    }

    #[test]
    fn queue_keeps_oldest_when_full() {
        let mut q = PlannerQueue::with_depth(2);
        let mut first = valid_block();
        first.step_event_count = 1;
        let mut second = valid_block();
        second.step_event_count = 2;
        q.push(first).unwrap();
        q.push(second).unwrap();
        assert!(q.is_full());
        assert!(q.push(valid_block()).is_err());
        assert_eq!(q.pop().map(|b| b.step_event_count), Some(1));
        assert_eq!(q.peek().map(|b| b.step_event_count), Some(2));
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn depth_is_clamped() {
        assert_eq!(PlannerQueue::with_depth(0).depth(), 1);
        assert_eq!(PlannerQueue::with_depth(1_000).depth(), PLANNER_QUEUE_DEPTH);
    }

    #[test]
    fn move_block_counts_steps_and_directions() {
        let kin = Cartesian::new(10.0);
        let block = PlannerBlock::for_move(&kin, (5.0, 5.0), (2.0, 9.0), 600.0);
        assert_eq!(block.steps, [30, 40, 0]);
        assert_eq!(block.step_event_count, 40);
        assert_eq!(block.direction_bits, Axis::Y.bit());
        assert!((block.millimeters - 5.0).abs() < 1e-9);
        assert!(block.is_valid());
    }
}
