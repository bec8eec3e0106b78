//! Handoff between the supervisor context and the step-generation context.
//!
//! On hardware the step side runs from a timer interrupt and the supervisor
//! from the main loop. The only shared state is a one-slot block exchange and
//! a few request flags, so either side can be driven independently. The
//! supervisor writes a block into the slot only while it is empty; the step
//! side takes it out and from then on is the sole owner of the block and the
//! motor position.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::config::{AXIS_COUNT, StepperConfig};
use crate::hal::StepperHal;
use crate::kinematics::Kinematics;
use crate::planner::PlannerBlock;
use crate::stepper::{Stepper, StepperState};

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Option<PlannerBlock>>,
    hold: AtomicBool,
    abort: AtomicBool,
    motors_off: AtomicBool,
    zero: AtomicBool,
    busy: AtomicBool,
    rejected: AtomicU32,
}

/// Supervisor half of the handoff.
#[derive(Debug, Clone)]
pub struct BlockSender {
    shared: Arc<Shared>,
}

/// Step-side half of the handoff.
#[derive(Debug)]
pub struct BlockReceiver {
    shared: Arc<Shared>,
}

pub fn channel() -> (BlockSender, BlockReceiver) {
    let shared = Arc::new(Shared::default());
    (
        BlockSender {
            shared: Arc::clone(&shared),
        },
        BlockReceiver { shared },
    )
}

impl BlockSender {
    /// Hand a block over. Gives it back if the previous one was not taken yet.
    pub fn try_send(&self, block: PlannerBlock) -> Result<(), PlannerBlock> {
        let mut slot = self.shared.slot.lock();
        if slot.is_some() {
            return Err(block);
        }
        *slot = Some(block);
        self.shared.busy.store(true, Ordering::Release);
        Ok(())
    }

    pub fn slot_free(&self) -> bool {
        self.shared.slot.lock().is_none()
    }

    /// Level-triggered: motion stays held while set.
    pub fn set_hold(&self, hold: bool) {
        self.shared.hold.store(hold, Ordering::Release);
    }

    /// Stop the current block and drop any block waiting in the slot.
    pub fn abort(&self) {
        self.shared.slot.lock().take();
        self.shared.abort.store(true, Ordering::Release);
    }

    pub fn motors_off(&self) {
        self.shared.motors_off.store(true, Ordering::Release);
    }

    /// Make the current motor position the origin.
    pub fn zero_position(&self) {
        self.shared.zero.store(true, Ordering::Release);
    }

    /// Blocks the step side refused to load since the last call.
    pub fn take_rejected(&self) -> u32 {
        self.shared.rejected.swap(0, Ordering::AcqRel)
    }

    /// True while a block is waiting or being stepped, or a request is pending.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
            || self.shared.abort.load(Ordering::Acquire)
            || !self.slot_free()
    }
}

impl BlockReceiver {
    fn take(&self) -> Option<PlannerBlock> {
        self.shared.slot.lock().take()
    }
}

/// Owns everything the step context touches.
#[derive(Debug)]
pub struct StepTask<H, K> {
    hal: H,
    stepper: Stepper<K>,
    rx: BlockReceiver,
}

impl<H: StepperHal, K: Kinematics> StepTask<H, K> {
    pub fn new(hal: H, config: StepperConfig, kinematics: K, rx: BlockReceiver) -> Self {
        Self {
            hal,
            stepper: Stepper::new(config, kinematics),
            rx,
        }
    }

    /// One tick of the step context.
    pub fn service(&mut self) {
        let shared = &self.rx.shared;

        if shared.abort.swap(false, Ordering::AcqRel) {
            self.stepper.stop();
        }
        if shared.motors_off.swap(false, Ordering::AcqRel) {
            self.stepper.enable_motors(&mut self.hal, false);
        }

        let hold = shared.hold.load(Ordering::Acquire);
        match (hold, self.stepper.state()) {
            (true, StepperState::Running) => self.stepper.hold(),
            (false, StepperState::Hold) => self.stepper.resume(&mut self.hal),
            _ => {}
        }

        self.stepper.update(&mut self.hal);

        if self.stepper.is_idle() && shared.zero.swap(false, Ordering::AcqRel) {
            self.stepper.set_position([0; AXIS_COUNT]);
        }

        if self.stepper.is_idle() && !hold {
            if let Some(block) = self.rx.take() {
                if self.stepper.load(&mut self.hal, block).is_err() {
                    shared.rejected.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        let busy = !self.stepper.is_idle() || self.rx.shared.slot.lock().is_some();
        self.rx.shared.busy.store(busy, Ordering::Release);
    }

    pub fn stepper(&self) -> &Stepper<K> {
        &self.stepper
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }
}
