//! Motion core for a two-axis engraver: serial framing, G-code, arcs,
//! planner blocks, step generation and the supervisor that ties them
//! together. `Machine` wraps it all for the browser simulator.

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

// --- LOGGING ---
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

#[cfg(not(target_arch = "wasm32"))]
fn log(_s: &str) {}

#[cfg(target_arch = "wasm32")]
fn warn(s: &str) {
    web_sys::console::warn_1(&JsValue::from_str(s));
}

#[cfg(not(target_arch = "wasm32"))]
fn warn(_s: &str) {}

macro_rules! console_log {
    ($($t:tt)*) => ($crate::log(&format!($($t)*)))
}

macro_rules! console_warn {
    ($($t:tt)*) => ($crate::warn(&format!($($t)*)))
}

pub mod config;
pub mod error;
pub mod hal;
pub mod kinematics;
pub mod sim;

pub mod arc;
pub mod gcode;
pub mod planner;
pub mod protocol;

pub mod report;
pub mod step_task;
pub mod stepper;
pub mod supervisor;

pub mod machine;

pub use config::{LineDelivery, ProtocolConfig, StepperConfig, SupervisorConfig};
pub use error::GcodeError;
pub use gcode::{GcodeState, Interpreter, MotionSink, MoveKind};
pub use hal::{Axis, Clock, Hal, Inputs, SpindleDirection, StepperHal};
pub use kinematics::{Cartesian, CoreXy, Kinematics};
pub use machine::Machine;
pub use planner::{PlannerBlock, PlannerQueue};
pub use protocol::{Framer, RealtimeCommand};
pub use report::{Alarm, StatusReport, SystemState};
pub use sim::SimHal;
pub use step_task::{BlockReceiver, BlockSender, StepTask, channel};
pub use stepper::{Stepper, StepperState};
pub use supervisor::{LineError, QueueError, Supervisor, assemble};
