//! Look-ahead motion planning core for multi-axis positioning systems.
//!
//! Turns a stream of target positions into a bounded queue of fully
//! parameterised trapezoidal motion segments that a step-generating
//! interrupt can execute without further floating-point work. Transport
//! and MCU concerns are deliberately kept out of this crate.

pub mod arc;
pub mod config;
pub mod fixed;
pub mod kinematics;
pub mod lookahead;
pub mod move_queue;
pub mod planner;
pub mod segment;
pub mod sub_segment;

pub use config::{Machine, MachineConfig};
pub use move_queue::{Ambient, CACHE_SIZE, MoveQueue};
pub use planner::{MotionPlanner, PlanError};
pub use segment::MotionSegment;
pub use sub_segment::{SUB_CACHE_SIZE, SubSegmentRing};
