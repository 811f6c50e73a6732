// Arc expansion: approximate circular arcs by short chords fed through
// the normal planning pipeline.

use crate::move_queue::Ambient;
use crate::planner::{MotionPlanner, PlanError};
use crate::segment::{E_AXIS, X_AXIS, Y_AXIS, Z_AXIS};

/// Chord length for arc approximation, in mm.
pub const MM_PER_ARC_SEGMENT: f64 = 1.0;

/// Longer chords used when the feedrate would outrun the planner.
pub const MM_PER_ARC_SEGMENT_BIG: f64 = 3.0;

/// Chords between exact recomputations of the radius vector. The
/// incremental small-angle rotation drifts slowly; 25 pieces keep the
/// error far below a step.
pub const N_ARC_CORRECTION: usize = 25;

impl<'m, A: Ambient> MotionPlanner<'m, A> {
    /// Expand a circular arc from `position` to `target` (both mm, in
    /// the xy plane) around `position + offset`, and queue the chords.
    ///
    /// The extruder interpolates linearly to `e_target` steps; z is held.
    /// Endstops are always honoured on arcs.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_arc(
        &mut self,
        position: [f64; 2],
        target: [f64; 2],
        offset: [f64; 2],
        e_target: i32,
        radius: f64,
        clockwise: bool,
        feedrate: f64,
    ) -> Result<(), PlanError> {
        let center = [position[0] + offset[0], position[1] + offset[1]];
        let extruder_travel = (e_target - self.position()[E_AXIS]) as f64;
        // Radius vector from the center to the current position, rotated
        // chord by chord.
        let mut r_axis = [-offset[0], -offset[1]];
        let rt_axis = [target[0] - center[0], target[1] - center[1]];

        let mut angular_travel = (r_axis[0] * rt_axis[1] - r_axis[1] * rt_axis[0])
            .atan2(r_axis[0] * rt_axis[0] + r_axis[1] * rt_axis[1]);
        if angular_travel < 0.0 {
            angular_travel += 2.0 * std::f64::consts::PI;
        }
        if clockwise {
            angular_travel -= 2.0 * std::f64::consts::PI;
        }

        let travel_mm = angular_travel.abs() * radius;
        if travel_mm < 0.001 {
            return Ok(());
        }
        // Stretch the chord length if the feedrate would generate chords
        // faster than they can be planned.
        let chord = if feedrate > 60.0 {
            MM_PER_ARC_SEGMENT_BIG.min(feedrate * 0.01666 * MM_PER_ARC_SEGMENT)
        } else {
            MM_PER_ARC_SEGMENT
        };
        let segments = ((travel_mm / chord).floor() as u32).max(1);

        let theta_per_segment = angular_travel / segments as f64;
        let extruder_per_segment = extruder_travel / segments as f64;
        // Small-angle rotation matrix for one chord.
        let cos_t = 1.0 - 0.5 * theta_per_segment * theta_per_segment;
        let sin_t = theta_per_segment;

        let z_steps = self.position()[Z_AXIS];
        let mut arc_e = self.position()[E_AXIS] as f64;
        let mut correction_count = 0usize;
        for i in 1..segments {
            if i % 4 == 0 {
                self.ambient_mut().serve_ambient();
            }
            if correction_count < N_ARC_CORRECTION {
                let r_new = r_axis[0] * sin_t + r_axis[1] * cos_t;
                r_axis[0] = r_axis[0] * cos_t - r_axis[1] * sin_t;
                r_axis[1] = r_new;
                correction_count += 1;
            } else {
                // Undo accumulated drift with an exact rotation from the
                // initial radius vector.
                let cos_ti = (i as f64 * theta_per_segment).cos();
                let sin_ti = (i as f64 * theta_per_segment).sin();
                r_axis[0] = -offset[0] * cos_ti + offset[1] * sin_ti;
                r_axis[1] = -offset[0] * sin_ti - offset[1] * cos_ti;
                correction_count = 0;
            }
            arc_e += extruder_per_segment;
            let chord_target = [
                ((center[0] + r_axis[0]) * self.machine().steps_per_mm[X_AXIS]) as i32,
                ((center[1] + r_axis[1]) * self.machine().steps_per_mm[Y_AXIS]) as i32,
                z_steps,
                arc_e as i32,
            ];
            self.plan_move(chord_target, feedrate, true, true)?;
        }
        // Land the final chord exactly on the commanded target.
        let final_target = [
            (target[0] * self.machine().steps_per_mm[X_AXIS]) as i32,
            (target[1] * self.machine().steps_per_mm[Y_AXIS]) as i32,
            z_steps,
            e_target,
        ];
        self.plan_move(final_target, feedrate, true, true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{Machine, MachineConfig};
    use crate::move_queue::MoveQueue;
    use crate::sub_segment::SubSegmentRing;

    struct Drain {
        queue: Arc<MoveQueue>,
        popped: usize,
    }

    impl Ambient for Drain {
        fn serve_ambient(&mut self) {
            if !self.queue.is_empty() {
                self.queue.pop_head();
                self.popped += 1;
            }
        }
    }

    fn machine() -> Machine {
        Machine::new(&MachineConfig {
            steps_per_mm: [80.0, 80.0, 80.0, 80.0],
            max_feedrate: [200.0, 200.0, 100.0, 100.0],
            ..MachineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn quarter_circle_lands_on_target() {
        let machine = machine();
        let queue = Arc::new(MoveQueue::new());
        let subs = Arc::new(SubSegmentRing::new());
        let ambient = Drain {
            queue: queue.clone(),
            popped: 0,
        };
        let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ambient);
        planner.set_position([800, 0, 0, 0]); // (10, 0) mm
        // Quarter circle to (0, 10) around the origin, radius 10.
        planner
            .plan_arc(
                [10.0, 0.0],
                [0.0, 10.0],
                [-10.0, 0.0],
                0,
                10.0,
                false,
                30.0,
            )
            .unwrap();
        assert_eq!(planner.position()[X_AXIS], 0);
        assert_eq!(planner.position()[Y_AXIS], 800);
        // Arc length 15.7 mm at 1 mm chords, plus the warmup dummies.
        let total = queue.len() + planner.ambient_mut().popped;
        assert!(total >= 14, "only {total} chords");
    }

    #[test]
    fn tiny_arc_is_dropped() {
        let machine = machine();
        let queue = Arc::new(MoveQueue::new());
        let subs = Arc::new(SubSegmentRing::new());
        let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ());
        planner
            .plan_arc(
                [0.0, 0.0],
                [0.0, 0.0],
                [-0.00001, 0.0],
                0,
                0.00001,
                false,
                30.0,
            )
            .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn fast_arcs_use_longer_chords() {
        let machine = machine();
        let queue = Arc::new(MoveQueue::new());
        let subs = Arc::new(SubSegmentRing::new());
        let ambient = Drain {
            queue: queue.clone(),
            popped: 0,
        };
        let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ambient);
        planner.set_position([800, 0, 0, 0]);
        planner
            .plan_arc(
                [10.0, 0.0],
                [0.0, 10.0],
                [-10.0, 0.0],
                0,
                10.0,
                false,
                120.0,
            )
            .unwrap();
        // 15.7 mm of travel at 2 mm chords: far fewer segments.
        let planned = queue.len() + planner.ambient_mut().popped;
        assert!(planned <= 10, "{planned} chords");
        assert_eq!(planner.position()[Y_AXIS], 800);
    }
}
