// Junction-speed look-ahead over the unfrozen tail of the move queue.
//
// Runs once per newly-built segment, before that segment becomes visible
// to the stepper: pick the replanning window, bound the junction with the
// predecessor by the jerk limits, raise speeds backward, then lower them
// forward to what acceleration can actually deliver, and finally refresh
// the trapezoid coefficients under a flying block.

use crate::config::Machine;
use crate::move_queue::{CACHE_SIZE, MoveQueue};
use crate::segment::{E_AXIS, MotionSegment, X_AXIS, Y_AXIS, Z_AXIS};

/// Planning-time budget: segments closer to execution than this many
/// ticks stay untouched so the stepper never runs dry mid-replan.
const PLANNER_HORIZON_TICKS: u64 = 4500 * CACHE_SIZE as u64;

/// Replan junction speeds after the segment at `new_index` was built.
///
/// `new_index` is the staged write slot; it is committed by the caller
/// after this returns.
pub fn update_trapezoids(queue: &MoveQueue, new_index: usize, machine: &Machine) {
    let first = select_window(queue, new_index);

    let previous_index = MoveQueue::prev_index(new_index);
    if queue.is_empty() || queue.segment(previous_index).flags.is_warmup() {
        queue.segment_mut(new_index).flags.set_start_fixed(true);
    } else {
        let (previous, current) = queue.pair_mut(previous_index, new_index);
        compute_max_junction_speed(machine, previous, current);
    }

    backward_pass(queue, new_index, first, machine);
    forward_pass(queue, first, new_index, machine);

    // Materialise, re-blocking the next slot before releasing the
    // previous one so the stepper never sees a segment mid-update.
    let mut index = first;
    while index != new_index {
        queue.segment_mut(index).update_step_params();
        let next = MoveQueue::next_index(index);
        queue.block(next);
        queue.unblock(index);
        index = next;
    }
    queue.segment_mut(new_index).update_step_params();
    queue.unblock(new_index);
}

/// Pick the oldest segment this replan may touch and block it.
///
/// The scan walks from the stepper's head, skipping segments whose
/// accumulated runtime still fits the planning budget, then walks back
/// from the new segment to the newest slot with a fixed end speed. No
/// interrupt masking: the scan simply retries when the consumer advanced
/// meanwhile.
fn select_window(queue: &MoveQueue, new_index: usize) -> usize {
    loop {
        let head = queue.head_index();
        let mut max_first = head;
        if max_first != new_index {
            max_first = MoveQueue::next_index(max_first);
        }
        let mut time_left = 0u64;
        while max_first != new_index {
            time_left += queue.segment(max_first).time_in_ticks;
            if time_left >= PLANNER_HORIZON_TICKS {
                break;
            }
            max_first = MoveQueue::next_index(max_first);
        }
        let mut first = new_index;
        while first != max_first && !queue.segment(first).flags.end_fixed() {
            first = MoveQueue::prev_index(first);
        }
        if first != new_index && queue.segment(first).flags.end_fixed() {
            first = MoveQueue::next_index(first);
        }
        queue.block(first);
        if queue.head_index() == head {
            return first;
        }
        // The stepper moved under the scan; release and retry.
        queue.unblock(first);
    }
}

/// Highest speed the junction between two segments may be crossed at.
fn compute_max_junction_speed(
    machine: &Machine,
    previous: &mut MotionSegment,
    current: &mut MotionSegment,
) {
    if previous.flags.is_warmup() {
        current.flags.set_start_fixed(true);
        return;
    }
    if machine.extruder.advance_enabled
        && previous.dir.has(E_AXIS) != current.dir.has(E_AXIS)
        && (previous.moving.any_xy() || current.moving.any_xy())
    {
        // The advance integral cannot survive an extruder reversal;
        // drop the junction to the slower side and freeze it.
        let junction = previous.end_speed.min(current.start_speed);
        previous.max_junction_speed = junction;
        previous.end_speed = junction;
        current.start_speed = junction;
        previous.flags.set_end_fixed(true);
        current.flags.set_start_fixed(true);
        previous.flags.set_params_ready(false);
        current.flags.set_params_ready(false);
        return;
    }
    if machine.kinematics.is_delta() && previous.move_id == current.move_id {
        // Sibling pieces of one split move join colinearly.
        previous.max_junction_speed = previous.full_speed.min(current.full_speed);
        return;
    }
    let dx = current.speed[X_AXIS] - previous.speed[X_AXIS];
    let dy = current.speed[Y_AXIS] - previous.speed[Y_AXIS];
    let jerk = if machine.kinematics.is_delta() {
        let dz = current.speed[Z_AXIS] - previous.speed[Z_AXIS];
        (dx * dx + dy * dy + dz * dz).sqrt()
    } else {
        (dx * dx + dy * dy).sqrt()
    };
    let mut factor = 1.0f64;
    if jerk > machine.max_jerk {
        factor = machine.max_jerk / jerk;
    }
    if !machine.kinematics.is_delta()
        && (previous.moving.has(Z_AXIS) || current.moving.has(Z_AXIS))
    {
        let dz = (current.speed[Z_AXIS] - previous.speed[Z_AXIS]).abs();
        if dz > machine.max_z_jerk {
            factor = factor.min(machine.max_z_jerk / dz);
        }
    }
    let e_jerk = (current.speed[E_AXIS] - previous.speed[E_AXIS]).abs();
    if e_jerk > machine.extruder.max_start_feedrate {
        factor = factor.min(machine.extruder.max_start_feedrate / e_jerk);
    }
    previous.max_junction_speed = (previous.full_speed * factor).min(current.full_speed);
}

/// Raise end speeds from the new segment toward `first`, bounded by each
/// junction and by what deceleration across a segment can shed.
fn backward_pass(queue: &MoveQueue, start: usize, last: usize, machine: &Machine) {
    if start == last {
        return;
    }
    let mut index = start;
    let mut active = start;
    let mut last_junction_speed = queue.segment(active).end_speed;
    while index != last {
        index = MoveQueue::prev_index(index);
        let (previous, current) = queue.pair_mut(index, active);
        if machine.kinematics.is_delta()
            && previous.move_id == current.move_id
            && last_junction_speed == previous.max_junction_speed
        {
            // Cruising inside a split move; carry the speed across.
            current.start_speed = last_junction_speed;
            previous.end_speed = last_junction_speed;
            previous.flags.set_params_ready(false);
            current.flags.set_params_ready(false);
        }
        if previous.is_pure_extruder_move() != current.is_pure_extruder_move() {
            // Crossing between travel and retract: keep both sides at
            // their safe speeds so the extruder never blocks.
            previous.flags.set_end_fixed(true);
            current.flags.set_start_fixed(true);
            return;
        }
        if previous.flags.end_fixed() {
            current.flags.set_start_fixed(true);
            return;
        }
        last_junction_speed = if current.flags.is_nominal() {
            current.full_speed
        } else {
            // Speed reachable when decelerating backward across the
            // segment; acceleration stores 2*a*d.
            (last_junction_speed * last_junction_speed + current.acceleration).sqrt()
        };
        if last_junction_speed >= previous.max_junction_speed {
            if previous.end_speed != previous.max_junction_speed {
                previous.flags.set_params_ready(false);
                previous.end_speed = previous.max_junction_speed;
            }
            if current.start_speed != previous.max_junction_speed {
                current.start_speed = previous.max_junction_speed;
                current.flags.set_params_ready(false);
            }
            last_junction_speed = previous.max_junction_speed;
        } else {
            current.start_speed = last_junction_speed;
            previous.end_speed = last_junction_speed;
            previous.flags.set_params_ready(false);
            current.flags.set_params_ready(false);
        }
        active = index;
    }
}

/// Lower speeds from `first` forward to what acceleration can reach,
/// freezing junctions that cannot improve any further.
fn forward_pass(queue: &MoveQueue, first: usize, write: usize, machine: &Machine) {
    if first == write {
        return;
    }
    let mut index = first;
    let mut left_speed = queue.segment(first).start_speed;
    while index != write {
        let active = index;
        index = MoveQueue::next_index(index);
        let (current, next) = queue.pair_mut(active, index);
        if current.flags.end_fixed() {
            left_speed = current.end_speed;
            continue;
        }
        if machine.kinematics.is_delta()
            && current.move_id == next.move_id
            && current.end_speed == current.max_junction_speed
        {
            current.start_speed = left_speed;
            left_speed = current.end_speed;
            current.flags.set_end_fixed(true);
            next.flags.set_start_fixed(true);
            continue;
        }
        let vmax_right = if current.flags.is_nominal() {
            current.full_speed
        } else {
            (left_speed * left_speed + current.acceleration).sqrt()
        };
        if vmax_right > current.end_speed {
            current.start_speed = left_speed;
            left_speed = current.end_speed;
            if current.end_speed == current.max_junction_speed {
                // Already at the junction bound; never worth revisiting.
                current.flags.set_end_fixed(true);
                next.flags.set_start_fixed(true);
            }
            current.flags.set_params_ready(false);
        } else {
            // The whole segment accelerates; that is as fast as this
            // junction will ever get.
            current.flags.set_start_fixed(true);
            current.flags.set_end_fixed(true);
            current.flags.set_params_ready(false);
            current.start_speed = left_speed;
            current.end_speed = vmax_right;
            next.start_speed = vmax_right;
            next.flags.set_start_fixed(true);
            left_speed = vmax_right;
        }
    }
    queue.segment_mut(write).start_speed = left_speed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn machine() -> Machine {
        Machine::new(&MachineConfig {
            steps_per_mm: [80.0, 80.0, 80.0, 80.0],
            max_feedrate: [200.0, 200.0, 100.0, 100.0],
            max_jerk: 20.0,
            ..MachineConfig::default()
        })
        .unwrap()
    }

    fn segment(speed_x: f64, speed_y: f64, full_speed: f64) -> MotionSegment {
        let mut seg = MotionSegment::default();
        seg.speed[X_AXIS] = speed_x;
        seg.speed[Y_AXIS] = speed_y;
        seg.full_speed = full_speed;
        seg.start_speed = 10.0;
        seg.end_speed = 10.0;
        if speed_x != 0.0 {
            seg.moving.set(X_AXIS);
        }
        if speed_y != 0.0 {
            seg.moving.set(Y_AXIS);
        }
        seg
    }

    #[test]
    fn right_angle_junction_is_jerk_limited() {
        let machine = machine();
        let mut previous = segment(60.0, 0.0, 60.0);
        let mut current = segment(0.0, 60.0, 60.0);
        compute_max_junction_speed(&machine, &mut previous, &mut current);
        // |dv| = 60 * sqrt(2) = 84.85, factor = 20 / 84.85.
        assert!(
            (previous.max_junction_speed - 60.0 * (20.0 / (60.0 * 2f64.sqrt()))).abs() < 1e-9,
            "{}",
            previous.max_junction_speed
        );
        assert!((previous.max_junction_speed - 14.142).abs() < 0.01);
    }

    #[test]
    fn colinear_junction_keeps_full_speed() {
        let machine = machine();
        let mut previous = segment(60.0, 0.0, 60.0);
        let mut current = segment(60.0, 0.0, 60.0);
        compute_max_junction_speed(&machine, &mut previous, &mut current);
        assert_eq!(previous.max_junction_speed, 60.0);
    }

    #[test]
    fn junction_is_capped_by_the_slower_segment() {
        let machine = machine();
        let mut previous = segment(60.0, 0.0, 60.0);
        let mut current = segment(30.0, 0.0, 30.0);
        compute_max_junction_speed(&machine, &mut previous, &mut current);
        assert_eq!(previous.max_junction_speed, 30.0);
    }

    #[test]
    fn warmup_predecessor_fixes_the_start() {
        let machine = machine();
        let mut previous = MotionSegment::default();
        previous.flags.set_warmup();
        let mut current = segment(60.0, 0.0, 60.0);
        compute_max_junction_speed(&machine, &mut previous, &mut current);
        assert!(current.flags.start_fixed());
        assert_eq!(previous.max_junction_speed, 0.0);
    }

    #[test]
    fn z_jerk_tightens_the_factor() {
        let machine = machine();
        let mut previous = segment(10.0, 0.0, 10.0);
        previous.moving.set(Z_AXIS);
        previous.speed[Z_AXIS] = 1.0;
        let mut current = segment(10.0, 0.0, 10.0);
        compute_max_junction_speed(&machine, &mut previous, &mut current);
        // dz = 1.0 > max_z_jerk (0.3) scales by 0.3.
        assert!((previous.max_junction_speed - 3.0).abs() < 1e-9);
    }
}
