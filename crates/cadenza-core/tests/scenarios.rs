// End-to-end planner scenarios and queue-level invariants.

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cadenza_core::config::{DeltaConfig, KinematicsConfig, Machine, MachineConfig};
use cadenza_core::kinematics::Kinematics;
use cadenza_core::lookahead;
use cadenza_core::move_queue::{Ambient, CACHE_SIZE, MoveQueue};
use cadenza_core::planner::{MotionPlanner, PlanError};
use cadenza_core::segment::{MotionSegment, X_AXIS, Y_AXIS};
use cadenza_core::sub_segment::SubSegmentRing;

fn cartesian_config() -> MachineConfig {
    MachineConfig {
        steps_per_mm: [80.0, 80.0, 80.0, 80.0],
        max_feedrate: [200.0, 200.0, 100.0, 100.0],
        acceleration_print: [1000.0, 1000.0, 1000.0, 1000.0],
        acceleration_travel: [1000.0, 1000.0, 1000.0, 1000.0],
        max_jerk: 20.0,
        ..MachineConfig::default()
    }
}

fn delta_config() -> MachineConfig {
    MachineConfig {
        kinematics: KinematicsConfig::Delta(DeltaConfig {
            diagonal_rod: 250.0,
            horizontal_radius: 100.0,
            carriage_travel: 300.0,
            segments_per_second_print: 180.0,
            segments_per_second_travel: 80.0,
        }),
        steps_per_mm: [80.0, 80.0, 80.0, 80.0],
        max_feedrate: [200.0, 200.0, 200.0, 100.0],
        acceleration_print: [1000.0, 1000.0, 1000.0, 1000.0],
        acceleration_travel: [1000.0, 1000.0, 1000.0, 1000.0],
        max_jerk: 20.0,
        ..MachineConfig::default()
    }
}

fn rig() -> (Arc<MoveQueue>, Arc<SubSegmentRing>) {
    (Arc::new(MoveQueue::new()), Arc::new(SubSegmentRing::new()))
}

/// Pops one queued segment per ambient call, standing in for the stepper
/// while the planner is blocked.
struct Drain(Arc<MoveQueue>);

impl Ambient for Drain {
    fn serve_ambient(&mut self) {
        if !self.0.is_empty() {
            self.0.pop_head();
        }
    }
}

#[test]
fn right_angle_corner_limits_the_junction() {
    let machine = Machine::new(&cartesian_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ());
    planner.plan_move([800, 0, 0, 0], 60.0, false, true).unwrap();
    planner
        .plan_move([800, 800, 0, 0], 60.0, false, true)
        .unwrap();
    // Warmups at 0..2, the two moves at 3 and 4.
    let first = queue.snapshot(3);
    let second = queue.snapshot(4);
    // |dv| = 60 * sqrt(2); factor 20 / 84.85 yields ~14.14 mm/s.
    assert!(
        (first.end_speed - 14.14).abs() < 0.05,
        "end {}",
        first.end_speed
    );
    assert_eq!(first.end_speed, second.start_speed);
    assert!(first.flags.params_ready() && second.flags.params_ready());
    assert!((first.max_junction_speed - 14.14).abs() < 0.05);
}

#[test]
fn colinear_moves_promote_interior_speed() {
    let machine = Machine::new(&cartesian_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ());
    planner.plan_move([800, 0, 0, 0], 60.0, false, true).unwrap();
    planner
        .plan_move([1600, 0, 0, 0], 60.0, false, true)
        .unwrap();
    let first = queue.snapshot(3);
    let second = queue.snapshot(4);
    // No direction change: the junction runs at full speed.
    assert!((first.end_speed - 60.0).abs() < 0.1, "{}", first.end_speed);
    assert_eq!(first.end_speed, second.start_speed);
    assert!(first.flags.end_fixed());
    assert!(second.flags.start_fixed());
}

#[test]
fn corexy_move_drives_both_towers() {
    let mut config = cartesian_config();
    config.kinematics = KinematicsConfig::Corexy {
        variant: Default::default(),
    };
    let machine = Machine::new(&config).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ());
    planner
        .plan_move([800, 0, 0, 0], 60.0, false, false)
        .unwrap();
    let seg = queue.snapshot(0);
    // A pure +x move turns both belts by the same amount.
    assert_eq!(seg.delta[X_AXIS], 800);
    assert_eq!(seg.delta[Y_AXIS], 800);
    assert!(seg.dir.has(X_AXIS) && seg.dir.has(Y_AXIS));
    // Distance stays the cartesian 10 mm, not the belt travel.
    assert!((seg.distance - 10.0).abs() < 1e-9);
}

#[test]
fn delta_move_splits_into_sibling_lines() {
    let machine = Machine::new(&delta_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs.clone(), ());
    let Kinematics::Delta(geometry) = &machine.kinematics else {
        unreachable!();
    };
    planner.set_delta_position(geometry.carriage_positions([0, 0, 0]).unwrap());
    // 50 mm of xy travel at 30 mm/s, 80 segments/s:
    // ceil(80 * 50/30) = 134 pieces, 7 lines of 19.
    planner
        .plan_move([4000, 0, 0, 0], 30.0, false, true)
        .unwrap();
    assert_eq!(queue.len(), 10); // 3 warmups + 7 lines
    let first_line = queue.snapshot(3);
    assert_eq!(first_line.num_sub_segments, 19);
    assert_eq!(first_line.primary_axis, 4);
    for index in 3..10 {
        let seg = queue.snapshot(index);
        assert_eq!(seg.move_id, first_line.move_id, "slot {index}");
        assert_eq!(seg.num_sub_segments, 19);
    }
    assert_eq!(subs.len(), 7 * 19);
    // The carriage cache must land exactly on the target solution.
    let Kinematics::Delta(towers) = &machine.kinematics else {
        unreachable!();
    };
    let expected = towers.carriage_positions([4000, 0, 0]).unwrap();
    assert_eq!(planner.delta_position(), expected);
    assert_eq!(planner.position(), [4000, 0, 0, 0]);
    // Sibling junctions carry the cruise speed instead of re-running
    // the jerk computation.
    for index in 4..10 {
        let previous = queue.snapshot(index - 1);
        let seg = queue.snapshot(index);
        assert_eq!(previous.end_speed, seg.start_speed, "slot {index}");
    }
}

#[test]
fn delta_pure_z_split_bounds_tower_counters() {
    let machine = Machine::new(&delta_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs.clone(), ());
    let Kinematics::Delta(geometry) = &machine.kinematics else {
        unreachable!();
    };
    planner.set_delta_position(geometry.carriage_positions([0, 0, 0]).unwrap());
    // 875 mm of z: a single tower delta would overflow 16 bits, so the
    // move splits by the counter width instead of segments-per-second.
    planner
        .plan_relative_steps([0, 0, 70_000, 0], 10.0, false, false)
        .unwrap();
    assert_eq!(queue.len(), 1);
    let seg = queue.snapshot(0);
    assert_eq!(seg.num_sub_segments, 2);
    assert_eq!(seg.primary_axis, 4);
    assert_eq!(subs.len(), 2);
    for _ in 0..2 {
        let sub = subs.pop().unwrap();
        for tower in 0..3 {
            assert_eq!(sub.steps[tower], 35_000);
            assert!(sub.dir.has(tower));
        }
    }
}

#[test]
fn unreachable_delta_target_is_advisory() {
    let machine = Machine::new(&delta_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs.clone(), ());
    let result = planner.plan_move([30_000, 0, 0, 0], 30.0, false, true);
    assert!(matches!(result, Err(PlanError::Unreachable)));
    assert!(queue.is_empty());
    assert!(subs.is_empty());
    assert_eq!(planner.position(), [0, 0, 0, 0]);
    assert_eq!(planner.filament_printed(), 0.0);
    // The planner keeps working afterwards.
    planner.plan_move([800, 0, 0, 0], 30.0, false, true).unwrap();
    assert!(!queue.is_empty());
}

#[test]
fn junction_continuity_over_a_random_path() {
    let machine = Machine::new(&cartesian_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner =
        MotionPlanner::new(&machine, queue.clone(), subs, Drain(queue.clone()));
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut x = 0i32;
    let mut y = 0i32;
    for _ in 0..40 {
        x += rng.gen_range(-2000..2000);
        y += rng.gen_range(-2000..2000);
        planner.plan_move([x, y, 0, 0], 60.0, false, true).unwrap();
        check_committed_invariants(&queue, &machine);
    }
}

fn check_committed_invariants(queue: &MoveQueue, machine: &Machine) {
    let committed = queue.committed();
    for seg in &committed {
        if seg.flags.is_warmup() {
            continue;
        }
        // Trapezoid integrity.
        assert!(seg.flags.params_ready());
        assert!(seg.accel_steps + seg.decel_steps <= seg.steps_remaining);
        assert_eq!(seg.steps_remaining, seg.delta[seg.primary_axis as usize]);
        // Acceleration bound: no moving axis exceeds its step limit.
        for axis in 0..4 {
            if seg.moving.has(axis) && seg.delta[seg.primary_axis as usize] > 0 {
                let axis_accel = seg.accel_prim as f64 * seg.delta[axis] as f64
                    / seg.delta[seg.primary_axis as usize] as f64;
                assert!(
                    axis_accel <= machine.accel_steps_travel[axis] * 1.01,
                    "axis {axis} accelerates at {axis_accel}"
                );
            }
        }
        // Junction speeds stay within what the junction allows.
        if seg.max_junction_speed > 0.0 {
            assert!(seg.end_speed <= seg.max_junction_speed + 1e-6);
        }
    }
    for pair in committed.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.flags.is_warmup() || b.flags.is_warmup() {
            continue;
        }
        assert!(
            (a.end_speed - b.start_speed).abs() < 1e-6,
            "junction discontinuity: {} vs {}",
            a.end_speed,
            b.start_speed
        );
        jerk_at_junction(a, b);
    }
}

/// Velocity change across a junction, evaluated at the planned junction
/// speed, must stay inside the configured jerk.
fn jerk_at_junction(a: &MotionSegment, b: &MotionSegment) {
    let junction = a.end_speed.min(b.start_speed);
    let fa = junction / a.full_speed;
    let fb = junction / b.full_speed;
    let dx = b.speed[X_AXIS] * fb - a.speed[X_AXIS] * fa;
    let dy = b.speed[Y_AXIS] * fb - a.speed[Y_AXIS] * fa;
    let jerk = (dx * dx + dy * dy).sqrt();
    assert!(jerk <= 20.0 + 0.5, "jerk {jerk} at junction {junction}");
}

#[test]
fn replanning_without_new_segments_is_idempotent() {
    let machine = Machine::new(&cartesian_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ());
    planner.plan_move([800, 0, 0, 0], 60.0, false, true).unwrap();
    planner
        .plan_move([800, 800, 0, 0], 60.0, false, true)
        .unwrap();
    planner
        .plan_move([0, 800, 0, 0], 45.0, false, true)
        .unwrap();
    let last = MoveQueue::prev_index(queue.write_index());
    lookahead::update_trapezoids(&queue, last, &machine);
    let baseline = queue.committed();
    lookahead::update_trapezoids(&queue, last, &machine);
    let replayed = queue.committed();
    assert_eq!(baseline.len(), replayed.len());
    for (a, b) in baseline.iter().zip(replayed.iter()) {
        assert_eq!(a, b);
    }
}

#[test]
fn concurrent_producer_and_stepper_stay_safe() {
    let machine = Machine::new(&cartesian_config()).unwrap();
    let queue = Arc::new(MoveQueue::new());
    let subs = Arc::new(SubSegmentRing::new());
    let moves = 200usize;
    thread::scope(|scope| {
        let consumer_queue = queue.clone();
        scope.spawn(move || {
            let mut seen = 0usize;
            while seen < moves {
                let count = consumer_queue.len();
                assert!(count <= CACHE_SIZE);
                // Read the fields the step interrupt consumes; planner-only
                // state (junction speeds) stays untouched here.
                let snap = consumer_queue.with_head(|seg| {
                    (
                        seg.flags,
                        seg.accel_steps,
                        seg.decel_steps,
                        seg.steps_remaining,
                        seg.delta[seg.primary_axis as usize],
                    )
                });
                if let Some((flags, accel_steps, decel_steps, steps, primary_delta)) = snap {
                    // A visible segment is never half-planned.
                    assert!(flags.params_ready());
                    assert!(accel_steps + decel_steps <= steps);
                    assert_eq!(steps, primary_delta);
                    consumer_queue.pop_head();
                    seen += 1;
                }
            }
        });
        let mut planner = MotionPlanner::new(&machine, queue.clone(), subs, ());
        let mut rng = StdRng::seed_from_u64(42);
        let mut x = 0i32;
        for _ in 0..moves {
            x += rng.gen_range(1..500);
            // No path optimisation: every move commits exactly one
            // segment, so the consumer knows when to stop.
            planner.plan_move([x, 0, 0, 0], 60.0, false, false).unwrap();
        }
    });
    assert!(queue.is_empty());
}

#[test]
fn randomised_interleaving_trace() {
    let machine = Machine::new(&cartesian_config()).unwrap();
    let (queue, subs) = rig();
    let mut planner =
        MotionPlanner::new(&machine, queue.clone(), subs, Drain(queue.clone()));
    let mut rng = StdRng::seed_from_u64(7);
    let mut x = 0i32;
    for _ in 0..300 {
        if rng.gen_bool(0.6) {
            x += rng.gen_range(-1500..1500);
            planner.plan_move([x, 0, 0, 0], 60.0, false, true).unwrap();
        } else if !queue.is_empty() {
            queue.pop_head();
        }
        assert!(queue.len() <= CACHE_SIZE);
    }
    check_committed_invariants(&queue, &machine);
}

#[test]
fn kinematic_round_trip_random_sweep() {
    let mut rng = StdRng::seed_from_u64(99);
    let machine = Machine::new(&delta_config()).unwrap();
    let Kinematics::Delta(towers) = &machine.kinematics else {
        unreachable!();
    };
    for _ in 0..200 {
        let cart = [
            rng.gen_range(-20_000..20_000),
            rng.gen_range(-20_000..20_000),
            rng.gen_range(-5_000..5_000),
        ];
        // Linear variants are exactly invertible.
        for kin in [
            Kinematics::Cartesian,
            Kinematics::CoreXy(Default::default()),
        ] {
            let mapped = kin.to_towers(cart).unwrap();
            assert_eq!(kin.from_towers(mapped).unwrap(), cart);
        }
        // The delta solve keeps the effector on the rod sphere to within
        // a step whenever the target is reachable.
        let inside = [
            rng.gen_range(-4_000..4_000),
            rng.gen_range(-4_000..4_000),
            rng.gen_range(0..8_000),
        ];
        if let Some(carriages) = towers.carriage_positions(inside) {
            for tower in 0..3 {
                let dz = (carriages[tower] - inside[2]) as f64;
                // Carriage height is the sphere solution; re-check it.
                let rod = 250.0 * 80.0;
                assert!(dz >= 0.0 && dz <= rod + 1.0);
            }
        }
    }
}
