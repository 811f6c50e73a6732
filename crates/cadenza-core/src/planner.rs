// Segment builder: turns target positions into queued motion segments.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Machine;
use crate::kinematics::Kinematics;
use crate::lookahead;
use crate::move_queue::{Ambient, CACHE_SIZE, MoveQueue};
use crate::segment::{AxisBits, E_AXIS, MotionSegment, NUM_AXES, VIRTUAL_AXIS, X_AXIS, Z_AXIS};
use crate::sub_segment::{SUB_CACHE_SIZE, SubSegment, SubSegmentRing};

/// Queue fill level below which short moves are slowed down to keep the
/// step interrupt fed.
pub const MOVE_CACHE_LOW: usize = 10;

/// A move shorter than this many ticks is a starvation hazard.
pub const LOW_TICKS_PER_MOVE: f64 = 250_000.0;

/// Halfstepping is disabled below this step interval.
pub const MAX_HALFSTEP_INTERVAL: u32 = 1999;

/// Upper bound on delta sub-segments per queue entry.
pub const MAX_SUB_PER_LINE: u32 = 22;

/// Commit cooldown that suppresses warmup insertion while a command
/// stream is merely pausing.
const WAIT_RELAX_TICKS: u8 = 70;

#[derive(Debug, Error)]
pub enum PlanError {
    /// The target lies outside the reachable delta volume. Advisory; no
    /// planner state was touched.
    #[error("target position is outside the reachable volume")]
    Unreachable,
}

/// The planning pipeline: owns the producer side of the motion queue and
/// the cached machine position.
///
/// One planner context per queue; the stepper context holds its own
/// handle to the same rings and only ever consumes.
pub struct MotionPlanner<'m, A: Ambient = ()> {
    machine: &'m Machine,
    queue: Arc<MoveQueue>,
    sub_segments: Arc<SubSegmentRing>,
    ambient: A,
    /// Commanded position in cartesian steps.
    position: [i32; NUM_AXES],
    /// Carriage positions in steps (delta only).
    delta_position: [i32; 3],
    /// Bits 0-2: last commanded x/y/z direction; bits 3-5: compensation
    /// enabled per axis.
    backlash_dir: u8,
    extrusion_multiplier: u16,
    filament_printed: f64,
    wait_relax: u8,
    last_move_id: u8,
}

impl<'m, A: Ambient> MotionPlanner<'m, A> {
    pub fn new(
        machine: &'m Machine,
        queue: Arc<MoveQueue>,
        sub_segments: Arc<SubSegmentRing>,
        ambient: A,
    ) -> Self {
        Self {
            machine,
            queue,
            sub_segments,
            ambient,
            position: [0; NUM_AXES],
            delta_position: [0; 3],
            backlash_dir: machine.backlash_enabled << 3,
            extrusion_multiplier: 100,
            filament_printed: 0.0,
            wait_relax: 0,
            last_move_id: 0,
        }
    }

    /// Queue a move to an absolute step position.
    ///
    /// Blocks cooperatively (serving the ambient callback) while the
    /// queue is full. On delta machines the move is split into
    /// sub-segment chains; an unreachable target is dropped with a
    /// diagnostic and leaves all planner state untouched.
    pub fn plan_move(
        &mut self,
        target: [i32; NUM_AXES],
        feedrate: f64,
        check_endstops: bool,
        optimise: bool,
    ) -> Result<(), PlanError> {
        if self.machine.kinematics.is_delta() {
            self.split_delta_move(target, feedrate, check_endstops, optimise, true)
        } else {
            self.queue_move(target, feedrate, check_endstops, optimise, true)
        }
    }

    /// Queue a relative move in steps, without soft-endstop clamping.
    /// Used by homing, which must be able to run into the endstops.
    pub fn plan_relative_steps(
        &mut self,
        delta: [i32; NUM_AXES],
        feedrate: f64,
        wait_end: bool,
        check_endstops: bool,
    ) -> Result<(), PlanError> {
        let mut target = self.position;
        for i in 0..NUM_AXES {
            target[i] += delta[i];
        }
        let result = if self.machine.kinematics.is_delta() {
            self.split_delta_move(target, feedrate, check_endstops, false, false)
        } else {
            self.queue_move(target, feedrate, check_endstops, false, false)
        };
        if wait_end {
            self.wait_until_idle();
        }
        result
    }

    /// Queue a pure extruder move (retract / prime).
    pub fn plan_extruder_move(
        &mut self,
        e_diff: i32,
        feedrate: f64,
        check_endstops: bool,
        optimise: bool,
    ) -> Result<(), PlanError> {
        self.plan_extruder_steps(e_diff as i64, feedrate, check_endstops, optimise)
    }

    /// Drain the queue, serving ambient work while the stepper catches
    /// up.
    pub fn wait_until_idle(&mut self) {
        while !self.queue.is_empty() {
            self.ambient.serve_ambient();
        }
    }

    /// Drop everything queued. No recovery of in-flight geometry.
    pub fn emergency_stop(&mut self) {
        self.queue.clear();
        self.sub_segments.clear();
    }

    /// Idle maintenance tick; decays the warmup-suppression cooldown.
    /// Call from the periodic task while the queue is empty.
    pub fn note_idle(&mut self) {
        self.wait_relax = self.wait_relax.saturating_sub(1);
    }

    pub fn position(&self) -> [i32; NUM_AXES] {
        self.position
    }

    /// Overwrite the cached cartesian position (homing).
    pub fn set_position(&mut self, position: [i32; NUM_AXES]) {
        self.position = position;
    }

    /// Overwrite the cached carriage positions (delta homing).
    pub fn set_delta_position(&mut self, towers: [i32; 3]) {
        self.delta_position = towers;
    }

    pub fn delta_position(&self) -> [i32; 3] {
        self.delta_position
    }

    /// Filament pushed through the extruder so far, in mm.
    pub fn filament_printed(&self) -> f64 {
        self.filament_printed
    }

    /// Flow multiplier in percent (100 = neutral).
    pub fn set_extrusion_multiplier(&mut self, percent: u16) {
        self.extrusion_multiplier = percent;
    }

    pub fn ambient_mut(&mut self) -> &mut A {
        &mut self.ambient
    }

    pub fn machine(&self) -> &Machine {
        self.machine
    }

    // --- cartesian / corexy path ---

    fn queue_move(
        &mut self,
        mut target: [i32; NUM_AXES],
        feedrate: f64,
        check_endstops: bool,
        optimise: bool,
        clamp: bool,
    ) -> Result<(), PlanError> {
        if clamp {
            self.clamp_destination(&mut target);
        }
        self.queue.reserve(1, &mut self.ambient);
        let inserted_warmup = self.insert_warmup(optimise, 0);
        let mut index = self.queue.write_index();

        let cart = [
            target[0] as i64 - self.position[0] as i64,
            target[1] as i64 - self.position[1] as i64,
            target[2] as i64 - self.position[2] as i64,
        ];
        let towers = self
            .machine
            .kinematics
            .to_tower_deltas(cart)
            .unwrap_or(cart);
        let diff = [
            towers[0],
            towers[1],
            towers[2],
            target[3] as i64 - self.position[3] as i64,
        ];
        let mut axis_diff = [0.0f64; 5];
        for i in 0..NUM_AXES {
            axis_diff[i] = diff[i] as f64 * self.machine.inv_steps_per_mm[i];
        }
        let (dir, moving, delta) = self.dir_and_delta(diff);
        self.position = target;
        self.filament_printed += axis_diff[E_AXIS];
        if !moving.any() {
            if inserted_warmup {
                self.queue.clear();
            }
            return Ok(());
        }
        {
            let seg = self.queue.segment_mut(index);
            *seg = MotionSegment::default();
            seg.flags.set_check_endstops(check_endstops);
            if !optimise {
                seg.flags.set_end_fixed(true);
            }
            seg.dir = dir;
            seg.moving = moving;
            seg.delta = delta;
        }

        if moving.any_xyz()
            && ((dir.xyz_bits() ^ (self.backlash_dir & 7)) & (self.backlash_dir >> 3)) != 0
        {
            index = self.insert_backlash_prologue(index, dir, feedrate, optimise);
        }

        {
            let seg = self.queue.segment_mut(index);
            let d = &seg.delta;
            let primary = if d[1] > d[0] && d[1] > d[2] && d[1] > d[3] {
                1
            } else if d[0] > d[2] && d[0] > d[3] {
                0
            } else if d[2] > d[3] {
                2
            } else {
                3
            };
            seg.primary_axis = primary as u8;
            seg.steps_remaining = seg.delta[primary];
            seg.distance = self.cartesian_distance(&axis_diff, seg.moving);
        }
        self.calculate_move(index, axis_diff, feedrate, optimise);
        Ok(())
    }

    /// Synthesise a zero-feed prologue covering the backlash distance on
    /// every axis whose direction flipped. Returns the slot of the real
    /// move, which follows the prologue.
    fn insert_backlash_prologue(
        &mut self,
        index: usize,
        dir: AxisBits,
        feedrate: f64,
        optimise: bool,
    ) -> usize {
        self.queue.reserve(2, &mut self.ambient);
        let saved = self.queue.snapshot(index);
        let changed = dir.xyz_bits() ^ (self.backlash_dir & 7);
        let mut back_diff = [0.0f64; 5];
        for axis in 0..3 {
            if changed & (1 << axis) != 0 {
                back_diff[axis] = if dir.has(axis) {
                    self.machine.backlash[axis]
                } else {
                    -self.machine.backlash[axis]
                };
            }
        }
        {
            let seg = self.queue.segment_mut(index);
            // Take-up move: no endstop checks, direction as the real move.
            seg.flags.set_check_endstops(false);
            seg.dir = AxisBits::new();
            for axis in 0..3 {
                if dir.has(axis) {
                    seg.dir.set(axis);
                }
            }
            seg.moving = AxisBits::new();
            seg.delta = [0; NUM_AXES];
            for axis in 0..3 {
                let steps = (back_diff[axis] * self.machine.steps_per_mm[axis]).abs() as u32;
                seg.delta[axis] = steps;
                if steps != 0 {
                    seg.moving.set(axis);
                }
            }
            let d = &seg.delta;
            let primary = if d[1] > d[0] && d[1] > d[2] {
                1
            } else if d[0] > d[2] {
                0
            } else {
                2
            };
            seg.primary_axis = primary as u8;
            seg.steps_remaining = seg.delta[primary];
            let xy2 = back_diff[0] * back_diff[0] + back_diff[1] * back_diff[1];
            seg.distance = if seg.moving.has(Z_AXIS) {
                (xy2 + back_diff[2] * back_diff[2]).sqrt()
            } else {
                xy2.sqrt()
            };
        }
        self.backlash_dir = (self.backlash_dir & 0b11_1000) | dir.xyz_bits();
        self.calculate_move(index, back_diff, feedrate, optimise);
        let real = self.queue.write_index();
        *self.queue.segment_mut(real) = saved;
        real
    }

    // --- delta path ---

    fn split_delta_move(
        &mut self,
        mut target: [i32; NUM_AXES],
        feedrate: f64,
        check_endstops: bool,
        optimise: bool,
        soft_endstop: bool,
    ) -> Result<(), PlanError> {
        if soft_endstop && target[2] < 0 {
            target[2] = 0;
        }
        let mut difference = [0i64; NUM_AXES];
        let mut axis_diff = [0.0f64; 5];
        for i in 0..NUM_AXES {
            difference[i] = target[i] as i64 - self.position[i] as i64;
            axis_diff[i] = difference[i] as f64 * self.machine.inv_steps_per_mm[i];
        }
        let (save_dir, save_moving, save_delta) = self.dir_and_delta(difference);
        if !save_moving.any() {
            return Ok(());
        }
        if !save_moving.any_xyz() {
            self.filament_printed += axis_diff[E_AXIS];
            return self.plan_extruder_steps(difference[E_AXIS], feedrate, check_endstops, optimise);
        }
        if let Kinematics::Delta(towers) = &self.machine.kinematics {
            if towers
                .carriage_positions([target[0], target[1], target[2]])
                .is_none()
            {
                tracing::warn!(?target, "unreachable delta target, move dropped");
                return Err(PlanError::Unreachable);
            }
        }
        self.filament_printed += axis_diff[E_AXIS];
        let save_distance = self.cartesian_distance(&axis_diff, save_moving);

        let segment_count = if save_moving.any_xy() {
            let seconds = save_distance / feedrate;
            let rate = if save_moving.has(E_AXIS) && save_dir.has(E_AXIS) {
                self.machine.segments_per_second_print
            } else {
                self.machine.segments_per_second_travel
            };
            ((rate * seconds).ceil() as u32).max(1)
        } else {
            // Pure z: bound each tower delta to the 16-bit ISR counter.
            ((save_delta[2] as u64 + 65_534) / 65_535).max(1) as u32
        };
        let num_lines = segment_count.div_ceil(MAX_SUB_PER_LINE);
        let segments_per_line = segment_count / num_lines;

        let start_position = self.position;
        self.queue.reserve(1, &mut self.ambient);
        let wait_extra = (num_lines as usize - 1).min(CACHE_SIZE - 4) as u8;
        self.insert_warmup(optimise, wait_extra);

        for line in 1..=num_lines {
            self.queue.reserve(1, &mut self.ambient);
            let index = self.queue.write_index();
            let mut fractional = [0i64; NUM_AXES];
            let mut line_diff = axis_diff;
            let line_target;
            {
                let seg = self.queue.segment_mut(index);
                *seg = MotionSegment::default();
            }
            if num_lines == 1 {
                let seg = self.queue.segment_mut(index);
                seg.dir = save_dir;
                seg.moving = save_moving;
                seg.delta = save_delta;
                seg.distance = save_distance;
                fractional = difference;
                line_target = [target[0], target[1], target[2]];
            } else {
                let mut tgt = [0i32; 3];
                for i in 0..NUM_AXES {
                    let dest =
                        start_position[i] as i64 + difference[i] * line as i64 / num_lines as i64;
                    fractional[i] = dest - self.position[i] as i64;
                    line_diff[i] = fractional[i] as f64 * self.machine.inv_steps_per_mm[i];
                    if i < 3 {
                        tgt[i] = dest as i32;
                    }
                }
                let (dir, moving, delta) = self.dir_and_delta(fractional);
                let distance = self.cartesian_distance(&line_diff, moving);
                let seg = self.queue.segment_mut(index);
                seg.dir = dir;
                seg.moving = moving;
                seg.delta = delta;
                seg.distance = distance;
                line_target = tgt;
            }
            {
                let seg = self.queue.segment_mut(index);
                seg.move_id = self.last_move_id;
                seg.flags.set_check_endstops(check_endstops);
                if line == num_lines && !optimise {
                    seg.flags.set_end_fixed(true);
                }
                seg.num_sub_segments = segments_per_line as u16;
            }
            let max_tower_step =
                self.build_sub_segments(index, line_target, segments_per_line, soft_endstop);
            let virtual_axis_move = max_tower_step as u64 * segments_per_line as u64;
            let delta_e = self.queue.segment(index).delta[E_AXIS];
            if virtual_axis_move == 0 && delta_e == 0 {
                // Line too short to move anything in the low precision
                // area; drop it.
                if num_lines != 1 {
                    tracing::warn!("zero-length sub-move inside a multi-line delta split");
                }
                return Ok(());
            }
            {
                let seg = self.queue.segment_mut(index);
                seg.primary_axis = VIRTUAL_AXIS;
                if virtual_axis_move > delta_e as u64 {
                    seg.steps_remaining = virtual_axis_move as u32;
                    seg.primary_steps_per_sub = max_tower_step;
                } else {
                    // Round the extruder delta up to a multiple of the
                    // sub-segment count.
                    seg.primary_steps_per_sub = delta_e.div_ceil(segments_per_line);
                    seg.steps_remaining = seg.primary_steps_per_sub * segments_per_line;
                }
                line_diff[4] =
                    seg.steps_remaining as f64 * self.machine.inv_steps_per_mm[X_AXIS];
            }
            self.calculate_move(index, line_diff, feedrate, optimise);
            for i in 0..NUM_AXES {
                self.position[i] = (self.position[i] as i64 + fractional[i]) as i32;
            }
        }
        self.last_move_id = self.last_move_id.wrapping_add(1);
        Ok(())
    }

    /// Interpolate toward the line target and emit one sub-segment per
    /// interpolation point. Returns the largest single-tower step count.
    fn build_sub_segments(
        &mut self,
        index: usize,
        line_target: [i32; 3],
        segments: u32,
        soft_endstop: bool,
    ) -> u32 {
        let machine: &'m Machine = self.machine;
        let Kinematics::Delta(towers) = &machine.kinematics else {
            return 0;
        };
        {
            let seg = self.queue.segment_mut(index);
            seg.sub_segment_read_pos = self.sub_segments.write_index() as u16;
        }
        let mut cursor = [
            self.position[0] as i64,
            self.position[1] as i64,
            self.position[2] as i64,
        ];
        let mut produced = 0usize;
        let mut max_step = 0u32;
        for s in (1..=segments as i64).rev() {
            for (i, c) in cursor.iter_mut().enumerate() {
                *c += (line_target[i] as i64 - *c) / s;
            }
            while self.sub_segments.len() + produced >= SUB_CACHE_SIZE {
                self.ambient.serve_ambient();
            }
            let mut sub = SubSegment::default();
            match towers.carriage_positions([cursor[0] as i32, cursor[1] as i32, cursor[2] as i32])
            {
                Some(carriages) => {
                    for i in 0..3 {
                        let mut carriage = carriages[i];
                        if soft_endstop && carriage > towers.max_tower_steps {
                            carriage = towers.max_tower_steps;
                        }
                        let d = carriage as i64 - self.delta_position[i] as i64;
                        if d != 0 {
                            sub.moving.set(i);
                            if d > 0 {
                                sub.dir.set(i);
                            }
                            let magnitude = d.unsigned_abs();
                            if magnitude > u16::MAX as u64 {
                                tracing::warn!(
                                    tower = i,
                                    steps = magnitude,
                                    "tower delta overflows the 16-bit sub-segment counter"
                                );
                            }
                            sub.steps[i] = magnitude.min(u16::MAX as u64) as u16;
                            max_step = max_step.max(sub.steps[i] as u32);
                        }
                        self.delta_position[i] = carriage;
                    }
                }
                None => {
                    // Numeric failure near the envelope boundary; emit a
                    // null piece rather than corrupting the chain.
                    tracing::warn!(position = ?cursor, "invalid delta coordinate, sub-segment zeroed");
                }
            }
            self.sub_segments.stage(sub);
            produced += 1;
        }
        self.sub_segments.publish(produced);
        max_step
    }

    // --- pure extruder path ---

    fn plan_extruder_steps(
        &mut self,
        e_diff: i64,
        feedrate: f64,
        check_endstops: bool,
        optimise: bool,
    ) -> Result<(), PlanError> {
        self.queue.reserve(1, &mut self.ambient);
        let inserted_warmup = self.insert_warmup(optimise, 0);
        let index = self.queue.write_index();
        let (dir, moving, delta) = self.dir_and_delta([0, 0, 0, e_diff]);
        self.position[E_AXIS] = (self.position[E_AXIS] as i64 + e_diff) as i32;
        if !moving.any() {
            if inserted_warmup {
                self.queue.clear();
            }
            return Ok(());
        }
        {
            let seg = self.queue.segment_mut(index);
            *seg = MotionSegment::default();
            seg.flags.set_check_endstops(check_endstops);
            if !optimise {
                seg.flags.set_end_fixed(true);
            }
            seg.dir = dir;
            seg.moving = moving;
            seg.delta = delta;
            seg.primary_axis = E_AXIS as u8;
            seg.steps_remaining = seg.delta[E_AXIS];
            seg.distance = (e_diff as f64 * self.machine.inv_steps_per_mm[E_AXIS]).abs();
            seg.move_id = self.last_move_id;
        }
        self.last_move_id = self.last_move_id.wrapping_add(1);
        let mut axis_diff = [0.0f64; 5];
        axis_diff[E_AXIS] = e_diff as f64 * self.machine.inv_steps_per_mm[E_AXIS];
        self.calculate_move(index, axis_diff, feedrate, optimise);
        Ok(())
    }

    // --- shared helpers ---

    /// Split signed step differences into sign bits, moving bits and
    /// magnitudes, applying the flow multiplier to the extruder.
    fn dir_and_delta(&self, diff: [i64; NUM_AXES]) -> (AxisBits, AxisBits, [u32; NUM_AXES]) {
        let mut dir = AxisBits::new();
        let mut moving = AxisBits::new();
        let mut delta = [0u32; NUM_AXES];
        for i in 0..NUM_AXES {
            let mut steps = diff[i];
            if steps >= 0 {
                dir.set(i);
            } else {
                steps = -steps;
            }
            delta[i] = steps as u32;
        }
        if self.extrusion_multiplier != 100 {
            delta[E_AXIS] =
                (delta[E_AXIS] as f64 * self.extrusion_multiplier as f64 * 0.01) as u32;
        }
        for i in 0..NUM_AXES {
            if delta[i] != 0 {
                moving.set(i);
            }
        }
        (dir, moving, delta)
    }

    /// Euclidean length of the move in mm. Gantry tower travel is mapped
    /// back to cartesian axes first.
    fn cartesian_distance(&self, axis_diff: &[f64; 5], moving: AxisBits) -> f64 {
        if moving.any_xyz() {
            let (dx, dy) = match &self.machine.kinematics {
                Kinematics::CoreXy(variant) => {
                    variant.cartesian_components(axis_diff[0], axis_diff[1])
                }
                _ => (axis_diff[0], axis_diff[1]),
            };
            let xy2 = dx * dx + dy * dy;
            if moving.has(Z_AXIS) {
                (xy2 + axis_diff[2] * axis_diff[2]).sqrt()
            } else {
                xy2.sqrt()
            }
        } else {
            axis_diff[E_AXIS].abs()
        }
    }

    fn clamp_destination(&self, target: &mut [i32; NUM_AXES]) {
        if let Some(endstops) = &self.machine.endstops {
            for i in 0..3 {
                target[i] = target[i].clamp(endstops.min[i], endstops.max[i]);
            }
        }
    }

    /// Enqueue three zero-motion warmup dummies when the queue starts
    /// from empty, giving the look-ahead some headroom before real
    /// motion executes. Returns whether dummies were inserted.
    fn insert_warmup(&mut self, optimise: bool, wait_extra: u8) -> bool {
        if !optimise || self.wait_relax != 0 || !self.queue.is_empty() {
            return false;
        }
        for w in (1..=3u8).rev() {
            let index = self.queue.write_index();
            {
                let seg = self.queue.segment_mut(index);
                *seg = MotionSegment::default();
                seg.flags.set_warmup();
                seg.flags.set_start_fixed(true);
                seg.flags.set_end_fixed(true);
                seg.flags.set_params_ready(true);
                seg.primary_axis = 2 + w + wait_extra;
                seg.time_in_ticks = 10_000 * w as u64;
                seg.wait_ticks = seg.time_in_ticks;
                seg.f_accel = 10_000 * w as u32;
            }
            self.queue.commit();
        }
        true
    }

    /// Per-segment kinematic profile: intervals, speeds, acceleration
    /// clamp, advance, halfstep selection; then the look-ahead pass and
    /// the commit.
    fn calculate_move(&mut self, index: usize, axis_diff: [f64; 5], feedrate: f64, optimise: bool) {
        let f_cpu = self.machine.timer_hz;
        let queued = self.queue.len();
        {
            let seg = self.queue.segment_mut(index);
            let is_virtual = seg.primary_axis == VIRTUAL_AXIS;
            let mut time_for_move = f_cpu * seg.distance / feedrate;
            let mut critical = false;
            if queued < MOVE_CACHE_LOW && time_for_move < LOW_TICKS_PER_MOVE {
                // Stretch short moves while the cache is low so the
                // interrupt is never starved.
                time_for_move += 3.0 * (LOW_TICKS_PER_MOVE - time_for_move) / (queued + 1) as f64;
                critical = true;
            }
            seg.time_in_ticks = time_for_move as u64;

            let steps = seg.steps_remaining as f64;
            let mut axis_interval = [0.0f64; 5];
            let mut limit_interval = time_for_move / steps;
            for i in 0..NUM_AXES {
                axis_interval[i] =
                    axis_diff[i].abs() * f_cpu / (self.machine.max_feedrate[i] * steps);
                if axis_interval[i] > limit_interval {
                    limit_interval = axis_interval[i];
                }
            }
            seg.full_interval = (limit_interval as u64).max(200) as u32;
            let time_for_move = seg.full_interval as f64 * steps;
            let inv_time_s = f_cpu / time_for_move;
            for i in 0..NUM_AXES {
                if seg.moving.has(i) {
                    axis_interval[i] = time_for_move / seg.delta[i] as f64;
                    let mut speed = axis_diff[i].abs() * inv_time_s;
                    if !seg.dir.has(i) {
                        speed = -speed;
                    }
                    seg.speed[i] = speed;
                } else {
                    seg.speed[i] = 0.0;
                }
            }
            if is_virtual {
                axis_interval[4] = time_for_move / steps;
            }
            seg.full_speed = seg.distance * inv_time_s;
            seg.inv_full_speed = 1.0 / seg.full_speed;

            // The axis that accelerates slowest at these intervals
            // dictates the segment's acceleration.
            let is_print_move = seg.is_e_positive_move();
            let mut slowest_plateau = 1e20f64;
            let primary = seg.primary_axis as usize;
            for i in 0..NUM_AXES {
                if !is_virtual {
                    seg.error[i] = (seg.delta[primary] >> 1) as i32;
                }
                if seg.moving.has(i) {
                    let accel = if is_print_move {
                        self.machine.accel_steps_print[i]
                    } else {
                        self.machine.accel_steps_travel[i]
                    };
                    slowest_plateau = slowest_plateau.min(axis_interval[i] * accel);
                }
            }
            if is_virtual {
                // Tower error terms are seeded by the interrupt.
                seg.error[E_AXIS] = (seg.steps_remaining >> 1) as i32;
            }
            seg.accel_prim = (slowest_plateau / axis_interval[primary]) as u32;
            seg.f_accel = (262_144.0 * seg.accel_prim as f64 / f_cpu) as u32;
            seg.acceleration = 2.0 * seg.distance * slowest_plateau * seg.full_speed / f_cpu;
            let safe = self.safe_speed(seg);
            seg.start_speed = safe;
            seg.end_speed = safe;
            if (safe * safe + seg.acceleration).sqrt() >= seg.full_speed {
                seg.flags.set_nominal();
            }
            seg.v_max = (f_cpu / seg.full_interval as f64) as u32;
            self.compute_advance(seg);

            if critical {
                seg.flags.set_critical();
            }
            if seg.full_interval < MAX_HALFSTEP_INTERVAL || critical {
                seg.flags.set_halfstep(false);
            } else {
                seg.flags.set_halfstep(true);
                if is_virtual {
                    seg.error[E_AXIS] = seg.steps_remaining as i32;
                } else {
                    seg.error = [seg.delta[primary] as i32; NUM_AXES];
                }
            }
        }
        lookahead::update_trapezoids(&self.queue, index, self.machine);
        self.queue.commit();
        if optimise {
            self.wait_relax = WAIT_RELAX_TICKS;
        }
    }

    /// Highest start/end speed that needs no planning to be crossed.
    fn safe_speed(&self, seg: &MotionSegment) -> f64 {
        let machine = self.machine;
        let mut safe = if seg.is_e_move() && machine.extruder.advance_enabled {
            seg.full_speed.min(machine.min_speed)
        } else {
            seg.full_speed
                .min(machine.min_speed.max(machine.max_jerk * 0.5))
        };
        if !machine.kinematics.is_delta() && seg.moving.has(Z_AXIS) {
            let speed_z = seg.speed[Z_AXIS].abs();
            if speed_z > machine.max_z_jerk * 0.5 {
                safe = safe.min(machine.max_z_jerk * 0.5 * seg.full_speed / speed_z);
            }
        }
        if seg.is_e_move() {
            if seg.moving.any_xyz() {
                safe = safe.min(
                    0.5 * machine.extruder.max_start_feedrate * seg.full_speed
                        / seg.speed[E_AXIS].abs(),
                );
            } else {
                safe = 0.5 * machine.extruder.max_start_feedrate;
            }
        }
        safe.min(seg.full_speed)
    }

    /// Pressure-advance coefficients. Active only when the extruder
    /// pushes forward while the head moves; retractions and pure
    /// extruder moves run without feed-forward.
    fn compute_advance(&self, seg: &mut MotionSegment) {
        let extruder = &self.machine.extruder;
        seg.advance_linear = 0;
        seg.advance_quadratic = 0;
        seg.advance_rate = 0;
        if !extruder.advance_enabled
            || !seg.moving.any_xyz()
            || !seg.moving.has(E_AXIS)
            || !seg.dir.has(E_AXIS)
        {
            return;
        }
        let speed_e = seg.speed[E_AXIS].abs();
        let linear = extruder.advance_linear * speed_e * self.machine.steps_per_mm[E_AXIS];
        seg.advance_linear = (65_536.0 * linear / seg.v_max as f64) as u32;
        if extruder.advance_quadratic > 0.0 {
            seg.advance_quadratic =
                (65_536.0 * extruder.advance_quadratic * speed_e * speed_e) as u32;
            let ramp_steps =
                ((seg.v_max as u64 * seg.v_max as u64) / ((seg.accel_prim as u64) << 1)).max(1);
            seg.advance_rate = seg.advance_quadratic / ramp_steps as u32;
        }
    }
}
