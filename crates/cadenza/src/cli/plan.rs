use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cadenza_core::move_queue::{Ambient, MoveQueue};
use cadenza_core::segment::{MotionSegment, NUM_AXES};
use cadenza_core::sub_segment::SubSegmentRing;
use cadenza_core::{Machine, MotionPlanner};
use clap::Args;

#[derive(Args)]
pub struct PlanArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,
    /// Moves file: one `x y z e [f]` line per move, in mm and mm/s.
    /// Lines starting with `#` are ignored.
    pub moves: PathBuf,
}

/// Stands in for the step interrupt: retires the head segment (and its
/// delta sub-segment run) whenever the planner yields, recording it for
/// the report.
struct RecordingStepper {
    queue: Arc<MoveQueue>,
    sub_segments: Arc<SubSegmentRing>,
    executed: Vec<MotionSegment>,
}

impl Ambient for RecordingStepper {
    fn serve_ambient(&mut self) {
        if let Some(segment) = self.queue.with_head(|seg| *seg) {
            self.queue.pop_head();
            for _ in 0..segment.num_sub_segments {
                self.sub_segments.pop();
            }
            self.executed.push(segment);
        }
    }
}

impl PlanArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = crate::config::load(&self.config)?;
        let machine = Machine::new(&config)
            .with_context(|| format!("invalid machine config {}", self.config.display()))?;
        let moves = parse_moves(&self.moves, &machine)?;
        tracing::info!(
            "planning {} moves from {}",
            moves.len(),
            self.moves.display()
        );

        let queue = Arc::new(MoveQueue::new());
        let sub_segments = Arc::new(SubSegmentRing::new());
        let stepper = RecordingStepper {
            queue: queue.clone(),
            sub_segments: sub_segments.clone(),
            executed: Vec::new(),
        };
        let mut planner = MotionPlanner::new(&machine, queue.clone(), sub_segments, stepper);

        let mut dropped = 0usize;
        for (target, feedrate) in &moves {
            if planner.plan_move(*target, *feedrate, true, true).is_err() {
                dropped += 1;
            }
        }
        // Retire whatever is still queued.
        while !queue.is_empty() {
            planner.ambient_mut().serve_ambient();
        }

        let executed = std::mem::take(&mut planner.ambient_mut().executed);
        println!(
            "{:>4} {:<6} {:>9} {:>9} {:>8} {:>8} {:>8} {:>7} {:>7}",
            "#", "kind", "steps", "mm", "v_full", "v_start", "v_end", "accel", "decel"
        );
        let mut total_ticks = 0u64;
        for (index, seg) in executed.iter().enumerate() {
            total_ticks += seg.time_in_ticks;
            if seg.flags.is_warmup() {
                println!("{index:>4} warmup {:>9} ticks", seg.wait_ticks);
                continue;
            }
            println!(
                "{index:>4} move   {:>9} {:>9.3} {:>8.2} {:>8.2} {:>8.2} {:>7} {:>7}",
                seg.steps_remaining,
                seg.distance,
                seg.full_speed,
                seg.start_speed,
                seg.end_speed,
                seg.accel_steps,
                seg.decel_steps,
            );
        }
        println!(
            "{} segments, {:.2} s of motion, {:.2} mm of filament, {dropped} dropped",
            executed.len(),
            total_ticks as f64 / machine.timer_hz,
            planner.filament_printed(),
        );
        Ok(())
    }
}

/// Parse the moves fixture: whitespace-separated `x y z e [f]` floats,
/// converted to steps with the machine's steps-per-mm.
fn parse_moves(path: &Path, machine: &Machine) -> Result<Vec<([i32; NUM_AXES], f64)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read moves file {}", path.display()))?;
    let mut moves = Vec::new();
    let mut feedrate = 50.0f64;
    for (line_number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<f64> = line
            .split_whitespace()
            .map(|field| {
                field
                    .parse::<f64>()
                    .with_context(|| format!("line {}: bad number {field:?}", line_number + 1))
            })
            .collect::<Result<_>>()?;
        if fields.len() < 4 || fields.len() > 5 {
            bail!(
                "line {}: expected `x y z e [f]`, got {} fields",
                line_number + 1,
                fields.len()
            );
        }
        if let Some(&f) = fields.get(4) {
            if f <= 0.0 {
                bail!("line {}: feedrate must be positive", line_number + 1);
            }
            feedrate = f;
        }
        let mut target = [0i32; NUM_AXES];
        for axis in 0..NUM_AXES {
            target[axis] = (fields[axis] * machine.steps_per_mm[axis]) as i32;
        }
        moves.push((target, feedrate));
    }
    Ok(moves)
}
