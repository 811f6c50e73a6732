use anyhow::{Context, Result};
use cadenza_core::Machine;
use cadenza_core::kinematics::Kinematics;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let config = crate::config::load(&self.config)?;
        let machine = Machine::new(&config)
            .with_context(|| format!("invalid machine config {}", self.config.display()))?;
        let kind = match &machine.kinematics {
            Kinematics::Cartesian => "cartesian",
            Kinematics::CoreXy(_) => "corexy",
            Kinematics::Delta(_) => "delta",
        };
        println!("OK {} ({kind})", self.config.display());
        println!(
            "  steps/mm {:?}  max feedrate {:?} mm/s",
            machine.steps_per_mm, machine.max_feedrate
        );
        println!(
            "  jerk {} mm/s (z {})  min speed {} mm/s",
            machine.max_jerk, machine.max_z_jerk, machine.min_speed
        );
        if machine.extruder.advance_enabled {
            println!(
                "  pressure advance: linear {} quadratic {}",
                machine.extruder.advance_linear, machine.extruder.advance_quadratic
            );
        }
        Ok(())
    }
}
