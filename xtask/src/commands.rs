use anyhow::Result;
use clap::{Args, Subcommand};
use xshell::{Shell, cmd};

#[derive(Subcommand)]
pub enum Command {
    /// Run CI checks (fmt, clippy, test). Runs all if no subcommand
    /// is specified.
    Ci(Ci),
    /// Apply rustfmt to all files
    Fmt(Fmt),
    /// Run precommit checks (checks rustfmt and runs clippy)
    Precommit(Precommit),
    /// Run tests
    Test(Test),
}

impl Command {
    pub fn run(self, sh: &Shell) -> Result<()> {
        match self {
            Command::Ci(cmd) => cmd.run(sh),
            Command::Fmt(cmd) => cmd.run(sh),
            Command::Precommit(cmd) => cmd.run(sh),
            Command::Test(cmd) => cmd.run(sh),
        }
    }
}

#[derive(Args)]
pub struct Ci {
    #[command(subcommand)]
    command: Option<CiCommand>,
}

#[derive(Subcommand)]
pub enum CiCommand {
    /// Run cargo fmt check
    Fmt,
    /// Run cargo clippy
    Clippy,
    /// Run cargo test
    Test,
}

impl Ci {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        match &self.command {
            Some(cmd) => cmd.run(sh),
            None => {
                CiCommand::Fmt.run(sh)?;
                CiCommand::Clippy.run(sh)?;
                CiCommand::Test.run(sh)?;
                Ok(())
            }
        }
    }
}

impl CiCommand {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        match self {
            CiCommand::Fmt => {
                eprintln!("Running cargo fmt check...");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
                Ok(())
            }
            CiCommand::Clippy => run_clippy(sh),
            CiCommand::Test => {
                eprintln!("Running cargo test...");
                cmd!(sh, "cargo test --workspace").run()?;
                Ok(())
            }
        }
    }
}

#[derive(Args)]
pub struct Fmt;

impl Fmt {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        cmd!(sh, "cargo fmt --all").run()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct Precommit;

impl Precommit {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        cmd!(sh, "cargo fmt --all -- --check").run()?;
        run_clippy(sh)?;
        eprintln!("Precommit checks passed!");
        Ok(())
    }
}

#[derive(Args)]
pub struct Test {
    #[arg(long, default_value = "dev")]
    profile: String,
}

impl Test {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        let cargo = cmd!(sh, "cargo test --workspace")
            .arg("--profile")
            .arg(&self.profile);
        cargo.run()?;
        Ok(())
    }
}

fn run_clippy(sh: &Shell) -> Result<()> {
    eprintln!("Running cargo clippy...");
    cmd!(
        sh,
        "cargo clippy --all-features --all-targets --workspace -- -D warnings"
    )
    .run()?;
    Ok(())
}
