use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for viewspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run fmt, clippy, tests, doc and a simulation smoke run
    Check,
    /// Run cargo fmt --check on all crates
    Fmt,
    /// Run clippy on all crates
    Clippy,
    /// Run all tests
    Test,
    /// Run the space benchmarks
    Bench,
    /// Build rustdoc for the workspace
    Doc,
    /// Run a short simulation through the CLI
    Smoke,
}

/// Run one cargo step, failing with `what` if it exits non-zero.
fn cargo(what: &str, args: &[&str]) -> Result<()> {
    println!("==> Running cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn run(command: &Commands) -> Result<()> {
    match command {
        Commands::Check => {
            for step in [
                Commands::Fmt,
                Commands::Clippy,
                Commands::Test,
                Commands::Doc,
                Commands::Smoke,
            ] {
                run(&step)?;
            }
            Ok(())
        }
        Commands::Fmt => cargo("cargo fmt check", &["fmt", "--all", "--", "--check"]),
        Commands::Clippy => cargo(
            "cargo clippy",
            &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        ),
        Commands::Test => cargo("cargo test", &["test", "--workspace"]),
        Commands::Bench => cargo(
            "space benchmarks",
            &["bench", "-p", "viewspace-stream", "--bench", "bench_spaces"],
        ),
        Commands::Doc => cargo("cargo doc", &["doc", "--workspace", "--no-deps"]),
        Commands::Smoke => cargo(
            "simulation smoke run",
            &[
                "run", "-p", "viewspace-cli", "--", "simulate", "--viewers", "2", "--cells", "64",
                "--steps", "20",
            ],
        ),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(&cli.command)
}
