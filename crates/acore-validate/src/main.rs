//! acore-validate - invariant evaluator CLI.
//!
//! Runs inside the microVM (as a dedicated unprivileged uid) against
//! the state file the IaC tool produced, and writes exactly one result
//! document to the results volume: `success.json` when every invariant
//! passed, `error.json` otherwise. Both writes are atomic so the host
//! never observes a partial result.
//!
//! The process exit code mirrors the verdict: 0 on pass, 1 on fail.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use acore_core::fs_safe::atomic_write_json;
use acore_core::{evaluate, StateDoc, TaskSpec, Verdict};
use anyhow::Context;
use clap::Parser;

/// Evaluate task invariants against a provider state file.
#[derive(Parser, Debug)]
#[command(name = "acore-validate", version, about)]
struct Args {
    /// Path to the task spec JSON.
    #[arg(short = 't', long)]
    task: PathBuf,

    /// Path to the provider state file.
    #[arg(short = 's', long)]
    state: PathBuf,

    /// Where to write the result document on pass.
    #[arg(long)]
    success_json: PathBuf,

    /// Where to write the result document on fail.
    #[arg(long)]
    error_json: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<Verdict> {
    let task_raw = fs::read_to_string(&args.task)
        .with_context(|| format!("cannot read task spec at {}", args.task.display()))?;
    let spec = TaskSpec::from_json(&task_raw).context("task spec rejected")?;

    let state_raw = fs::read_to_string(&args.state)
        .with_context(|| format!("cannot read state file at {}", args.state.display()))?;
    let state = StateDoc::parse(&state_raw).context("state file rejected")?;

    Ok(evaluate(&spec.invariants, &state))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let verdict = match run(&args) {
        Ok(verdict) => verdict,
        // Setup failures (unreadable inputs, malformed documents) are
        // fail-closed results, not crashes: the host must always find
        // a result document.
        Err(err) => Verdict::fail_closed(format!("{err:#}")),
    };

    for outcome in &verdict.detail {
        let status = if outcome.passed { "PASS" } else { "FAIL" };
        match &outcome.reason {
            Some(reason) => println!("[Validator] {status} {} ({}): {reason}", outcome.id, outcome.kind),
            None => println!("[Validator] {status} {} ({})", outcome.id, outcome.kind),
        }
    }
    println!(
        "[Validator] {}/{} invariants passed, score={}",
        verdict.passed_invariants, verdict.total_invariants, verdict.score
    );

    let target = if verdict.passed() {
        &args.success_json
    } else {
        &args.error_json
    };
    if let Err(err) = atomic_write_json(target, &verdict) {
        eprintln!("[Validator] failed to write result to {}: {err}", target.display());
        return ExitCode::from(2);
    }

    if verdict.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
