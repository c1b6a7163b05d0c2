//! acore-guest - init process of the validation microVM.
//!
//! Boots as PID 1 and walks a fixed sequence: pseudo-filesystem
//! mounts, network bring-up, optional egress self-checks, volume and
//! overlay mounts, the IaC tool, the evaluator, then sync/unmount and
//! power-off. The stage context is updated before each step so a
//! failure always writes an `error.json` naming the stage that broke,
//! and the host finds at most one result document on the results
//! volume (none at all reads as failure too).

mod checks;
mod cmd;
mod cmdline;
mod mounts;
mod net;
mod run;

use std::path::Path;

use acore_core::fs_safe::atomic_write_json;
use acore_core::{SecretRedactor, Verdict};
use cmdline::GuestCmdline;

/// Writes a fail-closed result document, best effort.
fn write_error(redactor: &SecretRedactor, stage: &str, detail: &str) {
    let msg = redactor.redact(&format!("{stage}: {detail}"));
    eprintln!("[Guest] ERROR {msg}");

    let results = Path::new(mounts::RESULTS_MNT);
    if results.is_dir() {
        let verdict = Verdict::fail_closed(msg);
        if let Err(err) = atomic_write_json(&results.join("error.json"), &verdict) {
            eprintln!("[Guest] failed to write error.json: {err}");
        }
    }
}

/// Powers the VM off. As PID 1 there is nothing to return to.
fn power_off() -> ! {
    nix::unistd::sync();
    let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF);
    // Reboot only fails outside a VM (tests, containers); spin so the
    // supervisor's timeout still fires.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn main() -> ! {
    println!("[Guest] acore guest runner starting");

    let mut redactor = SecretRedactor::new();
    let mut stage = "mounts";

    let outcome = (|| -> Result<(), String> {
        mounts::mount_pseudo()?;
        // Results volume first, so every later failure can still
        // deliver an error.json to the host.
        mounts::mount_results()?;

        stage = "network";
        let cmdline = GuestCmdline::from_proc();
        net::bring_up(&cmdline)?;

        stage = "net-checks";
        if cmdline.net_checks {
            checks::run_all(cmdline.net_check_timeout_s)
                .map_err(|(check, detail)| format!("egress check '{check}' failed: {detail}"))?;
        }

        stage = "volumes";
        mounts::mount_volumes()?;
        mounts::mount_overlay()?;

        stage = "credentials";
        let token = run::read_token()?;
        redactor.add_secret(token.clone());

        stage = "tool";
        run::run_tool(&token, &redactor)?;

        stage = "evaluator";
        let passed = run::run_evaluator(&redactor)?;
        println!(
            "[Guest] evaluator finished: {}",
            if passed { "pass" } else { "fail" }
        );
        Ok(())
    })();

    if let Err(detail) = outcome {
        write_error(&redactor, stage, &detail);
    }

    mounts::release_results();
    println!("[Guest] done, powering off");
    power_off()
}
