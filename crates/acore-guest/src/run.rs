//! Tool and evaluator execution inside the guest.
//!
//! The IaC tool runs inside the overlay as a dedicated unprivileged
//! uid; the evaluator runs afterwards as a second uid. Both get their
//! output mirrored to the serial console, and any failure is
//! summarized into the result document with the token scrubbed.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use acore_core::SecretRedactor;

use crate::cmd;
use crate::mounts::{BUNDLE_MNT, OVERLAY_MNT, RESULTS_MNT};

/// Uid the IaC tool runs as.
const TOOL_UID: u32 = 1000;
/// Uid the evaluator runs as. Distinct from the tool uid so the
/// evaluator cannot be influenced by anything the tool left running.
const VALIDATOR_UID: u32 = 2000;

/// Token file staged into the workspace by the host.
const TOKEN_FILE: &str = "gcp-access-token";
/// Credentials stub staged next to it.
const CREDS_STUB: &str = "gcp-creds.json";

/// Reads the injected access token from the workspace overlay.
///
/// # Errors
///
/// Returns a message when the token file is missing or empty.
pub fn read_token() -> Result<String, String> {
    let path = Path::new(OVERLAY_MNT).join(TOKEN_FILE);
    let token = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err("injected access token is empty".to_string());
    }
    Ok(token)
}

fn tool_env(command: &mut Command, token: &str) {
    let bundle_bin = format!("{BUNDLE_MNT}/bin");
    command
        .env_clear()
        .env("PATH", format!("{bundle_bin}:/usr/local/bin:/usr/bin:/bin"))
        .env("HOME", "/tmp")
        .env("TF_IN_AUTOMATION", "1")
        .env("GOOGLE_OAUTH_ACCESS_TOKEN", token)
        .env(
            "GOOGLE_APPLICATION_CREDENTIALS",
            format!("{OVERLAY_MNT}/{CREDS_STUB}"),
        )
        .env("http_proxy", "http://172.16.0.1:8888")
        .env("https_proxy", "http://172.16.0.1:8888");

    // Pin provider installs to the filesystem mirror when present.
    let tf_rc = format!("{BUNDLE_MNT}/config/terraform.rc");
    if Path::new(&tf_rc).exists() {
        command.env("TF_CLI_CONFIG_FILE", tf_rc);
    }
}

fn prepare_dirs() -> Result<(), String> {
    use std::os::unix::fs::chown;

    // The overlay upper layer and results must be writable by their
    // respective uids; the images are created root-owned on host.
    chown(OVERLAY_MNT, Some(TOOL_UID), Some(TOOL_UID))
        .map_err(|e| format!("chown overlay: {e}"))?;
    chown(RESULTS_MNT, Some(VALIDATOR_UID), Some(VALIDATOR_UID))
        .map_err(|e| format!("chown results: {e}"))?;
    Ok(())
}

/// Runs the IaC tool (init, then refresh-only apply) inside the
/// overlay as the tool uid.
///
/// # Errors
///
/// Returns a redacted failure summary.
pub fn run_tool(token: &str, redactor: &SecretRedactor) -> Result<(), String> {
    prepare_dirs()?;

    let tf_bin = PathBuf::from(BUNDLE_MNT).join("bin").join("terraform");
    if !tf_bin.exists() {
        return Err("terraform binary not found in validator bundle".to_string());
    }

    for (label, args) in [
        ("terraform init", vec!["init", "-input=false", "-backend=false", "-no-color"]),
        (
            "terraform apply",
            vec!["apply", "-refresh-only", "-auto-approve", "-no-color"],
        ),
    ] {
        println!("[Guest] {label}...");
        let mut command = Command::new(&tf_bin);
        command.args(&args).current_dir(OVERLAY_MNT);
        command.uid(TOOL_UID).gid(TOOL_UID);
        tool_env(&mut command, token);

        let result = cmd::stream(command).map_err(|e| format!("{label}: spawn failed: {e}"))?;
        if !result.success() {
            return Err(redactor.redact(&result.summarize(label)));
        }
    }
    Ok(())
}

/// Runs the evaluator against the state file the tool produced. The
/// evaluator writes the result document itself (atomically, onto the
/// results volume).
///
/// # Errors
///
/// Returns a redacted failure summary when the evaluator could not run
/// at all; a failing verdict is not an error here.
pub fn run_evaluator(redactor: &SecretRedactor) -> Result<bool, String> {
    let validate_bin = PathBuf::from(BUNDLE_MNT).join("bin").join("acore-validate");
    if !validate_bin.exists() {
        return Err("evaluator binary not found in validator bundle".to_string());
    }

    println!("[Guest] running evaluator...");
    let mut command = Command::new(&validate_bin);
    command
        .arg("-t")
        .arg(format!("{OVERLAY_MNT}/task.json"))
        .arg("-s")
        .arg(format!("{OVERLAY_MNT}/terraform.tfstate"))
        .arg("--success-json")
        .arg(format!("{RESULTS_MNT}/success.json"))
        .arg("--error-json")
        .arg(format!("{RESULTS_MNT}/error.json"))
        .current_dir(OVERLAY_MNT);
    command.uid(VALIDATOR_UID).gid(VALIDATOR_UID);
    command.env_clear().env("PATH", "/usr/bin:/bin").env("HOME", "/tmp");

    let result = cmd::stream(command).map_err(|e| format!("evaluator: spawn failed: {e}"))?;
    match result.code {
        // 0 = verdict passed, 1 = verdict failed; both wrote a result.
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(redactor.redact(&result.summarize("evaluator"))),
    }
}
