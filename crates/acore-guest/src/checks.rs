//! Guest egress-policy self-checks.
//!
//! A deterministic probe suite that proves the sandbox network policy
//! is actually in force before any tool code runs. Every probe must
//! succeed, in order; the first failure names the broken check and the
//! job fails. The suite is only run when the host asked for it on the
//! kernel command line.

use std::net::ToSocketAddrs;
use std::process::Command;

use crate::cmd;

/// Bridge gateway as seen from the guest.
const GATEWAY: &str = "172.16.0.1";

/// Allowlisting proxy bound on the gateway.
const PROXY_URL: &str = "http://172.16.0.1:8888";

/// An allowlisted API host.
const ALLOWED_URL: &str = "https://www.googleapis.com/discovery/v1/apis";

/// A second allowlisted host.
const ALLOWED_HOST_URL: &str = "https://compute.googleapis.com/";

/// A host outside the allowlist.
const BLOCKED_HOST: &str = "example.com";

/// The cloud metadata endpoint that must never be reachable.
const METADATA_URL: &str = "http://169.254.169.254/latest/meta-data";

fn resolve_ipv4(host: &str) -> Option<String> {
    let addrs = (host, 443u16).to_socket_addrs().ok()?;
    addrs
        .filter(|a| a.is_ipv4())
        .map(|a| a.ip().to_string())
        .next()
}

/// `curl -w %{http_code}`; "000" means no HTTP response at all.
fn http_code(url: &str, timeout_s: u32, via_proxy: bool) -> String {
    let mut command = Command::new("curl");
    command.args([
        "-s",
        "-o",
        "/dev/null",
        "-w",
        "%{http_code}",
        "--max-time",
        &timeout_s.max(1).to_string(),
        url,
    ]);
    if via_proxy {
        command.env("http_proxy", PROXY_URL);
        command.env("https_proxy", PROXY_URL);
    } else {
        command.env_remove("http_proxy");
        command.env_remove("https_proxy");
    }
    let (_, out) = cmd::capture(command);
    let code = out.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_digit()) {
        code.to_string()
    } else {
        "000".to_string()
    }
}

/// Runs every probe in order; returns the failed check's name and
/// detail on the first violation.
///
/// # Errors
///
/// Returns `(check_name, detail)` for the failing probe.
pub fn run_all(timeout_s: u32) -> Result<(), (String, String)> {
    let fail = |name: &str, detail: String| Err((name.to_string(), detail));

    // 1. Direct egress without the proxy must be blocked.
    let direct = http_code(ALLOWED_URL, timeout_s, false);
    println!("[Guest] check direct-egress-blocked: HTTP {direct}");
    if direct == "200" {
        return fail(
            "direct-egress-blocked",
            format!("direct egress to {ALLOWED_URL} returned HTTP 200"),
        );
    }

    // 2. DNS resolves for allowlisted domains.
    for host in ["googleapis.com", "compute.googleapis.com"] {
        let resolved = resolve_ipv4(host).unwrap_or_default();
        println!("[Guest] check dns-allowlist: {host} -> {resolved:?}");
        if resolved.is_empty() || resolved == "0.0.0.0" {
            return fail(
                "dns-allowlist",
                format!("{host} resolved to {resolved:?}"),
            );
        }
    }

    // 3. DNS sinkholes everything else.
    let sinkholed = resolve_ipv4(BLOCKED_HOST).unwrap_or_default();
    println!("[Guest] check dns-sinkhole: {BLOCKED_HOST} -> {sinkholed:?}");
    if !sinkholed.is_empty() && sinkholed != "0.0.0.0" {
        return fail(
            "dns-sinkhole",
            format!("{BLOCKED_HOST} resolved to {sinkholed}"),
        );
    }

    // 4. Allowlisted egress through the proxy succeeds.
    let allowed = http_code(ALLOWED_URL, timeout_s, true);
    println!("[Guest] check proxy-allowlist: HTTP {allowed}");
    if allowed != "200" {
        return fail(
            "proxy-allowlist",
            format!("{ALLOWED_URL} via proxy returned HTTP {allowed}"),
        );
    }
    let second = http_code(ALLOWED_HOST_URL, timeout_s, true);
    println!("[Guest] check proxy-allowlist: compute HTTP {second}");
    if second == "000" {
        return fail(
            "proxy-allowlist",
            format!("{ALLOWED_HOST_URL} not reachable via proxy"),
        );
    }

    // 5. Non-allowlisted egress through the proxy fails.
    for url in [
        &format!("http://{BLOCKED_HOST}"),
        &format!("https://{BLOCKED_HOST}"),
    ] {
        let blocked = http_code(url, timeout_s, true);
        println!("[Guest] check proxy-denylist: {url} -> HTTP {blocked}");
        if blocked == "200" {
            return fail(
                "proxy-denylist",
                format!("{url} via proxy returned HTTP 200"),
            );
        }
    }

    // 6. The metadata endpoint is unreachable, directly and via proxy.
    let mut direct_meta = Command::new("curl");
    direct_meta.args(["-sS", "--max-time", "2", METADATA_URL]);
    direct_meta.env_remove("http_proxy");
    direct_meta.env_remove("https_proxy");
    let (meta_rc, _) = cmd::capture(direct_meta);
    println!("[Guest] check metadata-blocked: direct rc={meta_rc:?}");
    if meta_rc == Some(0) {
        return fail(
            "metadata-blocked",
            "metadata endpoint answered without proxy".to_string(),
        );
    }
    let meta_proxy = http_code(METADATA_URL, timeout_s, true);
    println!("[Guest] check metadata-blocked: via proxy HTTP {meta_proxy}");
    if meta_proxy == "200" {
        return fail(
            "metadata-blocked",
            "metadata endpoint returned HTTP 200 via proxy".to_string(),
        );
    }

    println!("[Guest] all egress-policy checks passed");
    Ok(())
}
