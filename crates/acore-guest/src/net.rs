//! Guest network bring-up.
//!
//! One NIC, IPv4 only, DNS pinned at the bridge gateway. Addressing is
//! static when the host passed `acore_static_ip` (the default under
//! parallel runs), otherwise DHCP against the gateway with bounded
//! retries.

use std::process::Command;

use crate::cmd;
use crate::cmdline::GuestCmdline;
use crate::mounts;

/// The single guest NIC.
const NIC: &str = "eth0";

/// DHCP attempts before giving up.
const DHCP_RETRIES: u32 = 4;

fn ip_cmd(args: &[&str]) -> Result<(), String> {
    let mut command = Command::new("ip");
    command.args(args);
    let (code, _) = cmd::capture(command);
    if code == Some(0) {
        Ok(())
    } else {
        Err(format!("ip {} failed (rc={code:?})", args.join(" ")))
    }
}

fn disable_ipv6() {
    // All-zeros rootfs images may lack the sysctl tree; best effort.
    for scope in [NIC, "all", "default"] {
        let path = format!("/proc/sys/net/ipv6/conf/{scope}/disable_ipv6");
        let _ = std::fs::write(path, "1");
    }
}

/// Brings up `lo` and the NIC per the command line contract.
///
/// # Errors
///
/// Returns a message naming the failed step.
pub fn bring_up(cmdline: &GuestCmdline) -> Result<(), String> {
    mounts::pin_resolv_conf(&cmdline.static_dns)?;

    ip_cmd(&["link", "set", "lo", "up"])?;
    ip_cmd(&["link", "set", NIC, "up"])?;
    disable_ipv6();

    if let Some(static_ip) = &cmdline.static_ip {
        println!("[Guest] static IPv4 {static_ip} via {}", cmdline.static_gw);
        ip_cmd(&["addr", "add", static_ip, "dev", NIC])?;
        ip_cmd(&["route", "add", "default", "via", &cmdline.static_gw, "dev", NIC])?;
        return Ok(());
    }

    println!("[Guest] acquiring IPv4 lease via DHCP");
    for attempt in 1..=DHCP_RETRIES {
        let mut command = Command::new("udhcpc");
        command.args(["-i", NIC, "-n", "-q", "-t", "3", "-T", "3"]);
        let (code, _) = cmd::capture(command);
        if code == Some(0) {
            return Ok(());
        }
        println!("[Guest] DHCP attempt {attempt}/{DHCP_RETRIES} failed");
    }
    Err(format!("DHCP failed after {DHCP_RETRIES} attempts"))
}
