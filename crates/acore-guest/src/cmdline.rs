//! Kernel command line contract with the host.
//!
//! The sandbox runner passes feature flags as `key=value` tokens on
//! the kernel command line; there is no in-band control channel.
//! Absent keys default to DHCP and no probes.

/// Parsed `acore_*` keys from the kernel command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCmdline {
    /// Run the egress self-checks before touching the workspace.
    pub net_checks: bool,
    /// Per-probe timeout in seconds.
    pub net_check_timeout_s: u32,
    /// Static IPv4 in CIDR form; `None` means DHCP.
    pub static_ip: Option<String>,
    /// Default gateway for static addressing.
    pub static_gw: String,
    /// DNS server, always pinned to the bridge gateway by default.
    pub static_dns: String,
}

impl Default for GuestCmdline {
    fn default() -> Self {
        Self {
            net_checks: false,
            net_check_timeout_s: 5,
            static_ip: None,
            static_gw: "172.16.0.1".to_string(),
            static_dns: "172.16.0.1".to_string(),
        }
    }
}

impl GuestCmdline {
    /// Parses a raw command line string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for token in raw.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "acore_net_checks" => out.net_checks = value == "1",
                "acore_net_check_timeout" => {
                    if let Ok(parsed) = value.parse::<u32>() {
                        out.net_check_timeout_s = parsed.max(1);
                    }
                }
                "acore_static_ip" => {
                    if !value.is_empty() {
                        out.static_ip = Some(value.to_string());
                    }
                }
                "acore_static_gw" => out.static_gw = value.to_string(),
                "acore_static_dns" => out.static_dns = value.to_string(),
                _ => {}
            }
        }
        out
    }

    /// Reads and parses `/proc/cmdline`.
    #[must_use]
    pub fn from_proc() -> Self {
        match std::fs::read_to_string("/proc/cmdline") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_keys_default_to_dhcp_and_no_probes() {
        let cmdline = GuestCmdline::parse("console=ttyS0 reboot=k panic=1 pci=off");
        assert_eq!(cmdline, GuestCmdline::default());
        assert!(!cmdline.net_checks);
        assert!(cmdline.static_ip.is_none());
    }

    #[test]
    fn parses_all_acore_keys() {
        let cmdline = GuestCmdline::parse(
            "console=ttyS0 acore_net_checks=1 acore_net_check_timeout=9 \
             acore_static_ip=172.16.0.5/24 acore_static_gw=172.16.0.1 acore_static_dns=172.16.0.1",
        );
        assert!(cmdline.net_checks);
        assert_eq!(cmdline.net_check_timeout_s, 9);
        assert_eq!(cmdline.static_ip.as_deref(), Some("172.16.0.5/24"));
        assert_eq!(cmdline.static_gw, "172.16.0.1");
    }

    #[test]
    fn empty_static_ip_means_dhcp() {
        let cmdline = GuestCmdline::parse("acore_static_ip=");
        assert!(cmdline.static_ip.is_none());
    }

    #[test]
    fn net_checks_zero_is_off() {
        let cmdline = GuestCmdline::parse("acore_net_checks=0");
        assert!(!cmdline.net_checks);
    }
}
