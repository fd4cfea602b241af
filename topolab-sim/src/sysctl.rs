//! Typed access to the network sysctl parameters the emulation touches.
//!
//! These parameters are **per-namespace**: a value written inside a node's namespace only affects
//! that node. Writes are rendered as `sysctl -w` [`Cmd`]s so that they go through the same
//! [`Backend`](crate::command::Backend) as every other side effect.
//!
//! ```
//! use topolab_sim::sysctl::{self, Ip, Protocol};
//!
//! let cmd = sysctl::write_command(Ip::Forwarding, Protocol::V4, "1");
//! assert_eq!(cmd.to_string(), "sysctl -w net.ipv4.ip_forward=1");
//! ```

use crate::command::Cmd;

/// IP protocol version for sysctl paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// IPv4 (`/proc/sys/net/ipv4/...`)
    #[default]
    V4,
    /// IPv6 (`/proc/sys/net/ipv6/...`)
    V6,
}

const PROC_SYS: &str = "/proc/sys/";

/// Trait for sysctl parameters that can be read/written.
///
/// The `path` method takes a [`Protocol`] to support parameters that have
/// different paths for IPv4 and IPv6.
pub trait SysctlParam {
    /// Returns the full path to the sysctl file for the given protocol.
    fn path(&self, protocol: Protocol) -> &'static str;

    /// Returns the dotted key understood by `sysctl(8)`, e.g. `net.ipv4.ip_forward`.
    fn key(&self, protocol: Protocol) -> String {
        let path = self.path(protocol);
        path.strip_prefix(PROC_SYS).unwrap_or(path).replace('/', ".")
    }
}

/// General IP sysctl parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Ip {
    /// Enable IP forwarding (0/1).
    ///
    /// - IPv4: `/proc/sys/net/ipv4/ip_forward`
    /// - IPv6: `/proc/sys/net/ipv6/conf/all/forwarding`
    ///
    /// Default: 0 (disabled)
    Forwarding,
}

impl SysctlParam for Ip {
    fn path(&self, protocol: Protocol) -> &'static str {
        match (self, protocol) {
            (Self::Forwarding, Protocol::V4) => "/proc/sys/net/ipv4/ip_forward",
            (Self::Forwarding, Protocol::V6) => "/proc/sys/net/ipv6/conf/all/forwarding",
        }
    }
}

/// Renders a `sysctl -w key=value` command.
pub fn write_command<P: SysctlParam>(param: P, protocol: Protocol, value: &str) -> Cmd {
    Cmd::new(["sysctl".to_string(), "-w".to_string(), format!("{}={value}", param.key(protocol))])
}

/// Renders a `sysctl -n key` command, which prints the bare value.
pub fn read_command<P: SysctlParam>(param: P, protocol: Protocol) -> Cmd {
    Cmd::new(["sysctl".to_string(), "-n".to_string(), param.key(protocol)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_paths_differ_by_protocol() {
        assert_eq!(Ip::Forwarding.path(Protocol::V4), "/proc/sys/net/ipv4/ip_forward");
        assert_eq!(Ip::Forwarding.path(Protocol::V6), "/proc/sys/net/ipv6/conf/all/forwarding");
    }

    #[test]
    fn keys_are_derived_from_paths() {
        assert_eq!(Ip::Forwarding.key(Protocol::V4), "net.ipv4.ip_forward");
        assert_eq!(Ip::Forwarding.key(Protocol::V6), "net.ipv6.conf.all.forwarding");
    }

    #[test]
    fn commands_render() {
        let cmd = write_command(Ip::Forwarding, Protocol::V4, "0").in_namespace("tl-0001-ra");
        assert_eq!(cmd.to_string(), "ip netns exec tl-0001-ra sysctl -w net.ipv4.ip_forward=0");

        let cmd = read_command(Ip::Forwarding, Protocol::V4);
        assert_eq!(cmd.to_string(), "sysctl -n net.ipv4.ip_forward");
    }
}
