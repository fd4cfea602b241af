//! IPv4 interface addresses and subnets, on top of [`ipnet`].

use std::{fmt, net::Ipv4Addr, str::FromStr};

use ipnet::Ipv4Net;

use crate::error::ValidationError;

/// A subnet, composed of a network address and a netmask. Host bits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Subnet(Ipv4Net);

impl Subnet {
    /// The `0.0.0.0/0` subnet, matching every address.
    pub fn default_route() -> Self {
        Self(Ipv4Net::default())
    }

    /// Create a subnet from any address inside it. Host bits are cleared.
    pub fn new(address: Ipv4Addr, netmask: u8) -> Result<Self, ValidationError> {
        Ipv4Net::new(address, netmask)
            .map(|net| Self(net.trunc()))
            .map_err(|_| ValidationError::InvalidAddress(format!("{address}/{netmask}")))
    }

    pub fn network_address(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn netmask(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Whether `address` falls inside this subnet.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.0.contains(&address)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Subnet {
    type Err = ValidationError;

    /// Parses CIDR notation. A missing prefix is a `/32`, and `default` is `0.0.0.0/0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "default" {
            return Ok(Self::default_route());
        }

        let net = if s.contains('/') {
            s.parse::<Ipv4Net>().ok()
        } else {
            s.parse::<Ipv4Addr>().ok().map(Ipv4Net::from)
        };

        net.map(|net| Self(net.trunc())).ok_or_else(|| ValidationError::InvalidAddress(s.to_string()))
    }
}

/// An address assigned to an interface together with its prefix length, e.g. `192.168.1.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddress(Ipv4Net);

impl InterfaceAddress {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, ValidationError> {
        Ipv4Net::new(address, prefix)
            .map(Self)
            .map_err(|_| ValidationError::InvalidAddress(format!("{address}/{prefix}")))
    }

    pub fn address(&self) -> Ipv4Addr {
        self.0.addr()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// The subnet this address is directly connected to.
    pub fn subnet(&self) -> Subnet {
        Subnet(self.0.trunc())
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InterfaceAddress {
    type Err = ValidationError;

    /// Parses `a.b.c.d/p`. The prefix is mandatory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<Ipv4Net>().map(Self).map_err(|_| ValidationError::InvalidAddress(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_clears_host_bits() {
        let cases = [
            ("10.0.0.0/24", "10.0.0.0/24"),
            ("10.0.0.123/24", "10.0.0.0/24"),
            ("10.1.2.3/8", "10.0.0.0/8"),
            ("20.31.0.0/12", "20.16.0.0/12"),
            ("192.168.4.2", "192.168.4.2/32"),
            ("default", "0.0.0.0/0"),
        ];

        for (input, expected) in cases {
            let subnet: Subnet = input.parse().unwrap();
            assert_eq!(subnet.to_string(), expected, "parsing {input}");
        }
    }

    #[test]
    fn subnet_rejects_garbage() {
        let inputs = [
            "",
            "10.0.0/24",
            "10.0.0.0/33",
            "10.0.0.0/24/1",
            "10.0.0.0/x",
            "10.0.0.0/+24",
            "10.0.0.0/",
            "+10.0.0.0/24",
        ];

        for input in inputs {
            assert!(input.parse::<Subnet>().is_err(), "{input} should not parse");
        }
    }

    #[test]
    fn subnet_contains() {
        let subnet: Subnet = "192.168.2.0/24".parse().unwrap();

        assert!(subnet.contains(Ipv4Addr::new(192, 168, 2, 1)));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 2, 255)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 3, 1)));
        assert!(Subnet::default_route().contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn interface_address_requires_prefix() {
        let addr: InterfaceAddress = "192.168.4.1/24".parse().unwrap();
        assert_eq!(addr.address(), Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(addr.prefix_len(), 24);
        assert_eq!(addr.subnet().to_string(), "192.168.4.0/24");
        assert_eq!(addr.to_string(), "192.168.4.1/24");

        for input in ["192.168.4.1", "192.168.4.1/+24", "192.168.4.1/33"] {
            assert!(input.parse::<InterfaceAddress>().is_err(), "{input} should not parse");
        }
    }
}
