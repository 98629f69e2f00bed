//! Network identity and address discovery.
//!
//! A VM's MAC address is a pure function of its name, which lets the host
//! neighbor table be searched for the guest after DHCP without talking to the
//! guest at all.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::vm::tools;

/// Organizationally unique prefix for every derived address.
/// The locally-administered bit is set and the multicast bit is clear.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Derive the address for `name`.
    ///
    /// The last three octets are the first byte of SHA-256 over the name
    /// and over two salted variants of it (`#nic`, `#mac`).
    pub fn for_vm(name: &str) -> Self {
        let byte = |input: &str| Sha256::digest(input.as_bytes())[0];
        let [a, b, c] = MAC_PREFIX;
        Self([
            a,
            b,
            c,
            byte(name),
            byte(&format!("{name}#nic")),
            byte(&format!("{name}#mac")),
        ])
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacError(String);

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for ParseMacError {}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `:`-separated octets of one or two hex digits, the way BSD
    /// `arp` prints them (`52:54:0:a:1b:c`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseMacError(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for slot in &mut octets {
            let part = parts.next().ok_or_else(bad)?;
            if part.is_empty() || part.len() > 2 {
                return Err(bad());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| bad())?;
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self(octets))
    }
}

// ---------------------------------------------------------------------------
// Address discovery
// ---------------------------------------------------------------------------

/// Find the IPv4 address bound to `mac` in `arp -an` output.
///
/// Lines look like `? (192.168.64.5) at 52:54:0:ab:cd:ef on bridge100 ...`.
/// Hardware addresses compare case-insensitively; incomplete entries are
/// skipped.
pub fn parse_neighbor_table(output: &str, mac: &MacAddress) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let open = line.find('(')?;
        let close = open + line[open..].find(')')?;
        let ip: Ipv4Addr = line[open + 1..close].parse().ok()?;

        let rest = line[close + 1..].trim_start().strip_prefix("at ")?;
        let hw = rest.split_whitespace().next()?;
        let found: MacAddress = hw.to_ascii_lowercase().parse().ok()?;
        (found == *mac).then_some(ip)
    })
}

/// Look up the current address of VM `name` in the host neighbor table.
///
/// `None` means not yet known: the guest may still be in DHCP or the cache
/// may not be populated. Callers retry later.
pub fn discover_address(arp: &str, name: &str) -> Option<Ipv4Addr> {
    let mac = MacAddress::for_vm(name);
    let output = match tools::run(arp, ["-an"], "neighbor table lookup") {
        Ok(out) => out,
        Err(e) => {
            debug!(vm = name, "neighbor table lookup failed: {e}");
            return None;
        }
    };

    let ip = parse_neighbor_table(&output, &mac);
    debug!(vm = name, %mac, ip = ?ip, "address discovery");
    ip
}
