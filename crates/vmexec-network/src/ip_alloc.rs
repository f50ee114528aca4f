//! Deterministic, content-addressed IP allocation over a configured subnet.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use vmexec_core::error::ExecutorError;

/// Assigns IPv4 addresses within `gateway_octets[0..3].{2..=251}`, the same
/// address for the same `vm_id` every time, across any number of allocator
/// instances constructed over the same subnet and gateway.
pub struct IpAllocator {
    network: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
    allocated: Mutex<HashSet<Ipv4Addr>>,
}

const ADDRESS_SPACE: u32 = 250;
const FIRST_OFFSET: u8 = 2;

impl IpAllocator {
    /// `subnet` is a CIDR string (`"10.240.0.0/24"`), `gateway` a dotted IPv4
    /// address that must fall inside it.
    pub fn new(subnet: &str, gateway: &str) -> Result<Self> {
        let (network, prefix_len) = parse_cidr(subnet)?;
        let gateway: Ipv4Addr = gateway
            .parse()
            .with_context(|| format!("invalid gateway address: {gateway}"))?;
        if !in_subnet(gateway, network, prefix_len) {
            bail!("gateway {gateway} is not inside subnet {subnet}");
        }
        Ok(Self {
            network,
            prefix_len,
            gateway,
            allocated: Mutex::new(HashSet::new()),
        })
    }

    /// Deterministically derive and reserve an address for `vm_id`.
    pub fn allocate(&self, vm_id: &str) -> Result<String, ExecutorError> {
        let hash = Sha256::digest(vm_id.as_bytes());
        let h = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        let n = h % ADDRESS_SPACE;

        let octets = self.gateway.octets();
        let mut candidate = Ipv4Addr::new(octets[0], octets[1], octets[2], FIRST_OFFSET + n as u8);

        if candidate == self.gateway {
            let next_octet = candidate.octets()[3].checked_add(1);
            candidate = match next_octet {
                Some(o) => Ipv4Addr::new(octets[0], octets[1], octets[2], o),
                None => return Err(ExecutorError::SubnetExhausted),
            };
        }

        if !in_subnet(candidate, self.network, self.prefix_len) || candidate == self.gateway {
            return Err(ExecutorError::SubnetExhausted);
        }

        self.allocated.lock().unwrap().insert(candidate);
        Ok(candidate.to_string())
    }

    /// Unmark `ip`. A no-op for an unknown or empty address.
    pub fn release(&self, ip: &str) {
        if let Ok(addr) = ip.parse::<Ipv4Addr>() {
            self.allocated.lock().unwrap().remove(&addr);
        }
    }

    /// Dotted-quad netmask implied by the configured prefix length, for
    /// populating TAP records alongside an allocated address.
    pub fn netmask_str(&self) -> String {
        Ipv4Addr::from(prefix_mask(self.prefix_len)).to_string()
    }

    pub fn gateway_str(&self) -> String {
        self.gateway.to_string()
    }

    pub fn subnet_str(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .with_context(|| format!("not a CIDR: {cidr}"))?;
    let addr: Ipv4Addr = addr.parse().with_context(|| format!("invalid subnet address: {addr}"))?;
    let len: u8 = len.parse().with_context(|| format!("invalid prefix length: {len}"))?;
    if len > 32 {
        bail!("prefix length out of range: {len}");
    }
    let mask = prefix_mask(len);
    let network = u32::from(addr) & mask;
    Ok((Ipv4Addr::from(network), len))
}

fn prefix_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len)
    }
}

fn in_subnet(addr: Ipv4Addr, network: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = prefix_mask(prefix_len);
    (u32::from(addr) & mask) == u32::from(network)
}
