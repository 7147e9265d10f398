//! Automatic subnet allocation for created networks.
//!
//! Networks without an explicit `--subnet` get the first free /24 out of
//! 10.4.0.0/16, scanning the existing configurations for collisions.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Base of the allocation pool.
const POOL_BASE: [u8; 2] = [10, 4];

/// A /24 subnet with its conventional gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub cidr: String,
    pub gateway: String,
}

impl Subnet {
    fn nth(n: u8) -> Self {
        Self {
            cidr: format!("{}.{}.{}.0/24", POOL_BASE[0], POOL_BASE[1], n),
            gateway: format!("{}.{}.{}.1", POOL_BASE[0], POOL_BASE[1], n),
        }
    }
}

/// Parse `a.b.c.d/len` into (network address, prefix length).
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr_s, len_s) = s
        .split_once('/')
        .ok_or_else(|| Error::invalid(format!("invalid subnet {:?}: expected CIDR", s)))?;
    let addr: Ipv4Addr = addr_s
        .parse()
        .map_err(|_| Error::invalid(format!("invalid subnet address {:?}", addr_s)))?;
    let len: u8 = len_s
        .parse()
        .map_err(|_| Error::invalid(format!("invalid prefix length {:?}", len_s)))?;
    if len > 32 {
        return Err(Error::invalid(format!("invalid prefix length {}", len)));
    }
    Ok((addr, len))
}

/// First usable host address of a subnet, used as the default gateway.
/// /31 and /32 have no host address to hand out.
pub fn default_gateway(cidr: &str) -> Result<String> {
    let (addr, len) = parse_cidr(cidr)?;
    if len >= 31 {
        return Err(Error::invalid(format!(
            "subnet {} has no usable host address",
            cidr
        )));
    }
    let gw = u32::from(addr).checked_add(1).ok_or_else(|| {
        Error::invalid(format!("subnet {} has no usable host address", cidr))
    })?;
    Ok(Ipv4Addr::from(gw).to_string())
}

/// Whether two CIDR ranges share any address.
pub fn overlaps(a: (Ipv4Addr, u8), b: (Ipv4Addr, u8)) -> bool {
    let shorter = a.1.min(b.1);
    if shorter == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - shorter);
    (u32::from(a.0) & mask) == (u32::from(b.0) & mask)
}

/// Pick the first /24 from the pool that does not overlap any subnet in
/// `used`. Unparseable entries in `used` are skipped.
pub fn allocate(used: &[String]) -> Result<Subnet> {
    let parsed: Vec<(Ipv4Addr, u8)> =
        used.iter().filter_map(|s| parse_cidr(s).ok()).collect();

    for n in 0..=u8::MAX {
        let candidate = Subnet::nth(n);
        let cand = parse_cidr(&candidate.cidr)?;
        if !parsed.iter().any(|&u| overlaps(cand, u)) {
            return Ok(candidate);
        }
    }
    Err(Error::invalid(format!(
        "subnet pool {}.{}.0.0/16 exhausted",
        POOL_BASE[0], POOL_BASE[1]
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_first_free() {
        let s = allocate(&[]).unwrap();
        assert_eq!(s.cidr, "10.4.0.0/24");
        assert_eq!(s.gateway, "10.4.0.1");
    }

    #[test]
    fn test_allocate_skips_used() {
        let used = vec!["10.4.0.0/24".to_string(), "10.4.1.0/24".to_string()];
        assert_eq!(allocate(&used).unwrap().cidr, "10.4.2.0/24");
    }

    #[test]
    fn test_allocate_skips_overlapping_supernet() {
        let used = vec!["10.4.0.0/23".to_string()];
        assert_eq!(allocate(&used).unwrap().cidr, "10.4.2.0/24");
    }

    #[test]
    fn test_allocate_ignores_foreign_ranges() {
        let used = vec!["192.168.5.0/24".to_string(), "garbage".to_string()];
        assert_eq!(allocate(&used).unwrap().cidr, "10.4.0.0/24");
    }

    #[test]
    fn test_default_gateway() {
        assert_eq!(default_gateway("192.168.5.0/24").unwrap(), "192.168.5.1");
    }

    #[test]
    fn test_default_gateway_rejects_degenerate_prefixes() {
        assert!(default_gateway("10.0.0.0/31").is_err());
        assert!(default_gateway("10.0.0.0/32").is_err());
        // All-ones address must not wrap around to 0.0.0.0.
        assert!(default_gateway("255.255.255.255/32").is_err());
        assert!(default_gateway("255.255.255.255/24").is_err());
    }

    #[test]
    fn test_parse_cidr_rejects_garbage() {
        assert!(parse_cidr("10.4.0.0").is_err());
        assert!(parse_cidr("10.4.0.0/33").is_err());
        assert!(parse_cidr("ten/24").is_err());
    }
}
