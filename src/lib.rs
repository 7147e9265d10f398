//! cradle — a Docker-style CLI front end for containerd hosts.
//!
//! The library half of the crate holds everything the binary dispatches to:
//! the per-daemon data store, the identifier resolver, the containerd wire
//! layer, the OCI spec assembler, the CNI network manager, the volume store,
//! the container lifecycle engine, the JSON-lines logger, and the Compose
//! driver.

pub mod compose;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod ocispec;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod volume;

pub use error::{Error, Result};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Generate a fresh 64-hex container ID from kernel entropy.
pub fn new_container_id() -> Result<String> {
    use std::fmt::Write;
    use std::io::Read;

    let mut buf = [0u8; 32];
    std::fs::File::open("/dev/urandom")?.read_exact(&mut buf)?;

    let mut id = String::with_capacity(64);
    for b in buf {
        let _ = write!(id, "{:02x}", b);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_container_id_is_64_hex() {
        let id = new_container_id().unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_container_ids_are_unique() {
        let a = new_container_id().unwrap();
        let b = new_container_id().unwrap();
        assert_ne!(a, b);
    }
}
