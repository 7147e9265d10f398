//! Identifier resolution.
//!
//! A user token resolves to exactly one container or image. Precedence:
//! exact name, then exact full ID, then unique ID prefix (minimum 3 chars).
//! Zero matches is `not found`; more than one is `ambiguous`. The resolver
//! returns sets and decides nothing about what the caller does next.

use crate::error::{Error, Result};
use crate::store::{ContainerRecord, DataStore};

/// Minimum length for an ID prefix match.
pub const MIN_PREFIX: usize = 3;

/// A known image, as listed from containerd.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ImageRef {
    /// Image reference (e.g. `docker.io/library/alpine:latest`).
    pub name: String,
    /// Target digest (`sha256:…`).
    pub digest: String,
}

impl ImageRef {
    /// Hex part of the digest, used for prefix matching.
    pub fn digest_hex(&self) -> &str {
        self.digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&self.digest)
    }
}

/// Resolve a token against the containers of the current namespace.
pub fn resolve_container(store: &DataStore, token: &str) -> Result<ContainerRecord> {
    // 1. exact name
    if let Some(id) = store.lookup_name(token) {
        if let Some(record) = store.load_record(&id)? {
            return Ok(record);
        }
    }

    let records = store.list_records()?;

    // 2. exact full ID
    if let Some(record) = records.iter().find(|r| r.id == token) {
        return Ok(record.clone());
    }

    // 3. unique ID prefix
    if token.len() >= MIN_PREFIX && token.chars().all(|c| c.is_ascii_hexdigit()) {
        let matches: Vec<&ContainerRecord> =
            records.iter().filter(|r| r.id.starts_with(token)).collect();
        match matches.len() {
            0 => {}
            1 => return Ok(matches[0].clone()),
            n => {
                return Err(Error::AmbiguousPrefix {
                    kind: "container",
                    token: token.to_string(),
                    count: n,
                })
            }
        }
    }

    Err(Error::ContainerNotFound(token.to_string()))
}

/// Resolve a token against a list of images.
pub fn resolve_image(images: &[ImageRef], token: &str) -> Result<ImageRef> {
    // 1. exact name (with and without the implied :latest)
    let with_tag = if token.contains(':') {
        token.to_string()
    } else {
        format!("{}:latest", token)
    };
    if let Some(img) = images
        .iter()
        .find(|i| i.name == token || i.name == with_tag)
    {
        return Ok(img.clone());
    }

    // 2. exact digest
    if let Some(img) = images
        .iter()
        .find(|i| i.digest == token || i.digest_hex() == token)
    {
        return Ok(img.clone());
    }

    // 3. unique digest prefix
    if token.len() >= MIN_PREFIX && token.chars().all(|c| c.is_ascii_hexdigit()) {
        let matches: Vec<&ImageRef> = images
            .iter()
            .filter(|i| i.digest_hex().starts_with(token))
            .collect();
        match matches.len() {
            0 => {}
            1 => return Ok(matches[0].clone()),
            n => {
                return Err(Error::AmbiguousPrefix {
                    kind: "image",
                    token: token.to_string(),
                    count: n,
                })
            }
        }
    }

    Err(Error::ImageNotFound(token.to_string()))
}

/// What an `inspect` token resolved to.
#[derive(Debug, Clone)]
pub enum Resolved {
    Container(Box<ContainerRecord>),
    Image(ImageRef),
}

/// Resolve a token against containers and images at once; a token matching
/// entities of both kinds is an error the caller cannot recover from.
pub fn resolve_any(store: &DataStore, images: &[ImageRef], token: &str) -> Result<Resolved> {
    let container = resolve_container(store, token);
    let image = resolve_image(images, token);

    match (container, image) {
        (Ok(_), Ok(_)) => Err(Error::invalid(format!(
            "{:?} matches both a container and an image; use a longer identifier",
            token
        ))),
        (Ok(c), Err(_)) => Ok(Resolved::Container(Box::new(c))),
        (Err(_), Ok(i)) => Ok(Resolved::Image(i)),
        // Ambiguity within one kind outranks plain not-found in the other.
        (Err(e @ Error::AmbiguousPrefix { .. }), Err(_)) => Err(e),
        (Err(_), Err(e @ Error::AmbiguousPrefix { .. })) => Err(e),
        (Err(e), Err(_)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalOptions;
    use crate::store::ContainerRecord;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> DataStore {
        let opts = GlobalOptions {
            data_root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        DataStore::open(&opts).unwrap()
    }

    fn add(store: &DataStore, id: &str, name: Option<&str>) {
        let mut r = ContainerRecord::new(id, "default");
        if let Some(n) = name {
            r.name = Some(n.to_string());
            store.reserve_name(n, id).unwrap();
        }
        store.create_record(&r).unwrap();
    }

    #[test]
    fn test_exact_name_wins() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        add(&s, &format!("abc{}", "0".repeat(61)), Some("web"));
        // A second container whose ID starts with "web" would lose to the name.
        let r = resolve_container(&s, "web").unwrap();
        assert_eq!(r.name.as_deref(), Some("web"));
    }

    #[test]
    fn test_exact_name_beats_id_prefix() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        // Container named "abc" and a different container whose ID starts abc.
        let named_id = format!("fff{}", "0".repeat(61));
        add(&s, &named_id, Some("abc"));
        add(&s, &format!("abc{}", "1".repeat(61)), None);

        let r = resolve_container(&s, "abc").unwrap();
        assert_eq!(r.id, named_id, "exact name must beat ID prefix");
    }

    #[test]
    fn test_unique_prefix_resolves() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let id = format!("deadbe{}", "0".repeat(58));
        add(&s, &id, None);
        let r = resolve_container(&s, "dea").unwrap();
        assert_eq!(r.id, id);
    }

    #[test]
    fn test_ambiguous_prefix_errors() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        add(&s, &format!("abc1{}", "0".repeat(60)), None);
        add(&s, &format!("abc2{}", "0".repeat(60)), None);
        let err = resolve_container(&s, "abc").unwrap_err();
        assert!(matches!(err, Error::AmbiguousPrefix { count: 2, .. }));
    }

    #[test]
    fn test_prefix_shorter_than_minimum_not_matched() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        add(&s, &format!("ab{}", "0".repeat(62)), None);
        let err = resolve_container(&s, "ab").unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(_)));
    }

    #[test]
    fn test_image_name_with_implied_latest() {
        let images = vec![ImageRef {
            name: "docker.io/library/alpine:latest".into(),
            digest: "sha256:abcd0000".into(),
        }];
        assert!(resolve_image(&images, "docker.io/library/alpine").is_ok());
        assert!(resolve_image(&images, "docker.io/library/alpine:latest").is_ok());
        assert!(resolve_image(&images, "alpine:3.20").is_err());
    }

    #[test]
    fn test_image_digest_prefix() {
        let images = vec![
            ImageRef {
                name: "a:latest".into(),
                digest: "sha256:1234aa".into(),
            },
            ImageRef {
                name: "b:latest".into(),
                digest: "sha256:1299bb".into(),
            },
        ];
        assert_eq!(resolve_image(&images, "1234").unwrap().name, "a:latest");
        let err = resolve_image(&images, "12").unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));
    }

    #[test]
    fn test_inspect_both_kinds_is_error() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        add(&s, &"9".repeat(64), Some("alpine"));
        let images = vec![ImageRef {
            name: "alpine:latest".into(),
            digest: "sha256:77".into(),
        }];
        let err = resolve_any(&s, &images, "alpine").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
