//! Key to on-disk path mapping.
//!
//! Every blob the [`Store`](crate::store::Store) persists lives at a path
//! derived from its key. The content-addressed transform hashes the key and
//! splits the digest into fixed-width directory segments so no single
//! directory ends up holding every file.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Width of each directory segment carved out of the hex digest.
pub const SHARD_BLOCK_SIZE: usize = 5;

/// Directory segments plus terminal filename for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub shard_path: Vec<String>,
    pub filename: String,
}

impl PathKey {
    /// Path of the file relative to a namespace root.
    pub fn full_path(&self) -> PathBuf {
        let mut path: PathBuf = self.shard_path.iter().collect();
        path.push(&self.filename);
        path
    }

    /// The outermost shard directory, if the key has one.
    pub fn first_segment(&self) -> Option<&str> {
        self.shard_path.first().map(String::as_str)
    }
}

/// Strategy used to place keys on disk, picked once at construction.
#[derive(Debug, Clone, Copy, Default)]
pub enum PathTransform {
    /// SHA-1 of the key, hex encoded and split into [`SHARD_BLOCK_SIZE`] groups.
    #[default]
    ContentAddressed,
    /// Key used verbatim as both directory and filename. Test setups only.
    Identity,
    Custom(fn(&str) -> PathKey),
}

impl PathTransform {
    pub fn apply(&self, key: &str) -> PathKey {
        match self {
            PathTransform::ContentAddressed => content_addressed(key),
            PathTransform::Identity => identity(key),
            PathTransform::Custom(transform) => transform(key),
        }
    }
}

fn content_addressed(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    // The digest is ASCII hex, so byte chunks are always valid UTF-8.
    let shard_path = digest
        .as_bytes()
        .chunks(SHARD_BLOCK_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    PathKey {
        shard_path,
        filename: digest,
    }
}

fn identity(key: &str) -> PathKey {
    PathKey {
        shard_path: vec![key.to_string()],
        filename: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressed_matches_known_digest() {
        let path_key = PathTransform::ContentAddressed.apply("momsPics");

        assert_eq!(path_key.filename, "5f30a6b2beaff4a6a4eef55060bd746444ea54c6");
        assert_eq!(
            path_key.shard_path,
            vec!["5f30a", "6b2be", "aff4a", "6a4ee", "f5506", "0bd74", "6444e", "a54c6"]
        );
        assert_eq!(
            path_key.full_path(),
            PathBuf::from(
                "5f30a/6b2be/aff4a/6a4ee/f5506/0bd74/6444e/a54c6/5f30a6b2beaff4a6a4eef55060bd746444ea54c6"
            )
        );
    }

    #[test]
    fn transform_is_deterministic() {
        for key in ["", "a", "momsPics", "some/key with spaces"] {
            let first = PathTransform::ContentAddressed.apply(key);
            let second = PathTransform::ContentAddressed.apply(key);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn distinct_keys_land_in_distinct_paths() {
        let a = PathTransform::ContentAddressed.apply("picture-1");
        let b = PathTransform::ContentAddressed.apply("picture-2");
        assert_ne!(a.filename, b.filename);
        assert_ne!(a.shard_path, b.shard_path);
    }

    #[test]
    fn identity_uses_key_verbatim() {
        let path_key = PathTransform::Identity.apply("notes");
        assert_eq!(path_key.shard_path, vec!["notes"]);
        assert_eq!(path_key.filename, "notes");
        assert_eq!(path_key.first_segment(), Some("notes"));
    }

    #[test]
    fn custom_transform_is_used() {
        fn flat(key: &str) -> PathKey {
            PathKey {
                shard_path: Vec::new(),
                filename: key.to_uppercase(),
            }
        }

        let path_key = PathTransform::Custom(flat).apply("abc");
        assert_eq!(path_key.first_segment(), None);
        assert_eq!(path_key.full_path(), PathBuf::from("ABC"));
    }
}
