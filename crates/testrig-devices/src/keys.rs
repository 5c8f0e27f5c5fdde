/*!
 * Credential keys shipped with extension packages.
 *
 * Keys are downloaded out of band into `<key_directory>/<package>/<file_name>`.
 * The core only checks that they are present.
 */
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// What a key file is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Private half of an SSH key pair
    SshPrivate,
    /// Public half of an SSH key pair
    SshPublic,
    /// Anything else
    Other,
}

/// A credential file a package expects on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyInfo {
    /// File name within the package key directory
    pub file_name: String,
    /// Key kind
    pub kind: KeyKind,
    /// Owning package
    pub package: String,
}

impl KeyInfo {
    /// Describe a key
    pub fn new<F: Into<String>, P: Into<String>>(file_name: F, kind: KeyKind, package: P) -> Self {
        Self {
            file_name: file_name.into(),
            kind,
            package: package.into(),
        }
    }

    /// `package/file_name`
    pub fn id(&self) -> String {
        format!("{}/{}", self.package, self.file_name)
    }

    /// Where the key is expected under `key_dir`
    pub fn local_path(&self, key_dir: &Path) -> PathBuf {
        key_dir.join(&self.package).join(&self.file_name)
    }
}

impl fmt::Display for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Return the key's local path, or `MissingCredential` if the file is absent
pub fn check_key(key: &KeyInfo, key_dir: &Path) -> Result<PathBuf> {
    let path = key.local_path(key_dir);
    if path.is_file() {
        Ok(path)
    } else {
        Err(DeviceError::MissingCredential { key: key.id(), path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_check_key() {
        let dir = tempdir().unwrap();
        let key = KeyInfo::new("id_switch", KeyKind::SshPrivate, "acme");
        assert_eq!(key.local_path(dir.path()), dir.path().join("acme").join("id_switch"));

        match check_key(&key, dir.path()) {
            Err(DeviceError::MissingCredential { key: id, path }) => {
                assert_eq!(id, "acme/id_switch");
                assert_eq!(path, dir.path().join("acme/id_switch"));
            }
            other => panic!("unexpected {:?}", other),
        }

        std::fs::create_dir_all(dir.path().join("acme")).unwrap();
        std::fs::write(dir.path().join("acme/id_switch"), "key").unwrap();
        assert_eq!(check_key(&key, dir.path()).unwrap(), dir.path().join("acme/id_switch"));
    }

    #[test]
    fn test_key_kind_serialization() {
        let json = serde_json::to_string(&KeyKind::SshPrivate).unwrap();
        assert_eq!(json, "\"ssh_private\"");
    }
}
