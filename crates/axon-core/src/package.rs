//! Package descriptors, discovery, and content identifiers
//!
//! Two identifier schemes coexist. The legacy scheme identifies a
//! package by a size-derived checkcode (a `u32`), which is cheap but
//! collision-prone. The generalized scheme hashes the file with SHA-256
//! and compares hex digests. Which one a session uses depends on the
//! peer's negotiated capability level.

use crate::Status;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Protocol-level package category for the legacy check round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    /// The operator kernel package.
    Kernel,
    /// The extension kernel package (capability-gated).
    ExtendKernel,
}

impl PackageKind {
    pub fn as_u32(self) -> u32 {
        match self {
            PackageKind::Kernel => 0,
            PackageKind::ExtendKernel => 1,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PackageKind::Kernel),
            1 => Some(PackageKind::ExtendKernel),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageKind::Kernel => f.write_str("kernel"),
            PackageKind::ExtendKernel => f.write_str("extend_kernel"),
        }
    }
}

/// Content identifier of a package file under one of the two schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageIdent {
    /// Legacy size-derived checkcode.
    Checkcode(u32),
    /// SHA-256 hex digest.
    Hash(String),
}

impl std::fmt::Display for PackageIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageIdent::Checkcode(code) => write!(f, "checkcode:{code:#010x}"),
            PackageIdent::Hash(hex) => write!(f, "sha256:{hex}"),
        }
    }
}

/// A package file located on the host, ready for comparison and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    /// File name (no directory components), as referenced on the wire.
    pub name: String,
    /// Absolute path on the host.
    pub path: PathBuf,
    /// Directory under the device install root where the file lands.
    pub device_subdir: String,
    /// Whether absence on the host is tolerated.
    pub optional: bool,
}

impl PackageDescriptor {
    /// Compute this package's legacy checkcode.
    pub fn checkcode(&self) -> Result<u32, Status> {
        file_checkcode(&self.path)
    }

    /// Compute this package's SHA-256 hex digest.
    pub fn sha256_hex(&self) -> Result<String, Status> {
        file_sha256_hex(&self.path)
    }
}

/// Legacy checkcode: the file size truncated to 32 bits.
///
/// Collisions between different builds of the same size are possible;
/// the generalized hash scheme exists to replace this.
pub fn file_checkcode(path: &Path) -> Result<u32, Status> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.len() as u32)
}

/// SHA-256 of the file's contents as a lowercase hex string.
pub fn file_sha256_hex(path: &Path) -> Result<String, Status> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One entry in the package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File-name pattern, e.g. `"udf-compat-*.tar.gz"`. A single `*`
    /// wildcard is supported.
    pub pattern: String,
    /// Host directory searched for the pattern, relative to the install
    /// root unless absolute.
    pub host_dir: String,
    /// Directory under the device install root where the file lands.
    pub device_subdir: String,
    /// Missing packages are skipped instead of failing the sync.
    #[serde(default)]
    pub optional: bool,
}

/// TOML manifest listing the packages the config-driven sync scheme
/// keeps mirrored on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default, rename = "package")]
    pub packages: Vec<ManifestEntry>,
}

impl PackageManifest {
    /// Load a manifest from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Status> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| {
            Status::InvalidArgument(format!("malformed package manifest {}: {e}", path.display()))
        })
    }

    /// Resolve every manifest entry against the host filesystem.
    ///
    /// Entries whose pattern matches no file, or more than one file, are
    /// skipped with a warning rather than failing the whole sync.
    pub fn resolve(&self, install_root: &Path) -> Vec<PackageDescriptor> {
        let mut out = Vec::new();
        for entry in &self.packages {
            let dir = if Path::new(&entry.host_dir).is_absolute() {
                PathBuf::from(&entry.host_dir)
            } else {
                install_root.join(&entry.host_dir)
            };
            match find_one(&dir, &entry.pattern) {
                Ok(path) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    out.push(PackageDescriptor {
                        name,
                        path,
                        device_subdir: entry.device_subdir.clone(),
                        optional: entry.optional,
                    });
                }
                Err(reason) => {
                    if entry.optional {
                        tracing::debug!(pattern = %entry.pattern, %reason, "skipping optional package");
                    } else {
                        tracing::warn!(pattern = %entry.pattern, %reason, "skipping package");
                    }
                }
            }
        }
        out
    }
}

/// Discover the single package file in `dir` matching `pattern`.
///
/// Zero or multiple matches are not actionable; both return `None` with
/// a debug log so the caller skips this package kind.
pub fn discover_one(dir: &Path, pattern: &str, device_subdir: &str) -> Option<PackageDescriptor> {
    match find_one(dir, pattern) {
        Ok(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some(PackageDescriptor {
                name,
                path,
                device_subdir: device_subdir.to_string(),
                optional: false,
            })
        }
        Err(reason) => {
            tracing::debug!(%pattern, dir = %dir.display(), %reason, "package not discovered");
            None
        }
    }
}

/// Whether `name` matches `pattern`, which may contain one `*` wildcard.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

/// Find exactly one file in `dir` matching `pattern`.
fn find_one(dir: &Path, pattern: &str) -> Result<PathBuf, String> {
    let entries = std::fs::read_dir(dir).map_err(|e| format!("cannot read {}: {e}", dir.display()))?;
    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_file() && pattern_matches(pattern, &name) {
            matches.push(entry.path());
        }
    }
    match matches.len() {
        0 => Err("no match".to_string()),
        1 => Ok(matches.remove(0)),
        n => Err(format!("{n} matches, expected exactly one")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("kernel.tar.gz", "kernel.tar.gz"));
        assert!(pattern_matches("udf-compat-*.tar.gz", "udf-compat-1.2.3.tar.gz"));
        assert!(pattern_matches("*-kernel.tar", "aarch64-kernel.tar"));
        assert!(!pattern_matches("udf-compat-*.tar.gz", "udf-compat.tar"));
        // prefix and suffix must not overlap
        assert!(!pattern_matches("abc*cba", "abcba"));
    }

    #[test]
    fn test_checkcode_is_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.bin");
        std::fs::write(&path, vec![0u8; 1234]).unwrap();
        assert_eq!(file_checkcode(&path).unwrap(), 1234);
    }

    #[test]
    fn test_sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"abc").unwrap();
        drop(f);
        assert_eq!(
            file_sha256_hex(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_manifest_resolve_skips_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let pkg_dir = dir.path().join("packages");
        std::fs::create_dir(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("udf-1.0.tar.gz"), b"a").unwrap();
        std::fs::write(pkg_dir.join("udf-2.0.tar.gz"), b"b").unwrap();
        std::fs::write(pkg_dir.join("kernel.tar.gz"), b"k").unwrap();

        let manifest = PackageManifest {
            packages: vec![
                ManifestEntry {
                    pattern: "udf-*.tar.gz".into(),
                    host_dir: "packages".into(),
                    device_subdir: "udf".into(),
                    optional: false,
                },
                ManifestEntry {
                    pattern: "kernel.tar.gz".into(),
                    host_dir: "packages".into(),
                    device_subdir: "kernel".into(),
                    optional: false,
                },
                ManifestEntry {
                    pattern: "missing-*.bin".into(),
                    host_dir: "packages".into(),
                    device_subdir: "misc".into(),
                    optional: true,
                },
            ],
        };
        let resolved = manifest.resolve(dir.path());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "kernel.tar.gz");
        assert_eq!(resolved[0].device_subdir, "kernel");
    }

    #[test]
    fn test_manifest_toml_round_trip() {
        let text = r#"
            [[package]]
            pattern = "udf-compat-*.tar.gz"
            host_dir = "opp/packages"
            device_subdir = "udf"

            [[package]]
            pattern = "sink-base.tar.gz"
            host_dir = "sink"
            device_subdir = "sink"
            optional = true
        "#;
        let manifest: PackageManifest = toml::from_str(text).unwrap();
        assert_eq!(manifest.packages.len(), 2);
        assert!(!manifest.packages[0].optional);
        assert!(manifest.packages[1].optional);
    }
}
