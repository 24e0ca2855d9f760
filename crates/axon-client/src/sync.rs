//! Package synchronization engine
//!
//! Keeps package files on the device consistent with the host copies.
//! Two schemes share the same compare/transfer/re-verify protocol: the
//! legacy scheme identifies a package by a 32-bit size-derived checkcode
//! per package kind, the generalized scheme by SHA-256 digest per
//! package name. Transfers take a process-wide advisory lock on the
//! package file so concurrent senders of the same file serialize.

use axon_core::message::PackageHash;
use axon_core::{Body, PackageDescriptor, PackageKind, Status, Timeouts};
use axon_link::Session;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// Advisory exclusive lock on a package file, held for the duration of
/// one transfer.
struct TransferLock {
    file: File,
}

impl TransferLock {
    fn acquire(path: &Path) -> Result<Self, Status> {
        let file = File::open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for TransferLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn check_round(
    session: &mut Session,
    kind: PackageKind,
    checkcode: u32,
    before_send: bool,
    timeouts: &Timeouts,
) -> Result<u32, Status> {
    let rsp = session.call(
        Body::CheckPackage {
            package_kind: kind.as_u32(),
            checkcode,
            before_send,
        },
        timeouts.package_check(),
    )?;
    match rsp.body {
        Body::CheckPackageRsp { checkcode, .. } => Ok(checkcode),
        other => Err(Status::Internal(format!(
            "unexpected package check response kind {:?}",
            other.kind()
        ))),
    }
}

/// Synchronize one legacy package kind. Returns whether a transfer
/// happened.
pub fn sync_legacy(
    session: &mut Session,
    kind: PackageKind,
    package: &PackageDescriptor,
    timeouts: &Timeouts,
) -> Result<bool, Status> {
    let checkcode = package.checkcode()?;
    let device_code = check_round(session, kind, checkcode, true, timeouts)?;
    if device_code == checkcode && checkcode != 0 {
        debug!(device = %session.device(), %kind, checkcode, "package already in sync");
        return Ok(false);
    }

    info!(
        device = %session.device(),
        %kind,
        host = checkcode,
        device_held = device_code,
        "transferring package"
    );
    {
        let _lock = TransferLock::acquire(&package.path)?;
        session.send_file(&package.path, &package.device_subdir)?;
    }

    let verified = check_round(session, kind, checkcode, false, timeouts)?;
    if verified != checkcode {
        return Err(Status::PackageSyncMismatch(package.name.clone()));
    }
    Ok(true)
}

fn hash_round(
    session: &mut Session,
    query: Vec<PackageHash>,
    timeouts: &Timeouts,
) -> Result<HashMap<String, String>, Status> {
    let rsp = session.call(
        Body::QueryPackageHash {
            packages: query,
            max_process_secs: timeouts.hash_verify_secs as u32,
        },
        timeouts.hash_verify(),
    )?;
    match rsp.body {
        Body::PackageHashRsp { packages } => {
            Ok(packages.into_iter().map(|p| (p.name, p.hash)).collect())
        }
        other => Err(Status::Internal(format!(
            "unexpected package hash response kind {:?}",
            other.kind()
        ))),
    }
}

/// Synchronize a set of packages under the generalized hash scheme.
/// Returns the number of files transferred.
pub fn sync_common(
    session: &mut Session,
    packages: &[PackageDescriptor],
    timeouts: &Timeouts,
) -> Result<usize, Status> {
    if packages.is_empty() {
        return Ok(0);
    }
    let mut host_hashes = Vec::with_capacity(packages.len());
    for package in packages {
        host_hashes.push(PackageHash {
            name: package.name.clone(),
            hash: package.sha256_hex()?,
        });
    }

    let held = hash_round(session, host_hashes.clone(), timeouts)?;
    let mut stale = Vec::new();
    for (package, host) in packages.iter().zip(&host_hashes) {
        let device_hash = held.get(&host.name).map(String::as_str).unwrap_or("");
        if device_hash == host.hash && !host.hash.is_empty() {
            debug!(device = %session.device(), name = %host.name, "package already in sync");
        } else {
            stale.push((package, host));
        }
    }
    if stale.is_empty() {
        return Ok(0);
    }

    for (package, host) in &stale {
        info!(device = %session.device(), name = %host.name, "transferring package");
        let _lock = TransferLock::acquire(&package.path)?;
        session.send_file(&package.path, &package.device_subdir)?;
    }

    let verified = hash_round(session, host_hashes.clone(), timeouts)?;
    for (_, host) in &stale {
        let device_hash = verified.get(&host.name).map(String::as_str).unwrap_or("");
        if device_hash != host.hash {
            return Err(Status::PackageSyncMismatch(host.name.clone()));
        }
    }
    Ok(stale.len())
}
