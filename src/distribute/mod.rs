//! Copies issued identity files into the role directories
//!
//! Each role receives its private key, certificate and the shared authority
//! chain, renamed after the role's file prefix. The server additionally gets
//! its public key. Copies are byte-exact and keep permissions and modification
//! times.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::pki::ComponentIdentity;
use crate::topology::{Role, CA_CHAIN_FILE};

/// Distribution errors
#[derive(Debug, Error)]
pub enum DistributeError {
    /// A file the authority should have issued is not there
    #[error("source file missing: {0}")]
    MissingSource(PathBuf),

    /// The directory meant to receive the files does not exist
    #[error("identity directory missing: {0}")]
    MissingTargetDirectory(PathBuf),

    /// A copy failed midway
    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        /// Source file
        from: PathBuf,
        /// Destination file
        to: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Source and destination of every file a role receives, in copy order
pub fn distribution_plan(
    role: Role,
    identity: &ComponentIdentity,
    chain: &Path,
    identity_dir: &Path,
) -> Vec<(PathBuf, PathBuf)> {
    let mut plan = vec![(
        identity.private_key.clone(),
        identity_dir.join(role.private_key_file()),
    )];
    if let Some(public_key) = &identity.public_key {
        plan.push((public_key.clone(), identity_dir.join(role.public_key_file())));
    }
    plan.push((
        identity.certificate.clone(),
        identity_dir.join(role.certificate_file()),
    ));
    plan.push((chain.to_path_buf(), identity_dir.join(CA_CHAIN_FILE)));
    plan
}

/// Copy a role's identity into `identity_dir`, returning the files written
///
/// Files copied before a failure stay in place.
pub fn distribute_identity(
    role: Role,
    identity: &ComponentIdentity,
    chain: &Path,
    identity_dir: &Path,
) -> Result<Vec<PathBuf>, DistributeError> {
    if !identity_dir.is_dir() {
        return Err(DistributeError::MissingTargetDirectory(
            identity_dir.to_path_buf(),
        ));
    }

    let mut written = Vec::new();
    for (from, to) in distribution_plan(role, identity, chain, identity_dir) {
        copy_preserving(&from, &to)?;
        debug!(role = %role, from = %from.display(), to = %to.display(), "Copied");
        written.push(to);
    }

    info!(role = %role, files = written.len(), dir = %identity_dir.display(), "Distributed identity");
    Ok(written)
}

/// Copy one file, keeping permissions and modification time
///
/// The source is checked first so a missing source never leaves an empty
/// destination behind.
fn copy_preserving(from: &Path, to: &Path) -> Result<(), DistributeError> {
    let metadata = match fs::metadata(from) {
        Ok(m) if m.is_file() => m,
        _ => return Err(DistributeError::MissingSource(from.to_path_buf())),
    };

    let copy_err = |source| DistributeError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    // fs::copy carries permission bits over
    fs::copy(from, to).map_err(copy_err)?;

    if let Ok(modified) = metadata.modified() {
        let dest = File::open(to).map_err(copy_err)?;
        if let Err(e) = dest.set_modified(modified) {
            debug!(to = %to.display(), error = %e, "Could not preserve modification time");
        }
    }
    Ok(())
}
