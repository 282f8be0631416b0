//! Error kinds surfaced by the installation core.
//!
//! Stages return [`anyhow::Result`]; the kind of a failure is attached either as
//! the root error or as context, so callers classify failures with
//! `err.downcast_ref::<InstallError>()` regardless of how much context was
//! layered on afterwards.

use camino::Utf8PathBuf;

/// The kind of an installation failure.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The installation root directory does not exist; nothing was mounted.
    #[error("install root {0} does not exist")]
    InstallRootMissing(Utf8PathBuf),
    /// Mounting a partition or virtual filesystem failed.
    #[error("failed to mount {target}")]
    MountFailure {
        /// The mountpoint (or partition ID when unresolvable)
        target: String,
    },
    /// Unmounting failed.
    #[error("failed to unmount {target}")]
    UnmountFailure {
        /// The mountpoint
        target: String,
    },
    /// Installing a package into the chroot failed.
    #[error("failed to install package {package}")]
    PackageInstallFailure {
        /// Package name, or the package database on initialization failure
        package: String,
    },
    /// Generating or writing the fstab failed.
    #[error("failed to write {path}")]
    FstabWriteFailure {
        /// The fstab path
        path: Utf8PathBuf,
    },
    /// Secure boot signing was configured but its material is unusable.
    #[error("secure boot key or certificate file not found: {}", missing.join(", "))]
    SigningPrerequisiteMissing {
        /// The configured paths which do not exist
        missing: Vec<String>,
    },
    /// The signer failed on an artifact.
    #[error("failed to sign {path}")]
    SigningExecutionFailure {
        /// The artifact being signed
        path: Utf8PathBuf,
    },
    /// Building the unified kernel image failed.
    #[error("failed to build unified kernel image")]
    UkiBuildFailure,
    /// Generating package repository configuration failed.
    #[error("failed to generate package repository configuration")]
    RepositoryGenerationFailure,
    /// A command exited unsuccessfully.
    #[error("{description} failed ({status}): {output}")]
    CommandFailure {
        /// Human readable description of the command
        description: String,
        /// Exit status
        status: String,
        /// Tail of the combined output
        output: String,
    },
}

