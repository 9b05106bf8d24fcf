//! Host-side error types for the VM.
//!
//! These cover configuration and startup failures only. Anything the guest
//! can observe (bad address, privilege violation, unknown opcode) is an
//! interrupt, not an error; see [`crate::irq::Interrupt`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the host-side code.
pub type VmResult<T> = Result<T, VmError>;

/// Host-side failure. Each variant maps to a stable negative process exit
/// code via [`VmError::exit_code`].
#[derive(Debug, Error)]
pub enum VmError {
    /// Guest memory could not be allocated.
    #[error("failed to allocate {size} bytes of guest memory")]
    MemoryAllocation { size: u64 },

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread {name:?}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The boot image could not be read.
    #[error("boot image {path:?} is unreachable: {source}")]
    BootImage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The boot image does not fit into guest memory.
    #[error("guest memory is too small: {mem_size} bytes of RAM, {image_size} byte image")]
    MemoryTooSmall { mem_size: u64, image_size: u64 },

    /// The debug console could not read from standard input.
    #[error("debug console failed: {0}")]
    Console(#[source] io::Error),

    /// An extension module failed id/name/range verification.
    #[error("extension verification failed: {0}")]
    ExtensionVerify(String),

    /// `initext` was executed but no extension source is configured.
    #[error("no extension instruction set configured")]
    NoExtensions,

    /// Out-of-range or inconsistent command-line configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VmError {
    /// Stable process exit code for this failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::MemoryAllocation { .. } => -1,
            VmError::ThreadSpawn { .. } => -2,
            VmError::BootImage { .. } => -3,
            VmError::MemoryTooSmall { .. } => -4,
            VmError::Console(_) => -5,
            VmError::ExtensionVerify(_) => -6,
            VmError::NoExtensions => -7,
            VmError::Config(_) => -8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_negative_and_distinct() {
        let errors = [
            VmError::MemoryAllocation { size: 1 },
            VmError::ThreadSpawn {
                name: "core0".into(),
                source: io::Error::other("x"),
            },
            VmError::BootImage {
                path: "/nonexistent".into(),
                source: io::Error::other("x"),
            },
            VmError::MemoryTooSmall {
                mem_size: 1,
                image_size: 2,
            },
            VmError::Console(io::Error::other("x")),
            VmError::ExtensionVerify("id mismatch".into()),
            VmError::NoExtensions,
            VmError::Config("zero cores".into()),
        ];
        let mut seen = std::collections::BTreeSet::new();
        for e in &errors {
            let code = e.exit_code();
            assert!(code < 0);
            assert!(seen.insert(code), "duplicate exit code {code}");
        }
    }
}
