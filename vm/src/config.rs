//! Command-line surface and validated VM configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{VmError, VmResult};

/// Hard ceiling on the core count; core ids are a single byte on the
/// start-core I/O port.
pub const MAX_CORES: u16 = 255;

/// VM configuration, parsed directly from the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "riscvm", version, about = "64-bit RISC-style virtual machine")]
pub struct VmConfig {
    /// Guest memory size in bytes.
    #[arg(short = 'm', long = "memory", value_name = "SIZE")]
    pub mem_size: u64,

    /// Number of hardware threads (cores).
    #[arg(short = 'c', long = "cores", value_name = "N", default_value_t = 1)]
    pub cores: u16,

    /// Boot image, loaded at physical offset 0.
    #[arg(short = 'b', long = "boot", value_name = "PATH")]
    pub bootloader: PathBuf,

    /// Directory containing extension instruction modules.
    #[arg(short = 'e', long = "extensions", value_name = "PATH")]
    pub extensions: Option<PathBuf>,

    /// Suppress the internal per-core clock.
    #[arg(short = 't', long = "no-clock")]
    pub no_clock: bool,

    /// Enable the per-core debugger gate.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl VmConfig {
    /// Check value ranges that clap cannot express.
    pub fn validate(&self) -> VmResult<()> {
        if self.mem_size == 0 {
            return Err(VmError::Config("guest memory size must be nonzero".into()));
        }
        if self.cores == 0 {
            return Err(VmError::Config("at least one core is required".into()));
        }
        if self.cores > MAX_CORES {
            return Err(VmError::Config(format!(
                "core count {} exceeds the maximum of {MAX_CORES}",
                self.cores
            )));
        }
        Ok(())
    }
}
