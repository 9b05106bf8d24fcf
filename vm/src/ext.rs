//! Extension instruction sets.
//!
//! An extension is a module that installs extra opcode handlers into the
//! dispatch table at a declared slot range. The VM side of the contract
//! lives here: identity verification, slot installation and teardown.
//! How a module's code actually gets into the process (typically a
//! dynamic library named after [`module_file_name`] in the `-e`
//! directory) is host glue behind the [`ExtensionProvider`] trait.

use std::path::{Path, PathBuf};

use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::isa::{DispatchTable, OpHandler};

/// First dispatch slot extensions may claim; everything below is reserved
/// for the base instruction set.
pub const EXT_SPACE_FLOOR: usize = 42;

/// Registered extension names, indexed by extension id. Id 0 is reserved.
pub const EXTENSION_NAMES: &[&str] = &["", "bae", "ave", "simde"];

/// File name an extension module of the given id is expected under, for
/// directory-based providers: `libriscvmext<id>.<name>.so`.
pub fn module_file_name(id: u64) -> Option<String> {
    let name = EXTENSION_NAMES.get(id as usize)?;
    if name.is_empty() {
        return None;
    }
    Some(format!("libriscvmext{id}.{name}.so"))
}

/// Full path of an extension module inside an extension directory.
pub fn module_path(dir: &Path, id: u64) -> Option<PathBuf> {
    Some(dir.join(module_file_name(id)?))
}

/// A resolved extension: identity plus the handlers to install.
pub struct ExtensionModule {
    /// Declared id; must equal the id requested by `initext`.
    pub id: u64,
    /// Declared name; must equal the registered name for the id.
    pub name: String,
    /// First dispatch slot to claim.
    pub space_start: usize,
    /// Handlers for `[space_start, space_start + handlers.len())`.
    pub handlers: Vec<OpHandler>,
}

/// Source of extension modules. The production implementation resolves
/// and loads dynamic libraries from the `-e` directory; tests register
/// in-process modules.
pub trait ExtensionProvider: Send + Sync {
    fn resolve(&self, id: u64) -> VmResult<ExtensionModule>;
}

struct LoadedExtension {
    space_start: usize,
    count: usize,
}

/// Per-process extension state: the configured provider and the slots
/// currently claimed. One extension is resident at a time; `initext`
/// replaces, `destext` removes.
pub struct ExtensionHost {
    provider: Mutex<Option<Box<dyn ExtensionProvider>>>,
    loaded: Mutex<Option<LoadedExtension>>,
}

impl ExtensionHost {
    pub fn new() -> Self {
        Self {
            provider: Mutex::new(None),
            loaded: Mutex::new(None),
        }
    }

    pub fn set_provider(&self, provider: Box<dyn ExtensionProvider>) {
        *self.provider.lock() = Some(provider);
    }

    /// Resolve, verify and install extension `id`. Verification failure
    /// is fatal to the VM; the caller terminates the process.
    pub fn load(&self, id: u64, table: &DispatchTable) -> VmResult<()> {
        let provider = self.provider.lock();
        let provider = provider.as_ref().ok_or(VmError::NoExtensions)?;
        let module = provider.resolve(id)?;

        if module.id != id {
            return Err(VmError::ExtensionVerify(format!(
                "module declares id {} but id {} was requested",
                module.id, id
            )));
        }
        match EXTENSION_NAMES.get(id as usize) {
            Some(expected) if !expected.is_empty() && *expected == module.name => {}
            _ => {
                return Err(VmError::ExtensionVerify(format!(
                    "module name {:?} does not match the registered name for id {id}",
                    module.name
                )))
            }
        }
        let end = module.space_start.saturating_add(module.handlers.len());
        if module.space_start < EXT_SPACE_FLOOR || end > 256 {
            return Err(VmError::ExtensionVerify(format!(
                "slot range {}..{end} is outside the extension space",
                module.space_start
            )));
        }

        self.unload(table);
        table.install(module.space_start, module.id, &module.handlers);
        *self.loaded.lock() = Some(LoadedExtension {
            space_start: module.space_start,
            count: module.handlers.len(),
        });
        log::info!(
            "extension {} ({}) installed at slots {}..{}",
            module.id,
            module.name,
            module.space_start,
            module.space_start + module.handlers.len()
        );
        Ok(())
    }

    /// Empty the resident extension's slots. No-op when nothing is
    /// loaded.
    pub fn unload(&self, table: &DispatchTable) {
        if let Some(l) = self.loaded.lock().take() {
            table.clear_range(l.space_start, l.count);
            log::info!("extension slots {}..{} cleared", l.space_start, l.space_start + l.count);
        }
    }
}

impl Default for ExtensionHost {
    fn default() -> Self {
        Self::new()
    }
}
