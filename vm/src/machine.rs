//! Process orchestrator: owns guest memory, the cores, the control
//! planes, and the worker threads running them.
//!
//! Everything a thread needs travels in an explicit [`VmContext`]; there
//! are no process-wide globals.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::VmConfig;
use crate::cpu::{run::run_core, Core};
use crate::error::{VmError, VmResult};
use crate::ext::{ExtensionHost, ExtensionProvider};
use crate::io::{self, IoPlane};
use crate::irq::distributor::{self, IntPlane};
use crate::isa::DispatchTable;
use crate::mem::GuestMemory;
use crate::sleep;

/// Per-core start flags plus the process-wide shutdown latch.
///
/// A core runs while its flag is set and the VM is not shutting down; the
/// clock, distributor and I/O threads key off the same state so teardown
/// is symmetric.
pub struct StartFlags {
    flags: Box<[AtomicBool]>,
    shutdown: AtomicBool,
}

impl StartFlags {
    pub fn new(cores: usize) -> Self {
        Self {
            flags: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn core_count(&self) -> usize {
        self.flags.len()
    }

    /// Allow a core to run. Idempotent.
    pub fn start(&self, id: u64) {
        if let Some(flag) = self.flags.get(id as usize) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Raw start flag, ignoring shutdown.
    pub fn is_started(&self, id: u64) -> bool {
        self.flags
            .get(id as usize)
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Whether a core (or a service keyed to it) should keep running.
    pub fn is_running(&self, id: u64) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && self.is_started(id)
    }

    /// Begin process teardown; every loop observes this within one poll
    /// interval.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Park until the core may run. `false` means the VM shut down before
    /// the flag ever came.
    pub fn wait_for_start(&self, id: u64) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }
            if self.is_started(id) {
                return true;
            }
            sleep::awaiting_start();
        }
    }
}

/// Shared collaborators handed to every worker thread.
pub struct VmContext {
    pub mem: Arc<GuestMemory>,
    pub io: Arc<IoPlane>,
    pub dispatch: Arc<DispatchTable>,
    pub start: Arc<StartFlags>,
    pub ext: Arc<ExtensionHost>,
    /// Evaluate the per-core debugger gate each iteration.
    pub debug_enabled: bool,
    /// Spawn a clock producer per core.
    pub clock_enabled: bool,
}

/// The assembled virtual machine.
pub struct Machine {
    config: VmConfig,
    ctx: Arc<VmContext>,
    cores: Vec<Arc<Core>>,
    plane: Arc<IntPlane>,
    threads: Vec<JoinHandle<()>>,
}

impl Machine {
    /// Allocate memory and build all subsystems. Nothing runs yet.
    pub fn new(config: VmConfig) -> VmResult<Self> {
        config.validate()?;
        let mem = GuestMemory::new(config.mem_size).ok_or(VmError::MemoryAllocation {
            size: config.mem_size,
        })?;
        log::info!("installed memory: {} bytes", config.mem_size);

        let ctx = Arc::new(VmContext {
            mem: Arc::new(mem),
            io: Arc::new(IoPlane::new()),
            dispatch: Arc::new(DispatchTable::with_base()),
            start: Arc::new(StartFlags::new(config.cores as usize)),
            ext: Arc::new(ExtensionHost::new()),
            debug_enabled: config.debug,
            clock_enabled: !config.no_clock,
        });
        let cores = (0..u64::from(config.cores)).map(Core::new).collect();
        Ok(Self {
            config,
            ctx,
            cores,
            plane: Arc::new(IntPlane::new()),
            threads: Vec::new(),
        })
    }

    /// Read the boot image and place it at physical offset 0.
    pub fn load_boot_image(&self, path: &Path) -> VmResult<u64> {
        let image = fs::read(path).map_err(|source| VmError::BootImage {
            path: path.to_owned(),
            source,
        })?;
        self.load_boot_bytes(&image)?;
        log::info!("boot image loaded: {} bytes", image.len());
        Ok(image.len() as u64)
    }

    /// Place an in-memory boot image at physical offset 0.
    pub fn load_boot_bytes(&self, image: &[u8]) -> VmResult<()> {
        if image.len() as u64 > self.ctx.mem.len() {
            return Err(VmError::MemoryTooSmall {
                mem_size: self.ctx.mem.len(),
                image_size: image.len() as u64,
            });
        }
        self.ctx
            .mem
            .write(0, image)
            .map_err(|_| VmError::MemoryTooSmall {
                mem_size: self.ctx.mem.len(),
                image_size: image.len() as u64,
            })
    }

    /// Spawn the core workers, the distributor and the I/O control
    /// thread, and release core 0.
    pub fn start(&mut self) -> VmResult<()> {
        self.ctx.start.start(0);

        for core in &self.cores {
            let handle = thread::Builder::new()
                .name(format!("core{}", core.id))
                .spawn({
                    let core = Arc::clone(core);
                    let ctx = Arc::clone(&self.ctx);
                    move || run_core(core, ctx)
                })
                .map_err(|source| VmError::ThreadSpawn {
                    name: format!("core{}", core.id),
                    source,
                })?;
            self.threads.push(handle);
        }

        let queues: Vec<_> = self.cores.iter().map(|c| Arc::clone(&c.irq)).collect();
        let dist = thread::Builder::new()
            .name("intctl".into())
            .spawn({
                let plane = Arc::clone(&self.plane);
                let start = Arc::clone(&self.ctx.start);
                move || distributor::run_distributor(plane, queues, start)
            })
            .map_err(|source| VmError::ThreadSpawn {
                name: "intctl".into(),
                source,
            })?;
        self.threads.push(dist);

        let ioctl = thread::Builder::new()
            .name("ioctl".into())
            .spawn({
                let io = Arc::clone(&self.ctx.io);
                let start = Arc::clone(&self.ctx.start);
                move || io::run_io_control(io, start)
            })
            .map_err(|source| VmError::ThreadSpawn {
                name: "ioctl".into(),
                source,
            })?;
        self.threads.push(ioctl);
        Ok(())
    }

    /// Ask every thread to wind down.
    pub fn shutdown(&self) {
        self.ctx.start.shutdown();
    }

    /// Wait for every spawned thread to exit.
    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Install the source of extension modules resolved by `initext`.
    pub fn set_extension_provider(&self, provider: Box<dyn ExtensionProvider>) {
        self.ctx.ext.set_provider(provider);
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn cores(&self) -> &[Arc<Core>] {
        &self.cores
    }

    pub fn mem(&self) -> &GuestMemory {
        &self.ctx.mem
    }

    pub fn start_flags(&self) -> &StartFlags {
        &self.ctx.start
    }

    pub fn io(&self) -> &IoPlane {
        &self.ctx.io
    }

    /// The global interrupt plane external producers post to.
    pub fn int_plane(&self) -> &IntPlane {
        &self.plane
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}
