//! VM entry point: parse the command line, assemble the machine, run the
//! debugger console until end of input.

use std::process;

use clap::Parser;

use riscvm::debug::Console;
use riscvm::{Machine, VmConfig, VmResult};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = VmConfig::parse();
    if let Err(e) = run(config) {
        eprintln!("{e}");
        process::exit(e.exit_code());
    }
}

fn run(config: VmConfig) -> VmResult<()> {
    let mut vm = Machine::new(config)?;
    vm.load_boot_image(&vm.config().bootloader.clone())?;
    vm.start()?;

    // The console owns the foreground until its input closes; the guest
    // keeps running either way.
    Console::new(&vm).run()?;
    vm.join();
    Ok(())
}
