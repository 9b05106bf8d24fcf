//! Interactive debugger console.
//!
//! Reads whitespace-separated commands from standard input and prints
//! results to standard output. Commands act on a selected target core;
//! errors print a one-line message and leave all state unchanged.

use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::cpu::Core;
use crate::error::{VmError, VmResult};
use crate::machine::Machine;

/// Console state: the machine under inspection and the selected core.
pub struct Console<'a> {
    vm: &'a Machine,
    target: Option<usize>,
}

impl<'a> Console<'a> {
    pub fn new(vm: &'a Machine) -> Self {
        Self { vm, target: None }
    }

    /// Command loop; returns on end of input.
    pub fn run(&mut self) -> VmResult<()> {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("riscvm >> ");
            let _ = io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(VmError::Console(e)),
            }
            let output = self.dispatch(line.trim());
            if !output.is_empty() {
                println!("{output}");
            }
        }
    }

    /// Execute one command line and render its output.
    pub fn dispatch(&mut self, line: &str) -> String {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return String::new();
        };
        let args: Vec<&str> = words.collect();
        let result = match cmd {
            "core?" => self.cmd_core_query(&args),
            "core" => self.cmd_core_select(&args),
            "bp" => self.cmd_breakpoint_add(&args),
            "rbp" => self.cmd_breakpoint_remove(&args),
            "lbp" => self.cmd_breakpoint_list(),
            "stp" => self.cmd_step(&args),
            "cont" => self.cmd_continue(),
            "start" => self.cmd_start(),
            "mem" => self.cmd_mem(&args),
            "reg" => self.cmd_reg(&args),
            _ => Err(format!("unknown command: {cmd}")),
        };
        match result {
            Ok(out) => out,
            Err(msg) => format!("error: {msg}"),
        }
    }

    fn target(&self) -> Result<&Arc<Core>, String> {
        let id = self.target.ok_or("no core selected")?;
        self.vm.cores().get(id).ok_or_else(|| "no core selected".into())
    }

    fn cmd_core_query(&self, args: &[&str]) -> Result<String, String> {
        let cores = self.vm.cores();
        let mut out = match self.target {
            Some(id) => format!("{} cores, core {id} selected", cores.len()),
            None => format!("{} cores, none selected", cores.len()),
        };
        if args.first() == Some(&"a") {
            for core in cores {
                let running = self.vm.start_flags().is_started(core.id);
                let _ = write!(
                    out,
                    "\ncore {}: {}{}",
                    core.id,
                    if running { "running" } else { "stopped" },
                    if core.debug.is_paused() { ", debugging" } else { "" },
                );
            }
        }
        Ok(out)
    }

    fn cmd_core_select(&mut self, args: &[&str]) -> Result<String, String> {
        let id = parse_u64(args.first().ok_or("usage: core N")?)? as usize;
        if id >= self.vm.cores().len() {
            return Err(format!("no core {id}"));
        }
        self.target = Some(id);
        Ok(format!("core {id} selected"))
    }

    fn cmd_breakpoint_add(&self, args: &[&str]) -> Result<String, String> {
        let addr = parse_u64(args.first().ok_or("usage: bp ADDR")?)?;
        self.target()?.debug.add_breakpoint(addr).map_err(str::to_owned)?;
        Ok(String::new())
    }

    fn cmd_breakpoint_remove(&self, args: &[&str]) -> Result<String, String> {
        let addr = parse_u64(args.first().ok_or("usage: rbp ADDR")?)?;
        self.target()?.debug.remove_breakpoint(addr);
        Ok(String::new())
    }

    fn cmd_breakpoint_list(&self) -> Result<String, String> {
        let bps = self.target()?.debug.breakpoints();
        Ok(bps
            .iter()
            .map(|a| format!("{a:016x}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn cmd_step(&self, args: &[&str]) -> Result<String, String> {
        let count = match args.first() {
            Some(n) => parse_u64(n)? as u32,
            None => 1,
        };
        self.target()?.debug.request_step(count);
        Ok(String::new())
    }

    fn cmd_continue(&self) -> Result<String, String> {
        self.target()?.debug.request_continue();
        Ok(String::new())
    }

    fn cmd_start(&self) -> Result<String, String> {
        let core = self.target()?;
        self.vm.start_flags().start(core.id);
        Ok(format!("core {} started", core.id))
    }

    fn cmd_mem(&self, args: &[&str]) -> Result<String, String> {
        let addr = parse_u64(args.first().ok_or("usage: mem ADDR [COUNT]")?)?;
        let count = match args.get(1) {
            Some(n) => parse_u64(n)?,
            None => 1,
        };
        let mem = self.vm.mem();
        if count == 0 || addr >= mem.len() || count > mem.len() - addr {
            return Err("address out of range".into());
        }
        let mut out = String::new();
        for (i, a) in (addr..addr + count).enumerate() {
            if i % 16 == 0 {
                if i != 0 {
                    out.push('\n');
                }
                let _ = write!(out, "{a:016x}:");
            }
            let byte = mem.read_u8(a).map_err(|e| e.to_string())?;
            let _ = write!(out, " {byte:02x}");
        }
        Ok(out)
    }

    fn cmd_reg(&self, args: &[&str]) -> Result<String, String> {
        let core = self.target()?;
        let state = core.state.lock();
        let r = &state.regs;
        match args.first() {
            None => {
                let mut out = String::new();
                for (i, v) in r.x.iter().enumerate() {
                    let _ = writeln!(out, "x{i:<3} = {v:#018x}");
                }
                let _ = writeln!(out, "ip   = {:#018x}", r.ip);
                let _ = writeln!(out, "flg  = {:#018x}", r.flg.bits());
                for (name, v) in [
                    ("usb", r.usb),
                    ("ust", r.ust),
                    ("ksb", r.ksb),
                    ("kst", r.kst),
                    ("kpt", r.kpt),
                    ("upt", r.upt),
                    ("ivt", r.ivt),
                    ("scp", r.scp),
                ] {
                    let _ = writeln!(out, "{name}  = {v:#018x}");
                }
                out.pop();
                Ok(out)
            }
            Some(&name) => {
                let value = match name {
                    "ip" => r.ip,
                    "flg" => r.flg.bits(),
                    "usb" => r.usb,
                    "ust" => r.ust,
                    "ksb" => r.ksb,
                    "kst" => r.kst,
                    "kpt" => r.kpt,
                    "upt" => r.upt,
                    "ivt" => r.ivt,
                    "scp" => r.scp,
                    _ => {
                        let idx: usize = name
                            .strip_prefix('x')
                            .and_then(|n| n.parse().ok())
                            .filter(|&n| n < r.x.len())
                            .ok_or_else(|| format!("unknown register {name}"))?;
                        r.x[idx]
                    }
                };
                Ok(format!("{name} = {value:#018x}"))
            }
        }
    }
}

/// Accept decimal or 0x-prefixed hexadecimal.
fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("bad number: {s}"))
}
