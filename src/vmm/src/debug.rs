// SPDX-License-Identifier: Apache-2.0

//! Interactive debugger, gated on the BSP before each instruction.
//!
//! Enabled entirely through the environment so release builds carry it at
//! zero cost when unused: `VM_DEBUG_STEP`/`VM_STEP` single-step from the
//! first instruction, `VM_DEBUG_PAUSE` stops once before the first
//! instruction, `VM_BREAKPOINTS` takes a comma/semicolon/space separated
//! list of hex or decimal addresses.

use std::io::{self, BufRead, Write};

use crate::cpu::{dump_state, Vcpu};
use crate::cpu::isa::{decode_raw, Opcode};
use crate::machine::Machine;

pub struct Debugger {
    step_mode: bool,
    pause_on_start: bool,
    breakpoints: Vec<u32>,
}

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
        }
        Err(_) => false,
    }
}

fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

impl Debugger {
    /// Build a debugger from the environment; `None` when no debug knob
    /// is set, so the core loop skips the gate entirely.
    pub fn from_env() -> Option<Debugger> {
        let step_mode = env_truthy("VM_DEBUG_STEP") || env_truthy("VM_STEP");
        let pause_on_start = env_truthy("VM_DEBUG_PAUSE");
        let breakpoints: Vec<u32> = std::env::var("VM_BREAKPOINTS")
            .unwrap_or_default()
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter_map(parse_u32)
            .collect();

        if !step_mode && !pause_on_start && breakpoints.is_empty() {
            return None;
        }
        Some(Debugger { step_mode, pause_on_start, breakpoints })
    }

    fn has_breakpoint(&self, addr: u32) -> bool {
        self.breakpoints.contains(&addr)
    }

    fn add_breakpoint(&mut self, addr: u32) {
        if !self.has_breakpoint(addr) {
            self.breakpoints.push(addr);
        }
    }

    fn remove_breakpoint(&mut self, addr: u32) {
        self.breakpoints.retain(|&bp| bp != addr);
    }

    /// Called on the BSP before each fetch.
    pub fn pause_if_needed(&mut self, machine: &Machine, cpu: &mut Vcpu) {
        if self.pause_on_start {
            self.pause_on_start = false;
            self.interactive_wait(machine, cpu);
            return;
        }
        if self.step_mode || self.has_breakpoint(cpu.ip) {
            self.interactive_wait(machine, cpu);
        }
    }

    fn interactive_wait(&mut self, machine: &Machine, cpu: &mut Vcpu) {
        let (op, rd, rs1, rs2, imm) = machine
            .peek64(cpu.ip)
            .map(decode_raw)
            .unwrap_or((0, 0, 0, 0, 0));
        println!(
            "\n[debug] pause at IP={:#010x} op={} rd={} rs1={} rs2={} imm={}",
            cpu.ip,
            Opcode::name_of(op),
            rd,
            rs1,
            rs2,
            imm
        );
        print_help();

        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            let _ = io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => {
                    // Input is gone; keep running.
                    self.step_mode = false;
                    return;
                }
                Ok(_) => {}
            }
            let mut parts = line.split_whitespace();
            let cmd = match parts.next() {
                Some(cmd) => cmd,
                // An empty line repeats the step.
                None => {
                    self.step_mode = true;
                    return;
                }
            };
            let arg1 = parts.next();
            let arg2 = parts.next();

            match cmd {
                "s" => {
                    self.step_mode = true;
                    return;
                }
                "c" => {
                    self.step_mode = false;
                    return;
                }
                "r" => dump_state(machine, cpu),
                "m" => match (arg1.and_then(parse_u32), arg2.and_then(parse_u32)) {
                    (Some(addr), Some(len)) => dump_bytes(machine, addr, len),
                    _ => println!("[debug] usage: m <addr> <len>"),
                },
                "b" => match arg1.and_then(parse_u32) {
                    Some(addr) => {
                        self.add_breakpoint(addr);
                        println!("[debug] breakpoint set at {:#010x}", addr);
                    }
                    None => println!("[debug] usage: b <addr>"),
                },
                "d" => match arg1.and_then(parse_u32) {
                    Some(addr) => {
                        self.remove_breakpoint(addr);
                        println!("[debug] breakpoint removed at {:#010x}", addr);
                    }
                    None => println!("[debug] usage: d <addr>"),
                },
                "l" => {
                    println!("[debug] breakpoints ({}):", self.breakpoints.len());
                    for bp in &self.breakpoints {
                        println!("  {:#010x}", bp);
                    }
                }
                "q" => {
                    machine.power.halt();
                    return;
                }
                _ => print_help(),
            }
        }
    }
}

fn print_help() {
    println!(
        "[debug] commands: s(step), c(continue), r(regs), m <addr> <len>, b <addr>, d <addr>, l(list), q(quit)"
    );
}

fn dump_bytes(machine: &Machine, addr: u32, len: u32) {
    for i in 0..len {
        if i % 16 == 0 {
            print!("\n{:#010x}: ", addr + i);
        }
        match machine.read8(addr + i) {
            Ok(byte) => print!("{:02x} ", byte),
            Err(_) => print!("?? "),
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_addresses() {
        assert_eq!(parse_u32("0x2000"), Some(0x2000));
        assert_eq!(parse_u32("0X10"), Some(0x10));
        assert_eq!(parse_u32("4096"), Some(4096));
        assert_eq!(parse_u32(" 12 "), Some(12));
        assert_eq!(parse_u32("zzz"), None);
        assert_eq!(parse_u32(""), None);
    }

    #[test]
    fn breakpoint_list_deduplicates() {
        let mut dbg = Debugger { step_mode: false, pause_on_start: false, breakpoints: vec![] };
        dbg.add_breakpoint(0x10);
        dbg.add_breakpoint(0x10);
        dbg.add_breakpoint(0x20);
        assert_eq!(dbg.breakpoints, vec![0x10, 0x20]);
        assert!(dbg.has_breakpoint(0x10));
        dbg.remove_breakpoint(0x10);
        assert!(!dbg.has_breakpoint(0x10));
    }
}
