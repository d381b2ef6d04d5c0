// An 8086/80186/80286-real-mode PC emulator with a built-in DOS. The
// CPU core runs the guest; everything the guest expects from the machine
// (ports, BIOS services, DOS itself) is answered in host code through
// the Platform trait, entered via the trampoline page at segment 0.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod alu;
pub mod bios;
pub mod codepage;
pub mod dbg;
pub mod dos;
pub mod fields;
pub mod instructions;
pub mod keyboard;
pub mod loader;
pub mod mcb;
pub mod memory;
pub mod nls;
pub mod parser;
pub mod paths;
pub mod processor;
pub mod segments;
pub mod timer;
pub mod video;

use processor::{Cpu, Platform};

/// Everything outside the CPU: the DOS state, the timer, the keyboard
/// and the screen, plus process-level control.
pub struct Hardware {
    pub dos: dos::Dos,
    pub video: video::Video,
    pub keyb: keyboard::Keyboard,
    pub timer: timer::BiosTimer,
    exit_code: Option<u16>,
    break_exec: Arc<AtomicBool>,
    retrace: u8,
}

impl Hardware {
    fn new(break_exec: Arc<AtomicBool>) -> Hardware {
        Hardware {
            dos: dos::Dos::new(),
            video: video::Video::new(),
            keyb: keyboard::Keyboard::new(),
            timer: timer::BiosTimer::new(),
            exit_code: None,
            break_exec,
            retrace: 0,
        }
    }

    pub fn exit_code(&self) -> Option<u16> {
        self.exit_code
    }

    /// Stop the emulation with the given guest exit code.
    pub fn request_exit(&mut self, code: u16) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
        self.break_exec.store(true, Ordering::Relaxed);
    }

    /// Unrecoverable emulation error: report on stderr and stop.
    pub fn fatal(&mut self, msg: &str) {
        eprintln!("{}", msg);
        self.exit_code = Some(1);
        self.break_exec.store(true, Ordering::Relaxed);
    }

    /// Periodic machine maintenance between bursts of instructions.
    pub fn update(&mut self, cpu: &mut Cpu) {
        log::debug!(target: "int", "emu update cycle");
        self.timer.update(&mut cpu.mem);
        self.video.check_screen(&mut cpu.mem);
        self.keyb.poll(cpu);
    }
}

impl Platform for Hardware {
    fn read_port(&mut self, cpu: &mut Cpu, port: u16) -> u8 {
        match port {
            0x3DA => {
                // CGA status: a rolling retrace bit pattern satisfies
                // vertical-retrace polling loops.
                self.retrace = self.retrace.wrapping_add(1);
                self.retrace & 0x09
            }
            0x3D4 | 0x3D5 => self.video.crtc_read(port),
            0x40..=0x43 => self.timer.read_port(port),
            0x60..=0x65 => self.keyb.read_port(cpu, port),
            _ => {
                log::debug!(target: "port", "port read {:04x}", port);
                0xFF
            }
        }
    }

    fn write_port(&mut self, _cpu: &mut Cpu, port: u16, value: u8) {
        match port {
            0x40..=0x43 => self.timer.write_port(port, value),
            0x3D4 | 0x3D5 => self.video.crtc_write(port, value),
            0x60 | 0x61 | 0x64 => {
                if self.keyb.write_port(port, value) {
                    self.request_exit(0);
                }
            }
            _ => {
                log::debug!(target: "port", "port write {:04x} <- {:02x}", port, value);
            }
        }
    }

    fn bios_service(&mut self, cpu: &mut Cpu, num: u8) {
        match num {
            0x06 => {
                // The invalid-opcode vector still points at the BIOS
                // page: the guest hit an instruction we don't have.
                let ip = cpu.stack_peek(0);
                let cs = cpu.stack_peek(2);
                let op = cpu.mem.get8(cpu.linear(cs, ip));
                self.fatal(&format!(
                    "error, unimplemented opcode {:02X} at cs:ip = {:04X}:{:04X}",
                    op, cs, ip
                ));
            }
            0x10 => self.video.int10(cpu),
            0x11 => bios::int11(cpu),
            0x12 => bios::int12(cpu),
            0x16 => self.int16(cpu),
            0x19 => {
                log::debug!(target: "int", "INT 19: System reset!");
                self.request_exit(0);
            }
            0x1A => self.timer.int1a(cpu),
            0x20 => self.int20(cpu),
            0x21 => self.int21(cpu),
            0x22 => self.int22(cpu),
            0x28 => self.int28(cpu),
            0x2A => {} // network access: ignored
            0x2F => self.int2f(cpu),
            _ => {
                log::debug!(target: "int", "UNHANDLED INT {:02x}, AX={:04x}", num, cpu.ax());
            }
        }
    }

    fn request_exit(&mut self, code: u16) {
        Hardware::request_exit(self, code);
    }

    fn fatal(&mut self, msg: &str) {
        Hardware::fatal(self, msg);
    }

    fn reset_hook(&mut self, cpu: &mut Cpu) {
        bios::init_bios_mem(&mut cpu.mem);
        self.timer.update(&mut cpu.mem);
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub hw: Hardware,
    tick: Option<(timer::TickTimer, timer::TickGuard)>,
}

impl Emulator {
    pub fn new() -> Emulator {
        let cpu = Cpu::new();
        let break_exec = cpu.break_exec.clone();
        let mut emu = Emulator { cpu, hw: Hardware::new(break_exec), tick: None };
        bios::init_bios_mem(&mut emu.cpu.mem);
        emu.hw.timer.update(&mut emu.cpu.mem);
        emu
    }

    /// Load and lay out a DOS EXE/COM program with its PSP.
    pub fn boot_dos(&mut self, prog: &Path, args: &[String], env: &[String]) -> Result<(), String> {
        self.hw.dos.boot(&mut self.cpu, prog, args, env)
    }

    /// Load a raw binary at a linear address, for running bare test
    /// images without any DOS around them.
    pub fn load_binary(&mut self, data: &[u8], addr: u32, seg: u16, ip: u16) {
        let max = (0xFFFFF - addr) as usize;
        let n = data.len().min(max);
        self.cpu.mem.write_block(addr, &data[..n]);
        self.cpu.set_ip(ip);
        self.cpu.set_data_segment(fields::SegReg::CS, seg);
        self.cpu.set_data_segment(fields::SegReg::DS, 0);
        self.cpu.set_data_segment(fields::SegReg::ES, 0);
        self.cpu.set_data_segment(fields::SegReg::SS, 0);
        self.cpu.set_sp(0xFFFF);
    }

    /// Run until the guest terminates; returns the guest exit code.
    pub fn run(&mut self) -> u16 {
        // The ~18.2 Hz heartbeat: pop out of the inner loop so the
        // timer, screen and keyboard stay fresh.
        let tick = timer::TickTimer::new();
        let flag = self.cpu.break_exec.clone();
        let guard = tick.schedule(move || flag.store(true, Ordering::Relaxed));
        self.tick = Some((tick, guard));

        loop {
            self.cpu.execute(&mut self.hw);
            if let Some(code) = self.hw.exit_code {
                self.tick = None;
                return code;
            }
            self.hw.update(&mut self.cpu);
        }
    }
}
