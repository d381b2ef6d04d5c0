// This is the place for the CPU state and the instruction loop. The
// decoding itself lives in the parser module, the per-instruction
// semantics in the instructions module, and everything related to
// descriptors and privilege in the segments module; what stays here is
// the register file, flags, fetch/stack plumbing, IRQ delivery and the
// narrow trait the host machine plugs into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::alu::Flags;
use crate::fields::{SegReg, AX, BP, BX, CX, DI, DX, SI, SP};
use crate::memory::Memory;
use crate::parser;
use crate::segments::{SegCache, TableReg, TaskReg};

/// The services the emulated machine provides to the CPU core: port I/O,
/// the BIOS/DOS trampoline at segment 0, and process-level control.
pub trait Platform {
    fn read_port(&mut self, cpu: &mut Cpu, port: u16) -> u8;
    fn write_port(&mut self, cpu: &mut Cpu, port: u16, value: u8);
    /// A fetch from CS=0, IP<0x100 lands here; `num` is the service slot.
    fn bios_service(&mut self, cpu: &mut Cpu, num: u8);
    /// Ask the host to terminate the emulation with the given exit code.
    fn request_exit(&mut self, code: u16);
    /// Unrecoverable emulation error: report and terminate.
    fn fatal(&mut self, msg: &str);
    /// Called after a triple-fault CPU reset so the machine can restore
    /// its BIOS state.
    fn reset_hook(&mut self, cpu: &mut Cpu);
}

/// A do-nothing platform, handy for exercising the bare CPU.
pub struct NullPlatform;

impl Platform for NullPlatform {
    fn read_port(&mut self, _cpu: &mut Cpu, _port: u16) -> u8 {
        0xFF
    }
    fn write_port(&mut self, _cpu: &mut Cpu, _port: u16, _value: u8) {}
    fn bios_service(&mut self, _cpu: &mut Cpu, _num: u8) {}
    fn request_exit(&mut self, _code: u16) {}
    fn fatal(&mut self, msg: &str) {
        panic!("cpu fatal: {}", msg);
    }
    fn reset_hook(&mut self, _cpu: &mut Cpu) {}
}

pub struct Cpu {
    /// Word registers, indexed AX,CX,DX,BX,SP,BP,SI,DI.
    pub wregs: [u16; 8],
    pub ip: u16,
    /// IP at the start of the current instruction, for fault restart.
    pub start_ip: u16,
    pub flags: Flags,
    /// Segment caches, indexed ES,CS,SS,DS.
    pub segs: [SegCache; 4],
    /// Machine status word; bit 0 is protection enable.
    pub msw: u16,
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub ldtr: TableReg,
    pub task: TaskReg,
    pub cpl: u8,
    pub iopl: u8,
    /// Pending hardware interrupts, bit n = IRQ n.
    pub irq_mask: u16,
    pub mem: Memory,
    /// Set from the timer tick (or an exit request) to leave the inner
    /// instruction loop between two instructions.
    pub break_exec: Arc<AtomicBool>,
    /// Nested-fault depth; more than two means triple fault.
    pub(crate) in_fault: u8,
    pub(crate) reset_pending: bool,
    exe_zero: u32,
}

impl Cpu {
    pub fn new() -> Cpu {
        let mut cpu = Cpu {
            wregs: [0; 8],
            ip: 0,
            start_ip: 0,
            flags: Flags::default(),
            segs: [SegCache::default(); 4],
            msw: 0xFFF0,
            gdtr: TableReg::default(),
            idtr: TableReg::default(),
            ldtr: TableReg::default(),
            task: TaskReg::default(),
            cpl: 0,
            iopl: 0,
            irq_mask: 0,
            mem: Memory::new(),
            break_exec: Arc::new(AtomicBool::new(false)),
            in_fault: 0,
            reset_pending: false,
            exe_zero: 0,
        };
        cpu.reset();
        cpu
    }

    /// Hardware reset state: real mode, CS:IP = F000:FFF0.
    pub fn reset(&mut self) {
        self.msw = 0xFFF0;
        self.idtr = TableReg { base: 0, limit: 0x03FF };
        self.gdtr = TableReg { base: 0, limit: 0xFFFF };
        self.ldtr = TableReg { base: 0, limit: 0xFFFF };
        self.cpl = 0;
        self.segs[SegReg::CS as usize] = SegCache::real_mode(0xF000);
        self.segs[SegReg::DS as usize] = SegCache::real_mode(0);
        self.segs[SegReg::ES as usize] = SegCache::real_mode(0);
        self.segs[SegReg::SS as usize] = SegCache::real_mode(0);
        self.task = TaskReg::default();
        self.wregs = [0; 8];
        self.ip = 0xFFF0;
        self.flags = Flags::default();
    }

    pub fn protected_mode(&self) -> bool {
        self.msw & 1 != 0
    }

    // Register accessors, for the host-service side of the machine.

    pub fn ax(&self) -> u16 {
        self.wregs[AX]
    }
    pub fn cx(&self) -> u16 {
        self.wregs[CX]
    }
    pub fn dx(&self) -> u16 {
        self.wregs[DX]
    }
    pub fn bx(&self) -> u16 {
        self.wregs[BX]
    }
    pub fn sp(&self) -> u16 {
        self.wregs[SP]
    }
    pub fn bp(&self) -> u16 {
        self.wregs[BP]
    }
    pub fn si(&self) -> u16 {
        self.wregs[SI]
    }
    pub fn di(&self) -> u16 {
        self.wregs[DI]
    }
    pub fn al(&self) -> u8 {
        self.wregs[AX] as u8
    }
    pub fn ah(&self) -> u8 {
        (self.wregs[AX] >> 8) as u8
    }
    pub fn set_ax(&mut self, v: u16) {
        self.wregs[AX] = v;
    }
    pub fn set_cx(&mut self, v: u16) {
        self.wregs[CX] = v;
    }
    pub fn set_dx(&mut self, v: u16) {
        self.wregs[DX] = v;
    }
    pub fn set_bx(&mut self, v: u16) {
        self.wregs[BX] = v;
    }
    pub fn set_sp(&mut self, v: u16) {
        self.wregs[SP] = v;
    }
    pub fn set_bp(&mut self, v: u16) {
        self.wregs[BP] = v;
    }
    pub fn set_si(&mut self, v: u16) {
        self.wregs[SI] = v;
    }
    pub fn set_di(&mut self, v: u16) {
        self.wregs[DI] = v;
    }
    pub fn set_al(&mut self, v: u8) {
        self.wregs[AX] = (self.wregs[AX] & 0xFF00) | v as u16;
    }
    pub fn set_ah(&mut self, v: u8) {
        self.wregs[AX] = (self.wregs[AX] & 0x00FF) | ((v as u16) << 8);
    }
    pub fn set_ip(&mut self, v: u16) {
        self.ip = v;
    }

    pub fn seg_selector(&self, seg: SegReg) -> u16 {
        self.segs[seg as usize].selector
    }

    /// Byte register file view: indices 0-7 are AL,CL,DL,BL,AH,CH,DH,BH.
    pub fn reg8(&self, idx: usize) -> u8 {
        let r = self.wregs[idx & 3];
        if idx & 4 != 0 {
            (r >> 8) as u8
        } else {
            r as u8
        }
    }

    pub fn set_reg8(&mut self, idx: usize, val: u8) {
        let r = &mut self.wregs[idx & 3];
        if idx & 4 != 0 {
            *r = (*r & 0x00FF) | ((val as u16) << 8);
        } else {
            *r = (*r & 0xFF00) | val as u16;
        }
    }

    // Segment-relative memory access through the descriptor caches.

    pub fn mem_r8(&self, seg: SegReg, off: u16) -> u8 {
        self.mem.get8(self.segs[seg as usize].base.wrapping_add(off as u32))
    }

    pub fn mem_r16(&self, seg: SegReg, off: u16) -> u16 {
        self.mem.get16(self.segs[seg as usize].base.wrapping_add(off as u32))
    }

    pub fn mem_w8(&mut self, seg: SegReg, off: u16, val: u8) {
        let addr = self.segs[seg as usize].base.wrapping_add(off as u32);
        self.mem.put8(addr, val);
    }

    pub fn mem_w16(&mut self, seg: SegReg, off: u16, val: u16) {
        let addr = self.segs[seg as usize].base.wrapping_add(off as u32);
        self.mem.put16(addr, val);
    }

    /// 48-bit read used by LGDT/LIDT/LLDT: limit word plus 32-bit base.
    pub fn mem_r48(&self, seg: SegReg, off: u16) -> (u16, u32) {
        let limit = self.mem_r16(seg, off);
        let base = self.mem_r16(seg, off.wrapping_add(2)) as u32
            | ((self.mem_r16(seg, off.wrapping_add(4)) as u32) << 16);
        (limit, base)
    }

    pub fn mem_w48(&mut self, seg: SegReg, off: u16, limit: u16, base: u32) {
        self.mem_w16(seg, off, limit);
        self.mem_w16(seg, off.wrapping_add(2), base as u16);
        self.mem_w16(seg, off.wrapping_add(4), (base >> 16) as u16);
    }

    /// Real-mode linear address of seg:off, clamped below the HMA.
    pub fn linear(&self, seg: u16, off: u16) -> u32 {
        0xFFFFF & (seg as u32 * 16 + off as u32)
    }

    pub fn addr_ds(&self, off: u16) -> u32 {
        0xFFFFF & self.segs[SegReg::DS as usize].base.wrapping_add(off as u32)
    }

    pub fn addr_es(&self, off: u16) -> u32 {
        0xFFFFF & self.segs[SegReg::ES as usize].base.wrapping_add(off as u32)
    }

    pub fn addr_cs(&self, off: u16) -> u32 {
        0xFFFFF & self.segs[SegReg::CS as usize].base.wrapping_add(off as u32)
    }

    // Stack.

    pub fn push(&mut self, val: u16) {
        self.wregs[SP] = self.wregs[SP].wrapping_sub(2);
        self.mem_w16(SegReg::SS, self.wregs[SP], val);
    }

    pub fn pop(&mut self) -> u16 {
        let v = self.mem_r16(SegReg::SS, self.wregs[SP]);
        self.wregs[SP] = self.wregs[SP].wrapping_add(2);
        v
    }

    /// Word on the stack at SP+disp, used by the host services to reach
    /// into the interrupt return frame.
    pub fn stack_peek(&self, disp: u16) -> u16 {
        self.mem_r16(SegReg::SS, self.wregs[SP].wrapping_add(disp))
    }

    /// Set bits in the FLAGS word saved by the INT that entered the
    /// current BIOS/DOS service, so they survive the IRET.
    pub fn set_return_flags(&mut self, mask: u16) {
        let off = self.wregs[SP].wrapping_add(4);
        let f = self.mem_r16(SegReg::SS, off);
        self.mem_w16(SegReg::SS, off, f | mask);
    }

    pub fn clr_return_flags(&mut self, mask: u16) {
        let off = self.wregs[SP].wrapping_add(4);
        let f = self.mem_r16(SegReg::SS, off);
        self.mem_w16(SegReg::SS, off, f & !mask);
    }

    // Fetch.

    pub fn fetch_b(&mut self) -> u8 {
        let v = self.mem_r8(SegReg::CS, self.ip);
        self.ip = self.ip.wrapping_add(1);
        v
    }

    pub fn fetch_w(&mut self) -> u16 {
        let v = self.mem_r16(SegReg::CS, self.ip);
        self.ip = self.ip.wrapping_add(2);
        v
    }

    // Interrupt requests from the outside world. IRQ 0-7 map to vectors
    // 08h-0Fh, IRQ 8-15 to 70h-77h.

    pub fn trigger_irq(&mut self, num: u8) {
        self.irq_mask |= 1 << num;
    }

    pub fn handle_irq(&mut self) {
        // IRQs are left pending in protected mode; DOS guests get their
        // interrupts delivered once they are back in real mode.
        if !self.flags.interrupt || self.irq_mask == 0 || self.protected_mode() {
            return;
        }
        let irqn = self.irq_mask.trailing_zeros() as u8;
        self.irq_mask &= self.irq_mask - 1;
        log::debug!(target: "int", "handle irq, irq={}", irqn);
        let vector = if irqn < 8 { 8 + irqn } else { 0x68 + irqn };
        self.interrupt(vector);
    }

    pub fn set_a20(&mut self, enabled: bool) {
        log::debug!(target: "int", "{} A20", if enabled { "enable" } else { "disable" });
        self.mem.set_a20(enabled);
    }

    /// Run instructions until the break flag is raised by the timer tick
    /// or an exit request.
    pub fn execute(&mut self, hw: &mut impl Platform) {
        while !self.break_exec.swap(false, Ordering::Relaxed) {
            self.handle_irq();
            let tf = self.flags.trap;
            self.step(hw);
            // A set TF single-steps: the instruction runs, then INT 1.
            if tf && self.flags.trap {
                self.interrupt(1);
            }
        }
    }

    /// Fetch and execute one instruction, or run one BIOS service when
    /// execution reaches the trampoline page at segment 0.
    pub fn step(&mut self, hw: &mut impl Platform) {
        self.start_ip = self.ip;
        if self.seg_selector(SegReg::CS) == 0 && self.ip < 0x100 {
            // The low IVT page doubles as the BIOS entry table: the
            // offset itself names the service, and the service body is a
            // host routine followed by an IRET.
            let num = self.ip as u8;
            self.ip = self.ip.wrapping_add(1);
            hw.bios_service(self, num);
            self.do_retf(true, 0);
        } else {
            self.guard_zero_run(hw);
            if log::log_enabled!(target: "cpu", log::Level::Debug) {
                self.log_state();
            }
            let instr = parser::decode(self);
            instr.execute(self, hw);
        }
        if self.reset_pending {
            self.reset_pending = false;
            self.reset();
            hw.reset_hook(self);
        }
    }

    /// A long run of zero opcodes means the guest jumped into empty
    /// memory; abort instead of looping on ADD [BX+SI],AL forever.
    fn guard_zero_run(&mut self, hw: &mut impl Platform) {
        if self.mem_r8(SegReg::CS, self.ip) == 0
            && self.mem_r8(SegReg::CS, self.ip.wrapping_add(1)) == 0
        {
            self.exe_zero += 1;
            if self.exe_zero > 16 {
                hw.fatal(&format!(
                    "error, executing zeroed memory at cs:ip = {:04X}:{:04X}",
                    self.seg_selector(SegReg::CS),
                    self.ip
                ));
                self.exe_zero = 0;
            }
        } else {
            self.exe_zero = 0;
        }
    }

    fn log_state(&self) {
        let f = &self.flags;
        log::debug!(target: "cpu",
            "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SP={:04X} BP={:04X} SI={:04X} DI={:04X} \
             DS={:04X} ES={:04X} SS={:04X} CS={:04X} IP={:04X} {} {} {} {} {} {} {} {} [{:02X} {:02X} {:02X} {:02X}]",
            self.ax(), self.bx(), self.cx(), self.dx(), self.sp(), self.bp(), self.si(), self.di(),
            self.seg_selector(SegReg::DS), self.seg_selector(SegReg::ES),
            self.seg_selector(SegReg::SS), self.seg_selector(SegReg::CS), self.ip,
            if f.overflow { "OV" } else { "NV" },
            if f.direction { "DN" } else { "UP" },
            if f.interrupt { "EI" } else { "DI" },
            if f.sign { "NG" } else { "PL" },
            if f.zero { "ZR" } else { "NZ" },
            if f.adjust { "AC" } else { "NA" },
            if f.parity { "PE" } else { "PO" },
            if f.carry { "CY" } else { "NC" },
            self.mem_r8(SegReg::CS, self.ip),
            self.mem_r8(SegReg::CS, self.ip.wrapping_add(1)),
            self.mem_r8(SegReg::CS, self.ip.wrapping_add(2)),
            self.mem_r8(SegReg::CS, self.ip.wrapping_add(3)),
        );
    }
}
