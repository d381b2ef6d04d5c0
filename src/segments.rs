// Segmentation and the interrupt engine. Real mode fills the per-segment
// caches arithmetically; protected mode walks the GDT/LDT and keeps the
// decoded descriptor in the cache. Far control transfers, interrupt
// delivery and privilege transitions all live here because they are the
// only places the two worlds meet.

use bitflags::bitflags;

use crate::fields::SegReg;
use crate::processor::Cpu;

bitflags! {
    /// Descriptor access byte.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Access: u8 {
        const ACCESSED = 0x01;
        /// Writable (data) or readable (code).
        const RW = 0x02;
        /// Expand-down (data) or conforming (code).
        const DC = 0x04;
        const EXEC = 0x08;
        /// Set for code/data descriptors, clear for system descriptors.
        const SEGMENT = 0x10;
        const PRESENT = 0x80;
    }
}

/// Fault vectors.
pub const EX_DE: u8 = 0;
pub const EX_DB: u8 = 1;
pub const EX_BP: u8 = 3;
pub const EX_OF: u8 = 4;
pub const EX_BR: u8 = 5;
pub const EX_UD: u8 = 6;
pub const EX_TS: u8 = 10;
pub const EX_NP: u8 = 11;
pub const EX_GP: u8 = 13;

/// A CPU exception on its way to the interrupt engine. The error code is
/// pushed for the fault vectors that define one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fault {
    pub vector: u8,
    pub error: Option<u16>,
}

impl Fault {
    pub fn gp(error: u16) -> Fault {
        Fault { vector: EX_GP, error: Some(error) }
    }
    pub fn np(error: u16) -> Fault {
        Fault { vector: EX_NP, error: Some(error) }
    }
    pub fn ts(error: u16) -> Fault {
        Fault { vector: EX_TS, error: Some(error) }
    }
}

/// One cached segment register.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SegCache {
    pub base: u32,
    pub limit: u16,
    pub selector: u16,
    pub flags: u8,
    pub rpl: u8,
}

impl SegCache {
    pub fn real_mode(selector: u16) -> SegCache {
        SegCache { base: selector as u32 * 16, limit: 0xFFFF, selector, flags: 0x92, rpl: 0 }
    }

    pub fn dpl(&self) -> u8 {
        (self.flags >> 5) & 3
    }
    pub fn present(&self) -> bool {
        Access::from_bits_truncate(self.flags).contains(Access::PRESENT)
    }
    pub fn executable(&self) -> bool {
        Access::from_bits_truncate(self.flags).contains(Access::EXEC)
    }
    pub fn conforming(&self) -> bool {
        Access::from_bits_truncate(self.flags).contains(Access::EXEC | Access::DC)
    }
}

/// GDTR/IDTR/LDTR contents.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}

/// Task register with its cached descriptor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TaskReg {
    pub selector: u16,
    pub base: u32,
    pub limit: u16,
    pub flags: u8,
}

/// Raw 8-byte descriptor as read from a table.
#[derive(Debug, Copy, Clone)]
pub struct Descriptor {
    pub limit: u16,
    pub base0: u16,
    pub base1: u8,
    pub flags: u8,
}

impl Descriptor {
    pub fn dpl(&self) -> u8 {
        (self.flags >> 5) & 3
    }
}

impl Cpu {
    /// Read a descriptor from the GDT or LDT; selector bit 2 picks the
    /// table. A null selector or an out-of-limit index is a #GP.
    pub fn read_descriptor(&self, selector: u16) -> Result<Descriptor, Fault> {
        if selector == 0 {
            return Err(Fault::gp(selector));
        }
        let table = if selector & 0x04 != 0 { self.ldtr } else { self.gdtr };
        if (selector | 0x07) > table.limit {
            return Err(Fault::gp(selector));
        }
        let off = table.base + (selector & 0xFFF8) as u32;
        Ok(Descriptor {
            limit: self.mem.get16(off),
            base0: self.mem.get16(off + 2),
            base1: self.mem.get8(off + 4),
            flags: self.mem.get8(off + 5),
        })
    }

    /// Build a segment cache entry from a protected-mode selector. A null
    /// selector silently yields an all-zero cache, usable as DS/ES.
    pub fn segment_cache(&self, selector: u16) -> Result<SegCache, Fault> {
        if selector == 0 {
            return Ok(SegCache { selector, ..SegCache::default() });
        }
        let desc = self.read_descriptor(selector)?;
        let cache = SegCache {
            flags: desc.flags,
            selector,
            limit: desc.limit,
            base: desc.base0 as u32 | ((desc.base1 as u32) << 16),
            rpl: (selector & 3) as u8,
        };
        if cache.base & 3 != 0 {
            log::debug!(target: "cpu", "warning: segment base = {:06X} not aligned", cache.base);
        }
        log::debug!(target: "cpu",
            "LOAD SEGMENT {:4X}: BASE:{:06X} LIMIT:{:04X} FLAGS={:02X} RPL={}",
            selector, cache.base, cache.limit, cache.flags, cache.rpl);
        if desc.flags & Access::SEGMENT.bits() == 0 {
            return Err(Fault::gp(selector));
        }
        if desc.flags & Access::PRESENT.bits() == 0 {
            return Err(Fault::np(selector));
        }
        Ok(cache)
    }

    /// Load DS/ES/SS (or CS through the external register interface).
    pub fn set_data_segment(&mut self, seg: SegReg, selector: u16) {
        if self.protected_mode() {
            match self.segment_cache(selector) {
                Ok(cache) => self.segs[seg as usize] = cache,
                Err(f) => self.except(f),
            }
        } else {
            self.segs[seg as usize] = SegCache::real_mode(selector);
        }
    }

    /// Load CS; `set_cpl` adopts the descriptor's DPL as the new CPL.
    pub fn set_code_segment(&mut self, selector: u16, set_cpl: bool) {
        if self.protected_mode() {
            if selector == 0 {
                return self.gp(selector);
            }
            let cache = match self.segment_cache(selector) {
                Ok(c) => c,
                Err(f) => return self.except(f),
            };
            if set_cpl {
                self.cpl = cache.dpl();
            }
            self.segs[SegReg::CS as usize] = cache;
        } else {
            self.segs[SegReg::CS as usize] = SegCache::real_mode(selector);
        }
    }

    pub fn set_task_register(&mut self, selector: u16) {
        if selector & 0xFFFC == 0 {
            self.task = TaskReg { selector, ..TaskReg::default() };
            return;
        }
        // A TSS descriptor can't come from the LDT.
        if selector & 0x04 != 0 {
            return self.gp(selector);
        }
        if (selector | 0x07) > self.gdtr.limit {
            return self.gp(selector);
        }
        let off = self.gdtr.base + (selector & 0xFFF8) as u32;
        self.task = TaskReg {
            limit: self.mem.get16(off),
            base: self.mem.get16(off + 2) as u32 | ((self.mem.get8(off + 4) as u32) << 16),
            flags: self.mem.get8(off + 5),
            selector,
        };
    }

    // Interrupt engine.

    pub fn interrupt(&mut self, num: u8) {
        self.interrupt_full(num, None);
    }

    /// Deliver vector `num`, optionally pushing an error code. More than
    /// two nested deliveries without progress is a triple fault and
    /// schedules a full CPU reset.
    pub fn interrupt_full(&mut self, num: u8, error_code: Option<u16>) {
        self.in_fault += 1;
        if self.in_fault > 2 {
            log::debug!(target: "cpu", "Triple fault, reset CPU");
            self.in_fault = 0;
            self.reset_pending = true;
            return;
        }

        if self.protected_mode() {
            let off = num as u16 * 8;
            let base = self.idtr.base;
            log::debug!(target: "cpu", "INTERRUPT {}: ID: {:04x}:{:04x}:{:04x}:{:04x}", num,
                self.mem.get16(base + off as u32),
                self.mem.get16(base + off as u32 + 2),
                self.mem.get16(base + off as u32 + 4),
                self.mem.get16(base + off as u32 + 6));
            let prot = self.mem.get8(base + off as u32 + 5);
            // Only present trap/interrupt gates are acceptable.
            if off + 7 > self.idtr.limit || 0x86 != (prot & 0x9E) {
                return self.gp(off + 2);
            }
            let dest_off = self.mem.get16(base + off as u32);
            let dest_seg = self.mem.get16(base + off as u32 + 2);

            let old_cpl = self.cpl;
            let old_cs = self.seg_selector(SegReg::CS);
            let old_ip = self.ip;
            let old_flags = self.flags.compress() | ((self.iopl as u16) << 12);

            let cache = match self.segment_cache(dest_seg) {
                Ok(c) if dest_seg != 0 => c,
                Ok(_) => return self.gp(dest_seg),
                Err(f) => return self.except(f),
            };
            self.cpl = cache.dpl();
            self.segs[SegReg::CS as usize] = cache;
            self.ip = dest_off;

            if self.cpl < old_cpl {
                let old_ss = self.seg_selector(SegReg::SS);
                let old_sp = self.sp();

                // Inner stack comes from the TSS.
                let idx = self.cpl as u16 * 4 + 2;
                if idx + 3 > self.task.limit {
                    return self.gp(self.task.selector);
                }
                let new_sp = self.mem.get16(self.task.base + idx as u32);
                let new_ss = self.mem.get16(self.task.base + idx as u32 + 2);
                if new_ss & 0xFFFC == 0 {
                    self.cpl = old_cpl;
                    return self.except(Fault::ts(new_ss & 0xFFFC));
                }
                self.set_sp(new_sp);
                match self.segment_cache(new_ss) {
                    Ok(c) => self.segs[SegReg::SS as usize] = c,
                    Err(f) => return self.except(f),
                }
                log::debug!(target: "cpu", "loading new stack: {:04x}:{:04x}", new_ss, new_sp);
                self.push(old_ss);
                self.push(old_sp);
            }

            self.push(old_flags);
            self.push(old_cs);
            self.push(old_ip);
            if let Some(code) = error_code {
                self.push(code);
            }
            log::debug!(target: "cpu", "INTERRUPT from PM to {:04x}:{:04x}",
                self.seg_selector(SegReg::CS), self.ip);
        } else {
            let dest_off = self.mem.get16(num as u32 * 4);
            let dest_seg = self.mem.get16(num as u32 * 4 + 2);
            let flags = self.flags.compress();
            self.push(flags);
            let cs = self.seg_selector(SegReg::CS);
            self.push(cs);
            let ip = self.ip;
            self.push(ip);
            self.ip = dest_off;
            self.set_code_segment(dest_seg, true);
        }
        self.flags.trap = false;
        self.flags.interrupt = false;
        self.in_fault = 0;
    }

    /// CPU fault: rewind to the start of the faulting instruction, then
    /// deliver.
    pub fn trap(&mut self, num: u8) {
        self.ip = self.start_ip;
        log::debug!(target: "cpu", "{}TRAP {}",
            if self.protected_mode() { "In PM, " } else { "" }, num);
        self.interrupt_full(num, None);
    }

    pub fn gp(&mut self, error: u16) {
        self.ip = self.start_ip;
        log::debug!(target: "cpu", "#GP({:4x})", error);
        self.interrupt_full(EX_GP, Some(error));
    }

    pub fn except(&mut self, fault: Fault) {
        self.ip = self.start_ip;
        match fault.vector {
            EX_NP => log::debug!(target: "cpu", "#NP({:4x})", fault.error.unwrap_or(0)),
            EX_GP => log::debug!(target: "cpu", "#GP({:4x})", fault.error.unwrap_or(0)),
            EX_TS => log::debug!(target: "cpu", "#TS({:4x})", fault.error.unwrap_or(0)),
            v => log::debug!(target: "cpu", "exception {}", v),
        }
        self.interrupt_full(fault.vector, fault.error);
    }

    /// Far return / IRET. In protected mode this validates the target
    /// code segment and, on an outer-level return, reloads the outer
    /// stack and drops stale data-segment caches.
    pub fn do_retf(&mut self, is_iret: bool, count: u16) {
        if self.protected_mode() {
            let old_cpl = self.cpl;
            let old_flags = self.flags.compress();

            self.ip = self.pop();
            let cs = self.pop();

            // Can't return to a null selector or to a lower RPL.
            if cs == 0 || (cs & 3) < self.cpl as u16 {
                return self.gp(cs);
            }
            let cache = match self.segment_cache(cs) {
                Ok(c) => c,
                Err(_) => return self.gp(cs),
            };
            if !cache.executable() || !cache.present() {
                return self.gp(cs);
            }
            if cache.conforming() {
                if cache.dpl() > cache.rpl {
                    return self.gp(cs);
                }
            } else if cache.dpl() != cache.rpl {
                return self.gp(cs);
            }
            if self.ip > cache.limit {
                return self.gp(0);
            }

            if is_iret {
                let f = self.pop();
                self.flags.expand(f);
                if self.cpl == 0 {
                    self.iopl = ((f & 0x3000) >> 12) as u8;
                }
            }
            self.wregs[crate::fields::SP] = self.sp().wrapping_add(count);

            if self.cpl != cache.rpl {
                // Return to the outer privilege level.
                let new_sp = self.pop();
                let new_ss = self.pop();
                if new_ss & 0xFFFC == 0 {
                    self.cpl = old_cpl;
                    self.flags.expand(old_flags);
                    return self.except(Fault::ts(new_ss & 0xFFFC));
                }
                self.cpl = cache.rpl;
                self.set_sp(new_sp);
                log::debug!(target: "cpu", "will load stack to {:04x}:{:04x}", new_ss, new_sp);
                match self.segment_cache(new_ss) {
                    Ok(c) => self.segs[SegReg::SS as usize] = c,
                    Err(f) => self.except(f),
                }
                // Revalidate DS/ES so a stale cache can't outlive the
                // privilege drop.
                for seg in [SegReg::DS, SegReg::ES] {
                    let sel = self.seg_selector(seg);
                    match self.segment_cache(sel) {
                        Ok(c) => self.segs[seg as usize] = c,
                        Err(_) => self.segs[seg as usize] = SegCache { selector: 0, ..SegCache::default() },
                    }
                }
            }
            self.segs[SegReg::CS as usize] = cache;
        } else {
            self.ip = self.pop();
            let cs = self.pop();
            self.set_code_segment(cs, false);
            if is_iret {
                let f = self.pop();
                self.flags.expand(f);
            }
            self.wregs[crate::fields::SP] = self.sp().wrapping_add(count);
        }
    }

    /// Far JMP/CALL to seg:off, protected mode included. Call gates copy
    /// up to 31 parameter words onto the inner stack.
    pub fn do_jmp_far(&mut self, new_ip: u16, cs: u16, is_call: bool) {
        let old_cs = self.seg_selector(SegReg::CS);
        let old_ip = self.ip;

        if self.protected_mode() {
            self.ip = new_ip;
            let desc = match self.read_descriptor(cs) {
                Ok(d) => d,
                Err(f) => return self.except(f),
            };
            if desc.dpl() < self.cpl {
                return self.gp(cs);
            }
            if desc.flags & Access::SEGMENT.bits() == 0 {
                // Call gate.
                log::debug!(target: "cpu", "CALL GATE {:04x} ({:02x}:{:02x}:{:04x}:{:04x})",
                    cs, desc.flags, desc.base1, desc.base0, desc.limit);
                if desc.flags & Access::PRESENT.bits() == 0 {
                    return self.except(Fault::np(cs));
                }
                if desc.flags & 0x0F != 4 {
                    log::debug!(target: "cpu", "UNSUPPORTED GATE TYPE");
                    return self.except(Fault::gp(cs));
                }
                // Target comes from the gate itself.
                let gate_cs = desc.base0 & 0xFFF8;
                self.ip = desc.limit;
                let cache = match self.segment_cache(gate_cs) {
                    Ok(c) => c,
                    Err(f) => return self.except(f),
                };
                if cache.dpl() > self.cpl {
                    return self.gp(gate_cs);
                }
                self.segs[SegReg::CS as usize] = cache;

                if self.cpl != cache.dpl() {
                    let old_ss = self.seg_selector(SegReg::SS);
                    let old_sp = self.sp();

                    // Parameter words to move between the stacks.
                    let nwords = (desc.base1 & 0x1F) as u16;
                    let mut stack_copy = [0u16; 32];
                    for i in 0..nwords {
                        stack_copy[i as usize] =
                            self.mem_r16(SegReg::SS, old_sp.wrapping_add(i * 2));
                    }
                    self.cpl = cache.dpl();

                    let idx = self.cpl as u16 * 4 + 2;
                    if idx + 3 > self.task.limit {
                        return self.gp(self.task.selector);
                    }
                    let new_sp = self.mem.get16(self.task.base + idx as u32);
                    let new_ss = self.mem.get16(self.task.base + idx as u32 + 2);
                    if new_ss & 0xFFFC == 0 {
                        return self.except(Fault::ts(new_ss & 0xFFFC));
                    }
                    self.set_sp(new_sp);
                    match self.segment_cache(new_ss) {
                        Ok(c) => self.segs[SegReg::SS as usize] = c,
                        Err(f) => return self.except(f),
                    }
                    log::debug!(target: "cpu", "loaded new stack: {:04x}:{:04x}",
                        self.seg_selector(SegReg::SS), self.sp());

                    self.push(old_ss);
                    self.push(old_sp);
                    for i in (0..nwords).rev() {
                        self.push(stack_copy[i as usize]);
                    }
                    if is_call {
                        self.push(old_cs);
                        self.push(old_ip);
                    }
                    return;
                }
            } else {
                let cache = match self.segment_cache(cs) {
                    Ok(c) => c,
                    Err(f) => return self.except(f),
                };
                self.segs[SegReg::CS as usize] = cache;
            }
        } else {
            self.ip = new_ip;
            self.segs[SegReg::CS as usize] = SegCache::real_mode(cs);
        }

        if is_call {
            self.push(old_cs);
            self.push(old_ip);
        }
    }
}
