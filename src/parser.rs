// This is where the dirty grunt work of making sense of the byte stream
// happens. One call to decode() consumes the prefixes, the opcode, the
// ModRM byte and any displacement/immediate bytes, and lowers the whole
// thing into an Instruction with its operands already resolved against
// the prefix state. The executor never sees an encoding again.

use crate::fields::*;
use crate::instructions::{Instruction, ShiftCount};
use crate::processor::Cpu;

/// Effective-address offset for a memory ModRM, displacement included.
/// Mirrors the eight 8086 base+index rows; mod=00 r/m=110 is the direct
/// 16-bit address form.
fn modrm_offset(cpu: &mut Cpu, modrm: u8) -> u16 {
    let r = cpu.wregs;
    match modrm & 0xC7 {
        0x00 => r[BX].wrapping_add(r[SI]),
        0x01 => r[BX].wrapping_add(r[DI]),
        0x02 => r[BP].wrapping_add(r[SI]),
        0x03 => r[BP].wrapping_add(r[DI]),
        0x04 => r[SI],
        0x05 => r[DI],
        0x06 => cpu.fetch_w(),
        0x07 => r[BX],
        0x40..=0x47 => {
            let disp = cpu.fetch_b() as i8 as u16;
            let base = match modrm & 7 {
                0 => r[BX].wrapping_add(r[SI]),
                1 => r[BX].wrapping_add(r[DI]),
                2 => r[BP].wrapping_add(r[SI]),
                3 => r[BP].wrapping_add(r[DI]),
                4 => r[SI],
                5 => r[DI],
                6 => r[BP],
                _ => r[BX],
            };
            base.wrapping_add(disp)
        }
        0x80..=0x87 => {
            let disp = cpu.fetch_w();
            let base = match modrm & 7 {
                0 => r[BX].wrapping_add(r[SI]),
                1 => r[BX].wrapping_add(r[DI]),
                2 => r[BP].wrapping_add(r[SI]),
                3 => r[BP].wrapping_add(r[DI]),
                4 => r[SI],
                5 => r[DI],
                6 => r[BP],
                _ => r[BX],
            };
            base.wrapping_add(disp)
        }
        _ => 0,
    }
}

/// Default segment of a memory ModRM: SS whenever BP is in the base, DS
/// otherwise. The one exception is mod=00 r/m=110 (direct), which is DS.
fn modrm_default_seg(modrm: u8) -> SegReg {
    match modrm & 0xC7 {
        0x02 | 0x03 | 0x42 | 0x43 | 0x46 | 0x82 | 0x83 | 0x86 => SegReg::SS,
        _ => SegReg::DS,
    }
}

/// Resolve the r/m side of a ModRM byte into an operand, consuming any
/// displacement and applying the segment override.
fn modrm_rm(cpu: &mut Cpu, modrm: u8, prefixes: Prefixes) -> Operand {
    if modrm >= 0xC0 {
        Operand::Reg((modrm & 7) as usize)
    } else {
        let seg = prefixes.segment_for(modrm_default_seg(modrm));
        let off = modrm_offset(cpu, modrm);
        Operand::Mem(FatPtr::new(seg, off))
    }
}

fn modrm_reg(modrm: u8) -> usize {
    ((modrm >> 3) & 7) as usize
}

/// Memory-only ModRM form (LEA, LES, far pointers, descriptor tables).
/// Register encodings yield None, which the executor turns into #UD.
fn modrm_mem(cpu: &mut Cpu, modrm: u8, prefixes: Prefixes) -> Option<FatPtr> {
    match modrm_rm(cpu, modrm, prefixes) {
        Operand::Mem(ptr) => Some(ptr),
        _ => None,
    }
}

/// Fetch, decode and resolve the next instruction.
pub fn decode(cpu: &mut Cpu) -> Instruction {
    let mut prefixes = Prefixes::default();
    loop {
        let opcode = cpu.fetch_b();
        match opcode {
            0x26 => prefixes.segment = Some(SegReg::ES),
            0x2E => prefixes.segment = Some(SegReg::CS),
            0x36 => prefixes.segment = Some(SegReg::SS),
            0x3E => prefixes.segment = Some(SegReg::DS),
            0xF0 => {} // LOCK: single-processor machine, nothing to lock.
            0xF2 => prefixes.rep = Some(Rep::WhileNz),
            0xF3 => prefixes.rep = Some(Rep::WhileZ),
            _ => return decode_op(cpu, opcode, prefixes),
        }
    }
}

fn decode_op(cpu: &mut Cpu, opcode: u8, prefixes: Prefixes) -> Instruction {
    use Instruction as I;

    // The regular two-operand ALU block: eight ops with six forms each.
    if opcode < 0x40 && (opcode & 7) < 6 {
        let op = AluOp::from_bits((opcode >> 3) as usize);
        let w = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
        return match opcode & 7 {
            0 | 1 => {
                // op r/m, reg
                let modrm = cpu.fetch_b();
                let dst = modrm_rm(cpu, modrm, prefixes);
                I::Alu { op, w, dst, src: Operand::Reg(modrm_reg(modrm)) }
            }
            2 | 3 => {
                // op reg, r/m
                let modrm = cpu.fetch_b();
                let src = modrm_rm(cpu, modrm, prefixes);
                I::Alu { op, w, dst: Operand::Reg(modrm_reg(modrm)), src }
            }
            4 => {
                let imm = cpu.fetch_b() as u16;
                I::Alu { op, w, dst: Operand::Reg(AX), src: Operand::Imm(imm) }
            }
            _ => {
                let imm = cpu.fetch_w();
                I::Alu { op, w, dst: Operand::Reg(AX), src: Operand::Imm(imm) }
            }
        };
    }

    match opcode {
        0x06 => I::PushSeg { seg: SegReg::ES },
        0x07 => I::PopSeg { seg: SegReg::ES },
        0x0E => I::PushSeg { seg: SegReg::CS },
        0x0F => decode_0f(cpu, prefixes),
        0x16 => I::PushSeg { seg: SegReg::SS },
        0x17 => I::PopSeg { seg: SegReg::SS },
        0x1E => I::PushSeg { seg: SegReg::DS },
        0x1F => I::PopSeg { seg: SegReg::DS },
        0x27 => I::Daa,
        0x2F => I::Das,
        0x37 => I::Aaa,
        0x3F => I::Aas,
        0x40..=0x47 => I::IncDec {
            dec: false,
            w: Width::Word,
            dst: Operand::Reg((opcode & 7) as usize),
        },
        0x48..=0x4F => I::IncDec {
            dec: true,
            w: Width::Word,
            dst: Operand::Reg((opcode & 7) as usize),
        },
        0x54 => I::PushSp,
        0x50..=0x57 => I::Push { src: Operand::Reg((opcode & 7) as usize) },
        0x58..=0x5F => I::Pop { dst: Operand::Reg((opcode & 7) as usize) },
        0x60 => I::Pusha,
        0x61 => I::Popa,
        0x62 => {
            let modrm = cpu.fetch_b();
            let reg = modrm_reg(modrm);
            match modrm_mem(cpu, modrm, prefixes) {
                Some(mem) => I::Bound { reg, mem },
                None => I::Undefined,
            }
        }
        0x63..=0x67 => I::Undefined,
        0x68 => {
            let imm = cpu.fetch_w();
            I::Push { src: Operand::Imm(imm) }
        }
        0x69 => {
            let modrm = cpu.fetch_b();
            let src = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_w();
            I::ImulImm { reg: modrm_reg(modrm), src, imm }
        }
        0x6A => {
            let imm = cpu.fetch_b() as i8 as u16;
            I::Push { src: Operand::Imm(imm) }
        }
        0x6B => {
            let modrm = cpu.fetch_b();
            let src = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_b() as i8 as u16;
            I::ImulImm { reg: modrm_reg(modrm), src, imm }
        }
        0x6C..=0x6F => I::Str {
            op: if opcode < 0x6E { StringOp::Ins } else { StringOp::Outs },
            w: if opcode & 1 == 0 { Width::Byte } else { Width::Word },
            seg: prefixes.segment_for(SegReg::DS),
            rep: prefixes.rep,
        },
        0x70..=0x7F => {
            let disp = cpu.fetch_b() as i8;
            I::Jcc { cond: Cond::from_bits((opcode & 15) as usize), disp }
        }
        0x80 | 0x82 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_b() as u16;
            I::Alu { op: AluOp::from_bits(modrm_reg(modrm)), w: Width::Byte, dst, src: Operand::Imm(imm) }
        }
        0x81 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_w();
            I::Alu { op: AluOp::from_bits(modrm_reg(modrm)), w: Width::Word, dst, src: Operand::Imm(imm) }
        }
        0x83 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_b() as i8 as u16;
            I::Alu { op: AluOp::from_bits(modrm_reg(modrm)), w: Width::Word, dst, src: Operand::Imm(imm) }
        }
        0x84 | 0x85 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let w = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
            I::Alu { op: AluOp::Test, w, dst, src: Operand::Reg(modrm_reg(modrm)) }
        }
        0x86 | 0x87 => {
            let modrm = cpu.fetch_b();
            let a = modrm_rm(cpu, modrm, prefixes);
            let w = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
            I::Xchg { w, a, b: Operand::Reg(modrm_reg(modrm)) }
        }
        0x88 | 0x89 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let w = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
            I::Mov { w, dst, src: Operand::Reg(modrm_reg(modrm)) }
        }
        0x8A | 0x8B => {
            let modrm = cpu.fetch_b();
            let src = modrm_rm(cpu, modrm, prefixes);
            let w = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
            I::Mov { w, dst: Operand::Reg(modrm_reg(modrm)), src }
        }
        0x8C => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            I::MovRmFromSeg { dst, seg: SegReg::from_bits(modrm_reg(modrm)) }
        }
        0x8D => {
            let modrm = cpu.fetch_b();
            let reg = modrm_reg(modrm);
            if modrm >= 0xC0 {
                I::Undefined
            } else {
                let off = modrm_offset(cpu, modrm);
                I::Lea { reg, off }
            }
        }
        0x8E => {
            let modrm = cpu.fetch_b();
            let src = modrm_rm(cpu, modrm, prefixes);
            let seg = SegReg::from_bits(modrm_reg(modrm));
            if seg == SegReg::CS {
                I::Undefined
            } else {
                I::MovSegFromRm { seg, src }
            }
        }
        0x8F => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            I::Pop { dst }
        }
        0x90 => I::Nop,
        0x91..=0x97 => I::Xchg {
            w: Width::Word,
            a: Operand::Reg(AX),
            b: Operand::Reg((opcode & 7) as usize),
        },
        0x98 => I::Cbw,
        0x99 => I::Cwd,
        0x9A => {
            let off = cpu.fetch_w();
            let seg = cpu.fetch_w();
            I::CallFar { off, seg }
        }
        0x9B => I::Wait,
        0x9C => I::PushFlags,
        0x9D => I::PopFlags,
        0x9E => I::Sahf,
        0x9F => I::Lahf,
        0xA0..=0xA3 => {
            let off = cpu.fetch_w();
            I::MovAccMem {
                w: if opcode & 1 == 0 { Width::Byte } else { Width::Word },
                store: opcode >= 0xA2,
                ptr: FatPtr::new(prefixes.segment_for(SegReg::DS), off),
            }
        }
        0xA4 | 0xA5 | 0xA6 | 0xA7 | 0xAA..=0xAF => {
            let op = match opcode {
                0xA4 | 0xA5 => StringOp::Movs,
                0xA6 | 0xA7 => StringOp::Cmps,
                0xAA | 0xAB => StringOp::Stos,
                0xAC | 0xAD => StringOp::Lods,
                _ => StringOp::Scas,
            };
            I::Str {
                op,
                w: if opcode & 1 == 0 { Width::Byte } else { Width::Word },
                seg: prefixes.segment_for(SegReg::DS),
                rep: prefixes.rep,
            }
        }
        0xA8 => {
            let imm = cpu.fetch_b() as u16;
            I::Alu { op: AluOp::Test, w: Width::Byte, dst: Operand::Reg(AX), src: Operand::Imm(imm) }
        }
        0xA9 => {
            let imm = cpu.fetch_w();
            I::Alu { op: AluOp::Test, w: Width::Word, dst: Operand::Reg(AX), src: Operand::Imm(imm) }
        }
        0xB0..=0xB7 => {
            let imm = cpu.fetch_b() as u16;
            I::Mov { w: Width::Byte, dst: Operand::Reg((opcode & 7) as usize), src: Operand::Imm(imm) }
        }
        0xB8..=0xBF => {
            let imm = cpu.fetch_w();
            I::Mov { w: Width::Word, dst: Operand::Reg((opcode & 7) as usize), src: Operand::Imm(imm) }
        }
        0xC0 | 0xC1 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let count = cpu.fetch_b();
            I::Shift {
                op: ShiftOp::from_bits(modrm_reg(modrm)),
                w: if opcode & 1 == 0 { Width::Byte } else { Width::Word },
                dst,
                count: ShiftCount::Imm(count),
            }
        }
        0xC2 => {
            let pop = cpu.fetch_w();
            I::RetNear { pop }
        }
        0xC3 => I::RetNear { pop: 0 },
        0xC4 | 0xC5 => {
            let modrm = cpu.fetch_b();
            let reg = modrm_reg(modrm);
            match modrm_mem(cpu, modrm, prefixes) {
                Some(mem) => I::Lfp {
                    seg: if opcode == 0xC4 { SegReg::ES } else { SegReg::DS },
                    reg,
                    mem,
                },
                None => I::Undefined,
            }
        }
        0xC6 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_b() as u16;
            I::Mov { w: Width::Byte, dst, src: Operand::Imm(imm) }
        }
        0xC7 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            let imm = cpu.fetch_w();
            I::Mov { w: Width::Word, dst, src: Operand::Imm(imm) }
        }
        0xC8 => {
            let size = cpu.fetch_w();
            let level = cpu.fetch_b();
            I::Enter { size, level }
        }
        0xC9 => I::Leave,
        0xCA => {
            let pop = cpu.fetch_w();
            I::RetFar { pop }
        }
        0xCB => I::RetFar { pop: 0 },
        0xCC => I::Int3,
        0xCD => {
            let num = cpu.fetch_b();
            I::Int { num }
        }
        0xCE => I::Into,
        0xCF => I::Iret,
        0xD0 | 0xD1 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            I::Shift {
                op: ShiftOp::from_bits(modrm_reg(modrm)),
                w: if opcode & 1 == 0 { Width::Byte } else { Width::Word },
                dst,
                count: ShiftCount::One,
            }
        }
        0xD2 | 0xD3 => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            I::Shift {
                op: ShiftOp::from_bits(modrm_reg(modrm)),
                w: if opcode & 1 == 0 { Width::Byte } else { Width::Word },
                dst,
                count: ShiftCount::Cl,
            }
        }
        0xD4 => {
            let base = cpu.fetch_b();
            I::Aam { base }
        }
        0xD5 => {
            let base = cpu.fetch_b();
            I::Aad { base }
        }
        0xD6 => I::Nop,
        0xD7 => I::Xlat { seg: prefixes.segment_for(SegReg::DS) },
        0xD8..=0xDF => {
            // FPU escape: consume the ModRM encoding and ignore it.
            let modrm = cpu.fetch_b();
            let _ = modrm_rm(cpu, modrm, prefixes);
            I::Esc
        }
        0xE0..=0xE2 => {
            let disp = cpu.fetch_b() as i8;
            I::Loop { kind: (opcode & 3) as u8, disp }
        }
        0xE3 => {
            let disp = cpu.fetch_b() as i8;
            I::Jcxz { disp }
        }
        0xE4 | 0xE5 => {
            let port = cpu.fetch_b();
            I::InImm { w: if opcode & 1 == 0 { Width::Byte } else { Width::Word }, port }
        }
        0xE6 | 0xE7 => {
            let port = cpu.fetch_b();
            I::OutImm { w: if opcode & 1 == 0 { Width::Byte } else { Width::Word }, port }
        }
        0xE8 => {
            let disp = cpu.fetch_w() as i16;
            I::CallNear { disp }
        }
        0xE9 => {
            let disp = cpu.fetch_w() as i16;
            I::JmpNear { disp }
        }
        0xEA => {
            let off = cpu.fetch_w();
            let seg = cpu.fetch_w();
            I::JmpFar { off, seg }
        }
        0xEB => {
            let disp = cpu.fetch_b() as i8;
            I::JmpShort { disp }
        }
        0xEC | 0xED => I::InDx { w: if opcode & 1 == 0 { Width::Byte } else { Width::Word } },
        0xEE | 0xEF => I::OutDx { w: if opcode & 1 == 0 { Width::Byte } else { Width::Word } },
        0xF1 => I::Undefined,
        0xF4 => I::Hlt,
        0xF5 => I::Cmc,
        0xF6 | 0xF7 => {
            let w = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
            let modrm = cpu.fetch_b();
            let rm = modrm_rm(cpu, modrm, prefixes);
            match modrm & 0x38 {
                0x00 | 0x08 => {
                    let imm = match w {
                        Width::Byte => cpu.fetch_b() as u16,
                        Width::Word => cpu.fetch_w(),
                    };
                    I::Alu { op: AluOp::Test, w, dst: rm, src: Operand::Imm(imm) }
                }
                0x10 => I::Not { w, dst: rm },
                0x18 => I::Neg { w, dst: rm },
                0x20 => I::Mul { w, signed: false, src: rm },
                0x28 => I::Mul { w, signed: true, src: rm },
                0x30 => I::Div { w, signed: false, src: rm },
                _ => I::Div { w, signed: true, src: rm },
            }
        }
        0xF8 => I::Clc,
        0xF9 => I::Stc,
        0xFA => I::Cli,
        0xFB => I::Sti,
        0xFC => I::Cld,
        0xFD => I::Std,
        0xFE => {
            let modrm = cpu.fetch_b();
            let dst = modrm_rm(cpu, modrm, prefixes);
            match modrm & 0x38 {
                0x00 => I::IncDec { dec: false, w: Width::Byte, dst },
                0x08 => I::IncDec { dec: true, w: Width::Byte, dst },
                _ => I::Undefined,
            }
        }
        0xFF => {
            let modrm = cpu.fetch_b();
            let rm = modrm_rm(cpu, modrm, prefixes);
            match modrm & 0x38 {
                0x00 => I::IncDec { dec: false, w: Width::Word, dst: rm },
                0x08 => I::IncDec { dec: true, w: Width::Word, dst: rm },
                0x10 => I::CallRm { target: rm },
                0x18 => match rm {
                    Operand::Mem(ptr) => I::CallFarMem { ptr },
                    _ => I::Undefined,
                },
                0x20 => I::JmpRm { target: rm },
                0x28 => match rm {
                    Operand::Mem(ptr) => I::JmpFarMem { ptr },
                    _ => I::Undefined,
                },
                0x30 => I::Push { src: rm },
                _ => I::Undefined,
            }
        }
        // Prefixes are consumed by decode(); anything else in 00-3F was
        // handled by the ALU block above.
        _ => I::Undefined,
    }
}

/// The small 286 system-instruction corner of the 0F space; everything
/// else up there is undefined on this CPU.
fn decode_0f(cpu: &mut Cpu, prefixes: Prefixes) -> Instruction {
    use Instruction as I;
    let sub = cpu.fetch_b();
    match sub {
        0x00 => {
            let modrm = cpu.fetch_b();
            match modrm & 0x38 {
                0x10 => match modrm_mem(cpu, modrm, prefixes) {
                    Some(ptr) => I::Lldt { ptr },
                    None => I::Undefined,
                },
                0x18 => {
                    let src = modrm_rm(cpu, modrm, prefixes);
                    I::Ltr { src }
                }
                _ => I::Undefined,
            }
        }
        0x01 => {
            let modrm = cpu.fetch_b();
            match modrm & 0x38 {
                0x00 => match modrm_mem(cpu, modrm, prefixes) {
                    Some(ptr) => I::Sgdt { ptr },
                    None => I::Undefined,
                },
                0x08 => match modrm_mem(cpu, modrm, prefixes) {
                    Some(ptr) => I::Sidt { ptr },
                    None => I::Undefined,
                },
                0x10 => match modrm_mem(cpu, modrm, prefixes) {
                    Some(ptr) => I::Lgdt { ptr },
                    None => I::Undefined,
                },
                0x18 => match modrm_mem(cpu, modrm, prefixes) {
                    Some(ptr) => I::Lidt { ptr },
                    None => I::Undefined,
                },
                0x20 => {
                    let dst = modrm_rm(cpu, modrm, prefixes);
                    I::Smsw { dst }
                }
                0x30 => {
                    let src = modrm_rm(cpu, modrm, prefixes);
                    I::Lmsw { src }
                }
                _ => I::Undefined,
            }
        }
        0x06 => I::Clts,
        // LAR/LSL and the rest are not implemented on this part.
        _ => I::Undefined,
    }
}
