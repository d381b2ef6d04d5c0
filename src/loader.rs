// EXE/COM image loading and PSP construction.
//
// The PSP block sits just before the loaded program:
//
//   Offset  Length  Description
//   0       2       An INT 20h instruction
//   2       2       Program ending address (paragraph)
//   0Ah     4       Address of program termination code (INT 22h)
//   0Eh     4       Address of break handler routine (INT 23h)
//   12h     4       Address of critical error handler routine (INT 24h)
//   16h     2       Parent PSP segment
//   2Ch     2       Segment address of environment area
//   2Eh     4       SS:SP saved across DOS calls
//   50h     3       INT 21h / RETF instructions
//   5Ch     16      Default FCB #1
//   6Ch     20      Default FCB #2
//   80h     1       Length of command line string
//   81h     127     Command line string, CR-terminated

use thiserror::Error;

use crate::mcb::McbChain;
use crate::memory::Memory;
use crate::processor::Cpu;
use crate::fields::SegReg;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("empty program file")]
    Empty,
    #[error("program too big for memory")]
    TooBig,
    #[error("short program file")]
    ShortRead,
    #[error("not enough memory")]
    NoMemory,
}

fn g16(buf: &[u8], off: usize) -> u16 {
    buf[off] as u16 | ((buf[off + 1] as u16) << 8)
}

/// Build the main PSP plus its environment block. Returns the PSP MCB
/// segment (the PSP itself is one paragraph above).
pub fn create_psp(
    mem: &mut Memory,
    mcb: &mut McbChain,
    cmdline: &str,
    environment: &[u8],
    progname: &str,
) -> Option<u16> {
    // Environment first, program name appended after a word of 0001.
    let env_size = environment.len() as u16;
    let env_mcb = mcb.alloc(mem, (env_size + 64 + 2 + 15) >> 4, 1).ok()?;
    let psp_mcb = mcb.alloc(mem, 16, 1).ok()?;

    let env_seg = env_mcb + 1;
    let psp_seg = psp_mcb + 1;

    log::debug!(target: "dos", "\tcommand: '{}' args: '{}'", progname, cmdline);
    log::debug!(target: "dos", "\tenv size: {} at ${:04x}", env_size, env_seg);

    mcb.set_block_owner(mem, env_mcb, psp_seg);
    mcb.set_block_owner(mem, psp_mcb, psp_seg);

    let psp = psp_seg as u32 * 16;
    for i in 0..256 {
        mem.put8(psp + i, 0);
    }
    mem.put8(psp, 0xCD); // INT 20h
    mem.put8(psp + 1, 0x20);
    mem.put16(psp + 2, 0); // filled in by the loader
    mem.put16(psp + 22, 0xFFFE); // root PSP: no parent inside this process
    mem.put16(psp + 0x2C, env_seg);
    mem.put8(psp + 0x50, 0xCD); // INT 21h / RETF
    mem.put8(psp + 0x51, 0x21);
    mem.put8(psp + 0x52, 0xCB);
    let cmd = cmdline.as_bytes();
    let l = cmd.len().min(126);
    mem.put8(psp + 0x80, l as u8);
    mem.write_block(psp + 0x81, &cmd[..l]);
    mem.put8(psp + 0x81 + l as u32, 0x0D);

    let env = env_seg as u32 * 16;
    mem.write_block(env, environment);
    mem.put16(env + env_size as u32, 1);
    let name = progname.as_bytes();
    let nl = name.len().min(63);
    mem.write_block(env + env_size as u32 + 2, &name[..nl]);

    Some(psp_mcb)
}

fn set_common_regs(cpu: &mut Cpu, psp_seg: u16) {
    cpu.set_ax(0);
    cpu.set_bx(0);
    cpu.set_dx(psp_seg);
    cpu.set_bp(0x91C); // observed on DOS 5
    let ip = cpu.ip;
    cpu.set_si(ip);
    let sp = cpu.sp();
    cpu.set_di(sp);
}

/// Load a COM or EXE image into the arena headed by `psp_mcb` and set the
/// initial register state.
pub fn load_program(
    cpu: &mut Cpu,
    mcb: &mut McbChain,
    data: &[u8],
    psp_mcb: u16,
) -> Result<(), LoaderError> {
    if data.is_empty() {
        return Err(LoaderError::Empty);
    }
    let psp_seg = psp_mcb + 1;

    if data.len() < 28 || g16(data, 0) != 0x5A4D {
        // COM file: give it all the memory there is.
        mcb.resize(&mut cpu.mem, psp_mcb, 0xFFFF);
        let have = mcb.block_size(&cpu.mem, psp_mcb);
        let max = (have as usize - 16) * 16;
        let mem_start = (psp_mcb as u32 + 17) * 16;
        let n = data.len().min(max);
        cpu.mem.write_block(mem_start, &data[..n]);

        // Top-of-memory paragraph in the PSP.
        cpu.mem.put16(psp_mcb as u32 * 16 + 16 + 2, psp_mcb + have + 1);

        cpu.set_ip(0x100);
        cpu.set_data_segment(SegReg::CS, psp_seg);
        cpu.set_data_segment(SegReg::DS, psp_seg);
        cpu.set_data_segment(SegReg::ES, psp_seg);
        cpu.set_data_segment(SegReg::SS, psp_seg);
        cpu.set_sp(0xFFFE);
        cpu.set_cx(0x00FF);
        set_common_regs(cpu, psp_seg);
        return Ok(());
    }

    // EXE file.
    let head_size = g16(data, 8) as usize * 16;
    let mut data_blocks = g16(data, 4);
    if data_blocks & 0xF800 != 0 {
        log::debug!(target: "dos", "\tinvalid number of blocks (${:04x}), fixing.", data_blocks);
        data_blocks &= 0x07FF;
    }
    let mut data_size = data_blocks as usize * 512 + g16(data, 2) as usize;
    if g16(data, 2) != 0 {
        data_size -= 512;
    }
    let data_size = data_size.saturating_sub(head_size);

    let load_seg = psp_mcb + 17;

    let exe_sz = ((data_size + 256 + 15) >> 4) as u32;
    let min_sz = (g16(data, 10) as u32 + exe_sz).min(0xFFFF) as u16;
    let max_sz = if g16(data, 12) != 0 {
        (g16(data, 12) as u32 + exe_sz).min(0xFFFF) as u16
    } else {
        0xFFFF
    };

    let psp_sz = mcb.resize(&mut cpu.mem, psp_mcb, max_sz);
    if psp_sz < min_sz && psp_sz < max_sz {
        log::debug!(target: "dos", "\texe read, not enough memory!");
        return Err(LoaderError::NoMemory);
    }

    log::debug!(target: "dos",
        "\texe: bin={:04x} min={:04x} max={:04x}, alloc {:04x} segments of memory",
        exe_sz, g16(data, 10), g16(data, 12), mcb.block_size(&cpu.mem, psp_mcb));

    let have = mcb.block_size(&cpu.mem, psp_mcb);
    cpu.mem.put16(psp_mcb as u32 * 16 + 16 + 2, psp_mcb + have + 1);

    if head_size >= data.len() {
        return Err(LoaderError::ShortRead);
    }
    let image = &data[head_size..];
    let n = image.len().min(data_size);
    if n < data_size {
        log::debug!(target: "dos", "\tWARNING: short program!");
    }
    if !cpu.mem.write_block(load_seg as u32 * 16, &image[..n]) {
        return Err(LoaderError::TooBig);
    }
    log::debug!(target: "dos", "\texe read {} of {} data bytes", n, data_size);
    log::debug!(target: "dos", "\tPSP location: ${:04X}", psp_seg);
    log::debug!(target: "dos", "\tEXE start:    ${:04X}", load_seg);

    cpu.set_data_segment(SegReg::SS, load_seg.wrapping_add(g16(data, 14)));
    cpu.set_sp(g16(data, 16));
    cpu.set_ip(g16(data, 20));
    cpu.set_data_segment(SegReg::CS, load_seg.wrapping_add(g16(data, 22)));
    cpu.set_data_segment(SegReg::DS, psp_seg);
    cpu.set_data_segment(SegReg::ES, psp_seg);
    cpu.set_cx(0x7309);
    set_common_regs(cpu, psp_seg);

    apply_relocations(&mut cpu.mem, data, load_seg, load_seg)?;
    Ok(())
}

/// EXEC sub-function 3: load an image at a caller-provided segment with a
/// caller-provided relocation base; no MCB, no PSP, no register changes.
pub fn load_overlay(
    mem: &mut Memory,
    data: &[u8],
    load_seg: u16,
    reloc_seg: u16,
) -> Result<(), LoaderError> {
    if data.is_empty() {
        return Err(LoaderError::Empty);
    }
    if data.len() < 28 || g16(data, 0) != 0x5A4D {
        let start = load_seg as u32 * 16;
        let max = (0x100000u32.saturating_sub(start).saturating_sub(512)) as usize;
        let n = data.len().min(max);
        mem.write_block(start, &data[..n]);
        return Ok(());
    }

    let head_size = g16(data, 8) as usize * 16;
    let mut data_size = g16(data, 4) as usize * 512 + g16(data, 2) as usize;
    if g16(data, 2) != 0 {
        data_size -= 512;
    }
    let data_size = data_size.saturating_sub(head_size);

    if load_seg as u32 * 16 + data_size as u32 >= 0x100000 {
        log::debug!(target: "dos", "\texe size too big for memory");
        return Err(LoaderError::TooBig);
    }
    if head_size >= data.len() || data.len() - head_size < data_size {
        return Err(LoaderError::ShortRead);
    }
    mem.write_block(load_seg as u32 * 16, &data[head_size..head_size + data_size]);
    apply_relocations(mem, data, load_seg, reloc_seg)
}

/// Add `reloc_seg` to every word the relocation table points at.
fn apply_relocations(
    mem: &mut Memory,
    data: &[u8],
    load_seg: u16,
    reloc_seg: u16,
) -> Result<(), LoaderError> {
    let mut off = g16(data, 24) as usize;
    let nreloc = g16(data, 6);
    for _ in 0..nreloc {
        if off + 4 > data.len() {
            return Err(LoaderError::ShortRead);
        }
        let roff = g16(data, off);
        let rseg = load_seg.wrapping_add(g16(data, off + 2));
        let pos = roff as u32 + 16 * rseg as u32;
        let word = mem.get16(pos);
        mem.put16(pos, word.wrapping_add(reloc_seg));
        off += 4;
    }
    Ok(())
}
