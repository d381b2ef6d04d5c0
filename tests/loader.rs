// Program loading: COM and EXE layout, PSP contents, relocation.

use em86::fields::SegReg;
use em86::Emulator;

fn boot_with(data: &[u8], args: &[&str]) -> Emulator {
    let dir = tempfile::tempdir().unwrap();
    let prog = dir.path().join("TEST.COM");
    std::fs::write(&prog, data).unwrap();
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mut emu = Emulator::new();
    emu.boot_dos(&prog, &args, &[]).unwrap();
    emu
}

#[test]
fn com_layout_and_registers() {
    let code = [0xB8u8, 0x00, 0x4C, 0xCD, 0x21];
    let emu = boot_with(&code, &[]);
    let cpu = &emu.cpu;
    let psp = cpu.dx();
    assert_eq!(cpu.seg_selector(SegReg::CS), psp);
    assert_eq!(cpu.seg_selector(SegReg::DS), psp);
    assert_eq!(cpu.seg_selector(SegReg::ES), psp);
    assert_eq!(cpu.seg_selector(SegReg::SS), psp);
    assert_eq!(cpu.ip, 0x100);
    assert_eq!(cpu.sp(), 0xFFFE);
    assert_eq!(cpu.cx(), 0x00FF);
    assert_eq!(cpu.bp(), 0x091C);
    assert_eq!(cpu.si(), cpu.ip);
    assert_eq!(cpu.di(), cpu.sp());
    // The image sits right after the 256-byte PSP.
    let base = psp as u32 * 16;
    assert_eq!(cpu.mem.bytes_at(base + 0x100, 5), code);
    // PSP header: INT 20h and the INT 21h/RETF service stub.
    assert_eq!(cpu.mem.get8(base), 0xCD);
    assert_eq!(cpu.mem.get8(base + 1), 0x20);
    assert_eq!(cpu.mem.get8(base + 0x50), 0xCD);
    assert_eq!(cpu.mem.get8(base + 0x51), 0x21);
    assert_eq!(cpu.mem.get8(base + 0x52), 0xCB);
}

#[test]
fn psp_command_line() {
    let emu = boot_with(&[0xC3], &["foo", "bar"]);
    let psp = emu.cpu.dx() as u32 * 16;
    assert_eq!(emu.cpu.mem.get8(psp + 0x80), 8, "length of ' foo bar'");
    assert_eq!(&emu.cpu.mem.bytes_at(psp + 0x81, 9), b" foo bar\r");
}

#[test]
fn psp_environment_block() {
    let emu = boot_with(&[0xC3], &[]);
    let cpu = &emu.cpu;
    let psp = cpu.dx() as u32 * 16;
    let env_seg = cpu.mem.get16(psp + 0x2C);
    // No environment given: the default PATH is injected, followed by
    // the double NUL, a word of 0001 and the program name.
    let env = env_seg as u32 * 16;
    assert_eq!(&cpu.mem.bytes_at(env, 10), b"PATH=C:\\\0\0");
    assert_eq!(cpu.mem.get16(env + 10), 1);
}

fn build_exe(relocs: &[(u16, u16)], image: &[u8], extra_min: u16) -> Vec<u8> {
    // 2-paragraph header followed by the image and relocation table.
    let head_pars = 2u16;
    let reloc_off = 28u16;
    let total = head_pars as usize * 16 + image.len();
    let blocks = (total + 511) / 512;
    let last = total % 512;
    let mut exe = vec![0u8; head_pars as usize * 16 + image.len()];
    exe[0] = b'M';
    exe[1] = b'Z';
    exe[2..4].copy_from_slice(&(last as u16).to_le_bytes());
    exe[4..6].copy_from_slice(&(blocks as u16).to_le_bytes());
    exe[6..8].copy_from_slice(&(relocs.len() as u16).to_le_bytes());
    exe[8..10].copy_from_slice(&head_pars.to_le_bytes());
    exe[10..12].copy_from_slice(&extra_min.to_le_bytes());
    exe[12..14].copy_from_slice(&0xFFFFu16.to_le_bytes());
    exe[14..16].copy_from_slice(&0u16.to_le_bytes()); // SS
    exe[16..18].copy_from_slice(&0x800u16.to_le_bytes()); // SP
    exe[20..22].copy_from_slice(&0u16.to_le_bytes()); // IP
    exe[22..24].copy_from_slice(&0u16.to_le_bytes()); // CS
    exe[24..26].copy_from_slice(&reloc_off.to_le_bytes());
    for (i, (off, seg)) in relocs.iter().enumerate() {
        let p = reloc_off as usize + i * 4;
        exe[p..p + 2].copy_from_slice(&off.to_le_bytes());
        exe[p + 2..p + 4].copy_from_slice(&seg.to_le_bytes());
    }
    exe[head_pars as usize * 16..].copy_from_slice(image);
    exe
}

#[test]
fn exe_relocation_adds_load_segment() {
    let mut image = vec![0u8; 0x120];
    image[0x102] = 0x05; // word 0x0005 at seg 0x10, offset 2
    let exe = build_exe(&[(0x0002, 0x0010)], &image, 16);
    let emu = boot_with(&exe, &[]);
    let cpu = &emu.cpu;
    let psp = cpu.seg_selector(SegReg::DS);
    let load_seg = psp + 16;
    assert_eq!(cpu.seg_selector(SegReg::CS), load_seg);
    assert_eq!(cpu.ip, 0);
    assert_eq!(cpu.sp(), 0x800);
    assert_eq!(cpu.cx(), 0x7309);
    // The relocated word is the file word plus the load segment.
    let addr = (load_seg as u32 + 0x10) * 16 + 2;
    assert_eq!(cpu.mem.get16(addr), 0x0005 + load_seg);
}

#[test]
fn exe_image_lands_after_header() {
    let mut image = vec![0u8; 64];
    for (i, b) in image.iter_mut().enumerate() {
        *b = i as u8;
    }
    let exe = build_exe(&[], &image, 16);
    let emu = boot_with(&exe, &[]);
    let load_seg = emu.cpu.seg_selector(SegReg::CS);
    assert_eq!(emu.cpu.mem.bytes_at(load_seg as u32 * 16, 64), image);
}

#[test]
fn overlay_load_uses_caller_relocation_base() {
    let mut image = vec![0u8; 0x40];
    image[0x12] = 0x34;
    image[0x13] = 0x12;
    let exe = build_exe(&[(0x0012, 0x0000)], &image, 0);
    let mut emu = Emulator::new();
    em86::loader::load_overlay(&mut emu.cpu.mem, &exe, 0x3000, 0x0123).unwrap();
    assert_eq!(emu.cpu.mem.get16(0x30012), 0x1234 + 0x0123);
    // The image itself is copied verbatim around the patched word.
    assert_eq!(emu.cpu.mem.get8(0x30011), 0);
}
