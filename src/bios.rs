// BIOS-side machine setup: the data area the firmware publishes at
// 0x400, the reset stub, and the trivial equipment services.
//
// BIOS data area fields maintained by the emulator:
//
//   $413.W      RAM size in KB
//   $417.B      Keyboard shift flags
//   $41A.W      Keyboard buffer head (0x1E-0x3D)
//   $41C.W      Keyboard buffer tail
//   $41E-$43D   Keyboard ring buffer
//   $449.B      Video mode
//   $44A.W      Screen columns
//   $450.B      Cursor column (page 0)
//   $451.B      Cursor row
//   $462.B      Current video page
//   $463.W      CRTC I/O port
//   $46C.L      BIOS tick counter
//   $470.B      Day rollover counter
//   $484.B      Screen rows - 1

use crate::memory::Memory;
use crate::processor::Cpu;

/// Default BIOS data area contents; video values are rewritten by the
/// video module once a program touches INT 10h.
pub fn init_bios_mem(mem: &mut Memory) {
    mem.put8(0x413, 0x80); // ram size: 640k
    mem.put8(0x414, 0x02);
    mem.put8(0x41A, 0x1E); // empty keyboard buffer
    mem.put8(0x41C, 0x1E);
    mem.put8(0x449, 3); // video mode
    mem.put8(0x44A, 80); // screen columns
    mem.put8(0x44B, 0);
    mem.put8(0x450, 0); // cursor column
    mem.put8(0x451, 0); // cursor row
    mem.put8(0x462, 0); // current screen page
    mem.put8(0x463, 0xD4); // I/O port of video CRTC
    mem.put8(0x464, 0x03);
    mem.put8(0x484, 24); // screen rows - 1

    // Reset stub at FFFF:0000.
    mem.put8(0xFFFF0, 0xCB);
    mem.put8(0xFFFF1, 0x19);
    // BIOS date at F000:FFF5.
    mem.write_block(0xFFFF5, b"01/01/17");
}

/// INT 11h: equipment word.
pub fn int11(cpu: &mut Cpu) {
    cpu.set_ax(0x0021);
}

/// INT 12h: memory size in KB.
pub fn int12(cpu: &mut Cpu) {
    cpu.set_ax(640);
}
