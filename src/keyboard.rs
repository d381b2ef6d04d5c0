// Terminal keyboard. A reader thread drains the controlling tty (set to
// raw mode) into a channel; escape sequences are reassembled here and
// translated to BIOS scancode+ASCII pairs, with the shift/ctrl/alt state
// published in the BIOS data area. A small throttle keeps guests that
// busy-poll the keyboard from pinning a host core.

use std::fs::File;
use std::io::Read;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use termion::raw::{IntoRawMode, RawTerminal};

use crate::codepage::dos_from_unicode;
use crate::memory::Memory;
use crate::processor::Cpu;

const MAX_KEYB_CALLS: u32 = 10;
const ESC_TIMEOUT: Duration = Duration::from_millis(10);

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct Mods: u8 {
        const SHIFT = 1;
        const RSHIFT = 2;
        const CTRL = 4;
        const ALT = 8;
    }
}

// Scan codes for keys with modifier variants: plain, shift, ctrl, alt.
static SPECIAL_CODES: [[u8; 4]; 23] = [
    [0x3B, 0x54, 0x5E, 0x68], // F1
    [0x3C, 0x55, 0x5F, 0x69], // F2
    [0x3D, 0x56, 0x60, 0x6A], // F3
    [0x3E, 0x57, 0x61, 0x6B], // F4
    [0x3F, 0x58, 0x62, 0x6C], // F5
    [0x40, 0x59, 0x63, 0x6D], // F6
    [0x41, 0x5A, 0x64, 0x6E], // F7
    [0x42, 0x5B, 0x65, 0x6F], // F8
    [0x43, 0x5C, 0x66, 0x70], // F9
    [0x44, 0x5D, 0x67, 0x71], // F10
    [0x85, 0x87, 0x89, 0x8B], // F11
    [0x86, 0x88, 0x8A, 0x8C], // F12
    [0x48, 0x48, 0x8D, 0x98], // Up
    [0x50, 0x50, 0x91, 0xA0], // Down
    [0x4B, 0x4B, 0x73, 0x9B], // Left
    [0x4D, 0x4D, 0x74, 0x9D], // Right
    [0x49, 0x49, 0x84, 0x99], // Pg-Up
    [0x51, 0x51, 0x76, 0xA1], // Pg-Down
    [0x57, 0x57, 0x77, 0x97], // Home
    [0x4F, 0x4F, 0x75, 0x9F], // End
    [0x52, 0x52, 0x92, 0xA2], // Ins
    [0x53, 0x53, 0x93, 0xA3], // Del
    [0x4C, 0x4C, 0x8F, 0x00], // KP-5
];

const KEY_F1: usize = 0;
const KEY_UP: usize = 12;
const KEY_DOWN: usize = 13;
const KEY_LEFT: usize = 14;
const KEY_RIGHT: usize = 15;
const KEY_PGUP: usize = 16;
const KEY_PGDN: usize = 17;
const KEY_HOME: usize = 18;
const KEY_END: usize = 19;
const KEY_INS: usize = 20;
const KEY_DEL: usize = 21;
const KEY_KP5: usize = 22;

fn key_fn(n: usize) -> usize {
    KEY_F1 + n - 1
}

/// Scan code (high byte) for a plain ASCII key.
fn scancode_for(i: u8) -> u16 {
    let i = if i.is_ascii_lowercase() { i - b'a' + b'A' } else { i };
    match i {
        0x1B => 0x0100,
        b'!' | b'1' => 0x0200,
        b'@' | b'2' => 0x0300,
        b'#' | b'3' => 0x0400,
        b'$' | b'4' => 0x0500,
        b'%' | b'5' => 0x0600,
        b'^' | b'6' => 0x0700,
        b'&' | b'7' => 0x0800,
        b'*' | b'8' => 0x0900,
        b'(' | b'9' => 0x0A00,
        b')' | b'0' => 0x0B00,
        b'_' | b'-' => 0x0C00,
        b'+' | b'=' => 0x0D00,
        0x7F | 0x08 => 0x0E00,
        0x09 => 0x0F00,
        b'Q' => 0x1000,
        b'W' => 0x1100,
        b'E' => 0x1200,
        b'R' => 0x1300,
        b'T' => 0x1400,
        b'Y' => 0x1500,
        b'U' => 0x1600,
        b'I' => 0x1700,
        b'O' => 0x1800,
        b'P' => 0x1900,
        b'{' | b'[' => 0x1A00,
        b'}' | b']' => 0x1B00,
        0x0D => 0x1C00,
        b'A' => 0x1E00,
        b'S' => 0x1F00,
        b'D' => 0x2000,
        b'F' => 0x2100,
        b'G' => 0x2200,
        b'H' => 0x2300,
        b'J' => 0x2400,
        b'K' => 0x2500,
        b'L' => 0x2600,
        b':' | b';' => 0x2700,
        b'\'' | b'"' => 0x2800,
        b'`' | b'~' => 0x2900,
        b'\\' | b'|' => 0x2B00,
        b'Z' => 0x2C00,
        b'X' => 0x2D00,
        b'C' => 0x2E00,
        b'V' => 0x2F00,
        b'B' => 0x3000,
        b'N' => 0x3100,
        b'M' => 0x3200,
        b',' | b'<' => 0x3300,
        b'.' | b'>' => 0x3400,
        b'/' | b'?' => 0x3500,
        b' ' => 0x3900,
        _ => 0,
    }
}

pub struct Keyboard {
    rx: Option<Receiver<u8>>,
    _raw: Option<RawTerminal<File>>,
    queued_key: Option<u16>,
    mods: Mods,
    throttle_calls: u32,
    last_poll: Option<Instant>,
    portb_ctl: u8,
    keyb_command: u8,
}

impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            rx: None,
            _raw: None,
            queued_key: None,
            mods: Mods::empty(),
            throttle_calls: 0,
            last_poll: None,
            portb_ctl: 0,
            keyb_command: 0,
        }
    }

    /// Open the controlling tty in raw mode and start draining it. A
    /// missing tty is a fatal host error.
    fn init(&mut self) {
        if self.rx.is_some() {
            return;
        }
        let tty = match termion::get_tty() {
            Ok(t) => t,
            Err(e) => {
                eprintln!("error at open TTY, {}", e);
                std::process::exit(1);
            }
        };
        let reader = match tty.try_clone() {
            Ok(r) => r,
            Err(e) => {
                eprintln!("error at open TTY, {}", e);
                std::process::exit(1);
            }
        };
        match tty.into_raw_mode() {
            Ok(raw) => self._raw = Some(raw),
            Err(e) => {
                eprintln!("error at open TTY, {}", e);
                std::process::exit(1);
            }
        }
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 1];
            loop {
                match reader.read(&mut buf) {
                    Ok(1) => {
                        if tx.send(buf[0]).is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        self.rx = Some(rx);
    }

    fn next_byte(&mut self) -> Option<u8> {
        match self.rx.as_ref()?.try_recv() {
            Ok(b) => Some(b),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn next_byte_wait(&mut self) -> Option<u8> {
        self.rx.as_ref()?.recv_timeout(ESC_TIMEOUT).ok()
    }

    fn special_code(&self, key: usize) -> u16 {
        let col = if self.mods.contains(Mods::ALT) {
            3
        } else if self.mods.contains(Mods::CTRL) {
            2
        } else if self.mods.intersects(Mods::SHIFT | Mods::RSHIFT) {
            1
        } else {
            0
        };
        (SPECIAL_CODES[key][col] as u16) << 8
    }

    /// Attach a scan code to an ASCII key, inferring modifier state.
    fn add_scancode(&mut self, i: u8) -> u16 {
        if i < 0x20 && i != 0x1B && i != 0x0D && i != 0x09 {
            // Control range means CTRL+key.
            self.mods |= Mods::CTRL;
            let mut orig = i as u16;
            let k = match i {
                0x1C => b'\\',
                0x1D => b']',
                0x1E => b'6',
                0x1F => b'-',
                0x08 => {
                    orig = 0x7F;
                    0x7F
                }
                _ => i + 0x20,
            };
            return orig | scancode_for(k);
        }
        if (i > 0x20 && i < 0x27)
            || (i > 0x27 && i < 0x2C)
            || i == 0x3A
            || i == 0x3C
            || (i > 0x3D && i < 0x5B)
            || (i > 0x5D && i < 0x60)
            || (i > 0x7A && i < 0x7F)
        {
            self.mods |= Mods::SHIFT;
        }
        let i = if i == 0x7F { 0x08 } else { i };
        i as u16 | scancode_for(i)
    }

    fn alt_char(&mut self, i: u8) -> u16 {
        self.mods = Mods::ALT;
        // No ASCII code on ALT+char.
        self.add_scancode(i) & 0xFF00
    }

    /// Parse the tail of an escape sequence:
    ///   ESC               -> ESC key
    ///   ESC <char>        -> ALT+char
    ///   ESC [ <mods> <c>  -> function/cursor keys
    fn esc_sequence(&mut self) -> u16 {
        self.mods = Mods::empty();
        let ch = match self.next_byte_wait() {
            Some(c) => c,
            None => return 0x011B,
        };
        if ch != b'[' && ch != b'O' {
            return self.alt_char(ch);
        }
        let mut n1: u32 = 0;
        let mut n2: u32 = 0;
        loop {
            let cn = match self.next_byte_wait() {
                Some(c) => c,
                None => {
                    if n1 == 0 && n2 == 0 {
                        return self.alt_char(ch);
                    }
                    return 0;
                }
            };
            match cn {
                b'0'..=b'9' => n2 = n2 * 10 + (cn - b'0') as u32,
                b';' => {
                    n1 = n2;
                    n2 = 0;
                }
                b'~' => {
                    if n1 == 0 && n2 == 0 {
                        return 0;
                    }
                    if n1 == 0 {
                        n1 = n2;
                        n2 = 1;
                    }
                    n2 -= 1;
                    if n2 & 1 != 0 {
                        self.mods |= Mods::SHIFT;
                    }
                    if n2 & 2 != 0 {
                        self.mods |= Mods::ALT;
                    }
                    if n2 & 4 != 0 {
                        self.mods |= Mods::CTRL;
                    }
                    return match n1 {
                        1 => self.special_code(KEY_HOME),
                        2 => self.special_code(KEY_INS),
                        3 => self.special_code(KEY_DEL),
                        4 => self.special_code(KEY_END),
                        5 => self.special_code(KEY_PGUP),
                        6 => self.special_code(KEY_PGDN),
                        11 => self.special_code(key_fn(1)),
                        12 => self.special_code(key_fn(2)),
                        13 => self.special_code(key_fn(3)),
                        14 => self.special_code(key_fn(4)),
                        15 => self.special_code(key_fn(5)),
                        17 => self.special_code(key_fn(6)),
                        18 => self.special_code(key_fn(7)),
                        19 => self.special_code(key_fn(8)),
                        20 => self.special_code(key_fn(9)),
                        21 => self.special_code(key_fn(10)),
                        23 => self.special_code(key_fn(11)),
                        24 => self.special_code(key_fn(12)),
                        _ => 0,
                    };
                }
                _ => {
                    let mut m = n2;
                    if m != 0 {
                        m -= 1;
                    }
                    if m & 1 != 0 {
                        self.mods |= Mods::SHIFT;
                    }
                    if m & 2 != 0 {
                        self.mods |= Mods::ALT;
                    }
                    if m & 4 != 0 {
                        self.mods |= Mods::CTRL;
                    }
                    return match cn {
                        b'A' => self.special_code(KEY_UP),
                        b'B' => self.special_code(KEY_DOWN),
                        b'C' => self.special_code(KEY_RIGHT),
                        b'D' => self.special_code(KEY_LEFT),
                        b'E' => self.special_code(KEY_KP5),
                        b'F' => self.special_code(KEY_END),
                        b'H' => self.special_code(KEY_HOME),
                        b'I' => 0x0F09, // TAB
                        b'P' => self.special_code(key_fn(1)),
                        b'Q' => self.special_code(key_fn(2)),
                        b'R' => self.special_code(key_fn(3)),
                        b'S' => self.special_code(key_fn(4)),
                        b'Z' => {
                            self.mods |= Mods::SHIFT;
                            0x0F00 // shift-TAB
                        }
                        _ => 0,
                    };
                }
            }
        }
    }

    /// Pull one key from the terminal, decoding UTF-8 into the code page.
    fn read_key(&mut self) -> Option<u16> {
        let ch = self.next_byte()?;
        if ch == 0x1B {
            let k = self.esc_sequence();
            return if k == 0 { None } else { Some(k) };
        }
        self.mods = Mods::empty();
        if ch < 0x80 {
            return Some(self.add_scancode(ch));
        }
        // Multi-byte UTF-8: fold back into the code page.
        let uc = if ch & 0xE0 == 0xC0 {
            let c1 = self.next_byte_wait()?;
            if c1 & 0xC0 != 0x80 {
                return None;
            }
            ((ch as u32 & 0x1F) << 6) | (c1 as u32 & 0x3F)
        } else if ch & 0xF0 == 0xE0 {
            let c1 = self.next_byte_wait()?;
            let c2 = self.next_byte_wait()?;
            if c1 & 0xC0 != 0x80 || c2 & 0xC0 != 0x80 {
                return None;
            }
            ((ch as u32 & 0x0F) << 12) | ((c1 as u32 & 0x3F) << 6) | (c2 as u32 & 0x3F)
        } else if ch & 0xF8 == 0xF0 {
            let c1 = self.next_byte_wait()?;
            let c2 = self.next_byte_wait()?;
            let c3 = self.next_byte_wait()?;
            if c1 & 0xC0 != 0x80 || c2 & 0xC0 != 0x80 || c3 & 0xC0 != 0x80 {
                return None;
            }
            ((ch as u32 & 0x07) << 18)
                | ((c1 as u32 & 0x3F) << 12)
                | ((c2 as u32 & 0x3F) << 6)
                | (c3 as u32 & 0x3F)
        } else {
            return None;
        };
        dos_from_unicode(uc).map(|b| b as u16)
    }

    fn update_bios_state(&self, mem: &mut Memory) {
        mem.put8(0x417, self.mods.bits());
    }

    /// Append a key to the BIOS ring buffer at 0x41E.
    fn push_bios_buffer(&self, mem: &mut Memory, key: u16) {
        let tail = (mem.get8(0x41C) as u16).wrapping_sub(0x1E) & 0x1F;
        mem.put16(0x41E + tail as u32, key);
        mem.put8(0x41C, 0x1E + ((tail + 2) & 0x1F) as u8);
    }

    fn pop_bios_buffer(&self, mem: &mut Memory) {
        let head = (mem.get8(0x41A) as u16).wrapping_sub(0x1E) & 0x1F;
        mem.put8(0x41A, 0x1E + ((head + 2) & 0x1F) as u8);
    }

    pub fn wakeup(&mut self) {
        self.throttle_calls = 0;
    }

    /// Key waiting? Queues at most one key and raises IRQ 1 when a new
    /// one arrives. Busy polling is throttled with short sleeps.
    pub fn kbhit(&mut self, cpu: &mut Cpu) -> Option<u16> {
        if self.queued_key.is_none() {
            self.init();
            self.queued_key = self.read_key();
            match self.queued_key {
                Some(key) => {
                    self.update_bios_state(&mut cpu.mem);
                    self.push_bios_buffer(&mut cpu.mem, key);
                    cpu.trigger_irq(1);
                }
                None => {
                    let now = Instant::now();
                    if let Some(last) = self.last_poll {
                        if now.duration_since(last) < Duration::from_millis(10) {
                            self.throttle_calls += 1;
                            if self.throttle_calls > MAX_KEYB_CALLS {
                                log::debug!(target: "int", "keyboard sleep.");
                                std::thread::sleep(Duration::from_millis(10));
                                self.throttle_calls = 0;
                            }
                        } else {
                            self.throttle_calls = 0;
                        }
                    }
                    self.last_poll = Some(now);
                }
            }
        }
        self.queued_key
    }

    /// Store a keystroke as if the user typed it (INT 16h function 05h).
    /// Fails when a key is already waiting.
    pub fn push_key(&mut self, cpu: &mut Cpu, key: u16) -> bool {
        if self.queued_key.is_some() {
            return false;
        }
        self.queued_key = Some(key);
        self.push_bios_buffer(&mut cpu.mem, key);
        true
    }

    /// Consume the queued key and update the BIOS pointers.
    pub fn take_key(&mut self, mem: &mut Memory) -> Option<u16> {
        let key = self.queued_key.take()?;
        self.pop_bios_buffer(mem);
        self.update_bios_state(mem);
        Some(key)
    }

    /// Poll from the outer loop so IRQ 1 fires even while the guest is
    /// computing.
    pub fn poll(&mut self, cpu: &mut Cpu) {
        if self.rx.is_some() && self.queued_key.is_none() {
            self.kbhit(cpu);
        }
    }

    /// Keyboard controller data/status ports.
    pub fn read_port(&mut self, cpu: &mut Cpu, port: u16) -> u8 {
        if self.queued_key.is_none() {
            self.kbhit(cpu);
        }
        log::debug!(target: "int", "keyboard read_port: {:02X} (key={:04X})",
            port, self.queued_key.unwrap_or(0xFFFF));
        match port {
            0x60 => (self.queued_key.unwrap_or(0) >> 8) as u8,
            0x61 => self.portb_ctl,
            0x64 => (self.queued_key.is_some() as u8) | ((self.keyb_command != 0) as u8) << 3,
            _ => 0xFF,
        }
    }

    /// Returns true when the guest asked for a system reset through the
    /// controller.
    pub fn write_port(&mut self, port: u16, value: u8) -> bool {
        log::debug!(target: "int", "keyboard write_port: {:02X} <- {:02X}", port, value);
        match port {
            0x60 => {
                if self.keyb_command == 0 {
                    self.queued_key = Some((value as u16) << 8);
                } else if self.keyb_command == 0xD1 {
                    // Write output port; bit 0 requests a system reset.
                    self.keyb_command = 0;
                    if value & 1 != 0 {
                        log::debug!(target: "int", "System reset via keyboard I/O!");
                        return true;
                    }
                }
                false
            }
            0x61 => {
                self.portb_ctl = value & 0x03;
                false
            }
            0x64 => {
                self.keyb_command = value;
                if value & 0xF0 == 0xF0 {
                    self.keyb_command = 0;
                    if value & 1 != 0 {
                        log::debug!(target: "int", "System reset via keyboard controller!");
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }

    pub fn shift_flags(&self) -> u8 {
        self.mods.bits()
    }
}
