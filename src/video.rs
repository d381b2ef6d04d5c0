// Text-mode video. The real screen lives in guest memory at 0xB8000 as
// character/attribute pairs; a shadow copy tracks what the terminal
// currently shows and check_screen() only repaints the difference. All
// terminal output goes to the controlling tty so guest stdout can be
// redirected independently.

use std::fs::File;
use std::io::Write;

use termion::color::{AnsiValue, Bg, Fg};
use termion::cursor;

use crate::codepage::unicode_from_dos;
use crate::memory::Memory;
use crate::processor::Cpu;

const TEXT_BASE: u32 = 0xB8000;
const COLS: u16 = 80;
const ROWS: u16 = 25;

// DOS color index to ANSI color index.
static COLOR_MAP: [u8; 8] = [0, 4, 2, 6, 1, 5, 3, 7];

pub struct Video {
    initialized: bool,
    tty: Option<File>,
    term_screen: [u16; (COLS * ROWS) as usize],
    posx: u16,
    posy: u16,
    color: u8,
    cursor_shape: u16,
    crtc_port: u8,
    crtc_cursor_loc: u16,
}

impl Video {
    pub fn new() -> Video {
        Video {
            initialized: false,
            tty: None,
            term_screen: [0x0720; (COLS * ROWS) as usize],
            posx: 0,
            posy: 0,
            color: 0x07,
            cursor_shape: 0x0607,
            crtc_port: 0,
            crtc_cursor_loc: 0,
        }
    }

    pub fn active(&self) -> bool {
        self.initialized
    }

    /// Start video emulation on the first INT 10h use. Without a
    /// controlling terminal the screen buffer is still maintained but
    /// nothing is painted.
    fn init(&mut self, mem: &mut Memory) {
        if self.initialized {
            return;
        }
        log::debug!(target: "video", "starting video emulation.");
        self.initialized = true;
        self.tty = termion::get_tty().ok();
        self.clear_screen(mem);
        if let Some(tty) = &mut self.tty {
            let _ = write!(tty, "{}", termion::clear::All);
        }
    }

    fn update_posxy(&self, mem: &mut Memory) {
        mem.put8(0x450, self.posx as u8);
        mem.put8(0x451, self.posy as u8);
        mem.put8(0x462, 0); // current page
    }

    fn clear_screen(&mut self, mem: &mut Memory) {
        log::debug!(target: "video", "clear video screen");
        for i in 0..(COLS * ROWS) as u32 {
            mem.put16(TEXT_BASE + i * 2, 0x0720);
        }
        self.term_screen = [0x0720; (COLS * ROWS) as usize];
        self.posx = 0;
        self.posy = 0;
        self.color = 0x07;
        mem.put8(0x449, 0x03); // video mode
        mem.put8(0x44A, COLS as u8);
        mem.put8(0x484, (ROWS - 1) as u8);
        self.update_posxy(mem);
    }

    fn cell(mem: &Memory, x: u16, y: u16) -> u16 {
        mem.get16(TEXT_BASE + 2 * (x + y * COLS) as u32)
    }

    fn set_cell(mem: &mut Memory, x: u16, y: u16, v: u16) {
        mem.put16(TEXT_BASE + 2 * (x + y * COLS) as u32, v);
    }

    fn scroll_up(&mut self, mem: &mut Memory, x0: u16, y0: u16, x1: u16, y1: u16, n: u16) {
        let x1 = x1.min(COLS - 1);
        let y1 = y1.min(ROWS - 1);
        if x1 < x0 || y1 < y0 {
            return;
        }
        let blank = ((self.color as u16) << 8) | 0x20;
        if n == 0 || n > y1 - y0 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    Self::set_cell(mem, x, y, blank);
                }
            }
            return;
        }
        for y in y0..=(y1 - n) {
            for x in x0..=x1 {
                let v = Self::cell(mem, x, y + n);
                Self::set_cell(mem, x, y, v);
            }
        }
        for y in (y1 - n + 1)..=y1 {
            for x in x0..=x1 {
                Self::set_cell(mem, x, y, blank);
            }
        }
    }

    fn scroll_down(&mut self, mem: &mut Memory, x0: u16, y0: u16, x1: u16, y1: u16, n: u16) {
        let x1 = x1.min(COLS - 1);
        let y1 = y1.min(ROWS - 1);
        if x1 < x0 || y1 < y0 {
            return;
        }
        let blank = ((self.color as u16) << 8) | 0x20;
        if n == 0 || n > y1 - y0 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    Self::set_cell(mem, x, y, blank);
                }
            }
            return;
        }
        for y in ((y0 + n)..=y1).rev() {
            for x in x0..=x1 {
                let v = Self::cell(mem, x, y - n);
                Self::set_cell(mem, x, y, v);
            }
        }
        for y in y0..(y0 + n) {
            for x in x0..=x1 {
                Self::set_cell(mem, x, y, blank);
            }
        }
    }

    /// Teletype output: control characters move the cursor, everything
    /// else lands in the text buffer with the current attribute.
    pub fn putch(&mut self, mem: &mut Memory, ch: u8) {
        match ch {
            0x0D => self.posx = 0,
            0x0A => {
                self.posy += 1;
                while self.posy >= ROWS {
                    self.posy = ROWS - 1;
                    self.scroll_up(mem, 0, 0, COLS - 1, ROWS - 1, 1);
                }
            }
            0x08 => {
                if self.posx > 0 {
                    self.posx -= 1;
                }
            }
            0x07 => {} // bell
            _ => {
                let v = ((self.color as u16) << 8) | ch as u16;
                let (x, y) = (self.posx, self.posy);
                Self::set_cell(mem, x, y, v);
                self.posx += 1;
                if self.posx >= COLS {
                    self.posx = 0;
                    self.posy += 1;
                    while self.posy >= ROWS {
                        self.posy = ROWS - 1;
                        self.scroll_up(mem, 0, 0, COLS - 1, ROWS - 1, 1);
                    }
                }
            }
        }
        self.update_posxy(mem);
    }

    pub fn get_col(&self) -> u16 {
        self.posx
    }

    /// Repaint whatever changed since the last call and park the
    /// terminal cursor on the guest cursor.
    pub fn check_screen(&mut self, mem: &mut Memory) {
        if !self.initialized {
            return;
        }
        let Some(tty) = &mut self.tty else { return };
        let mut out = Vec::new();
        for y in 0..ROWS {
            for x in 0..COLS {
                let vc = Self::cell(mem, x, y);
                let idx = (x + y * COLS) as usize;
                if vc != self.term_screen[idx] {
                    self.term_screen[idx] = vc;
                    let attr = (vc >> 8) as u8;
                    let fg = COLOR_MAP[(attr & 7) as usize] + if attr & 8 != 0 { 8 } else { 0 };
                    let bg = COLOR_MAP[((attr >> 4) & 7) as usize];
                    let _ = write!(
                        out,
                        "{}{}{}{}",
                        cursor::Goto(x + 1, y + 1),
                        Fg(AnsiValue(fg)),
                        Bg(AnsiValue(bg)),
                        unicode_from_dos(vc as u8)
                    );
                }
            }
        }
        let _ = write!(out, "{}", cursor::Goto(self.posx + 1, self.posy + 1));
        let _ = tty.write_all(&out);
        let _ = tty.flush();
    }

    pub fn crtc_read(&self, port: u16) -> u8 {
        if port & 1 != 0 {
            match self.crtc_port {
                0x0E => (self.crtc_cursor_loc >> 8) as u8,
                0x0F => self.crtc_cursor_loc as u8,
                _ => 0,
            }
        } else {
            self.crtc_port
        }
    }

    pub fn crtc_write(&mut self, port: u16, value: u8) {
        if port & 1 != 0 {
            match self.crtc_port {
                0x0E => self.crtc_cursor_loc = (self.crtc_cursor_loc & 0xFF) | ((value as u16) << 8),
                0x0F => self.crtc_cursor_loc = (self.crtc_cursor_loc & 0xFF00) | value as u16,
                _ => {
                    log::debug!(target: "video", "CRTC port write [{:02x}] <- {:02x}",
                        self.crtc_port, value)
                }
            }
        } else {
            self.crtc_port = value;
        }
    }

    /// INT 10h text services on page 0 of mode 3.
    pub fn int10(&mut self, cpu: &mut Cpu) {
        self.init(&mut cpu.mem);
        let ax = cpu.ax();
        let ah = (ax >> 8) as u8;
        let al = ax as u8;
        let bx = cpu.bx();
        let cx = cpu.cx();
        let dx = cpu.dx();
        match ah {
            0x00 => {
                // Set mode; only text mode 3 exists here.
                self.clear_screen(&mut cpu.mem);
            }
            0x01 => {
                self.cursor_shape = cx;
            }
            0x02 => {
                self.posx = (dx & 0xFF).min(COLS - 1);
                self.posy = (dx >> 8).min(ROWS - 1);
                self.update_posxy(&mut cpu.mem);
            }
            0x03 => {
                cpu.set_dx((self.posy << 8) | self.posx);
                cpu.set_cx(self.cursor_shape);
            }
            0x05 => {} // select page: only page 0
            0x06 => {
                self.color = (bx >> 8) as u8;
                self.scroll_up(&mut cpu.mem, cx & 0xFF, cx >> 8, dx & 0xFF, dx >> 8, al as u16);
            }
            0x07 => {
                self.color = (bx >> 8) as u8;
                self.scroll_down(&mut cpu.mem, cx & 0xFF, cx >> 8, dx & 0xFF, dx >> 8, al as u16);
            }
            0x08 => {
                let v = Self::cell(&cpu.mem, self.posx, self.posy);
                cpu.set_ax(v);
            }
            0x09 | 0x0A => {
                let (mut x, mut y) = (self.posx, self.posy);
                for _ in 0..cx {
                    let v = if ah == 0x09 {
                        ((bx & 0xFF) << 8) | al as u16
                    } else {
                        (Self::cell(&cpu.mem, x, y) & 0xFF00) | al as u16
                    };
                    Self::set_cell(&mut cpu.mem, x, y, v);
                    x += 1;
                    if x >= COLS {
                        x = 0;
                        y += 1;
                        if y >= ROWS {
                            break;
                        }
                    }
                }
            }
            0x0E => {
                self.putch(&mut cpu.mem, al);
            }
            0x0F => {
                cpu.set_ax(((COLS as u16) << 8) | cpu.mem.get8(0x449) as u16);
                cpu.set_bx(bx & 0xFF);
            }
            0x10 => {
                // Palette/blink controls: nothing to do on a terminal.
                if ax != 0x1002 && ax != 0x1003 {
                    log::debug!(target: "video", "UNHANDLED INT 10, AX={:04x}", ax);
                }
            }
            0x11 => {
                if ax == 0x1130 {
                    cpu.set_dx((dx & 0xFF00) | (ROWS - 1));
                } else {
                    log::debug!(target: "video", "UNHANDLED INT 10, AX={:04x}", ax);
                }
            }
            0x12 => match bx & 0xFF {
                0x10 => {
                    cpu.set_bx(0x0003);
                    cpu.set_cx(0x0000);
                    cpu.set_ax(0);
                }
                0x30 => cpu.set_ax(0x1212),
                bl => log::debug!(target: "video", "UNHANDLED INT 10, AH=12 BL={:02x}", bl),
            },
            0x13 => {
                // Write string: AL bit 0 moves the cursor, bit 1 selects
                // char+attribute pairs in the buffer.
                let (sx, sy) = (self.posx, self.posy);
                self.posx = dx & 0xFF;
                self.posy = (dx >> 8).min(ROWS - 1);
                let seg = cpu.seg_selector(crate::fields::SegReg::ES);
                let base = cpu.linear(seg, cpu.bp());
                for i in 0..cx as u32 {
                    if al & 2 != 0 {
                        let ch = cpu.mem.get8(base + i * 2);
                        self.color = cpu.mem.get8(base + i * 2 + 1);
                        self.putch(&mut cpu.mem, ch);
                    } else {
                        self.color = bx as u8;
                        let ch = cpu.mem.get8(base + i);
                        self.putch(&mut cpu.mem, ch);
                    }
                }
                if al & 1 == 0 {
                    self.posx = sx;
                    self.posy = sy;
                    self.update_posxy(&mut cpu.mem);
                }
            }
            0x1A => {
                cpu.set_ax(0x001A);
                cpu.set_bx(0x0008); // VGA with analog color display
            }
            0xEF => {} // MSHERC.COM display-type probe
            _ => {
                log::debug!(target: "video", "UNHANDLED INT 10, AX={:04x}", ax);
            }
        }
    }
}
