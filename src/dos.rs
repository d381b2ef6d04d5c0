// The DOS services: INT 21h and its little siblings 20h/22h/28h/2Fh.
// Guest file handles map onto host files through a shared-backing table
// so DUP'ed handles keep one file position; FCB calls stash the real
// handle inside the FCB's reserved area. Paths go through the translator
// in the paths module, directory searches through a DTA-keyed cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;

use chrono::{Datelike, Local, Timelike};

use crate::alu::{FLAG_CF, FLAG_ZF};
use crate::fields::SegReg;
use crate::loader;
use crate::mcb::McbChain;
use crate::memory::Memory;
use crate::nls::{init_nls_data, NlsData, StaticMem};
use crate::paths::{DosFile, DosFs};
use crate::processor::Cpu;
use crate::Hardware;

pub const DEVINFO_TTY: u16 = 0x80D3;
pub const DEVINFO_NUL: u16 = 0x80C4;

/// What a guest handle points at. File backings are shared so DUP'ed
/// handles move one file position, and the host file is closed only when
/// the last index drops it.
#[derive(Clone)]
pub enum Backing {
    Stdin,
    Stdout,
    Stderr,
    Host(Rc<RefCell<File>>),
}

#[derive(Clone)]
pub struct HandleEntry {
    pub backing: Backing,
    pub devinfo: u16,
}

struct FindState {
    list: Vec<DosFile>,
    pos: usize,
}

pub struct Dos {
    handles: Vec<Option<HandleEntry>>,
    dta: u32,
    finds: HashMap<u32, FindState>,
    return_code: u16,
    current_psp: u16,
    pub fs: DosFs,
    pub mcb: McbChain,
    nls: Option<NlsData>,
    /// Carry for the scancode half of a special key from char input.
    pending_char: u16,
}

const MAX_HANDLES: usize = 0x10000;

fn guess_devinfo(tty: bool) -> u16 {
    if tty {
        DEVINFO_TTY
    } else {
        0x0002 // block device, drive C:
    }
}

/// Host I/O error to DOS error code for path operations.
fn dos_path_error(e: &std::io::Error) -> u16 {
    use std::io::ErrorKind::*;
    match e.kind() {
        NotFound => 2,
        PermissionDenied | AlreadyExists => 5,
        _ => match e.raw_os_error() {
            // ENOTDIR / ENAMETOOLONG
            Some(20) | Some(36) | Some(63) => 3,
            _ => 1,
        },
    }
}

fn dos_unlink_error(e: &std::io::Error) -> u16 {
    use std::io::ErrorKind::*;
    match e.kind() {
        NotFound => 2,
        _ => match e.raw_os_error() {
            Some(20) => 3,
            _ => 5,
        },
    }
}

/// Pack a host modification time into the DOS date:time dword.
fn dos_time_date(t: std::time::SystemTime) -> u32 {
    let lt: chrono::DateTime<Local> = t.into();
    let time =
        ((lt.hour() as u32) << 11) | ((lt.minute() as u32) << 5) | (lt.second() as u32 / 2);
    let year = (lt.year() - 1980).clamp(0, 127) as u32;
    let date = (year << 9) | ((lt.month() as u32) << 5) | lt.day() as u32;
    (date << 16) | time
}

fn dos_attributes(md: &std::fs::Metadata) -> u8 {
    let mut r = 0;
    if md.is_dir() {
        r |= 1 << 4; // DIR
    } else if !md.is_file() {
        r |= 1 << 2; // SYSTEM
    } else {
        r |= 1 << 5; // ARCHIVE
    }
    if md.permissions().readonly() {
        r |= 1 << 0; // READ_ONLY
    }
    r
}

fn read_full(f: &mut impl Read, buf: &mut [u8]) -> usize {
    let mut done = 0;
    while done < buf.len() {
        match f.read(&mut buf[done..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => done += n,
        }
    }
    done
}

impl Dos {
    pub fn new() -> Dos {
        let mut handles = vec![None; 5];
        handles[0] = Some(HandleEntry {
            backing: Backing::Stdin,
            devinfo: guess_devinfo(std::io::stdin().is_terminal()),
        });
        handles[1] = Some(HandleEntry {
            backing: Backing::Stdout,
            devinfo: guess_devinfo(std::io::stdout().is_terminal()),
        });
        handles[2] = Some(HandleEntry {
            backing: Backing::Stderr,
            devinfo: guess_devinfo(std::io::stderr().is_terminal()),
        });
        // Indices 3 and 4 stay reserved for AUX and PRN.
        Dos {
            handles,
            dta: 0,
            finds: HashMap::new(),
            return_code: 0,
            current_psp: 0,
            fs: DosFs::new(),
            mcb: McbChain::new(),
            nls: None,
            pending_char: 0,
        }
    }

    pub fn current_psp(&self) -> u16 {
        self.current_psp
    }

    pub fn set_current_psp(&mut self, psp: u16) {
        self.current_psp = psp;
    }

    pub fn handle(&self, h: u16) -> Option<&HandleEntry> {
        self.handles.get(h as usize).and_then(|e| e.as_ref())
    }

    pub fn devinfo(&self, h: u16) -> u16 {
        self.handle(h).map_or(0, |e| e.devinfo)
    }

    fn new_handle(&mut self) -> Option<u16> {
        for i in 5..self.handles.len() {
            if self.handles[i].is_none() {
                return Some(i as u16);
            }
        }
        if self.handles.len() < MAX_HANDLES {
            self.handles.push(None);
            Some((self.handles.len() - 1) as u16)
        } else {
            None
        }
    }

    fn append_paths(&self) -> Option<String> {
        std::env::var("EMU2_APPEND").ok()
    }

    fn close_handle(&mut self, h: u16) -> bool {
        match self.handles.get_mut(h as usize) {
            Some(slot @ Some(_)) => {
                // Dropping the entry releases the host file once no
                // other index shares the backing.
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Boot-time environment: IVT trampolines, the CP/M INT 21h entry,
    /// the MCB chain, NLS tables and sysvars.
    pub fn init_tables(&mut self, mem: &mut Memory) {
        crate::codepage::init_codepage();

        // Every vector points into the BIOS service page at segment 0,
        // offset = vector number.
        for i in 0..256u32 {
            mem.put8(i * 4, i as u8);
            mem.put8(i * 4 + 1, 0);
            mem.put16(i * 4 + 2, 0);
        }
        // INT 21h at 0000:00C0 for the CP/M call gate.
        mem.put8(0xC0, 0xCD);
        mem.put8(0xC1, 0x21);

        // Conventional memory: MCBs from 0x80 up to 640KB, or 512KB when
        // EMU2_LOWMEM asks for the old-program workaround.
        if std::env::var_os("EMU2_LOWMEM").is_some() {
            self.mcb.init(mem, 0x80, 0x7FFF);
        } else {
            self.mcb.init(mem, 0x80, 0xA000);
        }

        let mut rom = StaticMem::new();
        let nls = match init_nls_data(mem, &mut rom) {
            Some(n) => n,
            None => {
                eprintln!("not enough static DOS memory");
                std::process::exit(1);
            }
        };
        mem.put16(nls.sysvars + 22, 0x0080); // first MCB
        self.nls = Some(nls);

        // Default drive and CWD come from the environment when running
        // as a child of another emulator instance.
        if let Ok(d) = std::env::var("EMU2_DEFAULT_DRIVE") {
            if let Some(c) = d.bytes().next() {
                let c = if c.is_ascii_lowercase() { c - b'a' } else { c.wrapping_sub(b'A') };
                if c < 26 {
                    self.fs.set_default_drive(c as usize);
                    log::debug!(target: "dos", "set default drive = '{}'", (c + b'A') as char);
                }
            }
        }
        if let Ok(cwd) = std::env::var("EMU2_CWD") {
            self.fs.change_cwd(&cwd);
        } else {
            let drive = self.fs.default_drive();
            match self.fs.real_path(drive, ".") {
                Some(cwd) => {
                    self.fs.change_cwd(&cwd);
                }
                None => {
                    log::debug!(target: "dos", "\tWARNING: working directory outside default drive")
                }
            }
        }
    }

    /// Build the main PSP + environment and load the program image.
    pub fn boot(
        &mut self,
        cpu: &mut Cpu,
        prog: &Path,
        args: &[String],
        env: &[String],
    ) -> Result<(), String> {
        self.init_tables(&mut cpu.mem);

        // The command tail keeps the separator before each word, the
        // way the user typed it after the program name. A word that
        // already carries its separator (a re-executed command tail) is
        // appended verbatim.
        let mut cmdline = String::new();
        for a in args {
            if a.is_empty() {
                continue;
            }
            if !a.starts_with(' ') {
                cmdline.push(' ');
            }
            cmdline.push_str(a);
            if cmdline.len() > 126 {
                cmdline.truncate(126);
                break;
            }
        }

        let mut environment: Vec<u8> = Vec::new();
        let mut have_path = false;
        for e in env {
            if e == "PATH" || e.starts_with("PATH=") {
                have_path = true;
            }
            environment.extend_from_slice(e.as_bytes());
            environment.push(0);
        }
        if !have_path {
            environment.extend_from_slice(b"PATH=C:\\\0");
        }
        environment.push(0);

        let progname = match std::env::var("EMU2_PROGNAME") {
            Ok(p) => p,
            Err(_) => {
                let drive = self.fs.default_drive();
                self.fs
                    .real_path(drive, &prog.to_string_lossy())
                    .unwrap_or_else(|| prog.to_string_lossy().into_owned())
            }
        };

        let psp_mcb =
            loader::create_psp(&mut cpu.mem, &mut self.mcb, &cmdline, &environment, &progname)
                .ok_or("not enough memory for new PSP and environment")?;
        self.current_psp = psp_mcb + 1;

        let data = std::fs::read(prog)
            .map_err(|e| format!("can't open '{}': {}", prog.display(), e))?;
        loader::load_program(cpu, &mut self.mcb, &data, psp_mcb)
            .map_err(|e| format!("error loading EXE/COM file: {}", e))?;

        self.dta = self.current_psp as u32 * 16 + 0x80;

        cpu.flags.interrupt = true;
        cpu.flags.direction = false;
        cpu.flags.trap = false;
        Ok(())
    }
}

// The INT 21h function dispatcher and its helpers live on the machine
// because console I/O reaches into the video and keyboard state.
impl Hardware {
    fn ok(&self, cpu: &mut Cpu) {
        cpu.clr_return_flags(FLAG_CF);
    }

    fn err(&self, cpu: &mut Cpu, code: u16) {
        cpu.set_return_flags(FLAG_CF);
        cpu.set_ax(code);
    }

    /// Write one character to DOS stdout, through the video screen when
    /// handle 1 still points at the console.
    pub(crate) fn dos_putchar(&mut self, cpu: &mut Cpu, ch: u8) {
        if self.dos.devinfo(1) == DEVINFO_TTY && self.video.active() {
            self.video.putch(&mut cpu.mem, ch);
            return;
        }
        match self.dos.handle(1).map(|e| e.backing.clone()) {
            Some(Backing::Host(f)) => {
                let _ = f.borrow_mut().write_all(&[ch]);
            }
            Some(Backing::Stderr) => {
                let _ = std::io::stderr().write_all(&[ch]);
            }
            _ => {
                let mut out = std::io::stdout();
                let _ = out.write_all(&[ch]);
                let _ = out.flush();
            }
        }
    }

    /// Blocking keyboard read through the BIOS layer, running the
    /// machine updates while waiting.
    pub(crate) fn getch(&mut self, cpu: &mut Cpu, detect_brk: bool) -> u16 {
        loop {
            if self.keyb.kbhit(cpu).is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
            self.update(cpu);
        }
        let key = self.keyb.take_key(&mut cpu.mem).unwrap_or(0);
        if detect_brk && key & 0xFF == 3 {
            // Control-C pressed on the console.
            eprintln!();
            self.request_exit(1);
        }
        key
    }

    /// Single character input for functions 01/06/07/08; the scancode of
    /// a special key is delivered on the following call.
    fn char_input(&mut self, cpu: &mut Cpu, brk: bool) {
        if self.dos.pending_char == 0 {
            let key = if self.dos.devinfo(0) != DEVINFO_TTY {
                let mut b = [0u8; 1];
                let n = match self.dos.handle(0).map(|e| e.backing.clone()) {
                    Some(Backing::Host(f)) => read_full(&mut *f.borrow_mut(), &mut b),
                    _ => read_full(&mut std::io::stdin().lock(), &mut b),
                };
                if n == 0 {
                    0x1A // EOF reads as ^Z
                } else {
                    b[0] as u16
                }
            } else {
                self.getch(cpu, brk)
            };
            self.dos.pending_char = key;
        }
        let key = self.dos.pending_char;
        log::debug!(target: "dos", "\tgetch = {:02x}", key);
        cpu.set_al(key as u8);
        self.dos.pending_char = if key & 0xFF == 0 { key >> 8 } else { 0 };
    }

    /// Console line input with minimal editing; returns the bytes stored
    /// including the terminating CR/LF pair.
    fn line_input(&mut self, cpu: &mut Cpu, max: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.dos.devinfo(0) == DEVINFO_TTY {
            while buf.len() + 1 < max {
                let key = (self.getch(cpu, true) & 0xFF) as u8;
                match key {
                    b'\r' => {
                        self.dos_putchar(cpu, b'\r');
                        self.dos_putchar(cpu, b'\n');
                        buf.push(b'\r');
                        buf.push(b'\n');
                        break;
                    }
                    0x08 => {
                        if buf.pop().is_some() {
                            self.dos_putchar(cpu, 0x08);
                            self.dos_putchar(cpu, b' ');
                            self.dos_putchar(cpu, 0x08);
                        }
                    }
                    0 => {}
                    k => {
                        if buf.len() < max && self.video.get_col() < 79 {
                            self.dos_putchar(cpu, k);
                            buf.push(k);
                        }
                    }
                }
            }
        } else {
            let mut cr = false;
            let backing = self.dos.handle(0).map(|e| e.backing.clone());
            while buf.len() < max {
                let mut b = [0u8; 1];
                let n = match &backing {
                    Some(Backing::Host(f)) => read_full(&mut *f.borrow_mut(), &mut b),
                    _ => read_full(&mut std::io::stdin().lock(), &mut b),
                };
                if n == 0 {
                    break;
                }
                let c = b[0];
                if c == b'\n' && !cr {
                    buf.push(b'\r');
                    if buf.len() >= max {
                        break;
                    }
                } else if c == b'\r' {
                    cr = true;
                }
                buf.push(c);
                if c == b'\n' {
                    break;
                }
            }
        }
        buf
    }

    // FCB plumbing. An extended FCB is flagged by a leading 0xFF; the
    // plain FCB then starts 7 bytes in.

    fn fcb_ex_addr(&self, cpu: &Cpu) -> u32 {
        cpu.addr_ds(cpu.dx())
    }

    fn fcb_addr(&self, cpu: &Cpu) -> u32 {
        let fcb = self.fcb_ex_addr(cpu);
        if cpu.mem.get8(fcb) == 0xFF {
            fcb + 7
        } else {
            fcb
        }
    }

    fn fcb_handle(&self, cpu: &Cpu) -> u16 {
        cpu.mem.get16(self.fcb_addr(cpu) + 0x18)
    }

    fn show_fcb(&self, cpu: &Cpu) {
        if !crate::dbg::debug_active("dos") {
            return;
        }
        let fcb = self.fcb_addr(cpu);
        let name = cpu.mem.bytes_at(fcb + 1, 11);
        log::debug!(target: "dos",
            "\tFCB:[d={:02x}:n={}.{}:bn={:04x}:rs={:04x}:fs={:08x}:h={:04x}:rn={:02x}:ra={:08x}]",
            cpu.mem.get8(fcb),
            String::from_utf8_lossy(&name[..8]),
            String::from_utf8_lossy(&name[8..]),
            cpu.mem.get16(fcb + 0x0C),
            cpu.mem.get16(fcb + 0x0E),
            cpu.mem.get32(fcb + 0x10),
            cpu.mem.get16(fcb + 0x18),
            cpu.mem.get8(fcb + 0x20),
            cpu.mem.get32(fcb + 0x21));
    }

    fn fcb_host_path(&self, cpu: &Cpu, force: bool) -> Option<PathBuf> {
        let fcb = self.fcb_addr(cpu);
        let drive = cpu.mem.get8(fcb);
        let name = cpu.mem.bytes_at(fcb + 1, 11);
        let append = self.dos.append_paths();
        self.dos.fs.unix_path_fcb(drive, &name, force, append.as_deref())
    }

    fn open_file_fcb(&mut self, cpu: &mut Cpu, create: bool) {
        let h = match self.dos.new_handle() {
            Some(h) => h,
            None => {
                cpu.set_al(0xFF);
                cpu.set_return_flags(FLAG_CF);
                return;
            }
        };
        let fname = match self.fcb_host_path(cpu, create) {
            Some(f) => f,
            None => {
                log::debug!(target: "dos", "\t(file not found)");
                cpu.set_al(0xFF);
                cpu.set_return_flags(FLAG_CF);
                return;
            }
        };
        log::debug!(target: "dos", "\topen fcb '{}', {:04x}", fname.display(), h);
        let file = if create {
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&fname)
        } else {
            OpenOptions::new().read(true).write(true).open(&fname)
                .or_else(|_| OpenOptions::new().read(true).open(&fname))
        };
        let file = match file {
            Ok(f) => f,
            Err(e) => {
                log::debug!(target: "dos", "{}.", e);
                cpu.set_al(0xFF);
                cpu.set_return_flags(FLAG_CF);
                return;
            }
        };
        let size = file.metadata().map(|m| m.len().min(0xFFFFFFFF) as u32).unwrap_or(0);
        self.dos.handles[h as usize] = Some(HandleEntry {
            backing: Backing::Host(Rc::new(RefCell::new(file))),
            devinfo: self.dos.fs.default_drive() as u16,
        });
        let fcb = self.fcb_addr(cpu);
        cpu.mem.put16(fcb + 0x0C, 0); // block number
        cpu.mem.put16(fcb + 0x0E, 128); // record size
        cpu.mem.put32(fcb + 0x10, size);
        cpu.mem.put16(fcb + 0x14, 0); // date of last write
        cpu.mem.put16(fcb + 0x16, 0); // time of last write
        cpu.mem.put16(fcb + 0x18, h); // reserved: the real handle
        cpu.mem.put8(fcb + 0x20, 0); // current record
        cpu.clr_return_flags(FLAG_CF);
        cpu.set_al(0x00);
        self.show_fcb(cpu);
    }

    /// Record number for an FCB transfer: sequential uses block+current
    /// record, random the 32-bit random field.
    fn fcb_record(&self, cpu: &Cpu, random: bool) -> u32 {
        let fcb = self.fcb_addr(cpu);
        if random {
            cpu.mem.get32(fcb + 0x21)
        } else {
            cpu.mem.get16(fcb + 0x0C) as u32 * 128 + cpu.mem.get8(fcb + 0x20) as u32
        }
    }

    fn fcb_advance(&self, cpu: &mut Cpu, recnum: u32, advance_random: bool) {
        let fcb = self.fcb_addr(cpu);
        let next = recnum + 1;
        cpu.mem.put8(fcb + 0x20, (next % 128) as u8);
        cpu.mem.put16(fcb + 0x0C, (next / 128) as u16);
        if advance_random {
            cpu.mem.put32(fcb + 0x21, next);
        }
    }

    /// FCB read into `addr`: 0 full record, 1 EOF, 2 bad buffer,
    /// 3 partial record (zero padded).
    fn fcb_read_record(&mut self, cpu: &mut Cpu, addr: u32, recnum: u32, advance: Option<bool>) -> u8 {
        let h = self.fcb_handle(cpu);
        let Some(entry) = self.dos.handle(h) else { return 1 };
        let Backing::Host(f) = entry.backing.clone() else { return 1 };
        let fcb = self.fcb_addr(cpu);
        let rsize = cpu.mem.get16(fcb + 0x0E) as u32;
        if rsize == 0 {
            return 2;
        }
        let pos = rsize as u64 * recnum as u64;
        let mut buf = vec![0u8; rsize as usize];
        let mut file = f.borrow_mut();
        if file.seek(SeekFrom::Start(pos)).is_err() {
            return 1;
        }
        let n = read_full(&mut *file, &mut buf);
        drop(file);
        if cpu.mem.block_mut(addr, rsize).is_none() {
            log::debug!(target: "dos", "\tbuffer pointer invalid");
            return 2;
        }
        cpu.mem.write_block(addr, &buf);
        if let Some(adv_random) = advance {
            if n > 0 {
                self.fcb_advance(cpu, recnum, adv_random);
            }
        }
        if n == rsize as usize {
            0
        } else if n == 0 {
            1
        } else {
            3
        }
    }

    fn fcb_write_record(&mut self, cpu: &mut Cpu, addr: u32, recnum: u32, advance: Option<bool>) -> u8 {
        let h = self.fcb_handle(cpu);
        let Some(entry) = self.dos.handle(h) else { return 1 };
        let Backing::Host(f) = entry.backing.clone() else { return 1 };
        let fcb = self.fcb_addr(cpu);
        let rsize = cpu.mem.get16(fcb + 0x0E) as u32;
        if rsize == 0 {
            return 2;
        }
        let buf = match cpu.mem.block(addr, rsize) {
            Some(b) => b.to_vec(),
            None => {
                log::debug!(target: "dos", "\tbuffer pointer invalid");
                return 2;
            }
        };
        let pos = rsize as u64 * recnum as u64;
        let mut file = f.borrow_mut();
        if file.seek(SeekFrom::Start(pos)).is_err() {
            return 1;
        }
        let n = file.write(&buf).unwrap_or(0);
        drop(file);
        if let Some(adv_random) = advance {
            if n > 0 {
                self.fcb_advance(cpu, recnum, adv_random);
            }
        }
        // Track the growing file size.
        let end = pos + n as u64;
        if end > cpu.mem.get32(fcb + 0x10) as u64 {
            cpu.mem.put32(fcb + 0x10, end.min(0xFFFFFFFF) as u32);
        }
        if n == rsize as usize {
            0
        } else {
            3 // disk full
        }
    }

    // Find-first machinery. The listings live in a DTA-keyed map; a slot
    // is dropped when its listing is exhausted or replaced.

    fn fill_dta_entry(&mut self, cpu: &mut Cpu, f: &DosFile) {
        let dta = self.dos.dta;
        match &f.host {
            Some(host) => match std::fs::metadata(host) {
                Ok(md) => {
                    cpu.mem.put8(dta + 0x15, dos_attributes(&md));
                    let td = md
                        .modified()
                        .map(dos_time_date)
                        .unwrap_or(0x10001);
                    cpu.mem.put32(dta + 0x16, td);
                    let size = md.len().min(0x7FFFFFFF) as u32;
                    cpu.mem.put32(dta + 0x1A, size);
                }
                Err(_) => {
                    cpu.mem.put8(dta + 0x15, 0);
                    cpu.mem.put32(dta + 0x16, 0x10001);
                    cpu.mem.put32(dta + 0x1A, 0);
                }
            },
            None => {
                // Volume label.
                cpu.mem.put8(dta + 0x15, 8);
                cpu.mem.put32(dta + 0x16, dos_time_date(std::time::SystemTime::now()));
                cpu.mem.put32(dta + 0x1A, 0);
            }
        }
        let mut name = [0u8; 13];
        for (i, b) in f.dos.bytes().take(12).enumerate() {
            name[i] = b;
        }
        cpu.mem.write_block(dta + 0x1E, &name);
    }

    fn find_next(&mut self, cpu: &mut Cpu, first: bool) {
        let dta = self.dos.dta;
        let next = match self.dos.finds.get_mut(&dta) {
            Some(st) if st.pos < st.list.len() => {
                let f = st.list[st.pos].clone();
                st.pos += 1;
                Some(f)
            }
            _ => None,
        };
        match next {
            None => {
                log::debug!(target: "dos", "\t(end)");
                self.dos.finds.remove(&dta);
                cpu.set_return_flags(FLAG_CF);
                cpu.set_ax(if first { 0x02 } else { 0x12 });
            }
            Some(f) => {
                log::debug!(target: "dos", "\t'{}' ('{}')", f.dos,
                    f.host.as_ref().map(|h| h.display().to_string()).unwrap_or_default());
                self.fill_dta_entry(cpu, &f);
                cpu.clr_return_flags(FLAG_CF);
            }
        }
    }

    fn volume_label_list() -> Vec<DosFile> {
        vec![DosFile { dos: "DISK LABEL".to_string(), host: None }]
    }

    fn find_first(&mut self, cpu: &mut Cpu) {
        let list = if cpu.cx() & 8 != 0 {
            Self::volume_label_list()
        } else {
            let path = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
            self.dos.fs.find_first_list(&path)
        };
        self.dos.finds.insert(self.dos.dta, FindState { list, pos: 0 });
        self.find_next(cpu, true);
    }

    fn find_next_fcb(&mut self, cpu: &mut Cpu) {
        let dta = self.dos.dta;
        let next = match self.dos.finds.get_mut(&dta) {
            Some(st) if st.pos < st.list.len() => {
                let f = st.list[st.pos].clone();
                st.pos += 1;
                Some(f)
            }
            _ => None,
        };
        match next {
            None => {
                log::debug!(target: "dos", "\t(end)");
                self.dos.finds.remove(&dta);
                cpu.set_al(0xFF);
            }
            Some(f) => {
                log::debug!(target: "dos", "\t'{}'", f.dos);
                // Output is a directory-entry style FCB at the DTA,
                // extended when the input FCB is extended.
                let ex = cpu.mem.get8(self.fcb_ex_addr(cpu)) == 0xFF;
                let ofcb = if ex { dta + 7 } else { dta };
                let mut pos = 1;
                for c in f.dos.bytes() {
                    if c != b'.' {
                        cpu.mem.put8(ofcb + pos, c);
                        pos += 1;
                    } else {
                        while pos < 9 {
                            cpu.mem.put8(ofcb + pos, b' ');
                            pos += 1;
                        }
                    }
                }
                while pos < 12 {
                    cpu.mem.put8(ofcb + pos, b' ');
                    pos += 1;
                }
                let drive = cpu.mem.get8(self.fcb_addr(cpu));
                cpu.mem.put8(ofcb, drive);
                match &f.host {
                    Some(host) => match std::fs::metadata(host) {
                        Ok(md) => {
                            cpu.mem.put8(ofcb + 0x0C, dos_attributes(&md));
                            let td =
                                md.modified().map(dos_time_date).unwrap_or(0x10001);
                            cpu.mem.put32(ofcb + 0x17, td);
                            cpu.mem.put32(ofcb + 0x1D, md.len().min(0x7FFFFFFF) as u32);
                        }
                        Err(_) => {
                            cpu.mem.put8(ofcb + 0x0C, 0);
                            cpu.mem.put32(ofcb + 0x17, 0x10001);
                            cpu.mem.put32(ofcb + 0x1D, 0);
                        }
                    },
                    None => {
                        cpu.mem.put8(ofcb + 0x0C, 8);
                        cpu.mem.put32(ofcb + 0x17, dos_time_date(std::time::SystemTime::now()));
                        cpu.mem.put32(ofcb + 0x1D, 0);
                    }
                }
                cpu.set_al(0x00);
            }
        }
    }

    fn find_first_fcb(&mut self, cpu: &mut Cpu) {
        let efcb = self.fcb_ex_addr(cpu);
        let list = if cpu.mem.get8(efcb) == 0xFF && cpu.mem.get8(efcb + 6) == 0x08 {
            Self::volume_label_list()
        } else {
            let fcb = self.fcb_addr(cpu);
            let drive = cpu.mem.get8(fcb);
            let name = cpu.mem.bytes_at(fcb + 1, 11);
            self.dos.fs.find_first_list_fcb(drive, &name)
        };
        self.dos.finds.insert(self.dos.dta, FindState { list, pos: 0 });
        self.find_next_fcb(cpu);
    }

    fn open_file(&mut self, cpu: &mut Cpu, create: u8) {
        let h = match self.dos.new_handle() {
            Some(h) => h,
            None => {
                self.err(cpu, 4);
                return;
            }
        };
        let name_addr = cpu.addr_ds(cpu.dx());
        let al = cpu.al();
        let name = cpu.mem.string_at(name_addr, 63);
        let append = self.dos.append_paths();
        let fname = self.dos.fs.unix_path(
            &name,
            create != 0,
            if create == 0 { append.as_deref() } else { None },
        );
        let fname = match fname {
            Some(f) if !name.is_empty() => f,
            _ => {
                log::debug!(target: "dos", "\t(file not found)");
                self.err(cpu, 2);
                return;
            }
        };
        log::debug!(target: "dos", "\topen '{}', {:02x}, {:04x}", fname.display(), al, h);
        let file = match create {
            1 => OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&fname),
            2 => OpenOptions::new().read(true).write(true).create_new(true).open(&fname),
            _ => match al & 7 {
                0 => OpenOptions::new().read(true).open(&fname),
                1 | 2 => OpenOptions::new().read(true).write(true).open(&fname)
                    .or_else(|_| OpenOptions::new().read(true).open(&fname)),
                _ => {
                    self.err(cpu, 1);
                    return;
                }
            },
        };
        let file = match file {
            Ok(f) => f,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    log::debug!(target: "dos", "not found.");
                    self.err(cpu, 2);
                } else {
                    log::debug!(target: "dos", "{}.", e);
                    self.err(cpu, 5);
                }
                return;
            }
        };
        let devinfo = if fname == Path::new("/dev/null") {
            DEVINFO_NUL
        } else if fname == Path::new("/dev/tty") {
            DEVINFO_TTY
        } else if cpu.mem.get8(name_addr + 1) == b':' {
            let c = cpu.mem.get8(name_addr);
            let c = if c >= b'a' { c.wrapping_sub(b'a') } else { c.wrapping_sub(b'A') };
            if c < 26 {
                c as u16
            } else {
                self.dos.fs.default_drive() as u16
            }
        } else {
            self.dos.fs.default_drive() as u16
        };
        self.dos.handles[h as usize] =
            Some(HandleEntry { backing: Backing::Host(Rc::new(RefCell::new(file))), devinfo });
        log::debug!(target: "dos", "OK.");
        cpu.clr_return_flags(FLAG_CF);
        cpu.set_ax(h);
    }

    fn close_file(&mut self, cpu: &mut Cpu, h: u16) -> bool {
        if self.dos.close_handle(h) {
            cpu.clr_return_flags(FLAG_CF);
            true
        } else {
            self.err(cpu, 6);
            false
        }
    }

    fn mkdir_rmdir(&mut self, cpu: &mut Cpu, rmdir: bool) {
        let name = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
        let fname = match self.dos.fs.unix_path(&name, true, None) {
            Some(f) => f,
            None => {
                self.err(cpu, 2);
                return;
            }
        };
        log::debug!(target: "dos", "\t{} '{}' ", if rmdir { "rmdir" } else { "mkdir" },
            fname.display());
        let r = if rmdir { std::fs::remove_dir(&fname) } else { std::fs::create_dir(&fname) };
        match r {
            Ok(()) => {
                log::debug!(target: "dos", "OK");
                self.ok(cpu);
            }
            Err(e) => {
                let code = dos_path_error(&e);
                log::debug!(target: "dos", "ERROR {}", code);
                self.err(cpu, code);
            }
        }
    }

    fn drive_info(&mut self, cpu: &mut Cpu, _drive: u8) {
        cpu.set_al(32); // 16k clusters
        cpu.set_cx(512); // 512 bytes/sector
        cpu.set_dx(0xFFFF); // total 1GB
        cpu.set_bx(0x0000); // media ID byte, offset
        cpu.set_data_segment(SegReg::DS, 0x0000); // and segment
        cpu.clr_return_flags(FLAG_CF);
    }

    /// Re-execute the emulator binary to run a child program, wiring the
    /// guest's stdio handles to the child's host stdio.
    fn run_emulator(
        &mut self,
        file: &Path,
        prgname: &str,
        cmdline: &str,
        env: Vec<String>,
    ) -> bool {
        let exe = match std::env::current_exe() {
            Ok(e) => e,
            Err(_) => {
                eprintln!("can't get emulator path.");
                self.dos.return_code = 0x100;
                return true;
            }
        };
        let mut cmd = Command::new(exe);
        cmd.arg(file).arg(cmdline).arg("--").args(env);
        cmd.env("EMU2_PROGNAME", prgname);
        let drv = (b'A' + self.dos.fs.default_drive() as u8) as char;
        cmd.env("EMU2_DEFAULT_DRIVE", drv.to_string());
        let cwd = self.dos.fs.cwd_for(0);
        let cwd_len = cwd.iter().position(|&c| c == 0).unwrap_or(64);
        cmd.env("EMU2_CWD", String::from_utf8_lossy(&cwd[..cwd_len]).into_owned());

        // Guest handles 0-2 become the child's stdio.
        for i in 0..3u16 {
            let stdio = match self.dos.handle(i).map(|e| e.backing.clone()) {
                Some(Backing::Host(f)) => match f.borrow().try_clone() {
                    Ok(c) => Stdio::from(c),
                    Err(_) => Stdio::inherit(),
                },
                _ => Stdio::inherit(),
            };
            match i {
                0 => cmd.stdin(stdio),
                1 => cmd.stdout(stdio),
                _ => cmd.stderr(stdio),
            };
        }

        match cmd.status() {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                let mut rc = (status.code().unwrap_or(0) & 0xFF) as u16;
                if status.signal().is_some() || status.code().is_none() {
                    rc |= 0x100;
                }
                if rc != 0 {
                    log::debug!(target: "dos", "child exited with code {:04x}", rc);
                }
                self.dos.return_code = rc;
                rc > 0xFF
            }
            Err(e) => {
                log::debug!(target: "dos", "exec failed: {}", e);
                self.dos.return_code = 0x100;
                true
            }
        }
    }

    fn exec(&mut self, cpu: &mut Cpu) {
        let name = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
        let append = self.dos.append_paths();
        let fname = match self.dos.fs.unix_path(&name, false, append.as_deref()) {
            Some(f) => f,
            None => {
                log::debug!(target: "dos", "\texec error, file not found");
                self.err(cpu, 2);
                return;
            }
        };
        let al = cpu.al();
        if al == 3 {
            // Overlay load.
            log::debug!(target: "dos", "\tload overlay '{}'", fname.display());
            let pb = cpu.addr_es(cpu.bx());
            let load_seg = cpu.mem.get16(pb);
            let reloc_seg = cpu.mem.get16(pb + 2);
            let ok = std::fs::read(&fname)
                .ok()
                .map(|data| loader::load_overlay(&mut cpu.mem, &data, load_seg, reloc_seg).is_ok())
                .unwrap_or(false);
            if ok {
                cpu.clr_return_flags(FLAG_CF);
            } else {
                log::debug!(target: "dos", "\tERROR");
                self.err(cpu, 11);
            }
        } else if al == 0 {
            log::debug!(target: "dos", "\texec: '{}'", fname.display());
            let prgname = name.clone();
            let pb = cpu.addr_es(cpu.bx());
            let cmd_addr = cpu.linear(cpu.mem.get16(pb + 4), cpu.mem.get16(pb + 2));
            let clen = cpu.mem.get8(cmd_addr) as u32;
            let cmdline = cpu.mem.string_at(cmd_addr + 1, clen.min(127));
            log::debug!(target: "dos", "\texec command line: '{} {}'", prgname, cmdline);
            let mut env = Vec::new();
            if cpu.mem.get16(pb) != 0 {
                let mut eaddr = cpu.linear(cpu.mem.get16(pb), 0);
                while cpu.mem.get8(eaddr) != 0 && eaddr < 0xFFFFF {
                    let entry = cpu.mem.string_at(eaddr, 254);
                    if entry.is_empty() {
                        break;
                    }
                    eaddr += entry.len() as u32 + 1;
                    env.push(entry);
                }
            }
            if self.run_emulator(&fname, &prgname, &cmdline, env) {
                self.err(cpu, 5); // access denied
            } else {
                cpu.clr_return_flags(FLAG_CF);
            }
        } else {
            log::debug!(target: "dos", "\texec '{}': type {:02x}h not supported.",
                fname.display(), al);
            self.err(cpu, 1);
        }
    }

    /// INT 21h function 4Ch and friends: either leave the process or
    /// return control to the parent PSP inside the same emulator.
    fn exit_program(&mut self, cpu: &mut Cpu, code: u8) {
        let psp = self.dos.current_psp;
        let parent = cpu.mem.get16(cpu.linear(psp, 22));
        log::debug!(target: "dos", "\texit PSP:'{:04x}', PARENT:{:04x}.", psp, parent);
        if parent == 0xFFFE {
            self.request_exit(code as u16);
            return;
        }
        self.dos.return_code = code as u16;
        // Restore the parent's INT 22h/23h/24h vectors from the PSP.
        for i in 0..6u32 {
            let v = cpu.mem.get16(cpu.linear(psp, 10 + 2 * i as u16));
            cpu.mem.put16(0x88 + 2 * i, v);
        }
        self.dos.current_psp = parent;
        let ss = cpu.mem.get16(cpu.linear(parent, 0x30));
        let sp = cpu.mem.get16(cpu.linear(parent, 0x2E));
        cpu.set_data_segment(SegReg::SS, ss);
        cpu.set_sp(sp);
        // Synthesize the interrupt frame the trampoline IRET will pop:
        // the parent's termination address with interrupts enabled.
        let stack = cpu.linear(ss, sp);
        let int22_off = cpu.mem.get16(0x22 * 4);
        let int22_seg = cpu.mem.get16(0x22 * 4 + 2);
        cpu.mem.put16(stack, int22_off);
        cpu.mem.put16(stack + 2, int22_seg);
        cpu.mem.put16(stack + 4, 0xF202);
    }

    fn int21_debug(&self, cpu: &Cpu) {
        static FUNC_NAMES: [&str; 0x66] = [
            "terminate", "getchar", "putchar", "getc(aux)", "putc(aux)", // 0-4
            "putc(prn)", "console i/o", "getch", "getch", "puts", // 5-9
            "gets", "eof(stdin)", "flush(stdin)+", "disk reset", "set drive", // 0A-0E
            "open fcb", "close fcb", "find first fcb", "find next fcb", "del fcb", // 0F-13
            "read fcb", "write fcb", "creat fcb", "rename fcb", "n/a", // 14-18
            "get drive", "set DTA", "stat def drive", "stat drive", "n/a", // 19-1D
            "n/a", "get def DPB", "n/a", "read fcb", "write fcb", // 1E-22
            "size fcb", "set record fcb", "set int vect", "create PSP", "read blk fcb", // 23-27
            "write blk fcb", "parse filename", "get date", "set date", "get time", // 28-2C
            "set time", "set verify", "get DTA", "version", "go TSR", // 2D-31
            "get DPB", "g/set brk check", "InDOS addr", "get int vect", "get free", // 32-36
            "get/set switch", "country info", "mkdir", "rmdir", "chdir", // 37-3B
            "creat", "open", "close", "read", "write", // 3C-40
            "unlink", "lseek", "get/set attr", "g/set devinfo", "dup", // 41-45
            "dup2", "get CWD", "mem alloc", "mem free", "mem resize", // 46-4A
            "exec", "exit", "get errorlevel", "find first", "find next", // 4B-4F
            "set PSP", "get PSP", "get sysvars", "trans BPB to DPB", "get verify", // 50-54
            "create PSP", "rename", "g/set file dates", "g/set alloc type", "ext error", // 55-59
            "create tmpfile", "creat new file", "flock", "(server fn)", "(net fn)", // 5A-5E
            "(net redir)", "truename", "n/a", "get PSP", "intl char info", // 5F-63
            "(internal)", "get ext country info", // 64-65
        ];
        let ax = cpu.ax();
        let fn_name = FUNC_NAMES.get((ax >> 8) as usize).unwrap_or(&"(unknown)");
        log::debug!(target: "dos",
            "D-21{:04X}: {:<15} BX={:04X} CX:{:04X} DX:{:04X} DI={:04X} DS:{:04X} ES:{:04X}",
            ax, fn_name, cpu.bx(), cpu.cx(), cpu.dx(), cpu.di(),
            cpu.seg_selector(SegReg::DS), cpu.seg_selector(SegReg::ES));
    }

    pub(crate) fn int21(&mut self, cpu: &mut Cpu) {
        // A far call through the trampoline at 0000:00C0 is the CP/M
        // entry convention: the function is in CL, and the stack holds a
        // far-call frame under our interrupt frame.
        if cpu.linear(cpu.stack_peek(2), cpu.stack_peek(0)) == 0xC2 {
            log::debug!(target: "dos", "CP/M CALL: ");
            let old_ax = cpu.ax();
            let ip = cpu.stack_peek(10);
            let cs = cpu.stack_peek(8);
            let flags = cpu.stack_peek(4);
            cpu.set_ax((cpu.cx() << 8) | (old_ax & 0xFF));
            let sp = cpu.sp().wrapping_add(6);
            cpu.set_sp(sp);
            let stack = cpu.linear(cpu.seg_selector(SegReg::SS), sp);
            cpu.mem.put16(stack, ip);
            cpu.mem.put16(stack + 2, cs);
            cpu.mem.put16(stack + 4, flags);
            self.int21(cpu);
            let ax = cpu.ax();
            cpu.set_ax((old_ax & 0xFF00) | (ax & 0xFF));
            return;
        }
        log::debug!(target: "int", "D-21{:04X}: BX={:04X}", cpu.ax(), cpu.bx());
        if crate::dbg::debug_active("dos") {
            self.int21_debug(cpu);
        }

        let ax = cpu.ax();
        let ah = (ax >> 8) as u8;

        // Save SS:SP in the PSP, used when a child returns.
        if ah != 0x50 && ah != 0x51 && ah != 0x62 && ah != 0x64 && ah < 0x6C {
            let psp = self.dos.current_psp;
            let sp = cpu.sp();
            let ss = cpu.seg_selector(SegReg::SS);
            let base = cpu.linear(psp, 0x2E);
            cpu.mem.put16(base, sp);
            cpu.mem.put16(base + 2, ss);
        }

        match ah {
            0x00 => self.request_exit(0),
            0x01 => {
                self.char_input(cpu, true);
                let al = cpu.al();
                self.dos_putchar(cpu, al);
            }
            0x02 => {
                let dl = cpu.dx() as u8;
                self.dos_putchar(cpu, dl);
                cpu.set_ax(0x0200 | dl as u16);
            }
            0x06 => {
                let dl = cpu.dx() as u8;
                if dl == 0xFF {
                    self.char_input(cpu, true);
                } else {
                    self.dos_putchar(cpu, dl);
                    cpu.set_al(dl);
                }
            }
            0x07 => self.char_input(cpu, false),
            0x08 => self.char_input(cpu, true),
            0x09 => {
                let mut i = cpu.addr_ds(cpu.dx());
                while cpu.mem.get8(i) != 0x24 && i < 0x100000 {
                    let c = cpu.mem.get8(i);
                    self.dos_putchar(cpu, c);
                    i += 1;
                }
                cpu.set_al(0x24);
            }
            0x0A => {
                let addr = cpu.addr_ds(cpu.dx());
                let max = cpu.mem.get8(addr) as usize;
                let line = self.line_input(cpu, max);
                // Stored without the LF; the length excludes the CR.
                let mut n: u32 = 0;
                let mut saw_cr = false;
                for &c in line.iter() {
                    if c == b'\n' {
                        break;
                    }
                    cpu.mem.put8(addr + 2 + n, c);
                    n += 1;
                    if c == b'\r' {
                        saw_cr = true;
                        break;
                    }
                }
                let count = if saw_cr { n - 1 } else { n };
                cpu.mem.put8(addr + 1, count as u8);
            }
            0x0B => {
                if self.dos.devinfo(0) == DEVINFO_TTY {
                    let hit = self.keyb.kbhit(cpu).is_some();
                    cpu.set_ax(if hit { 0x0BFF } else { 0x0B00 });
                } else {
                    cpu.set_ax(0x0B00);
                }
            }
            0x0C => {
                self.keyb.wakeup();
                self.dos.pending_char = 0;
                while self.keyb.take_key(&mut cpu.mem).is_some() {}
                match ax & 0xFF {
                    0x01 | 0x06 | 0x07 | 0x08 | 0x0A => {
                        cpu.set_ax(ax << 8);
                        self.int21(cpu);
                    }
                    _ => {}
                }
            }
            0x0E => {
                let dl = cpu.dx() as u8;
                self.dos.fs.set_default_drive(dl as usize);
                // Drives A:, B: and C: exist.
                cpu.set_ax(0x0E03);
            }
            0x0F => self.open_file_fcb(cpu, false),
            0x10 => {
                self.show_fcb(cpu);
                let h = self.fcb_handle(cpu);
                let closed = self.dos.close_handle(h);
                cpu.set_ax(if closed { 0x1000 } else { 0x10FF });
            }
            0x11 => self.find_first_fcb(cpu),
            0x12 => self.find_next_fcb(cpu),
            0x13 => {
                self.show_fcb(cpu);
                // Single names only, no wildcards.
                match self.fcb_host_path(cpu, false) {
                    None => {
                        log::debug!(target: "dos", "\t(file not found)");
                        cpu.set_al(0xFF);
                    }
                    Some(fname) => {
                        log::debug!(target: "dos", "\tdelete fcb '{}'", fname.display());
                        match std::fs::remove_file(&fname) {
                            Ok(()) => {
                                let fcb = self.fcb_addr(cpu);
                                cpu.mem.put8(fcb + 1, 0xE5); // deleted marker
                                cpu.set_al(0x00);
                            }
                            Err(_) => cpu.set_al(0xFF),
                        }
                    }
                }
            }
            0x14 => {
                self.show_fcb(cpu);
                let rec = self.fcb_record(cpu, false);
                let dta = self.dos.dta;
                let e = self.fcb_read_record(cpu, dta, rec, Some(false));
                cpu.set_al(e);
            }
            0x15 => {
                self.show_fcb(cpu);
                let rec = self.fcb_record(cpu, false);
                let dta = self.dos.dta;
                let e = self.fcb_write_record(cpu, dta, rec, Some(false));
                cpu.set_al(e);
            }
            0x16 => self.open_file_fcb(cpu, true),
            0x19 => {
                log::debug!(target: "dos", "\tget default drive = '{}'",
                    (b'A' + self.dos.fs.default_drive() as u8) as char);
                cpu.set_al(self.dos.fs.default_drive() as u8);
            }
            0x1A => {
                let ds = cpu.seg_selector(SegReg::DS);
                self.dos.dta = cpu.linear(ds, cpu.dx());
            }
            0x1B => self.drive_info(cpu, 0),
            0x1C => {
                let dl = cpu.dx() as u8;
                self.drive_info(cpu, dl);
            }
            0x21 => {
                self.show_fcb(cpu);
                let rec = self.fcb_record(cpu, true);
                let dta = self.dos.dta;
                let e = self.fcb_read_record(cpu, dta, rec, None);
                cpu.set_al(e);
            }
            0x22 => {
                self.show_fcb(cpu);
                let rec = self.fcb_record(cpu, true);
                let dta = self.dos.dta;
                let e = self.fcb_write_record(cpu, dta, rec, None);
                cpu.set_al(e);
            }
            0x25 => {
                let n = (ax & 0xFF) as u32;
                let dx = cpu.dx();
                let ds = cpu.seg_selector(SegReg::DS);
                cpu.mem.put16(4 * n, dx);
                cpu.mem.put16(4 * n + 2, ds);
            }
            0x26 => {
                let src = cpu.linear(self.dos.current_psp, 0);
                let dst = cpu.linear(cpu.dx(), 0);
                // 0x80 bytes is what DOS copies; the command tail stays.
                let block = cpu.mem.bytes_at(src, 0x80);
                cpu.mem.write_block(dst, &block);
            }
            0x27 | 0x28 => {
                self.show_fcb(cpu);
                let fcb = self.fcb_addr(cpu);
                let rsize = cpu.mem.get16(fcb + 0x0E) as u32;
                let mut count = cpu.cx();
                let mut target = self.dos.dta;
                let mut e = 0;
                while e == 0 && count > 0 {
                    let rec = self.fcb_record(cpu, true);
                    e = if ah == 0x27 {
                        self.fcb_read_record(cpu, target, rec, Some(true))
                    } else {
                        self.fcb_write_record(cpu, target, rec, Some(true))
                    };
                    if e == 0 || e == 3 {
                        target += rsize;
                        count -= 1;
                    }
                }
                let done = cpu.cx() - count;
                cpu.set_cx(done);
                cpu.set_al(e);
                self.show_fcb(cpu);
            }
            0x29 => self.parse_filename_fcb(cpu),
            0x2A => {
                let now = Local::now();
                cpu.set_al(now.weekday().num_days_from_sunday() as u8);
                cpu.set_cx(now.year() as u16);
                cpu.set_dx(((now.month() as u16) << 8) | now.day() as u16);
            }
            0x2B => cpu.set_al(0xFF), // setting the date is refused
            0x2C => {
                // Derive the time of day from the BIOS tick counter.
                let bios_timer = self.timer.ticks() as u64 * 1080;
                let bsec = (bios_timer / 19663) as u32;
                let bsub = (bios_timer % 19663) as u32;
                let hour = (bsec / 3600) as u16;
                let min = ((bsec / 60) % 60) as u16;
                let sec = (bsec % 60) as u16;
                let hsec = (bsub * 100 / 19663) as u16;
                cpu.set_cx((hour << 8) | min);
                cpu.set_dx((sec << 8) | hsec);
            }
            0x2D => cpu.set_al(0xFF), // setting the time is refused
            0x2F => {
                let dta = self.dos.dta;
                cpu.set_data_segment(SegReg::ES, ((dta & 0xFFF00) >> 4) as u16);
                cpu.set_bx((dta & 0xFF) as u16);
            }
            0x30 => {
                // DOS 3.30.
                cpu.set_ax(0x1E03);
                cpu.set_bx(0x0000);
            }
            0x33 => {
                if ax == 0x3300 || ax == 0x3301 {
                    let dx = cpu.dx();
                    cpu.set_dx((dx & 0xFF00) | 1);
                }
            }
            0x35 => {
                let n = (ax & 0xFF) as u32;
                let off = cpu.mem.get16(4 * n);
                let seg = cpu.mem.get16(4 * n + 2);
                cpu.set_bx(off);
                cpu.set_data_segment(SegReg::ES, seg);
            }
            0x36 => {
                cpu.set_ax(32); // 16k clusters
                cpu.set_bx(0xFFFF); // all free, 1GB
                cpu.set_cx(512); // bytes/sector
                cpu.set_dx(0xFFFF); // total 1GB
            }
            0x37 => cpu.set_dx(b'/' as u16),
            0x38 => {
                let addr = cpu.addr_ds(cpu.dx());
                if let Some(nls) = &self.dos.nls {
                    let info = nls.country_info;
                    cpu.mem.write_block(addr, &info);
                }
            }
            0x39 => self.mkdir_rmdir(cpu, false),
            0x3A => self.mkdir_rmdir(cpu, true),
            0x3B => {
                let path = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
                if self.dos.fs.change_cwd(&path) {
                    cpu.clr_return_flags(FLAG_CF);
                } else {
                    self.err(cpu, 2);
                }
            }
            0x3C => self.open_file(cpu, 1),
            0x3D => self.open_file(cpu, 0),
            0x3E => {
                let h = cpu.bx();
                self.close_file(cpu, h);
            }
            0x3F => self.handle_read(cpu),
            0x40 => self.handle_write(cpu),
            0x41 => {
                let name = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
                match self.dos.fs.unix_path(&name, false, None) {
                    None => {
                        log::debug!(target: "dos", "\t(file not found)");
                        self.err(cpu, 2);
                    }
                    Some(fname) => {
                        log::debug!(target: "dos", "\tunlink '{}'", fname.display());
                        match std::fs::remove_file(&fname) {
                            Ok(()) => cpu.clr_return_flags(FLAG_CF),
                            Err(e) => {
                                let code = dos_unlink_error(&e);
                                self.err(cpu, code);
                            }
                        }
                    }
                }
            }
            0x42 => self.handle_seek(cpu),
            0x43 => {
                if ax & 0xFF == 0 {
                    let name = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
                    match self.dos.fs.unix_path(&name, false, None) {
                        None => {
                            log::debug!(target: "dos", "\t(file not found)");
                            self.err(cpu, 2);
                        }
                        Some(fname) => match std::fs::metadata(&fname) {
                            Ok(md) => {
                                cpu.clr_return_flags(FLAG_CF);
                                cpu.set_cx(dos_attributes(&md) as u16);
                                log::debug!(target: "dos", "\tattr '{}' = {:04X}",
                                    fname.display(), cpu.cx());
                            }
                            Err(e) => {
                                let code = dos_path_error(&e);
                                self.err(cpu, code);
                            }
                        },
                    }
                } else {
                    self.err(cpu, 1);
                }
            }
            0x44 => self.ioctl(cpu),
            0x45 => {
                let src = cpu.bx();
                if self.dos.handle(src).is_none() {
                    log::debug!(target: "dos", "\t(invalid file handle)");
                    self.err(cpu, 6);
                } else {
                    match self.dos.new_handle() {
                        None => self.err(cpu, 4),
                        Some(h) => {
                            log::debug!(target: "dos", "\t{:04x} -> {:04x}", src, h);
                            self.dos.handles[h as usize] =
                                self.dos.handles[src as usize].clone();
                            cpu.set_ax(h);
                            cpu.clr_return_flags(FLAG_CF);
                        }
                    }
                }
            }
            0x46 => {
                let src = cpu.bx();
                let dst = cpu.cx();
                if self.dos.handle(src).is_none() {
                    log::debug!(target: "dos", "\t(invalid file handle)");
                    self.err(cpu, 6);
                } else {
                    if self.dos.handle(dst).is_some() {
                        self.dos.close_handle(dst);
                    }
                    if dst as usize >= self.dos.handles.len() {
                        self.dos.handles.resize(dst as usize + 1, None);
                    }
                    self.dos.handles[dst as usize] = self.dos.handles[src as usize].clone();
                    cpu.clr_return_flags(FLAG_CF);
                }
            }
            0x47 => {
                let dl = cpu.dx() as u8;
                let path = *self.dos.fs.cwd_for(dl);
                log::debug!(target: "dos", "\tcwd '{}' = '{}'", (b'@' + dl) as char,
                    String::from_utf8_lossy(&path));
                let addr = cpu.addr_ds(cpu.si());
                cpu.mem.write_block(addr, &path);
                cpu.set_ax(0x0100);
                cpu.clr_return_flags(FLAG_CF);
            }
            0x48 => {
                let size = cpu.bx();
                let owner = self.dos.current_psp;
                match self.dos.mcb.alloc_segment(&mut cpu.mem, size, owner) {
                    Ok(seg) => {
                        log::debug!(target: "dos", "\tallocated at {:04x}.", seg);
                        cpu.set_ax(seg);
                        cpu.clr_return_flags(FLAG_CF);
                    }
                    Err(max) => {
                        log::debug!(target: "dos", "\tnot enough memory, max=${:04x} paragraphs", max);
                        cpu.set_bx(max);
                        self.err(cpu, 8);
                    }
                }
            }
            0x49 => {
                let seg = cpu.seg_selector(SegReg::ES);
                self.dos.mcb.free_segment(&mut cpu.mem, seg);
                cpu.clr_return_flags(FLAG_CF);
            }
            0x4A => {
                let seg = cpu.seg_selector(SegReg::ES);
                let want = cpu.bx();
                let got = self.dos.mcb.resize_segment(&mut cpu.mem, seg, want);
                if got == want {
                    cpu.clr_return_flags(FLAG_CF);
                } else {
                    log::debug!(target: "dos", "\tmax memory available: ${:04x}", got);
                    cpu.set_bx(got);
                    self.err(cpu, 8);
                }
            }
            0x4B => self.exec(cpu),
            0x4C => {
                let code = cpu.al();
                self.exit_program(cpu, code);
            }
            0x4D => {
                cpu.set_ax(self.dos.return_code);
                self.dos.return_code = 0;
                cpu.clr_return_flags(FLAG_CF);
            }
            0x4E => self.find_first(cpu),
            0x4F => self.find_next(cpu, false),
            0x50 => self.dos.current_psp = cpu.bx(),
            0x51 => {
                let psp = self.dos.current_psp;
                cpu.set_bx(psp);
            }
            0x52 => {
                if let Some(nls) = &self.dos.nls {
                    let sysvars = nls.sysvars;
                    cpu.set_data_segment(SegReg::ES, (sysvars >> 4) as u16);
                    cpu.set_bx((sysvars & 0xF) as u16 + 24);
                }
            }
            0x55 => {
                let src = cpu.linear(self.dos.current_psp, 0);
                let dst = cpu.linear(cpu.dx(), 0);
                let block = cpu.mem.bytes_at(src, 0x80);
                cpu.mem.write_block(dst, &block);
                let parent = self.dos.current_psp;
                cpu.mem.put16(dst + 22, parent);
                self.dos.current_psp = cpu.dx();
            }
            0x56 => {
                let name1 = cpu.mem.string_at(cpu.addr_ds(cpu.dx()), 63);
                let name2 = cpu.mem.string_at(cpu.addr_es(cpu.di()), 63);
                let from = match self.dos.fs.unix_path(&name1, false, None) {
                    Some(f) => f,
                    None => {
                        log::debug!(target: "dos", "\t(file not found)");
                        self.err(cpu, 2);
                        return;
                    }
                };
                let to = match self.dos.fs.unix_path(&name2, true, None) {
                    Some(t) => t,
                    None => {
                        self.err(cpu, 5);
                        return;
                    }
                };
                log::debug!(target: "dos", "\t'{}' -> '{}'", from.display(), to.display());
                match std::fs::rename(&from, &to) {
                    Ok(()) => cpu.clr_return_flags(FLAG_CF),
                    Err(e) => {
                        let code = dos_unlink_error(&e);
                        self.err(cpu, code);
                    }
                }
            }
            0x57 => {
                let al = (ax & 0xFF) as u8;
                let h = cpu.bx();
                match self.dos.handle(h).map(|e| e.backing.clone()) {
                    None => self.err(cpu, 6),
                    Some(backing) => match al {
                        0 => {
                            let md = match backing {
                                Backing::Host(f) => f.borrow().metadata().ok(),
                                _ => None,
                            };
                            match md.and_then(|m| m.modified().ok()) {
                                Some(t) => {
                                    let td = dos_time_date(t);
                                    cpu.set_cx(td as u16);
                                    cpu.set_dx((td >> 16) as u16);
                                    cpu.clr_return_flags(FLAG_CF);
                                }
                                None => self.err(cpu, 1),
                            }
                        }
                        1 => cpu.clr_return_flags(FLAG_CF), // silently ignored
                        _ => self.err(cpu, 1),
                    },
                }
            }
            0x58 => match ax & 0xFF {
                0 => cpu.set_ax(self.dos.mcb.strategy() as u16),
                1 => self.dos.mcb.set_strategy(cpu.bx() as u8),
                _ => self.err(cpu, 1),
            },
            0x5B => self.open_file(cpu, 2),
            0x62 => {
                let psp = self.dos.current_psp;
                cpu.set_bx(psp);
            }
            0x65 => self.nls_info(cpu),
            0x66 => {
                // Global code page.
                cpu.set_bx(437);
                cpu.set_dx(437);
                cpu.clr_return_flags(FLAG_CF);
            }
            0x67 => cpu.clr_return_flags(FLAG_CF), // handle count: accepted
            _ => {
                log::debug!(target: "dos", "UNHANDLED INT 21, AX={:04x}", ax);
                log::debug!(target: "int", "UNHANDLED INT 21, AX={:04x}", ax);
                cpu.set_return_flags(FLAG_CF);
                cpu.set_ax(ax & 0xFF00);
            }
        }
    }

    fn handle_read(&mut self, cpu: &mut Cpu) {
        let h = cpu.bx();
        let Some(entry) = self.dos.handle(h).cloned() else {
            self.err(cpu, 6);
            return;
        };
        let addr = cpu.addr_ds(cpu.dx());
        let len = cpu.cx() as u32;
        if cpu.mem.block_mut(addr, len).is_none() {
            log::debug!(target: "dos", "\tbuffer pointer invalid");
            self.err(cpu, 5);
            return;
        }
        if entry.devinfo == DEVINFO_TTY {
            // Reading the console gets line-input semantics.
            let line = self.line_input(cpu, len as usize);
            cpu.mem.write_block(addr, &line);
            cpu.set_ax(line.len() as u16);
        } else {
            let mut buf = vec![0u8; len as usize];
            let n = match entry.backing {
                Backing::Host(f) => read_full(&mut *f.borrow_mut(), &mut buf),
                Backing::Stdin => read_full(&mut std::io::stdin().lock(), &mut buf),
                _ => 0,
            };
            cpu.mem.write_block(addr, &buf[..n]);
            cpu.set_ax(n as u16);
        }
        cpu.clr_return_flags(FLAG_CF);
    }

    fn handle_write(&mut self, cpu: &mut Cpu) {
        let h = cpu.bx();
        let Some(entry) = self.dos.handle(h).cloned() else {
            self.err(cpu, 6);
            return;
        };
        let addr = cpu.addr_ds(cpu.dx());
        let len = cpu.cx() as u32;
        let buf = match cpu.mem.block(addr, len) {
            Some(b) => b.to_vec(),
            None => {
                log::debug!(target: "dos", "\tbuffer pointer invalid");
                self.err(cpu, 5);
                return;
            }
        };
        if entry.devinfo == DEVINFO_TTY && self.video.active() {
            for &c in &buf {
                self.video.putch(&mut cpu.mem, c);
            }
            cpu.set_ax(len as u16);
        } else {
            let n = match entry.backing {
                Backing::Host(f) => f.borrow_mut().write(&buf).unwrap_or(0),
                Backing::Stdout => {
                    let mut out = std::io::stdout();
                    let n = out.write(&buf).unwrap_or(0);
                    let _ = out.flush();
                    n
                }
                Backing::Stderr => std::io::stderr().write(&buf).unwrap_or(0),
                Backing::Stdin => 0,
            };
            cpu.set_ax(n as u16);
        }
        cpu.clr_return_flags(FLAG_CF);
    }

    fn handle_seek(&mut self, cpu: &mut Cpu) {
        let h = cpu.bx();
        let al = cpu.al();
        let pos = (((cpu.cx() as u32) << 16) | cpu.dx() as u32) as i32 as i64;
        log::debug!(target: "dos", "\tlseek-{:02x} pos = {}", al, pos);
        let Some(entry) = self.dos.handle(h).cloned() else {
            self.err(cpu, 6);
            return;
        };
        let whence = match al {
            0 => SeekFrom::Start(pos.max(0) as u64),
            1 => SeekFrom::Current(pos),
            2 => SeekFrom::End(pos),
            _ => {
                self.err(cpu, 1);
                return;
            }
        };
        let newpos = match entry.backing {
            Backing::Host(f) => f.borrow_mut().seek(whence).unwrap_or(0),
            _ => 0,
        };
        cpu.set_ax(newpos as u16);
        cpu.set_dx((newpos >> 16) as u16);
        cpu.clr_return_flags(FLAG_CF);
    }

    fn ioctl(&mut self, cpu: &mut Cpu) {
        let h = cpu.bx();
        let al = cpu.al();
        let needs_handle = al < 4 || al == 6 || al == 7 || al == 10 || al == 12 || al == 16;
        if needs_handle && self.dos.handle(h).is_none() {
            log::debug!(target: "dos", "\t(invalid file handle)");
            self.err(cpu, 6);
            return;
        }
        cpu.clr_return_flags(FLAG_CF);
        match al {
            0x00 => {
                let di = self.dos.devinfo(h);
                log::debug!(target: "dos", "\t= {:04x}", di);
                cpu.set_dx(di);
            }
            0x01..=0x05 => self.err(cpu, 5),
            0x06 => {
                if self.dos.devinfo(h) == DEVINFO_TTY {
                    let hit = self.keyb.kbhit(cpu).is_some();
                    cpu.set_ax(if hit { 0x44FF } else { 0x4400 });
                } else {
                    // At EOF when the file position reached the end.
                    let at_eof = match self.dos.handle(h).map(|e| e.backing.clone()) {
                        Some(Backing::Host(f)) => {
                            let mut f = f.borrow_mut();
                            let pos = f.stream_position().unwrap_or(0);
                            let len = f.metadata().map(|m| m.len()).unwrap_or(0);
                            pos >= len
                        }
                        _ => false,
                    };
                    cpu.set_ax(if at_eof { 0x4400 } else { 0x44FF });
                }
            }
            0x07 => cpu.set_ax(0x44FF),
            0x08 => {
                let d = cpu.bx() as u8;
                let d = if d == 0 { self.dos.fs.default_drive() as u8 } else { d - 1 };
                cpu.set_ax(if d < 2 { 0x0000 } else { 0x0001 });
            }
            0x09 => cpu.set_dx(0x0100),
            0x0A => cpu.set_dx(0),
            0x0E => cpu.set_ax(0x4400),
            _ => self.err(cpu, 1),
        }
    }

    /// INT 21h 29h: parse a textual file name into an FCB at ES:DI.
    fn parse_filename_fcb(&mut self, cpu: &mut Cpu) {
        let src = cpu.addr_ds(cpu.si());
        let text = cpu.mem.bytes_at(src, 64);
        let dst = cpu.addr_es(cpu.di());
        if cpu.mem.block_mut(dst, 37).is_none() {
            log::debug!(target: "dos", "\tinvalid destination");
            cpu.set_al(0xFF);
            return;
        }
        let al = cpu.al();
        let mut p = 0usize;
        if al & 1 != 0 {
            if p < text.len() && b":;.,=+".contains(&text[p]) {
                p += 1;
            }
        }
        while p < text.len() && (text[p] == b' ' || text[p] == b'\t') {
            p += 1;
        }
        let mut ret: u8 = 0;
        cpu.mem.put8(dst, 0);
        if p + 1 < text.len() && text[p] != 0 && text[p + 1] == b':' {
            let d = text[p];
            match d {
                b'A'..=b'Z' => cpu.mem.put8(dst, d - b'A' + 1),
                b'a'..=b'z' => cpu.mem.put8(dst, d - b'a' + 1),
                _ => ret = 0xFF,
            }
            p += 2;
        }
        let mut i = 1usize;
        while i < 12 {
            let c = *text.get(p).unwrap_or(&0);
            if c == b'.' && i <= 9 {
                while i < 9 {
                    cpu.mem.put8(dst + i as u32, b' ');
                    i += 1;
                }
                p += 1;
            } else if c == 0 || b":.;,=+ \t/\"[]<>|\x0D\x10".contains(&c) {
                while i < 12 {
                    cpu.mem.put8(dst + i as u32, b' ');
                    i += 1;
                }
                break;
            } else if c == b'*' && i < 9 {
                while i < 9 {
                    cpu.mem.put8(dst + i as u32, b'?');
                    i += 1;
                }
                p += 1;
                ret = 1;
            } else if c == b'*' {
                while i < 12 {
                    cpu.mem.put8(dst + i as u32, b'?');
                    i += 1;
                }
                p += 1;
                ret = 1;
                break;
            } else {
                let c = if c.is_ascii_lowercase() { c - b'a' + b'A' } else { c };
                cpu.mem.put8(dst + i as u32, c);
                i += 1;
                p += 1;
            }
        }
        // Advance DS:SI past the parsed text.
        let mut si = cpu.si() as u32 + p as u32;
        let mut ds = cpu.seg_selector(SegReg::DS);
        while si > 0xFFFF {
            si -= 0x10;
            ds += 1;
        }
        cpu.set_data_segment(SegReg::DS, ds);
        cpu.set_si(si as u16);
        cpu.set_al(ret);
    }

    /// INT 21h 65h: extended country information tables.
    fn nls_info(&mut self, cpu: &mut Cpu) {
        let Some(nls) = &self.dos.nls else { return };
        let addr = cpu.addr_es(cpu.di());
        cpu.clr_return_flags(FLAG_CF);
        let sub = cpu.al();
        let table = |cpu: &mut Cpu, id: u8, linear: u32| {
            cpu.mem.put8(addr, id);
            cpu.mem.put16(addr + 1, (linear & 0xF) as u16);
            cpu.mem.put16(addr + 3, (linear >> 4) as u16);
            cpu.set_cx(5);
        };
        match sub {
            1 => {
                let info = nls.country_info;
                cpu.mem.write_block(addr, &[1, 38, 0, 1, 0, 181, 1]);
                cpu.mem.write_block(addr + 7, &info);
                cpu.set_cx(41);
            }
            2 => {
                let t = nls.uppercase_table;
                table(cpu, 2, t);
            }
            4 => {
                let t = nls.uppercase_table;
                table(cpu, 4, t);
            }
            5 => {
                let t = nls.terminator_table;
                table(cpu, 5, t);
            }
            6 => {
                let t = nls.collating_table;
                table(cpu, 6, t);
            }
            7 => {
                let t = nls.dbc_set_table;
                table(cpu, 7, t);
            }
            _ => {
                self.err(cpu, 1);
            }
        }
    }

    /// INT 20h: terminate.
    pub(crate) fn int20(&mut self, _cpu: &mut Cpu) {
        self.request_exit(0);
    }

    /// INT 22h: the termination address itself; reaching it means the
    /// root program returned, so leave with the recorded code.
    pub(crate) fn int22(&mut self, _cpu: &mut Cpu) {
        log::debug!(target: "dos", "D-22: TERMINATE HANDLER CALLED");
        let code = self.dos.return_code;
        self.request_exit(code & 0xFF);
    }

    /// INT 28h: DOS idle.
    pub(crate) fn int28(&mut self, _cpu: &mut Cpu) {
        std::thread::sleep(std::time::Duration::from_micros(100));
    }

    /// INT 2Fh: multiplex; nothing is installed.
    pub(crate) fn int2f(&mut self, cpu: &mut Cpu) {
        log::debug!(target: "dos", "D-2F{:04X}: multiplex query", cpu.ax());
    }

    /// Keyboard status for INT 16h function 01/11: sets/clears ZF in the
    /// interrupt return frame.
    pub(crate) fn int16(&mut self, cpu: &mut Cpu) {
        let ax = cpu.ax();
        match (ax >> 8) as u8 {
            0x00 | 0x10 => {
                let key = self.getch(cpu, false);
                cpu.set_ax(key);
            }
            0x01 | 0x11 => match self.keyb.kbhit(cpu) {
                Some(key) => {
                    cpu.set_ax(key);
                    cpu.clr_return_flags(FLAG_ZF);
                }
                None => {
                    cpu.set_return_flags(FLAG_ZF);
                }
            },
            0x02 | 0x12 => {
                let flags = self.keyb.shift_flags();
                cpu.set_al(flags);
            }
            0x05 => {
                // Store keystroke.
                let key = cpu.cx();
                let stored = self.keyb.push_key(cpu, key);
                cpu.set_al(if stored { 0 } else { 1 });
            }
            n => {
                log::debug!(target: "int", "UNHANDLED INT 16, AH={:02x}", n);
            }
        }
    }
}
