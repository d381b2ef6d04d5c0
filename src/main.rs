// Command line entry point. Options come before the program name; the
// words after the program (up to "--") become the guest command line,
// and everything after "--" is the guest environment.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use em86::dbg;
use em86::Emulator;

#[derive(Parser)]
#[command(
    name = "emu2",
    disable_version_flag = true,
    about = "Simple x86 + DOS emulator",
    override_usage = "emu2 [options] <prog.exe> [args...] [-- environment vars]",
    after_help = "\
Environment variables:
  EMU2_DEBUG_NAME     Base name of a file to write the debug log, defaults to
                      the exe name if not given.
  EMU2_DEBUG          List of debug options to activate, from the following:
                      'cpu', 'int', 'port', 'dos', 'video'.
  EMU2_PROGNAME       DOS program name, if not given use the unix name.
  EMU2_DEFAULT_DRIVE  DOS default (current) drive letter, if not given use 'C:'
  EMU2_CWD            DOS current working directory, use 'C:\\' if not given.
  EMU2_DRIVE_n        Set unix path as root of drive 'n', by default all drives
                      point to the unix working directory.
  EMU2_CODEPAGE       Set DOS code-page.
  EMU2_LOWMEM         Limit DOS memory to 512KB, fixes some old buggy programs.
  EMU2_APPEND         Specifies DOS append paths, separated by ';'."
)]
struct Options {
    /// Load header-less binary at address.
    #[arg(short = 'b', value_name = "addr")]
    bin_addr: Option<String>,
    /// Run address to start execution (only for binary loaded data).
    #[arg(short = 'r', value_name = "seg:ip")]
    run_addr: Option<String>,
    /// Reference memory image compared against RAM at exit.
    #[arg(short = 'X', value_name = "file")]
    check_mem: Option<PathBuf>,
}

fn die(msg: &str) -> ! {
    eprintln!("emu2: {}", msg);
    std::process::exit(1);
}

/// strtol-style number: 0x hex, leading 0 octal, else decimal.
fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();

    // Options are only processed before the program name.
    let mut opt_end = 1;
    while opt_end < argv.len() {
        let a = &argv[opt_end];
        if !a.starts_with('-') || a == "--" {
            break;
        }
        let takes_value = matches!(a.as_bytes().get(1), Some(b'b') | Some(b'r') | Some(b'X'));
        if takes_value && a.len() == 2 {
            opt_end += 2;
        } else {
            opt_end += 1;
        }
    }
    let options = Options::parse_from(&argv[..opt_end.min(argv.len())]);

    let Some(prog) = argv.get(opt_end) else {
        die("program name expected.");
    };
    let rest = &argv[opt_end + 1..];
    let split = rest.iter().position(|a| a == "--").unwrap_or(rest.len());
    let args = &rest[..split];
    let env = rest.get(split + 1..).unwrap_or(&[]);

    if let Err(e) = dbg::init_debug(prog) {
        die(&e);
    }

    // Reference image for the exit-time memory check.
    let check_mem = options.check_mem.as_ref().map(|path| {
        match std::fs::read(path) {
            Ok(data) => {
                eprintln!("emu2: will check {:X} bytes.", data.len());
                data
            }
            Err(e) => die(&format!("can't open '{}': {}", path.display(), e)),
        }
    });

    let mut emu = Emulator::new();

    if let Some(addr) = &options.bin_addr {
        let addr = match parse_number(addr) {
            Some(a) if a <= 0xFFFF0 => a,
            _ => die(&format!("binary load address '{}' invalid.", addr)),
        };
        let (mut seg, mut ip) = (((addr & 0xFFF00) >> 4) as u16, (addr & 0xFF) as u16);
        if let Some(run) = &options.run_addr {
            match run.split_once(':') {
                Some((s, o)) => {
                    seg = match parse_number(s) {
                        Some(v) if v <= 0xFFFF => v as u16,
                        _ => die(&format!("binary run segment '{}' invalid.", run)),
                    };
                    ip = match parse_number(o) {
                        Some(v) if v <= 0xFFFF => v as u16,
                        _ => die(&format!("binary run address '{}' invalid.", run)),
                    };
                }
                None => match parse_number(run) {
                    Some(v) => {
                        seg = (v >> 4) as u16;
                        ip = (v & 0xF) as u16;
                    }
                    None => die(&format!("binary run segment '{}' invalid.", run)),
                },
            }
        }
        let data = match std::fs::read(prog) {
            Ok(d) => d,
            Err(e) => die(&format!("can't open '{}': {}", prog, e)),
        };
        emu.load_binary(&data, addr, seg, ip);
    } else {
        if let Err(e) = emu.boot_dos(PathBuf::from(prog).as_path(), args, env) {
            die(&e);
        }
    }

    let code = emu.run();

    if let Some(reference) = check_mem {
        for (i, &b) in reference.iter().enumerate() {
            let got = emu.cpu.mem.get8(i as u32);
            if b != got {
                eprintln!(
                    "emu2: check memory: differ at byte {:X}, {:02X} != {:02X}",
                    i, b, got
                );
                break;
            }
        }
    }

    ExitCode::from((code & 0xFF) as u8)
}
