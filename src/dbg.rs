// Debug log channels. Each channel named in EMU2_DEBUG gets its own log
// file, written through the standard `log` facade: the channel is the
// record target, so emulation code just says
// `debug!(target: "dos", ...)` and this backend does the routing.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

pub const CHANNELS: [&str; 5] = ["cpu", "int", "port", "dos", "video"];

struct ChannelLog {
    files: Vec<(&'static str, Mutex<File>)>,
}

impl log::Log for ChannelLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.files.iter().any(|(name, _)| *name == metadata.target())
    }

    fn log(&self, record: &log::Record) {
        if let Some((_, f)) = self.files.iter().find(|(name, _)| *name == record.target()) {
            let mut f = f.lock().unwrap();
            let _ = writeln!(f, "{}", record.args());
            // Keep the log useful even if the emulator dies hard.
            let _ = f.flush();
        }
    }

    fn flush(&self) {}
}

/// Open `<base>-<channel>.<n>.log` with the first free `n`.
fn open_log_file(base: &str, channel: &str) -> Result<File, String> {
    for i in 0..1000 {
        let name = format!("{}-{}.{}.log", base, channel, i);
        match OpenOptions::new().write(true).create_new(true).open(&name) {
            Ok(f) => {
                eprintln!("{} debug log on file '{}'.", channel, name);
                return Ok(f);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(format!("can't open debug log '{}': {}", name, e)),
        }
    }
    Err("can't open debug log: too many log files".to_string())
}

/// Parse EMU2_DEBUG / EMU2_DEBUG_NAME and install the channel logger.
/// `default_base` is the program name, used when no base name is given.
pub fn init_debug(default_base: &str) -> Result<(), String> {
    let base = std::env::var("EMU2_DEBUG_NAME").unwrap_or_else(|_| default_base.to_string());
    let spec = match std::env::var("EMU2_DEBUG") {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };
    let mut files = Vec::new();
    for channel in CHANNELS {
        if spec.contains(channel) {
            files.push((channel, Mutex::new(open_log_file(&base, channel)?)));
        }
    }
    if files.is_empty() {
        return Ok(());
    }
    log::set_boxed_logger(Box::new(ChannelLog { files })).map_err(|e| e.to_string())?;
    log::set_max_level(log::LevelFilter::Debug);
    Ok(())
}

/// Is a channel active? Used to skip expensive formatting.
pub fn debug_active(channel: &str) -> bool {
    log::log_enabled!(target: channel, log::Level::Debug)
}
