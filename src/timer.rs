// BIOS tick counter and the 8253 counter-0 ports. The tick counter is
// derived from the wall clock on every update (1573040 ticks per day,
// 19663/1080 per second), so it stays correct no matter how far the
// emulation lags behind real time.

use chrono::{Local, NaiveDate, Timelike};

use crate::memory::Memory;
use crate::processor::Cpu;

/// The ~18.2 Hz heartbeat that pops the CPU out of its inner loop, one
/// scheduler thread behind the scenes.
pub struct TickTimer {
    inner: timer::Timer,
}

pub type TickGuard = timer::Guard;

impl TickTimer {
    pub fn new() -> TickTimer {
        TickTimer { inner: timer::Timer::new() }
    }

    /// 54925 microseconds, the PC timer period.
    pub fn schedule<F>(&self, cb: F) -> TickGuard
    where
        F: 'static + FnMut() + Send,
    {
        self.inner.schedule_repeating(chrono::Duration::microseconds(54925), cb)
    }
}

/// Ticks per day: 0x1800B0.
const TICKS_PER_DAY: i64 = 0x1800B0;

pub struct BiosTimer {
    start_day: Option<NaiveDate>,
    bios_timer: u32,
    bios_dater: u16,
    // 8253 counter-0 latch emulation.
    last_timer: u16,
    port_value: u16,
    port_control: u8,
}

impl BiosTimer {
    pub fn new() -> BiosTimer {
        BiosTimer {
            start_day: None,
            bios_timer: 0,
            bios_dater: 0,
            last_timer: 0,
            port_value: 0,
            port_control: 0,
        }
    }

    /// Refresh the tick counter and day rollover in the BIOS data area.
    pub fn update(&mut self, mem: &mut Memory) {
        let now = Local::now();
        let today = now.date_naive();
        let start = *self.start_day.get_or_insert(today);
        let days = (today - start).num_days();
        let secs = now.num_seconds_from_midnight() as f64
            + now.nanosecond() as f64 * 1e-9
            + days as f64 * 86400.0;
        let cnt = (secs * 19663.0 / 1080.0).round() as i64;
        self.bios_timer = (cnt % TICKS_PER_DAY) as u32;
        self.bios_dater = (cnt / TICKS_PER_DAY) as u16;
        mem.put32(0x46C, self.bios_timer);
        mem.put8(0x470, self.bios_dater as u8);
    }

    pub fn ticks(&self) -> u32 {
        self.bios_timer
    }

    /// Free-running PIT counter at 1.193182 MHz, low 16 bits.
    fn port_timer(&self) -> u16 {
        let us = Local::now().timestamp_micros() as f64;
        let counts = us * 1.19317997037;
        (counts % 16777216.0) as u64 as u16
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        if port == 0x43 {
            return self.port_control;
        }
        let tag = self.port_control & 0x30;
        let v = match tag {
            0x20 => (self.port_value >> 8) as u8,
            0x10 => self.port_value as u8,
            0x30 => {
                self.port_control &= 0xCF;
                self.port_value as u8
            }
            _ => {
                self.port_control |= 0x30;
                (self.port_value >> 8) as u8
            }
        };
        log::debug!(target: "int", "timer port read ${:02x} = {:02x} (control={:02x})",
            port, v, self.port_control);
        v
    }

    pub fn write_port(&mut self, port: u16, val: u8) {
        if port == 0x43 {
            self.port_control = val;
            if self.port_control & 0x30 == 0 {
                self.port_control |= 0x30;
            }
            self.port_value = self.port_timer().wrapping_sub(self.last_timer);
            log::debug!(target: "int",
                "timer port write ${:02x} = {:02x} (latched val={:04x} control={:02x})",
                port, val, self.port_value, self.port_control);
        } else if port == 0x40 {
            let tag = self.port_control & 0x30;
            match tag {
                0x20 => {
                    self.last_timer = (self.port_timer().wrapping_add((val as u16) << 8) & 0xFF00)
                        + (self.last_timer & 0xFF);
                }
                0x10 => {
                    self.last_timer = (self.port_timer().wrapping_add(val as u16) & 0xFF)
                        + (self.last_timer & 0xFF00);
                }
                0x30 => {
                    self.port_control &= 0xCF;
                    self.port_value = val as u16;
                }
                _ => {
                    self.port_control |= 0x30;
                    self.port_value |= (val as u16) << 8;
                    self.last_timer = self.port_timer().wrapping_add(self.port_value);
                }
            }
            log::debug!(target: "int",
                "timer port write ${:02x} = {:02x} (last={:04x} val={:04x} control={:02x})",
                port, val, self.last_timer, self.port_value, self.port_control);
        }
    }

    /// INT 1Ah BIOS time services.
    pub fn int1a(&mut self, cpu: &mut Cpu) {
        let ax = cpu.ax();
        log::debug!(target: "int", "B-1A{:04X}: BX={:04X}", ax, cpu.bx());
        match ax >> 8 {
            0 => {
                self.update(&mut cpu.mem);
                cpu.set_dx(self.bios_timer as u16);
                cpu.set_cx((self.bios_timer >> 16) as u16);
                cpu.set_ax(self.bios_dater);
            }
            _ => {
                log::debug!(target: "int", "UNHANDLED INT 1A, AX={:04x}", ax);
            }
        }
    }
}
