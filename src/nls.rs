// National-language-support tables and the DOS "sysvars" block, parked
// in ROM-like memory just under the BIOS. A bump allocator hands out
// chunks from 0xFE000 upward; the tables themselves are the stock US
// codepage-437 set.

use crate::memory::Memory;

const STATIC_BASE: u32 = 0xFE000;
const STATIC_END: u32 = 0xFF000;

/// Bump allocator over the static ROM window.
pub struct StaticMem {
    current: u32,
}

impl StaticMem {
    pub fn new() -> StaticMem {
        StaticMem { current: STATIC_BASE }
    }

    /// Reserve `bytes` with the given power-of-two alignment; returns the
    /// linear address. None when the window is exhausted.
    pub fn alloc(&mut self, bytes: u16, align: u16) -> Option<u32> {
        if align != 0 {
            let a = align as u32;
            self.current = (self.current + a - 1) & !(a - 1);
        }
        if self.current + bytes as u32 >= STATIC_END {
            return None;
        }
        self.current += bytes as u32;
        Some(self.current - bytes as u32)
    }
}

/// Linear addresses of the installed tables, for INT 21h 38h/65h.
pub struct NlsData {
    pub uppercase_table: u32,
    pub terminator_table: u32,
    pub collating_table: u32,
    pub dbc_set_table: u32,
    pub country_info: [u8; 34],
    pub sysvars: u32,
}

static UPPERCASE_TABLE: [u8; 128] = [
    0x80, 0x9A, 0x45, 0x41, 0x8E, 0x41, 0x8F, 0x80, 0x45, 0x45, 0x45, 0x49, 0x49, 0x49, 0x8E, 0x8F,
    0x90, 0x92, 0x92, 0x4F, 0x99, 0x4F, 0x55, 0x55, 0x59, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F,
    0x41, 0x49, 0x4F, 0x55, 0xA5, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF,
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF,
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF,
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF,
    0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF,
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

static COLLATING_TABLE: [u8; 256] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F,
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 0x2E, 0x2F,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
    0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, 0x5B, 0x5C, 0x5D, 0x5E, 0x5F,
    0x60, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
    0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, 0x7B, 0x7C, 0x7D, 0x7E, 0x7F,
    0x43, 0x55, 0x45, 0x41, 0x41, 0x41, 0x41, 0x43, 0x45, 0x45, 0x45, 0x49, 0x49, 0x49, 0x41, 0x41,
    0x45, 0x41, 0x41, 0x4F, 0x4F, 0x4F, 0x55, 0x55, 0x59, 0x4F, 0x55, 0x24, 0x24, 0x24, 0x24, 0x24,
    0x41, 0x49, 0x4F, 0x55, 0x4E, 0x4E, 0xA6, 0xA7, 0x3F, 0xA9, 0xAA, 0xAB, 0xAC, 0x21, 0x22, 0x22,
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF,
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF,
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF,
    0xE0, 0x53, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF,
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

static TERMINATOR_TABLE: [u8; 24] = [
    0x16, 0x00, // size of table = 22 bytes
    0x01, //
    0x00, // lowest char in filename
    0xFF, // highest char in filename
    0x00, //
    0x00, // first excluded char
    0x20, // last excluded char
    0x02, //
    0x0E, // number of terminator characters
    0x2E, 0x22, 0x2F, 0x5C, 0x5B, 0x5D, 0x3A, 0x7C, 0x3C, 0x3E, 0x2B, 0x3D, 0x3B, 0x2C,
];

// Callable far routine that maps a character through the uppercase
// table; the country-info structure points at it.
static FN_UPPERCASE: [u8; 16] = [
    0x3C, 0x80, //     CMP    AL,80
    0x72, 0x0B, //     JB     xit
    0x53, //            PUSH   BX
    0x30, 0xFF, //      XOR    BH,BH
    0x88, 0xC3, //      MOV    BL,AL
    0x2E, //            CS:
    0x8A, 0x87, 2, 0, // MOV   AL,[BX+0002]
    0x5B, //            POP    BX
    0xCB, // xit:       RETF
];

/// Install every table and the sysvars block; returns their addresses.
pub fn init_nls_data(mem: &mut Memory, rom: &mut StaticMem) -> Option<NlsData> {
    let mut country_info: [u8; 34] = [
        1, 0, // Date format
        b'$', 0, 0, 0, 0, // Currency symbol string
        b',', 0, // Thousands separator
        b'.', 0, // Decimal separator
        b'-', 0, // Date separator
        b':', 0, // Time separator
        0, // Currency format
        2, // Digits after decimal in currency
        0, // Time format
        0, 0, 0, 0, // Uppercase function address - patched below
        b',', 0, // Data list separator
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];

    let uppercase_table = rom.alloc(128 + 2 + 16, 0)?;
    mem.put16(uppercase_table, 128);
    mem.write_block(uppercase_table + 2, &UPPERCASE_TABLE);
    mem.write_block(uppercase_table + 128 + 2, &FN_UPPERCASE);

    let fn_ucase_seg = (uppercase_table >> 4) as u16;
    let fn_ucase_off = (uppercase_table & 0xF) as u16 + 128 + 2;
    country_info[18] = fn_ucase_off as u8;
    country_info[19] = (fn_ucase_off >> 8) as u8;
    country_info[20] = fn_ucase_seg as u8;
    country_info[21] = (fn_ucase_seg >> 8) as u8;

    let terminator_table = rom.alloc(24, 0)?;
    mem.write_block(terminator_table, &TERMINATOR_TABLE);

    let collating_table = rom.alloc(256 + 2, 0)?;
    mem.put16(collating_table, 256);
    mem.write_block(collating_table + 2, &COLLATING_TABLE);

    let dbc_set_table = rom.alloc(4, 0)?;
    mem.put16(dbc_set_table, 0); // empty set, one terminator entry

    let sysvars = rom.alloc(128, 0)?;

    Some(NlsData {
        uppercase_table,
        terminator_table,
        collating_table,
        dbc_set_table,
        country_info,
        sysvars,
    })
}
