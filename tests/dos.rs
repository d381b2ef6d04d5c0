// DOS-side behavior: the allocator chain, path translation and the 8.3
// name machinery against a real host directory.

use em86::mcb::McbChain;
use em86::memory::Memory;
use em86::paths::{glob_match, read_dir_dos, search_name, DosFs};

#[test]
fn alloc_carve_and_coalesce() {
    // One 0x8000-paragraph free block; best-fit alloc of 0x100 carves
    // the front, freeing restores the original block.
    let mut mem = Memory::new();
    let mut chain = McbChain::new();
    chain.init(&mut mem, 0x40, 0x8041);
    assert_eq!(mem.get8(0x400), b'Z');
    assert_eq!(mem.get16(0x403), 0x8000);

    chain.set_strategy(1);
    let seg = chain.alloc_segment(&mut mem, 0x100, 0x1234).unwrap();
    assert_eq!(seg, 0x41);
    // The trailing free block holds the rest.
    let next = 0x40 + 0x100 + 1;
    assert_eq!(mem.get16(next as u32 * 16 + 3), 0x7EFF);
    assert_eq!(mem.get16(0x401), 0x1234, "owner recorded");

    chain.free_segment(&mut mem, seg);
    assert_eq!(mem.get8(0x400), b'Z');
    assert_eq!(mem.get16(0x403), 0x8000);
    assert_eq!(mem.get16(0x401), 0, "block is free again");
}

#[test]
fn chain_always_ends_on_z() {
    let mut mem = Memory::new();
    let mut chain = McbChain::new();
    chain.init(&mut mem, 0x80, 0xA000);
    let mut segs = Vec::new();
    for size in [0x10u16, 0x200, 0x1, 0x800, 0x40] {
        segs.push(chain.alloc_segment(&mut mem, size, 8).unwrap());
    }
    chain.free_segment(&mut mem, segs[1]);
    chain.free_segment(&mut mem, segs[3]);
    let _ = chain.resize_segment(&mut mem, segs[4], 0x100);
    // Walk the chain: every block valid, exactly one 'Z' at the end.
    let mut mcb = 0x80u16;
    loop {
        let t = mem.get8(mcb as u32 * 16);
        assert!(t == b'M' || t == b'Z', "bad block at {:04x}", mcb);
        if t == b'Z' {
            break;
        }
        mcb = mcb + mem.get16(mcb as u32 * 16 + 3) + 1;
        assert!(mcb < 0xA000);
    }
}

#[test]
fn normalize_is_idempotent() {
    let fs = DosFs::new();
    for p in ["DIR\\FILE.TXT", "\\A\\B\\C", "A\\..\\B", ".\\X"] {
        let (_, once) = fs.normalize(p);
        let (_, twice) = fs.normalize(&format!("\\{}", once));
        assert_eq!(once, twice, "normalizing '{}'", p);
    }
}

#[test]
fn resolve_existing_file_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Mixed.Txt"), b"x").unwrap();
    std::env::set_var("EMU2_DRIVE_G", dir.path());
    let mut fs = DosFs::new();
    fs.set_default_drive(6); // G:
    let found = fs.unix_path("MIXED.TXT", false, None).unwrap();
    assert!(found.ends_with("Mixed.Txt"), "{}", found.display());
    // A missing name resolves only when forced, to its lowercase form.
    assert!(fs.unix_path("NEWFILE.TXT", false, None).is_none());
    let forced = fs.unix_path("NEWFILE.TXT", true, None).unwrap();
    assert!(forced.ends_with("newfile.txt"));
}

#[test]
fn real_path_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();
    std::fs::write(dir.path().join("subdir/report.txt"), b"x").unwrap();
    std::env::set_var("EMU2_DRIVE_H", dir.path());
    let mut fs = DosFs::new();
    fs.set_default_drive(7); // H:
    let dos = fs
        .real_path(7, &dir.path().join("subdir/report.txt").to_string_lossy())
        .unwrap();
    assert_eq!(dos, "C:\\SUBDIR\\REPORT.TXT");
    // Translating the DOS path back finds the same host file.
    let host = fs.unix_path("\\SUBDIR\\REPORT.TXT", false, None).unwrap();
    assert_eq!(
        std::fs::canonicalize(host).unwrap(),
        std::fs::canonicalize(dir.path().join("subdir/report.txt")).unwrap()
    );
}

#[test]
fn find_first_coining_order() {
    // README, README.TXT and readme~99.txt coin to three distinct names
    // with the no-extension entry first.
    let dir = tempfile::tempdir().unwrap();
    for n in ["README", "README.TXT", "readme~99.txt"] {
        std::fs::write(dir.path().join(n), b"x").unwrap();
    }
    let list = read_dir_dos(dir.path(), "README*.*");
    assert_eq!(list.len(), 3);
    assert_eq!(list[0].dos, "README");
    assert_eq!(list[1].dos, "README.TXT");
    assert!(list[2].dos.starts_with("README~"), "{}", list[2].dos);
    assert_ne!(list[2].dos, "README~99.TXT");
    for f in &list {
        assert_eq!(search_name(&list, &f.dos), 1);
    }
}

#[test]
fn coining_appends_numeric_suffix() {
    let dir = tempfile::tempdir().unwrap();
    for n in ["longfilename_a.txt", "longfilename_b.txt", "longfilename_c.txt"] {
        std::fs::write(dir.path().join(n), b"x").unwrap();
    }
    let list = read_dir_dos(dir.path(), "*.*");
    assert_eq!(list.len(), 3);
    // All coin from the same 8-char base; every survivor is unique.
    for f in &list {
        assert_eq!(search_name(&list, &f.dos), 1, "{} duplicated", f.dos);
        assert!(f.dos.len() <= 12);
    }
}

#[test]
fn append_path_search() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("tools")).unwrap();
    std::fs::write(dir.path().join("tools/util.com"), b"x").unwrap();
    std::env::set_var("EMU2_DRIVE_I", dir.path());
    let mut fs = DosFs::new();
    fs.set_default_drive(8); // I:
    assert!(fs.unix_path("UTIL.COM", false, None).is_none());
    let found = fs.unix_path("UTIL.COM", false, Some("\\TOOLS")).unwrap();
    assert!(found.ends_with("util.com"), "{}", found.display());
}

#[test]
fn glob_is_case_folded_and_dot_aware() {
    assert!(glob_match("UTIL.COM", "util.*"));
    assert!(glob_match("A", "*"));
    assert!(!glob_match("A.B", "*"));
    assert!(glob_match("A.B", "*.*"));
}
