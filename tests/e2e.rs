// End-to-end runs of the real binary against small guest programs.

use std::process::Command;

fn emu() -> Command {
    Command::new(env!("CARGO_BIN_EXE_emu2"))
}

#[test]
fn hello_world_com() {
    let dir = tempfile::tempdir().unwrap();
    let prog = dir.path().join("HELLO.COM");
    // MOV AH,9; MOV DX,109; INT 21; MOV AX,4C00; INT 21; db "Hello$"
    std::fs::write(
        &prog,
        [
            0xB4, 0x09, 0xBA, 0x09, 0x01, 0xCD, 0x21, 0xB8, 0x00, 0x4C, 0xCD, 0x21, 0x48, 0x65,
            0x6C, 0x6C, 0x6F, 0x24, 0x00, 0x00,
        ],
    )
    .unwrap();
    let out = emu().arg(&prog).env("EMU2_DRIVE_C", dir.path()).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "Hello");
    assert!(out.status.success(), "{:?}", out.status);
}

#[test]
fn exit_code_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let prog = dir.path().join("EXIT5.COM");
    // MOV AX,4C05; INT 21
    std::fs::write(&prog, [0xB8, 0x05, 0x4C, 0xCD, 0x21]).unwrap();
    let out = emu().arg(&prog).env("EMU2_DRIVE_C", dir.path()).output().unwrap();
    assert_eq!(out.status.code(), Some(5));
}

#[test]
fn command_line_reaches_the_psp() {
    let dir = tempfile::tempdir().unwrap();
    let prog = dir.path().join("ARGS.COM");
    // Write the PSP command tail (length byte plus text) to stdout:
    // MOV AH,40; MOV BX,1; MOV CX,9; MOV DX,80; INT 21; MOV AX,4C00; INT 21
    std::fs::write(
        &prog,
        [
            0xB4, 0x40, 0xBB, 0x01, 0x00, 0xB9, 0x09, 0x00, 0xBA, 0x80, 0x00, 0xCD, 0x21, 0xB8,
            0x00, 0x4C, 0xCD, 0x21,
        ],
    )
    .unwrap();
    let out = emu()
        .arg(&prog)
        .arg("foo")
        .arg("bar")
        .env("EMU2_DRIVE_C", dir.path())
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0));
    let mut expect = vec![8u8];
    expect.extend_from_slice(b" foo bar");
    assert_eq!(out.stdout, expect);
}

#[test]
fn guest_file_io_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let prog = dir.path().join("WRITE.COM");
    // Create OUT.TXT, write "OK", close, exit 0.
    // MOV AH,3C; XOR CX,CX; MOV DX,offset name; INT 21  (create)
    // MOV BX,AX; MOV AH,40; MOV CX,2; MOV DX,offset data; INT 21
    // MOV AH,3E; INT 21; MOV AX,4C00; INT 21
    // name at 0x120: "OUT.TXT",0 ; data at 0x128: "OK"
    std::fs::write(
        &prog,
        [
            0xB4, 0x3C, 0x31, 0xC9, 0xBA, 0x20, 0x01, 0xCD, 0x21, // create
            0x89, 0xC3, // mov bx, ax
            0xB4, 0x40, 0xB9, 0x02, 0x00, 0xBA, 0x28, 0x01, 0xCD, 0x21, // write
            0xB4, 0x3E, 0xCD, 0x21, // close
            0xB8, 0x00, 0x4C, 0xCD, 0x21, // exit
            0x00, 0x00, // pad to 0x120
            0x4F, 0x55, 0x54, 0x2E, 0x54, 0x58, 0x54, 0x00, // "OUT.TXT"
            0x4F, 0x4B, // "OK"
        ],
    )
    .unwrap();
    let out = emu().arg(&prog).env("EMU2_DRIVE_C", dir.path()).output().unwrap();
    assert_eq!(out.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let written = std::fs::read(dir.path().join("out.txt")).unwrap();
    assert_eq!(written, b"OK");
}

#[test]
fn memory_check_option_reports_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let prog = dir.path().join("NOP.COM");
    std::fs::write(&prog, [0xB8, 0x00, 0x4C, 0xCD, 0x21]).unwrap();
    // A reference image that can't match: the IVT starts differently.
    let reference = dir.path().join("ref.bin");
    std::fs::write(&reference, [0xFFu8; 16]).unwrap();
    let out = emu()
        .arg("-X")
        .arg(&reference)
        .arg(&prog)
        .env("EMU2_DRIVE_C", dir.path())
        .output()
        .unwrap();
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("check memory"), "{}", err);
}
