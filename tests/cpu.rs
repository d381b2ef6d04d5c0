// CPU-level behavior driven through real instruction streams, with the
// machine side stubbed out.

use em86::alu::{FLAG_CF, FLAG_IF, FLAG_ZF};
use em86::fields::SegReg;
use em86::processor::{Cpu, NullPlatform};

const CODE_SEG: u16 = 0x1000;

/// A CPU with `code` at 1000:0000 and a stack at 2000:FFFE.
fn boot(code: &[u8]) -> Cpu {
    let mut cpu = Cpu::new();
    cpu.mem.write_block(CODE_SEG as u32 * 16, code);
    cpu.set_data_segment(SegReg::CS, CODE_SEG);
    cpu.set_data_segment(SegReg::DS, CODE_SEG);
    cpu.set_data_segment(SegReg::ES, CODE_SEG);
    cpu.set_data_segment(SegReg::SS, 0x2000);
    cpu.set_sp(0xFFFE);
    cpu.set_ip(0);
    cpu
}

fn step(cpu: &mut Cpu) {
    cpu.step(&mut NullPlatform);
}

fn steps(cpu: &mut Cpu, n: usize) {
    for _ in 0..n {
        step(cpu);
    }
}

#[test]
fn pushf_popf_round_trip() {
    // STC, STD, STI, PUSHF, CLC, CLD, CLI, POPF
    let mut cpu = boot(&[0xF9, 0xFD, 0xFB, 0x9C, 0xF8, 0xFC, 0xFA, 0x9D]);
    steps(&mut cpu, 8);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.direction);
    assert!(cpu.flags.interrupt);
    // Bit 1 is always set in the packed word.
    assert_eq!(cpu.flags.compress() & 2, 2);
}

#[test]
fn push_pop_is_identity() {
    for sp in [2u16, 0x100, 0x8000, 0xFFFE] {
        // PUSH AX; POP BX
        let mut cpu = boot(&[0x50, 0x5B]);
        cpu.set_sp(sp);
        cpu.set_ax(0xA55A);
        steps(&mut cpu, 2);
        assert_eq!(cpu.bx(), 0xA55A);
        assert_eq!(cpu.sp(), sp);
    }
}

#[test]
fn push_sp_pushes_pre_decrement_value() {
    // 80286 behavior: the stored word equals SP before the push.
    let mut cpu = boot(&[0x54]);
    cpu.set_sp(0x1000);
    step(&mut cpu);
    assert_eq!(cpu.sp(), 0x0FFE);
    assert_eq!(cpu.mem_r16(SegReg::SS, 0x0FFE), 0x1000);
}

#[test]
fn modrm_memory_round_trip() {
    // Each addressing row: MOV [ea], AX then MOV CX, [ea].
    let cases: [(&[u8], &[u8]); 5] = [
        (&[0x89, 0x00], &[0x8B, 0x08]),             // [BX+SI]
        (&[0x89, 0x42, 0x05], &[0x8B, 0x4A, 0x05]), // [BP+SI+5]
        (&[0x89, 0x06, 0x34, 0x12], &[0x8B, 0x0E, 0x34, 0x12]), // [1234]
        (&[0x89, 0x87, 0x00, 0x01], &[0x8B, 0x8F, 0x00, 0x01]), // [BX+100]
        (&[0x89, 0x44, 0x7F], &[0x8B, 0x4C, 0x7F]), // [SI+7F]
    ];
    for (st, ld) in cases {
        let mut code = Vec::new();
        code.extend_from_slice(st);
        code.extend_from_slice(ld);
        let mut cpu = boot(&code);
        cpu.set_ax(0xBEEF);
        cpu.set_bx(0x0200);
        cpu.set_si(0x0040);
        cpu.set_bp(0x0300);
        steps(&mut cpu, 2);
        assert_eq!(cpu.cx(), 0xBEEF, "store {:02x?}", st);
    }
    // Register form round-trips too: MOV DX, AX; MOV CX, DX.
    let mut cpu = boot(&[0x89, 0xC2, 0x8B, 0xCA]);
    cpu.set_ax(0x1234);
    steps(&mut cpu, 2);
    assert_eq!(cpu.cx(), 0x1234);
}

#[test]
fn bp_defaults_to_stack_segment() {
    // MOV [BP+2], AX with no prefix writes through SS.
    let mut cpu = boot(&[0x89, 0x46, 0x02]);
    cpu.set_bp(0x0100);
    cpu.set_ax(0xCAFE);
    step(&mut cpu);
    assert_eq!(cpu.mem_r16(SegReg::SS, 0x0102), 0xCAFE);
    // With an ES: override it goes through ES instead.
    let mut cpu = boot(&[0x26, 0x89, 0x46, 0x02]);
    cpu.set_bp(0x0100);
    cpu.set_ax(0xD00D);
    step(&mut cpu);
    assert_eq!(cpu.mem_r16(SegReg::ES, 0x0102), 0xD00D);
    assert_eq!(cpu.mem_r16(SegReg::SS, 0x0102), 0);
}

#[test]
fn shl_by_16_clears_word() {
    // SHL AX, 16 (C1 E0 10)
    let mut cpu = boot(&[0xC1, 0xE0, 0x10]);
    cpu.set_ax(0x8001);
    step(&mut cpu);
    assert_eq!(cpu.ax(), 0);
    assert!(cpu.flags.carry, "CF is the last bit shifted out");
    assert!(cpu.flags.zero);
}

#[test]
fn interrupt_frame_matches_pre_int_state() {
    // INT 80h; handler is a single IRET.
    let mut cpu = boot(&[0xCD, 0x80]);
    cpu.mem.put16(0x80 * 4, 0x0000);
    cpu.mem.put16(0x80 * 4 + 2, 0x3000);
    cpu.mem.put8(0x30000, 0xCF); // IRET
    cpu.flags.carry = true;
    cpu.flags.interrupt = true;
    let flags_before = cpu.flags.compress();

    step(&mut cpu);
    assert_eq!(cpu.seg_selector(SegReg::CS), 0x3000);
    assert_eq!(cpu.ip, 0);
    assert!(!cpu.flags.interrupt, "INT clears IF");
    // The frame holds IP, CS, FLAGS from before the INT.
    assert_eq!(cpu.stack_peek(0), 2);
    assert_eq!(cpu.stack_peek(2), CODE_SEG);
    assert_eq!(cpu.stack_peek(4), flags_before);

    step(&mut cpu); // IRET
    assert_eq!(cpu.seg_selector(SegReg::CS), CODE_SEG);
    assert_eq!(cpu.ip, 2);
    assert_eq!(cpu.flags.compress(), flags_before);
    assert_eq!(cpu.sp(), 0xFFFE);
}

#[test]
fn divide_fault_rewinds_ip() {
    // XOR CX,CX; DIV CX at offset 2.
    let mut cpu = boot(&[0x31, 0xC9, 0xF7, 0xF1]);
    cpu.mem.put16(0, 0x0000); // keep vector 0 pointing at 0000:0000
    cpu.mem.put16(2, 0x3000);
    cpu.mem.put8(0x30000, 0xCF);
    steps(&mut cpu, 2);
    assert_eq!(cpu.seg_selector(SegReg::CS), 0x3000, "INT 0 was delivered");
    // The pushed IP is the start of the DIV, so it can be restarted.
    assert_eq!(cpu.stack_peek(0), 2);
}

#[test]
fn rep_movsb_copies_and_respects_df() {
    // MOV SI,0x100; MOV DI,0x200; MOV CX,4; REP MOVSB
    let mut cpu = boot(&[0xBE, 0x00, 0x01, 0xBF, 0x00, 0x02, 0xB9, 0x04, 0x00, 0xF3, 0xA4]);
    cpu.mem.write_block(CODE_SEG as u32 * 16 + 0x100, b"ABCD");
    steps(&mut cpu, 4);
    assert_eq!(cpu.cx(), 0);
    assert_eq!(cpu.si(), 0x104);
    assert_eq!(cpu.di(), 0x204);
    assert_eq!(&cpu.mem.bytes_at(CODE_SEG as u32 * 16 + 0x200, 4), b"ABCD");
}

#[test]
fn repne_scasb_stops_on_match() {
    // MOV DI,0x300; MOV CX,8; MOV AL,'C'; REPNE SCASB
    let mut cpu = boot(&[0xBF, 0x00, 0x03, 0xB9, 0x08, 0x00, 0xB0, 0x43, 0xF2, 0xAE]);
    cpu.mem.write_block(CODE_SEG as u32 * 16 + 0x300, b"ABCDEFGH");
    steps(&mut cpu, 4);
    assert!(cpu.flags.zero, "found the byte");
    assert_eq!(cpu.di(), 0x303);
    assert_eq!(cpu.cx(), 5);
}

#[test]
fn string_source_override_only() {
    // ES:MOVSB: destination stays ES, source segment becomes ES too in
    // the encoded sense; a CS: override must redirect only the source.
    let mut cpu = boot(&[0x2E, 0xA4]); // CS: MOVSB
    cpu.set_si(0x0500);
    cpu.set_di(0x0600);
    cpu.mem.put8(CODE_SEG as u32 * 16 + 0x500, 0x77); // CS:0500
    cpu.set_data_segment(SegReg::DS, 0x4000);
    cpu.mem.put8(0x40500, 0x11); // DS:0500, must not be the source
    step(&mut cpu);
    // Destination is always ES; the override redirected the source only.
    assert_eq!(cpu.mem_r8(SegReg::ES, 0x0600), 0x77);
}

#[test]
fn xlat_uses_table_at_bx() {
    // XLAT with a table at DS:0x400.
    let mut cpu = boot(&[0xD7]);
    cpu.set_bx(0x0400);
    cpu.set_ax(0x0003);
    cpu.mem.put8(CODE_SEG as u32 * 16 + 0x403, 0x5A);
    step(&mut cpu);
    assert_eq!(cpu.al(), 0x5A);
}

#[test]
fn a20_gate_masks_high_memory() {
    let mut cpu = Cpu::new();
    assert!(!cpu.mem.a20());
    cpu.mem.put8(0x000123, 0x42);
    // With the gate closed, 1MB + 0x123 wraps to the bottom.
    assert_eq!(cpu.mem.get8(0x100123), 0x42);
    cpu.set_a20(true);
    cpu.mem.put8(0x100123, 0x99);
    assert_eq!(cpu.mem.get8(0x100123), 0x99);
    assert_eq!(cpu.mem.get8(0x000123), 0x42);
    cpu.set_a20(false);
    assert_eq!(cpu.mem.get8(0x100123), 0x42);
}

#[test]
fn loop_and_jcxz() {
    // MOV CX,3; lbl: LOOP lbl; JCXZ done
    let mut cpu = boot(&[0xB9, 0x03, 0x00, 0xE2, 0xFE, 0xE3, 0x02]);
    step(&mut cpu);
    steps(&mut cpu, 3); // LOOP spins until CX hits zero
    assert_eq!(cpu.cx(), 0);
    assert_eq!(cpu.ip, 5);
    step(&mut cpu); // JCXZ taken
    assert_eq!(cpu.ip, 9);
}

#[test]
fn lahf_sahf_round_trip() {
    // STC; LAHF; CLC; SAHF
    let mut cpu = boot(&[0xF9, 0x9F, 0xF8, 0x9E]);
    steps(&mut cpu, 4);
    assert!(cpu.flags.carry, "SAHF restored CF from AH");
}

#[test]
fn protected_mode_np_on_cs_load() {
    let mut cpu = Cpu::new();
    // GDT at 0x500: null, a not-present code segment at selector 0x08,
    // a present one at 0x10 for the fault handler.
    let gdt = 0x500u32;
    // selector 0x08: base 0x20000, limit 0xFFFF, P=0, code.
    cpu.mem.put16(gdt + 8, 0xFFFF);
    cpu.mem.put16(gdt + 10, 0x0000);
    cpu.mem.put8(gdt + 12, 0x02);
    cpu.mem.put8(gdt + 13, 0x1A); // S=1, EXEC, not present
    // selector 0x10: base 0x30000, limit 0xFFFF, present code.
    cpu.mem.put16(gdt + 16, 0xFFFF);
    cpu.mem.put16(gdt + 18, 0x0000);
    cpu.mem.put8(gdt + 20, 0x03);
    cpu.mem.put8(gdt + 21, 0x9A);
    // selector 0x18: present data for the stack.
    cpu.mem.put16(gdt + 24, 0xFFFF);
    cpu.mem.put16(gdt + 26, 0x0000);
    cpu.mem.put8(gdt + 28, 0x04);
    cpu.mem.put8(gdt + 29, 0x92);
    cpu.gdtr.base = gdt;
    cpu.gdtr.limit = 0xFFFF;
    // IDT at 0x700; vector 11 is an interrupt gate to 0x10:0x2222.
    let idt = 0x700u32;
    cpu.mem.put16(idt + 11 * 8, 0x2222);
    cpu.mem.put16(idt + 11 * 8 + 2, 0x0010);
    cpu.mem.put8(idt + 11 * 8 + 5, 0x86);
    cpu.idtr.base = idt;
    cpu.idtr.limit = 0xFFFF;

    cpu.msw |= 1; // protection enable
    cpu.set_data_segment(SegReg::SS, 0x18);
    cpu.set_sp(0x1000);
    cpu.set_data_segment(SegReg::CS, 0x10);
    cpu.ip = 0x0050;
    cpu.start_ip = 0x0050;

    // Far JMP to the not-present selector.
    cpu.do_jmp_far(0x0100, 0x0008, false);

    // Fault delivered through vector 11 with the selector as error code.
    assert_eq!(cpu.ip, 0x2222);
    assert_eq!(cpu.seg_selector(SegReg::CS), 0x0010);
    assert_eq!(cpu.stack_peek(0), 0x0008, "error code");
    assert_eq!(cpu.stack_peek(2), 0x0050, "faulting IP was rewound");
    assert_eq!(cpu.stack_peek(4), 0x0010, "old CS");
}

#[test]
fn triple_fault_resets_cpu() {
    // Protected mode with an empty IDT: any interrupt faults, the fault
    // faults again, and the third nesting resets the CPU.
    let mut cpu = boot(&[0xCD, 0x21]); // INT 21h
    cpu.msw |= 1;
    cpu.idtr.limit = 0;
    step(&mut cpu);
    assert_eq!(cpu.seg_selector(SegReg::CS), 0xF000, "back at the reset vector");
    assert_eq!(cpu.ip, 0xFFF0);
    assert!(!cpu.protected_mode());
}

#[test]
fn flag_bits_have_fixed_positions() {
    let mut cpu = boot(&[0xF9, 0xFB]); // STC; STI
    steps(&mut cpu, 2);
    let f = cpu.flags.compress();
    assert_eq!(f & FLAG_CF, FLAG_CF);
    assert_eq!(f & FLAG_IF, FLAG_IF);
    assert_eq!(f & FLAG_ZF, 0);
}

#[test]
fn irq_delivery_uses_lowest_pending() {
    let mut cpu = boot(&[0x90, 0x90]); // NOP, NOP
    cpu.mem.put16(0x08 * 4, 0x1111);
    cpu.mem.put16(0x08 * 4 + 2, 0x5000);
    cpu.mem.put16(0x09 * 4, 0x2222);
    cpu.mem.put16(0x09 * 4 + 2, 0x5000);
    cpu.flags.interrupt = true;
    cpu.trigger_irq(1);
    cpu.trigger_irq(0);
    cpu.handle_irq();
    // IRQ 0 (vector 8) wins over IRQ 1.
    assert_eq!(cpu.ip, 0x1111);
    assert_eq!(cpu.seg_selector(SegReg::CS), 0x5000);
}
