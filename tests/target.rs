//! Driver-level tests against the fake probe's device model.

use esp108_debug::probe::fake_probe::{FakeProbe, Scan};
use esp108_debug::registers::{general_index, REG_IDX_PC, XT_NUM_REGS};
use esp108_debug::{Breakpoint, BreakpointKind, Esp108, HaltReason, TargetState, XtensaError};
use test_log::test;

const TAPINS_PWRCTL: u32 = 0x08;
const TAPINS_PWRSTAT: u32 = 0x09;
const TAPINS_NARSEL: u32 = 0x1C;

const NARADR_DDR: u8 = 0x45;
const NARADR_DIR0EXEC: u8 = 0x47;

const SR_IBREAKENABLE: u8 = 96;
const SR_IBREAKA0: u8 = 128;
const SR_IBREAKA1: u8 = 129;
const SR_ICOUNTLEVEL: u8 = 237;
const SR_EPC6: u8 = 182;

fn connected_target() -> (Esp108, FakeProbe) {
    let probe = FakeProbe::new();
    let handle = probe.clone();

    let mut target = Esp108::new(Box::new(probe));
    target.examine().unwrap();

    (target, handle)
}

fn halted_target() -> (Esp108, FakeProbe) {
    let (mut target, probe) = connected_target();

    target.halt().unwrap();
    target.poll().unwrap();
    assert_eq!(TargetState::Halted, target.state());

    (target, probe)
}

/// Extracts the values of all Nexus writes to the given register, in order.
///
/// NARSEL scans alternate between the address and data registers, so the
/// scan length cannot be used to tell them apart.
fn nexus_writes(scans: &[Scan], register: u8) -> Vec<u32> {
    let mut values = Vec::new();
    let mut nar = 0u8;
    let mut is_data = false;

    for scan in scans {
        if scan.ir != TAPINS_NARSEL {
            is_data = false;
            continue;
        }

        if !is_data {
            nar = scan.data[0];
            is_data = true;
        } else {
            is_data = false;
            if nar == (register << 1) | 1 {
                let n = scan.data.len().min(4);
                let mut word = [0u8; 4];
                word[..n].copy_from_slice(&scan.data[..n]);
                values.push(u32::from_le_bytes(word));
            }
        }
    }

    values
}

/// The instruction words executed through DIR0EXEC, in order.
fn injected_instructions(scans: &[Scan]) -> Vec<u32> {
    nexus_writes(scans, NARADR_DIR0EXEC)
}

#[test]
fn examine_on_a_freshly_reset_device() {
    let probe = FakeProbe::new();
    let handle = probe.clone();

    let mut target = Esp108::new(Box::new(probe));
    target.examine().unwrap();

    assert!(target.examined());
    assert_eq!(TargetState::Running, target.state());

    let scans = handle.scans();

    // The poll starts with the PWRSTAT read-and-clear; the outgoing byte is
    // the write-1-to-clear mask for the two was-reset flags.
    assert_eq!(TAPINS_PWRSTAT, scans[0].ir);
    assert_eq!(vec![0x50], scans[0].data);

    // The two PWRCTL writes wake the domains and arm JTAGDEBUGUSE with a
    // 0 -> 1 edge.
    let pwrctl: Vec<u8> = scans
        .iter()
        .filter(|s| s.ir == TAPINS_PWRCTL)
        .map(|s| s.data[0])
        .collect();
    assert_eq!(vec![0x07, 0x87], pwrctl);

    // DCRSET <- ENABLEOCD.
    assert_eq!(vec![0x01], nexus_writes(&scans, 0x43));
}

#[test]
fn halt_then_inspect_pc() {
    let (mut target, probe) = connected_target();
    probe.set_special(SR_EPC6, 0x400D_0078);

    target.halt().unwrap();
    target.poll().unwrap();

    assert_eq!(TargetState::Halted, target.state());
    assert_eq!(Some(HaltReason::DebugInterrupt), target.halt_reason());

    assert_eq!(0x400D_0078, target.read_register(REG_IDX_PC).unwrap());

    let (descriptor, entry) = target.gdb_reg_list()[REG_IDX_PC];
    assert_eq!("pc", descriptor.name);
    assert!(entry.is_valid());
    assert!(!entry.is_dirty());
}

#[test]
fn registers_are_valid_and_clean_after_halt() {
    let (target, _probe) = halted_target();

    for (descriptor, entry) in target.gdb_reg_list() {
        assert!(entry.is_valid(), "{} is not valid", descriptor.name);
        assert!(!entry.is_dirty(), "{} is dirty", descriptor.name);
    }
}

#[test]
fn halt_refresh_captures_the_whole_window_file() {
    let probe = FakeProbe::new();
    for n in 0..64 {
        probe.set_ar(n, 0xA000_0000 + n as u32);
    }
    let handle = probe.clone();

    let mut target = Esp108::new(Box::new(probe));
    target.examine().unwrap();
    target.halt().unwrap();
    target.poll().unwrap();

    for n in 0..64u8 {
        assert_eq!(
            0xA000_0000 + n as u32,
            target.read_register(general_index(n)).unwrap(),
            "ar{n}"
        );
    }

    // The window walk must end where it started.
    let rotations = injected_instructions(&handle.scans())
        .iter()
        .filter(|&&word| word & 0xFFF00F == 0x408000)
        .count();
    assert_eq!(0, rotations % 4);
}

#[test]
fn write_a_single_byte() {
    let (mut target, probe) = halted_target();
    probe.clear_scans();

    target.write_memory(0x3FFB_0000, 1, 1, &[0xAB]).unwrap();
    assert_eq!(vec![0xAB], probe.memory(0x3FFB_0000, 1));

    // The store is S8I a1, a0, 0 after the base address and the data byte
    // travelled through DDR.
    let injected = injected_instructions(&probe.scans());
    assert!(injected.contains(&0x004012));
    let ddr = nexus_writes(&probe.scans(), NARADR_DDR);
    assert!(ddr.contains(&0x3FFB_0000));
    assert!(ddr.contains(&0x0000_00AB));

    let mut readback = [0u8; 1];
    target.read_memory(0x3FFB_0000, 1, 1, &mut readback).unwrap();
    assert_eq!([0xAB], readback);
}

#[test]
fn long_reads_are_chunked_at_the_imm8_limit() {
    let (mut target, probe) = halted_target();

    let pattern: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    probe.set_memory(0x3FFB_0000, &pattern);
    probe.clear_scans();

    let mut buffer = vec![0u8; 1200];
    target.read_memory(0x3FFB_0000, 4, 300, &mut buffer).unwrap();
    assert_eq!(pattern, buffer);

    // 300 words split into 255 + 45, each run preceded by its own base
    // address load through DDR.
    let ddr = nexus_writes(&probe.scans(), NARADR_DDR);
    assert!(ddr.contains(&0x3FFB_0000));
    assert!(ddr.contains(&(0x3FFB_0000 + 255 * 4)));
}

#[test]
fn memory_roundtrip_for_every_element_size() {
    let (mut target, _probe) = halted_target();

    for size in [1u32, 2, 4] {
        let data: Vec<u8> = (0..8 * size).map(|i| (0x11 * size + i) as u8).collect();
        target
            .write_memory(0x3FF0_0000, size, 8, &data)
            .unwrap();

        let mut readback = vec![0u8; data.len()];
        target
            .read_memory(0x3FF0_0000, size, 8, &mut readback)
            .unwrap();
        assert_eq!(data, readback, "size {size}");
    }
}

#[test]
fn memory_preconditions_are_checked_without_tap_traffic() {
    let (mut target, probe) = halted_target();
    probe.clear_scans();

    let mut buffer = [0u8; 8];
    assert!(matches!(
        target.read_memory(0x3FF0_0001, 4, 2, &mut buffer),
        Err(XtensaError::UnalignedAccess)
    ));
    assert!(matches!(
        target.read_memory(0x3FF0_0001, 2, 2, &mut buffer),
        Err(XtensaError::UnalignedAccess)
    ));
    assert!(matches!(
        target.read_memory(0x3FF0_0000, 3, 2, &mut buffer),
        Err(XtensaError::InvalidArgument)
    ));
    assert!(matches!(
        target.read_memory(0x3FF0_0000, 4, 0, &mut buffer),
        Err(XtensaError::InvalidArgument)
    ));
    assert!(probe.scans().is_empty());
}

#[test]
fn memory_access_requires_a_halted_core() {
    let (mut target, probe) = connected_target();
    assert_eq!(TargetState::Running, target.state());
    probe.clear_scans();

    let mut buffer = [0u8; 4];
    assert!(matches!(
        target.read_memory(0x3FF0_0000, 4, 1, &mut buffer),
        Err(XtensaError::NotHalted)
    ));
    assert!(matches!(
        target.write_memory(0x3FF0_0000, 4, 1, &buffer),
        Err(XtensaError::NotHalted)
    ));
    assert!(probe.scans().is_empty());
}

#[test]
fn buffer_writes_merge_partial_words() {
    let (mut target, probe) = halted_target();
    probe.set_memory(0x3FF0_0000, &[0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);

    target.write_buffer(0x3FF0_0001, &[0xAA, 0xBB, 0xCC]).unwrap();

    assert_eq!(
        vec![0x10, 0xAA, 0xBB, 0xCC, 0x14, 0x15, 0x16, 0x17],
        probe.memory(0x3FF0_0000, 8)
    );
}

#[test]
fn buffer_reads_handle_unaligned_spans() {
    let (mut target, probe) = halted_target();
    probe.set_memory(0x3FF0_0000, &[0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);

    let mut buffer = [0u8; 5];
    target.read_buffer(0x3FF0_0001, &mut buffer).unwrap();
    assert_eq!([0x11, 0x12, 0x13, 0x14, 0x15], buffer);
}

#[test]
fn register_roundtrip_survives_resume() {
    let (mut target, probe) = halted_target();

    target.write_register(general_index(5), 0xDEAD_BEEF).unwrap();
    target.write_register(68, 0x0000_001F).unwrap(); // sar
    assert_eq!(0xDEAD_BEEF, target.read_register(general_index(5)).unwrap());

    target.resume(true, 0, false, false).unwrap();
    assert_eq!(TargetState::Running, target.state());
    assert_eq!(0xDEAD_BEEF, probe.ar(5));
    assert_eq!(0x0000_001F, probe.special(3));

    // Every cache entry is dropped by the resume.
    assert!(target.gdb_reg_list().iter().all(|(_, e)| !e.is_valid()));

    target.halt().unwrap();
    target.poll().unwrap();
    assert_eq!(0xDEAD_BEEF, target.read_register(general_index(5)).unwrap());
    assert_eq!(0x0000_001F, target.read_register(68).unwrap());
}

#[test]
fn restore_writes_special_registers_before_general_ones() {
    let (mut target, probe) = halted_target();

    // Writing pc goes through the a0 scratch register; if the restore
    // ordering were wrong, a0 would end up holding the pc value.
    target.write_register(REG_IDX_PC, 0x4008_1234).unwrap();
    target.write_register(general_index(0), 0x1111_2222).unwrap();

    target.resume(true, 0, false, false).unwrap();

    assert_eq!(0x4008_1234, probe.special(SR_EPC6));
    assert_eq!(0x1111_2222, probe.ar(0));
}

#[test]
fn resume_to_address_loads_the_pc() {
    let (mut target, probe) = halted_target();

    target.resume(false, 0x4008_0000, false, false).unwrap();

    assert_eq!(0x4008_0000, probe.special(SR_EPC6));
    assert_eq!(TargetState::Running, target.state());
}

#[test]
fn resume_requires_a_halted_core() {
    let (mut target, _probe) = connected_target();
    assert!(matches!(
        target.resume(true, 0, false, false),
        Err(XtensaError::NotHalted)
    ));
}

#[test]
fn debug_execution_resumes_into_debug_running() {
    let (mut target, probe) = halted_target();

    target.resume(true, 0, false, true).unwrap();
    assert_eq!(TargetState::DebugRunning, target.state());

    // RFDO 1 selects the OCD-Run state.
    assert!(injected_instructions(&probe.scans()).contains(&0xF1E100));

    // A later poll must not lose the debug-running state.
    target.poll().unwrap();
    assert_eq!(TargetState::DebugRunning, target.state());
}

#[test]
fn step_executes_one_instruction() {
    let (mut target, probe) = halted_target();
    let pc_before = target.read_register(REG_IDX_PC).unwrap();

    target.step(true, 0).unwrap();

    assert_eq!(TargetState::Halted, target.state());
    assert_eq!(Some(HaltReason::SingleStep), target.halt_reason());
    assert_eq!(
        pc_before.wrapping_add(3),
        target.read_register(REG_IDX_PC).unwrap()
    );

    // The instruction counter is disarmed again.
    assert_eq!(0, probe.special(SR_ICOUNTLEVEL));
}

#[test]
fn breakpoints_fill_the_lowest_free_slot() {
    let (mut target, probe) = halted_target();

    let bp0 = Breakpoint {
        address: 0x4008_0400,
        kind: BreakpointKind::Hardware,
    };
    let bp1 = Breakpoint {
        address: 0x4008_0800,
        kind: BreakpointKind::Hardware,
    };

    target.add_breakpoint(bp0).unwrap();
    target.add_breakpoint(bp1).unwrap();

    assert_eq!(0, target.free_breakpoint_units());
    assert_eq!(0x4008_0400, probe.special(SR_IBREAKA0));
    assert_eq!(0x4008_0800, probe.special(SR_IBREAKA1));
    assert_eq!(0b11, probe.special(SR_IBREAKENABLE));

    // Removing the first breakpoint leaves the second armed.
    target.remove_breakpoint(&bp0).unwrap();
    assert_eq!(1, target.free_breakpoint_units());
    assert_eq!(0b10, probe.special(SR_IBREAKENABLE));

    target.remove_breakpoint(&bp1).unwrap();
    assert_eq!(2, target.free_breakpoint_units());
    assert_eq!(0, probe.special(SR_IBREAKENABLE));
}

#[test]
fn breakpoint_exhaustion_causes_no_tap_traffic() {
    let (mut target, probe) = halted_target();

    for address in [0x4008_0400, 0x4008_0800] {
        target
            .add_breakpoint(Breakpoint {
                address,
                kind: BreakpointKind::Hardware,
            })
            .unwrap();
    }
    assert_eq!(0, target.free_breakpoint_units());

    probe.clear_scans();
    let result = target.add_breakpoint(Breakpoint {
        address: 0x4008_0C00,
        kind: BreakpointKind::Hardware,
    });

    assert!(matches!(result, Err(XtensaError::NoFreeBreakpointUnit)));
    assert!(probe.scans().is_empty());
}

#[test]
fn software_breakpoints_are_rejected() {
    let (mut target, probe) = halted_target();
    probe.clear_scans();

    let result = target.add_breakpoint(Breakpoint {
        address: 0x4008_0400,
        kind: BreakpointKind::Software,
    });

    assert!(matches!(
        result,
        Err(XtensaError::SoftwareBreakpointsUnsupported)
    ));
    assert!(probe.scans().is_empty());
}

#[test]
fn reset_during_run_clears_all_mirrored_state() {
    let (mut target, probe) = halted_target();

    target
        .add_breakpoint(Breakpoint {
            address: 0x4008_0400,
            kind: BreakpointKind::Hardware,
        })
        .unwrap();
    target.resume(true, 0, false, false).unwrap();
    assert_eq!(TargetState::Running, target.state());

    probe.trigger_reset();
    target.poll().unwrap();

    assert_eq!(TargetState::Running, target.state());
    assert_eq!(2, target.free_breakpoint_units());
    assert!(target.breakpoints().iter().all(Option::is_none));
    assert!(target.gdb_reg_list().iter().all(|(_, e)| !e.is_valid()));
}

#[test]
fn reset_sequence_reestablishes_contact() {
    let (mut target, probe) = halted_target();

    target.assert_reset().unwrap();
    assert_eq!(TargetState::Reset, target.state());
    assert!(probe.reset_asserted());

    target.deassert_reset().unwrap();
    assert!(!probe.reset_asserted());
    assert_eq!(TargetState::Running, target.state());
}

#[test]
fn reset_with_halt_request_halts_after_the_restart() {
    let (mut target, _probe) = connected_target();
    target.set_reset_halt(true);

    target.assert_reset().unwrap();
    target.deassert_reset().unwrap();

    assert_eq!(TargetState::Halted, target.state());
}

#[test]
fn operations_require_an_examined_target() {
    let mut target = Esp108::new(Box::new(FakeProbe::new()));

    assert!(matches!(target.halt(), Err(XtensaError::StateLost)));

    let mut buffer = [0u8; 4];
    assert!(matches!(
        target.read_memory(0x3FF0_0000, 4, 1, &mut buffer),
        Err(XtensaError::StateLost)
    ));
    assert!(matches!(
        target.read_register(REG_IDX_PC),
        Err(XtensaError::StateLost)
    ));
}

#[test]
fn gdb_reg_list_has_the_wire_layout() {
    let (target, _probe) = connected_target();

    let list = target.gdb_reg_list();
    assert_eq!(XT_NUM_REGS, list.len());
    assert_eq!("pc", list[0].0.name);
    assert_eq!("ar0", list[1].0.name);
    assert_eq!("ddr", list[84].0.name);
}
