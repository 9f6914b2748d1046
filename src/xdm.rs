//! Access to the Xtensa Debug Module (XDM) of the ESP108.
//!
//! The debug module sits behind the NARSEL JTAG instruction: selecting it
//! alternatingly presents the NAR and NDR (Nexus Address/Data Register) as
//! the DR. The 8-bit NAR carries a register address in bits 7..1 and a
//! read/write bit in bit 0 (set for writes); the 32-bit NDR moves the data.
//! The byte shifted out of the NAR reports the status of the previous
//! transaction: Busy in bit 1, Error in bit 0.
//!
//! Two more TAP instructions reach the power domain controller directly:
//! PWRCTL and PWRSTAT, both with 8-bit DRs.

use bitvec::field::BitField;
use bitvec::slice::BitSlice;

use crate::arch::instruction::Instruction;
use crate::communication_interface::XtensaError;
use crate::probe::{
    CommandResult, DeferredResultIndex, DeferredResultSet, JtagAccess, JtagCommandQueue,
    JtagWriteCommand,
};

// TAP instruction register opcodes.
pub const TAPINS_PWRCTL: u32 = 0x08;
pub const TAPINS_PWRSTAT: u32 = 0x09;
pub const TAPINS_NARSEL: u32 = 0x1C;
pub const TAPINS_IDCODE: u32 = 0x1E;
pub const TAPINS_BYPASS: u32 = 0x1F;

const TAPINS_PWRCTL_LEN: u32 = 8;
const TAPINS_PWRSTAT_LEN: u32 = 8;
const TAPINS_NARSEL_ADRLEN: u32 = 8;
const TAPINS_NARSEL_DATALEN: u32 = 32;
const TAPINS_IDCODE_LEN: u32 = 32;

/// The ESP108 TAP has a 5-bit instruction register.
const IR_LENGTH: u8 = 5;

/// Nexus register addresses.
pub mod naradr {
    // TRAX registers.
    pub const TRAXID: u8 = 0x00;
    pub const TRAXCTRL: u8 = 0x01;
    pub const TRAXSTAT: u8 = 0x02;
    pub const TRAXDATA: u8 = 0x03;
    pub const TRAXADDR: u8 = 0x04;
    pub const TRIGGERPC: u8 = 0x05;
    pub const PCMATCHCTRL: u8 = 0x06;
    pub const DELAYCNT: u8 = 0x07;
    pub const MEMADDRSTART: u8 = 0x08;
    pub const MEMADDREND: u8 = 0x09;

    // Performance monitor registers. PM0..7, PMCTRL0..7 and PMSTAT0..7
    // follow their base address.
    pub const PMG: u8 = 0x20;
    pub const INTPC: u8 = 0x24;
    pub const PM0: u8 = 0x28;
    pub const PMCTRL0: u8 = 0x30;
    pub const PMSTAT0: u8 = 0x38;

    // OCD registers. DIR1..7 follow DIR0.
    pub const OCDID: u8 = 0x40;
    pub const DCRCLR: u8 = 0x42;
    pub const DCRSET: u8 = 0x43;
    pub const DSR: u8 = 0x44;
    pub const DDR: u8 = 0x45;
    pub const DDREXEC: u8 = 0x46;
    pub const DIR0EXEC: u8 = 0x47;
    pub const DIR0: u8 = 0x48;

    // Misc registers. PWRSTAT shares its address with the CoreSight
    // CLAIMCLR register.
    pub const PWRCTL: u8 = 0x58;
    pub const ERISTAT: u8 = 0x5A;
    pub const PWRSTAT: u8 = 0x69;

    // CoreSight registers.
    pub const ITCTRL: u8 = 0x60;
    pub const CLAIMSET: u8 = 0x68;
    pub const LOCKACCESS: u8 = 0x6C;
    pub const LOCKSTATUS: u8 = 0x6D;
    pub const AUTHSTATUS: u8 = 0x6E;
    pub const DEVID: u8 = 0x72;
    pub const DEVTYPE: u8 = 0x73;
    pub const PERID4: u8 = 0x74;
    pub const PERID0: u8 = 0x78;
    pub const COMPID0: u8 = 0x7C;
}

// From the manual:
// To properly use Debug registers through JTAG, software must ensure that:
// - Tap is out of reset
// - Xtensa Debug Module is out of reset
// - Other bits of PWRCTL are set to their desired values, and finally
// - JtagDebugUse transitions from 0 to 1
// The bit must continue to be 1 in order for JTAG accesses to the Debug
// Module to happen correctly. When it is set, any write to this bit clears
// it. Either don't access it, or re-write it to 1 so JTAG accesses continue.
pub const PWRCTL_JTAGDEBUGUSE: u8 = 1 << 7;
pub const PWRCTL_DEBUGRESET: u8 = 1 << 6;
pub const PWRCTL_CORERESET: u8 = 1 << 4;
pub const PWRCTL_DEBUGWAKEUP: u8 = 1 << 2;
pub const PWRCTL_MEMWAKEUP: u8 = 1 << 1;
pub const PWRCTL_COREWAKEUP: u8 = 1 << 0;

pub const PWRSTAT_DEBUGWASRESET: u8 = 1 << 6;
pub const PWRSTAT_COREWASRESET: u8 = 1 << 4;
pub const PWRSTAT_CORESTILLNEEDED: u8 = 1 << 3;
pub const PWRSTAT_DEBUGDOMAINON: u8 = 1 << 2;
pub const PWRSTAT_MEMDOMAINON: u8 = 1 << 1;
pub const PWRSTAT_COREDOMAINON: u8 = 1 << 0;

/// Debug Control Register bits, written through DCRSET/DCRCLR.
pub mod dcr {
    pub const ENABLEOCD: u32 = 1 << 0;
    pub const DEBUGINTERRUPT: u32 = 1 << 1;
    pub const INTERRUPTALLCONDS: u32 = 1 << 2;
    pub const BREAKINEN: u32 = 1 << 16;
    pub const BREAKOUTEN: u32 = 1 << 17;
    pub const DEBUGSWACTIVE: u32 = 1 << 20;
    pub const RUNSTALLINEN: u32 = 1 << 21;
    pub const DEBUGMODEOUTEN: u32 = 1 << 22;
}

bitfield::bitfield! {
    /// The Debug Status Register (DSR).
    #[derive(Copy, Clone)]
    pub struct DebugStatus(u32);
    impl Debug;

    /// An injected instruction completed.
    pub exec_done, _: 0;

    /// An injected instruction raised an exception.
    pub exec_exception, _: 1;

    /// An injected instruction is still executing.
    pub exec_busy, _: 2;

    /// An instruction was written to DIR while the previous one was busy.
    pub exec_overrun, _: 3;

    /// The core is stopped in the debug exception.
    pub stopped, _: 4;

    pub core_wrote_ddr, _: 10;
    pub core_read_ddr, _: 11;
    pub host_wrote_ddr, _: 14;
    pub host_read_ddr, _: 15;
    pub debug_pend_break, _: 16;
    pub debug_pend_host, _: 17;
    pub debug_pend_trax, _: 18;
    pub debug_int_break, _: 20;
    pub debug_int_host, _: 21;
    pub debug_int_trax, _: 22;
    pub run_stall_sample, _: 24;
}

impl DebugStatus {
    /// Checks the instruction-execution bits and reports the first anomaly.
    pub fn check_exec(&self) -> Result<(), XdmError> {
        if self.exec_exception() {
            Err(XdmError::ExecException)
        } else if self.exec_overrun() {
            Err(XdmError::ExecOverrun)
        } else if self.exec_busy() {
            Err(XdmError::ExecBusy)
        } else {
            Ok(())
        }
    }
}

/// Errors reported by the debug module itself.
#[derive(thiserror::Error, Debug, docsplay::Display, Clone, Copy, PartialEq, Eq)]
pub enum XdmError {
    /// The Nexus register interface reported an error.
    NexusError,

    /// The Nexus register interface is busy.
    NexusBusy,

    /// An injected instruction raised an exception.
    ExecException,

    /// The instruction execution unit is busy.
    ExecBusy,

    /// An injected instruction was overrun by the next one.
    ExecOverrun,
}

/// The TAP-facing half of the driver: queues PWRCTL/PWRSTAT and Nexus scans
/// and executes them in batches.
#[derive(Debug)]
pub struct Xdm {
    probe: Box<dyn JtagAccess>,
    queue: JtagCommandQueue,
    results: DeferredResultSet,
}

impl Xdm {
    /// Wraps a JTAG probe driving an ESP108 TAP.
    pub fn new(mut probe: Box<dyn JtagAccess>) -> Self {
        probe.set_ir_length(IR_LENGTH);
        // Nexus accesses need a few TCK cycles to propagate into the core
        // clock domain.
        probe.set_idle_cycles(100);

        Self {
            probe,
            queue: JtagCommandQueue::new(),
            results: DeferredResultSet::new(),
        }
    }

    /// Enqueues a PWRCTL write.
    ///
    /// Writing JTAGDEBUGUSE clears it on-chip, so every caller keeping the
    /// debug path alive must include [`PWRCTL_JTAGDEBUGUSE`] in `value`.
    pub fn schedule_pwrctl_set(&mut self, value: u8) {
        self.queue.schedule(JtagWriteCommand {
            address: TAPINS_PWRCTL,
            data: vec![value],
            len: TAPINS_PWRCTL_LEN,
            transform: transform_noop,
        });
    }

    /// Enqueues the power-up handshake.
    ///
    /// Two writes: the second one produces the 0 -> 1 edge on JTAGDEBUGUSE
    /// that arms debug-module accesses after a reset.
    pub fn schedule_wakeup(&mut self) {
        let wakeup = PWRCTL_DEBUGWAKEUP | PWRCTL_MEMWAKEUP | PWRCTL_COREWAKEUP;
        self.schedule_pwrctl_set(wakeup);
        self.schedule_pwrctl_set(wakeup | PWRCTL_JTAGDEBUGUSE);
    }

    /// Enqueues a PWRSTAT read.
    ///
    /// The outgoing bits clear the sticky was-reset flags while the previous
    /// status shifts out.
    pub fn schedule_pwrstat_readclear(&mut self) -> DeferredResultIndex {
        self.queue.schedule(JtagWriteCommand {
            address: TAPINS_PWRSTAT,
            data: vec![PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET],
            len: TAPINS_PWRSTAT_LEN,
            transform: transform_u8,
        })
    }

    /// Enqueues a write of a Nexus register.
    pub fn schedule_nexus_write(&mut self, address: u8, value: u32) {
        self.schedule_nar(address, true);
        self.queue.schedule(JtagWriteCommand {
            address: TAPINS_NARSEL,
            data: value.to_le_bytes().to_vec(),
            len: TAPINS_NARSEL_DATALEN,
            transform: transform_noop,
        });
    }

    /// Enqueues a read of a Nexus register.
    pub fn schedule_nexus_read(&mut self, address: u8) -> DeferredResultIndex {
        self.schedule_nexus_read_sized(address, TAPINS_NARSEL_DATALEN)
    }

    /// Enqueues a read of the low `bits` bits of a Nexus register.
    ///
    /// Shifting less than the full 32 bits is legal and saves scan time for
    /// narrow memory elements.
    pub fn schedule_nexus_read_sized(&mut self, address: u8, bits: u32) -> DeferredResultIndex {
        debug_assert!(0 < bits && bits <= TAPINS_NARSEL_DATALEN);

        self.schedule_nar(address, false);
        self.queue.schedule(JtagWriteCommand {
            address: TAPINS_NARSEL,
            data: vec![0; bits.div_ceil(8) as usize],
            len: bits,
            transform: transform_u32,
        })
    }

    /// Selects a Nexus register address. Bit 0 of the NAR selects the
    /// direction; set means write.
    fn schedule_nar(&mut self, address: u8, write: bool) {
        self.queue.schedule(JtagWriteCommand {
            address: TAPINS_NARSEL,
            data: vec![(address << 1) | write as u8],
            len: TAPINS_NARSEL_ADRLEN,
            transform: transform_nexus_status,
        });
    }

    /// Enqueues a CPU instruction; the core executes it as soon as the scan
    /// reaches DIR0EXEC.
    pub fn schedule_execute_instruction(&mut self, instruction: Instruction) {
        tracing::trace!("Injecting {instruction:?}");
        self.schedule_nexus_write(naradr::DIR0EXEC, instruction.encode());
    }

    /// Enqueues a write of the data-exchange register.
    pub fn schedule_write_ddr(&mut self, value: u32) {
        self.schedule_nexus_write(naradr::DDR, value);
    }

    /// Enqueues a read of the data-exchange register.
    pub fn schedule_read_ddr(&mut self) -> DeferredResultIndex {
        self.schedule_nexus_read(naradr::DDR)
    }

    /// Enqueues setting bits in the Debug Control Register.
    pub fn schedule_dcr_set(&mut self, bits: u32) {
        self.schedule_nexus_write(naradr::DCRSET, bits);
    }

    /// Enqueues clearing bits in the Debug Control Register.
    pub fn schedule_dcr_clear(&mut self, bits: u32) {
        self.schedule_nexus_write(naradr::DCRCLR, bits);
    }

    /// Enqueues a read of the Debug Status Register.
    pub fn schedule_read_dsr(&mut self) -> DeferredResultIndex {
        self.schedule_nexus_read(naradr::DSR)
    }

    /// Reads the Debug Status Register, flushing the queue.
    pub fn status(&mut self) -> Result<DebugStatus, XtensaError> {
        let reader = self.schedule_read_dsr();
        Ok(DebugStatus(self.read_deferred_result(reader)?.into_u32()))
    }

    /// Reads the TAP IDCODE.
    pub fn read_idcode(&mut self) -> Result<u32, XtensaError> {
        // Keep the wire ordering: anything already queued goes out first.
        self.execute()?;

        let value = self.probe.read_register(TAPINS_IDCODE, TAPINS_IDCODE_LEN)?;
        Ok(value.load_le::<u32>())
    }

    /// Flushes the queued scans to the probe.
    ///
    /// Shifts execute strictly in enqueue order; captured values become
    /// available through [`Xdm::read_deferred_result`] afterwards. A failed
    /// batch drops the unexecuted remainder.
    pub fn execute(&mut self) -> Result<(), XtensaError> {
        let cmds = std::mem::take(&mut self.queue);

        if cmds.is_empty() {
            return Ok(());
        }

        tracing::trace!("Executing batch of {} scans", cmds.len());

        match self.probe.write_register_batch(&cmds) {
            Ok(results) => {
                self.results.merge_from(results);
                Ok(())
            }
            Err(e) => {
                self.results.merge_from(e.results);
                tracing::warn!("JTAG batch failed: {}", e.error);
                Err(match e.error {
                    crate::Error::Probe(err) => XtensaError::DebugProbe(err),
                    crate::Error::Xtensa(err) => err,
                })
            }
        }
    }

    /// Retrieves the result of a previously scheduled scan, flushing the
    /// queue if it has not executed yet.
    pub fn read_deferred_result(
        &mut self,
        index: DeferredResultIndex,
    ) -> Result<CommandResult, XtensaError> {
        match self.results.take(index) {
            Ok(result) => Ok(result),
            Err(index) => {
                self.execute()?;
                // We can lose data if `execute` fails.
                self.results
                    .take(index)
                    .map_err(|_| XtensaError::BatchedResultNotAvailable)
            }
        }
    }

    /// Asserts the target reset line through the probe.
    pub fn target_reset_assert(&mut self) -> Result<(), XtensaError> {
        Ok(self.probe.target_reset_assert()?)
    }

    /// Deasserts the target reset line through the probe.
    pub fn target_reset_deassert(&mut self) -> Result<(), XtensaError> {
        Ok(self.probe.target_reset_deassert()?)
    }
}

fn transform_noop(_: &JtagWriteCommand, _: &BitSlice) -> Result<CommandResult, crate::Error> {
    Ok(CommandResult::None)
}

fn transform_u8(
    cmd: &JtagWriteCommand,
    response: &BitSlice,
) -> Result<CommandResult, crate::Error> {
    Ok(CommandResult::U8(
        response[..cmd.len as usize].load_le::<u8>(),
    ))
}

fn transform_u32(
    cmd: &JtagWriteCommand,
    response: &BitSlice,
) -> Result<CommandResult, crate::Error> {
    Ok(CommandResult::U32(
        response[..cmd.len as usize].load_le::<u32>(),
    ))
}

/// Decodes the NAR status byte of the previous Nexus transaction.
fn transform_nexus_status(
    cmd: &JtagWriteCommand,
    response: &BitSlice,
) -> Result<CommandResult, crate::Error> {
    let status = response[..cmd.len as usize].load_le::<u8>();

    if status & 0x01 != 0 {
        Err(XtensaError::Xdm(XdmError::NexusError).into())
    } else if status & 0x02 != 0 {
        Err(XtensaError::Xdm(XdmError::NexusBusy).into())
    } else {
        Ok(CommandResult::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake_probe::FakeProbe;

    #[test]
    fn wakeup_reasserts_jtagdebuguse() {
        let probe = FakeProbe::new();
        let recorder = probe.clone();

        let mut xdm = Xdm::new(Box::new(probe));
        xdm.schedule_wakeup();
        xdm.execute().unwrap();

        let pwrctl_writes: Vec<u8> = recorder
            .scans()
            .iter()
            .filter(|scan| scan.ir == TAPINS_PWRCTL)
            .map(|scan| scan.data[0])
            .collect();
        assert_eq!(vec![0x07, 0x87], pwrctl_writes);
    }

    #[test]
    fn nexus_write_sets_the_direction_bit() {
        let probe = FakeProbe::new();
        let recorder = probe.clone();

        let mut xdm = Xdm::new(Box::new(probe));
        xdm.schedule_nexus_write(naradr::DCRSET, dcr::ENABLEOCD);
        xdm.execute().unwrap();

        let scans = recorder.scans();
        let nar = scans.iter().find(|s| s.ir == TAPINS_NARSEL).unwrap();
        assert_eq!((naradr::DCRSET << 1) | 1, nar.data[0]);
    }

    #[test]
    fn nexus_read_returns_the_register_value() {
        let probe = FakeProbe::new();
        probe.set_halted(true);

        let mut xdm = Xdm::new(Box::new(probe));
        let status = xdm.status().unwrap();
        assert!(status.stopped());
    }

    #[test]
    fn pwrstat_read_clears_reset_flags() {
        let probe = FakeProbe::new();

        let mut xdm = Xdm::new(Box::new(probe));
        let reader = xdm.schedule_pwrstat_readclear();
        xdm.execute().unwrap();

        // A fresh device reports both was-reset flags once.
        let status = xdm.read_deferred_result(reader).unwrap().into_u8();
        assert_eq!(
            PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET,
            status & (PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET)
        );

        let reader = xdm.schedule_pwrstat_readclear();
        xdm.execute().unwrap();
        let status = xdm.read_deferred_result(reader).unwrap().into_u8();
        assert_eq!(0, status & (PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET));
    }
}
