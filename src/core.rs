//! The ESP108 target: examine/poll/halt/resume/step, reset handling and the
//! hardware breakpoint slots.

use std::thread;
use std::time::{Duration, Instant};

use crate::arch::sr;
use crate::communication_interface::{DebugCause, XtensaCommunicationInterface, XtensaError};
use crate::probe::JtagAccess;
use crate::register_cache::CacheEntry;
use crate::registers::{RegisterDescriptor, ESP108_REGISTERS, REG_IDX_PC, XT_NUM_REGS};
use crate::xdm::{dcr, naradr, DebugStatus, PWRSTAT_COREWASRESET, PWRSTAT_DEBUGWASRESET};

/// Number of instruction-breakpoint units in the ESP108 configuration.
pub const XT_NUM_BREAKPOINTS: usize = 2;

/// How long a single step may take before the driver gives up.
const STEP_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll granularity while waiting for a step to land.
const STEP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The abstract execution state of the target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetState {
    /// Nothing is known about the core yet; examine it first.
    Unknown,
    /// The core is executing normally.
    Running,
    /// The core sits in the debug exception.
    Halted,
    /// The core is executing under debugger control.
    DebugRunning,
    /// The core is being held in reset.
    Reset,
}

/// Why the core halted, decoded from DEBUGCAUSE.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HaltReason {
    /// An instruction breakpoint or BREAK instruction hit.
    Breakpoint,
    /// A data breakpoint hit.
    Watchpoint,
    /// The instruction counter overflowed after a step request.
    SingleStep,
    /// The host requested a halt through the debug interrupt.
    DebugInterrupt,
    /// More than one cause was flagged at once.
    Multiple,
    /// The cause could not be identified.
    Unknown,
}

impl HaltReason {
    fn from_debug_cause(cause: DebugCause) -> Self {
        let is_breakpoint = cause.ibreak_exception()
            || cause.break_instruction()
            || cause.break_n_instruction();

        let count = cause.icount_exception() as u8
            + cause.ibreak_exception() as u8
            + cause.break_instruction() as u8
            + cause.break_n_instruction() as u8
            + cause.dbreak_exception() as u8
            + cause.debug_interrupt() as u8;

        if count > 1 {
            // Several causes fired at once. Report a breakpoint if one of
            // them was a breakpoint; debuggers care about that one most.
            if is_breakpoint {
                HaltReason::Breakpoint
            } else {
                HaltReason::Multiple
            }
        } else if cause.icount_exception() {
            HaltReason::SingleStep
        } else if is_breakpoint {
            HaltReason::Breakpoint
        } else if cause.dbreak_exception() {
            HaltReason::Watchpoint
        } else if cause.debug_interrupt() {
            HaltReason::DebugInterrupt
        } else {
            HaltReason::Unknown
        }
    }
}

/// The kind of breakpoint the host framework requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakpointKind {
    /// A hardware breakpoint in an IBREAK unit.
    Hardware,
    /// A software breakpoint; not supported by this driver.
    Software,
}

/// A breakpoint record handed over by the host framework.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Breakpoint {
    /// The address the core should halt at.
    pub address: u32,
    /// The requested breakpoint kind.
    pub kind: BreakpointKind,
}

/// A debuggable ESP108 core behind a JTAG probe.
pub struct Esp108 {
    interface: XtensaCommunicationInterface,
    state: TargetState,
    halt_reason: Option<HaltReason>,
    examined: bool,
    reset_halt: bool,
    breakpoints: [Option<Breakpoint>; XT_NUM_BREAKPOINTS],
    free_breakpoints: usize,
}

impl Esp108 {
    const IBREAKA_REGS: [u8; XT_NUM_BREAKPOINTS] = [sr::IBREAKA0, sr::IBREAKA1];

    /// Creates the target on top of a JTAG probe. The core state stays
    /// [`TargetState::Unknown`] until [`Esp108::examine`] ran.
    pub fn new(probe: Box<dyn JtagAccess>) -> Self {
        Self {
            interface: XtensaCommunicationInterface::new(probe),
            state: TargetState::Unknown,
            halt_reason: None,
            examined: false,
            reset_halt: false,
            breakpoints: [None; XT_NUM_BREAKPOINTS],
            free_breakpoints: XT_NUM_BREAKPOINTS,
        }
    }

    /// Returns the current target state.
    pub fn state(&self) -> TargetState {
        self.state
    }

    /// Returns why the core halted, if it is halted.
    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt_reason
    }

    /// Returns whether the target was examined successfully.
    pub fn examined(&self) -> bool {
        self.examined
    }

    /// Requests a halt right after the next deassert-reset.
    pub fn set_reset_halt(&mut self, reset_halt: bool) {
        self.reset_halt = reset_halt;
    }

    /// First contact with the core: brings the debug module up and
    /// determines the initial state.
    pub fn examine(&mut self) -> Result<(), XtensaError> {
        self.poll()?;
        self.examined = true;

        tracing::info!("Examined ESP108 core, state: {:?}", self.state);
        Ok(())
    }

    /// Periodic state check.
    ///
    /// Keeps the debug power domains awake, re-arms JTAGDEBUGUSE, notices
    /// resets and detects halt transitions. All scans of one poll go out in
    /// a single batch.
    pub fn poll(&mut self) -> Result<TargetState, XtensaError> {
        let pwrstat_reader = self.interface.xdm.schedule_pwrstat_readclear();
        self.interface.xdm.schedule_wakeup();
        self.interface.xdm.schedule_dcr_set(dcr::ENABLEOCD);
        let ocdid_reader = self.interface.xdm.schedule_nexus_read(naradr::OCDID);
        let dsr_reader = self.interface.xdm.schedule_read_dsr();

        if let Err(e) = self.interface.xdm.execute() {
            self.lose_state();
            return Err(e);
        }

        let pwrstat = self
            .interface
            .xdm
            .read_deferred_result(pwrstat_reader)?
            .into_u8();
        if pwrstat & PWRSTAT_DEBUGWASRESET != 0 {
            tracing::info!("Debug controller was reset.");
        }
        if pwrstat & PWRSTAT_COREWASRESET != 0 {
            tracing::info!("Core was reset.");
        }
        if pwrstat & (PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET) != 0 {
            self.on_reset_observed();
        }

        let ocdid = self
            .interface
            .xdm
            .read_deferred_result(ocdid_reader)?
            .into_u32();
        tracing::trace!("OCDID: {ocdid:#010x}");

        let dsr = DebugStatus(
            self.interface
                .xdm
                .read_deferred_result(dsr_reader)?
                .into_u32(),
        );

        if dsr.stopped() {
            if self.state != TargetState::Halted {
                let prior = self.state;
                self.state = TargetState::Halted;
                self.interface.set_halted(true);

                let cause = match self.interface.fetch_all_registers() {
                    Ok(cause) => cause,
                    Err(e) => {
                        self.lose_state();
                        return Err(e);
                    }
                };
                self.halt_reason = Some(HaltReason::from_debug_cause(cause));

                if prior == TargetState::DebugRunning {
                    tracing::debug!("Core debug-halted: {:?}", self.halt_reason);
                } else {
                    tracing::info!("Core halted: {:?}", self.halt_reason);
                }
            }
        } else if self.state != TargetState::DebugRunning {
            self.state = TargetState::Running;
            self.interface.set_halted(false);
        }

        Ok(self.state)
    }

    /// Fails operations that need an established target state; examine is
    /// the recovery path.
    fn ensure_known_state(&self) -> Result<(), XtensaError> {
        if self.state == TargetState::Unknown {
            return Err(XtensaError::StateLost);
        }
        Ok(())
    }

    /// Asks the core to halt. The next poll observes the stopped state and
    /// performs the halted-state bookkeeping.
    pub fn halt(&mut self) -> Result<(), XtensaError> {
        self.ensure_known_state()?;

        if self.state == TargetState::Halted {
            tracing::debug!("Target was already halted");
            return Ok(());
        }

        self.interface.xdm.schedule_dcr_set(dcr::DEBUGINTERRUPT);
        self.interface.xdm.execute()
    }

    /// Resumes execution.
    ///
    /// With `current` unset the core continues at `address` instead of the
    /// current program counter. `debug_execution` selects the OCD-Run state
    /// rather than normal execution. Breakpoints stay armed either way; the
    /// host framework owns any step-over logic.
    pub fn resume(
        &mut self,
        current: bool,
        address: u32,
        _handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), XtensaError> {
        self.ensure_known_state()?;

        if self.state != TargetState::Halted {
            tracing::warn!("Resume requested but target is not halted");
            return Err(XtensaError::NotHalted);
        }

        tracing::debug!("Resuming, current={current} address={address:#010x}");

        if !current {
            self.interface.write_register(REG_IDX_PC, address)?;
        }

        let result = self.resume_inner(debug_execution);
        if result.is_err() {
            self.lose_state();
            return result;
        }

        self.interface.invalidate_cache();
        self.interface.set_halted(false);
        self.halt_reason = None;
        self.state = if debug_execution {
            TargetState::DebugRunning
        } else {
            TargetState::Running
        };
        tracing::debug!("Resumed");

        Ok(())
    }

    fn resume_inner(&mut self, debug_execution: bool) -> Result<(), XtensaError> {
        self.interface.restore_context()?;

        self.interface.xdm.schedule_dcr_clear(dcr::DEBUGINTERRUPT);
        self.interface
            .xdm
            .schedule_execute_instruction(crate::arch::instruction::Instruction::Rfdo(
                debug_execution as u8,
            ));
        self.interface.xdm.execute()
    }

    /// Executes a single instruction.
    ///
    /// ICOUNT is primed so that one instruction completes before the counter
    /// overflows into the debug exception; ICOUNTLEVEL 1 keeps the counter
    /// running inside interrupt handlers as well, which has proven to
    /// recover better than counting only at the debug level.
    pub fn step(&mut self, current: bool, address: u32) -> Result<(), XtensaError> {
        self.ensure_known_state()?;

        if self.state != TargetState::Halted {
            tracing::warn!("Step requested but target is not halted");
            return Err(XtensaError::NotHalted);
        }

        self.interface.write_special_and_flush(sr::ICOUNTLEVEL, 1)?;
        self.interface
            .write_special_and_flush(sr::ICOUNT, -2i32 as u32)?;

        // Let the exec engine settle before resuming; resuming with a busy
        // or faulted engine produces bad resumes.
        let deadline = Instant::now() + STEP_TIMEOUT;
        loop {
            let dsr = self.interface.xdm.status()?;
            if dsr.stopped() && !dsr.exec_busy() && !dsr.exec_exception() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(XtensaError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.resume(current, address, false, false)?;

        // Wait for the stepped instruction to retire.
        let deadline = Instant::now() + STEP_TIMEOUT;
        while self.state != TargetState::Halted {
            self.poll()?;
            if self.state == TargetState::Halted {
                break;
            }
            if Instant::now() >= deadline {
                tracing::error!("Timed out waiting for the step to finish.");
                // Cleanup needs a halted core; nothing more we can do here.
                return Err(XtensaError::Timeout);
            }
            thread::sleep(STEP_POLL_INTERVAL);
        }

        self.interface.write_special_and_flush(sr::ICOUNTLEVEL, 0)?;

        Ok(())
    }

    /// Asserts the reset line and drops all cached knowledge of the core.
    pub fn assert_reset(&mut self) -> Result<(), XtensaError> {
        tracing::debug!("Asserting reset");

        self.interface.xdm.target_reset_assert()?;
        self.state = TargetState::Reset;
        thread::sleep(Duration::from_millis(5));

        self.interface.invalidate_cache();
        self.interface.set_halted(false);
        Ok(())
    }

    /// Releases the reset line and re-establishes contact.
    pub fn deassert_reset(&mut self) -> Result<(), XtensaError> {
        tracing::debug!("Deasserting reset");

        self.interface.xdm.target_reset_deassert()?;
        thread::sleep(Duration::from_millis(100));

        self.poll()?;

        if self.reset_halt {
            // The core has been running since the reset was released; a
            // halt right now is the closest this hardware gets.
            self.halt()?;
            self.poll()?;
            tracing::warn!(
                "'reset halt' is not supported; halted some time after reset instead (not the same thing!)"
            );
        }

        Ok(())
    }

    // --- memory --------------------------------------------------------

    /// Reads `count` elements of `size` bytes each from `address`.
    pub fn read_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), XtensaError> {
        self.ensure_known_state()?;
        let result = self.interface.read_memory(address, size, count, buffer);
        self.check_wire_result(result)
    }

    /// Writes `count` elements of `size` bytes each to `address`.
    pub fn write_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), XtensaError> {
        self.ensure_known_state()?;
        let result = self.interface.write_memory(address, size, count, buffer);
        self.check_wire_result(result)
    }

    /// Reads a byte buffer from `address` with no alignment requirements.
    pub fn read_buffer(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), XtensaError> {
        self.ensure_known_state()?;
        let result = self.interface.read_buffer(address, buffer);
        self.check_wire_result(result)
    }

    /// Writes a byte buffer to `address` with no alignment requirements.
    pub fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> Result<(), XtensaError> {
        self.ensure_known_state()?;
        let result = self.interface.write_buffer(address, buffer);
        self.check_wire_result(result)
    }

    /// Precondition failures leave the driver state alone, but a wire-level
    /// or debug-module failure means nothing can be assumed anymore.
    fn check_wire_result(&mut self, result: Result<(), XtensaError>) -> Result<(), XtensaError> {
        if let Err(XtensaError::DebugProbe(_) | XtensaError::Xdm(_)) = &result {
            self.lose_state();
        }
        result
    }

    // --- registers -----------------------------------------------------

    /// Reads a register by its GDB table index.
    pub fn read_register(&mut self, index: usize) -> Result<u32, XtensaError> {
        self.ensure_known_state()?;
        self.interface.read_register(index, false)
    }

    /// Writes a register by its GDB table index. The value reaches the core
    /// when execution resumes.
    pub fn write_register(&mut self, index: usize, value: u32) -> Result<(), XtensaError> {
        self.ensure_known_state()?;
        self.interface.write_register(index, value)
    }

    /// Returns the GDB register list: descriptor and cached state of all 85
    /// registers, in wire order.
    pub fn gdb_reg_list(&self) -> Vec<(&'static RegisterDescriptor, CacheEntry)> {
        (0..XT_NUM_REGS)
            .map(|i| (&ESP108_REGISTERS[i], *self.interface.cache_entry(i)))
            .collect()
    }

    // --- breakpoints ---------------------------------------------------

    /// Installs a breakpoint in a free IBREAK unit.
    pub fn add_breakpoint(&mut self, breakpoint: Breakpoint) -> Result<(), XtensaError> {
        self.ensure_known_state()?;

        if self.state != TargetState::Halted {
            tracing::warn!("Breakpoint requested but target is not halted");
            return Err(XtensaError::NotHalted);
        }

        if breakpoint.kind == BreakpointKind::Software {
            tracing::error!("Software breakpoint requested, but only hardware breakpoints are supported");
            return Err(XtensaError::SoftwareBreakpointsUnsupported);
        }

        if self.free_breakpoints == 0 {
            tracing::error!("No free IBREAK unit available for hardware breakpoint");
            return Err(XtensaError::NoFreeBreakpointUnit);
        }

        let slot = self
            .breakpoints
            .iter()
            .position(Option::is_none)
            .expect("free_breakpoints and the slot table disagree. This is a bug.");

        self.interface
            .write_special_and_flush(Self::IBREAKA_REGS[slot], breakpoint.address)?;
        self.interface
            .write_special_and_flush(sr::IBREAKENABLE, self.breakpoint_mask() | (1 << slot))?;

        self.breakpoints[slot] = Some(breakpoint);
        self.free_breakpoints -= 1;

        tracing::debug!(
            "Set breakpoint at {:#010x} in IBREAK{slot}",
            breakpoint.address
        );
        Ok(())
    }

    /// Removes a previously installed breakpoint.
    ///
    /// # Panics
    ///
    /// Panics if `breakpoint` was never installed; the host framework owns
    /// the breakpoint list and only hands back records it got from us.
    pub fn remove_breakpoint(&mut self, breakpoint: &Breakpoint) -> Result<(), XtensaError> {
        self.ensure_known_state()?;

        if self.state != TargetState::Halted {
            tracing::warn!("Breakpoint removal requested but target is not halted");
            return Err(XtensaError::NotHalted);
        }

        let slot = self
            .breakpoints
            .iter()
            .position(|slot| slot.as_ref() == Some(breakpoint))
            .expect("Breakpoint slot not found. This is a bug.");

        // IBREAKA keeps its stale address; clearing the enable bit is
        // enough.
        self.breakpoints[slot] = None;
        self.interface
            .write_special_and_flush(sr::IBREAKENABLE, self.breakpoint_mask())?;

        self.free_breakpoints += 1;
        debug_assert!(self.free_breakpoints <= XT_NUM_BREAKPOINTS);

        Ok(())
    }

    /// Returns the number of unused IBREAK units.
    pub fn free_breakpoint_units(&self) -> usize {
        self.free_breakpoints
    }

    /// Returns the installed breakpoints, by slot.
    pub fn breakpoints(&self) -> &[Option<Breakpoint>; XT_NUM_BREAKPOINTS] {
        &self.breakpoints
    }

    fn breakpoint_mask(&self) -> u32 {
        self.breakpoints
            .iter()
            .enumerate()
            .fold(0, |acc, (i, slot)| {
                if slot.is_some() {
                    acc | (1 << i)
                } else {
                    acc
                }
            })
    }

    // --- internal ------------------------------------------------------

    /// A reset wipes the register file and the IBREAK units; drop every
    /// mirror of on-chip state.
    fn on_reset_observed(&mut self) {
        self.state = TargetState::Reset;
        self.interface.invalidate_cache();
        self.interface.set_halted(false);
        self.halt_reason = None;
        self.breakpoints = [None; XT_NUM_BREAKPOINTS];
        self.free_breakpoints = XT_NUM_BREAKPOINTS;
    }

    /// After a failed flush nothing can be assumed about the core anymore.
    fn lose_state(&mut self) {
        self.state = TargetState::Unknown;
        self.interface.invalidate_cache();
        self.interface.set_halted(false);
        self.halt_reason = None;
    }
}
