//! Xtensa debug-module communication: instruction injection, the register
//! file and the memory-access engine.
//!
//! Everything here is built from two primitives: writing an instruction word
//! to DIR0EXEC (the core executes it immediately) and moving 32-bit values
//! through the DDR data-exchange register. A queued sequence must alternate
//! injections and DDR traffic so that each instruction executes between the
//! DDR write it consumes and the DDR read that collects its result; the
//! schedule_* functions below preserve that ordering by construction.

use crate::arch::instruction::Instruction;
use crate::arch::{sr, CpuRegister, Register};
use crate::probe::{DebugProbeError, DeferredResultIndex, JtagAccess};
use crate::register_cache::{CacheEntry, RegisterCache};
use crate::registers::{
    general_index, ESP108_REGISTERS, REG_IDX_AR0, REG_IDX_AR1, REG_IDX_DDR, XT_NUM_REGS,
};
use crate::xdm::{Xdm, XdmError};

/// Possible Xtensa driver errors.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum XtensaError {
    /// An error originating from the debug probe occurred.
    DebugProbe(#[from] DebugProbeError),

    /// The Xtensa debug module reported an error.
    Xdm(#[from] XdmError),

    /// The operation requires a halted core.
    NotHalted,

    /// A memory access was not aligned to its element size.
    UnalignedAccess,

    /// An argument was outside the range the debug module can express.
    InvalidArgument,

    /// All hardware breakpoint units are in use.
    NoFreeBreakpointUnit,

    /// The core supports hardware breakpoints only.
    SoftwareBreakpointsUnsupported,

    /// The operation has timed out.
    Timeout,

    /// The result of a batched command is not available.
    BatchedResultNotAvailable,

    /// The driver lost track of the target state; re-examine the target.
    StateLost,
}

bitfield::bitfield! {
    /// The `DEBUGCAUSE` register.
    #[derive(Copy, Clone)]
    pub struct DebugCause(u32);
    impl Debug;

    /// Instruction counter exception
    pub icount_exception,    _: 0;

    /// Instruction breakpoint exception
    pub ibreak_exception,    _: 1;

    /// Data breakpoint (watchpoint) exception
    pub dbreak_exception,    _: 2;

    /// Break instruction exception
    pub break_instruction,   _: 3;

    /// Narrow Break instruction exception
    pub break_n_instruction, _: 4;

    /// Debug interrupt exception
    pub debug_interrupt,     _: 5;

    /// Data breakpoint number
    pub dbreak_num,          _: 11, 8;
}

/// All the LxxI/SxxI instructions take an 8-bit element offset, so memory
/// requests are broken into runs of at most this many elements.
const MAX_MEMORY_CHUNK: u32 = 255;

/// The higher level of the XDM functionality: translates register and memory
/// operations into injected-instruction recipes.
pub struct XtensaCommunicationInterface {
    /// The TAP-facing half of the driver.
    pub(crate) xdm: Xdm,
    cache: RegisterCache,
    is_halted: bool,
}

impl XtensaCommunicationInterface {
    /// Creates the communication interface on top of a JTAG probe.
    pub fn new(probe: Box<dyn JtagAccess>) -> Self {
        Self {
            xdm: Xdm::new(probe),
            cache: RegisterCache::new(),
            is_halted: false,
        }
    }

    /// Returns whether the driver believes the core to be halted.
    pub fn is_halted(&self) -> bool {
        self.is_halted
    }

    pub(crate) fn set_halted(&mut self, halted: bool) {
        self.is_halted = halted;
    }

    /// Returns a view of the register cache entry at `index`.
    pub fn cache_entry(&self, index: usize) -> &CacheEntry {
        self.cache.entry(index)
    }

    /// Drops every cached register value.
    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate_all();
    }

    // --- injection recipes ---------------------------------------------

    /// AR -> host: move the register through DDR.
    fn schedule_read_cpu_register(&mut self, register: CpuRegister) -> DeferredResultIndex {
        self.xdm
            .schedule_execute_instruction(Instruction::Wsr(sr::DDR, register));
        self.xdm.schedule_read_ddr()
    }

    /// host -> AR: stage the value in DDR, then pull it into the register.
    fn schedule_write_cpu_register(&mut self, register: CpuRegister, value: u32) {
        self.xdm.schedule_write_ddr(value);
        self.xdm
            .schedule_execute_instruction(Instruction::Rsr(sr::DDR, register));
    }

    /// SR -> host via the a0 scratch register. The caller owns a0.
    fn schedule_read_special(&mut self, number: u8) -> DeferredResultIndex {
        self.xdm
            .schedule_execute_instruction(Instruction::Rsr(number, CpuRegister::A0));
        self.schedule_read_cpu_register(CpuRegister::A0)
    }

    /// host -> SR via the a0 scratch register. The caller owns a0.
    fn schedule_write_special(&mut self, number: u8, value: u32) {
        self.schedule_write_cpu_register(CpuRegister::A0, value);
        self.xdm
            .schedule_execute_instruction(Instruction::Wsr(number, CpuRegister::A0));
    }

    /// UR -> host via the a0 scratch register. The caller owns a0.
    fn schedule_read_user(&mut self, number: u8) -> DeferredResultIndex {
        self.xdm
            .schedule_execute_instruction(Instruction::Rur(number, CpuRegister::A0));
        self.schedule_read_cpu_register(CpuRegister::A0)
    }

    /// host -> UR via the a0 scratch register. The caller owns a0.
    fn schedule_write_user(&mut self, number: u8, value: u32) {
        self.schedule_write_cpu_register(CpuRegister::A0, value);
        self.xdm
            .schedule_execute_instruction(Instruction::Wur(number, CpuRegister::A0));
    }

    /// Schedules a read of any table register.
    ///
    /// AR registers beyond the visible window are reached by rotating the
    /// window in WINDOWBASE steps of 4; the rotation is always completed to
    /// a full cycle so the window base ends up where it started.
    fn schedule_read_register(&mut self, register: Register) -> DeferredResultIndex {
        match register {
            Register::General(n) if n < 16 => {
                self.schedule_read_cpu_register(CpuRegister::windowed(n))
            }
            Register::General(n) => {
                let rotations = n / 16;
                for _ in 0..rotations {
                    self.xdm.schedule_execute_instruction(Instruction::Rotw(4));
                }
                let reader = self.schedule_read_cpu_register(CpuRegister::windowed(n % 16));
                for _ in rotations..4 {
                    self.xdm.schedule_execute_instruction(Instruction::Rotw(4));
                }
                reader
            }
            Register::Special(n) => self.schedule_read_special(n),
            Register::User(n) => self.schedule_read_user(n),
            Register::Debug(_) => self.xdm.schedule_read_ddr(),
        }
    }

    /// Schedules a write of any table register.
    fn schedule_write_register(&mut self, register: Register, value: u32) {
        match register {
            Register::General(n) if n < 16 => {
                self.schedule_write_cpu_register(CpuRegister::windowed(n), value)
            }
            Register::General(n) => {
                let rotations = n / 16;
                for _ in 0..rotations {
                    self.xdm.schedule_execute_instruction(Instruction::Rotw(4));
                }
                self.schedule_write_cpu_register(CpuRegister::windowed(n % 16), value);
                for _ in rotations..4 {
                    self.xdm.schedule_execute_instruction(Instruction::Rotw(4));
                }
            }
            Register::Special(n) => self.schedule_write_special(n, value),
            Register::User(n) => self.schedule_write_user(n, value),
            Register::Debug(_) => self.xdm.schedule_write_ddr(value),
        }
    }

    // --- scratch bookkeeping -------------------------------------------

    /// Sets up a register we intend to clobber for scratch purposes.
    ///
    /// The current value is pulled into the cache if it is not there yet,
    /// and the entry is marked dirty up front so the restore path writes it
    /// back even if the operation that needed the scratch errors out early.
    fn acquire_scratch(&mut self, index: usize) -> Result<(), XtensaError> {
        if !self.cache.entry(index).is_valid() {
            let Register::General(n) = ESP108_REGISTERS[index].register else {
                panic!("scratch register at index {index} is not general. This is a bug.");
            };
            let reader = self.schedule_read_cpu_register(CpuRegister::windowed(n));
            let value = self.xdm.read_deferred_result(reader)?.into_u32();
            self.cache.update(index, value);
        }
        self.cache.mark_dirty(index);
        Ok(())
    }

    // --- cache-routed register access ----------------------------------

    /// Reads a register by table index, going through the cache.
    ///
    /// A valid entry is served from the cache unless `force` is set; a dirty
    /// entry is always served from the cache, because the target copy is the
    /// stale one.
    pub fn read_register(&mut self, index: usize, force: bool) -> Result<u32, XtensaError> {
        if index >= XT_NUM_REGS {
            return Err(XtensaError::InvalidArgument);
        }

        let entry = self.cache.entry(index);
        if (entry.is_valid() && !force) || entry.is_dirty() {
            return Ok(entry.value());
        }

        if !self.is_halted {
            return Err(XtensaError::NotHalted);
        }

        let descriptor = &ESP108_REGISTERS[index];
        if needs_scratch(descriptor.register) {
            self.acquire_scratch(REG_IDX_AR0)?;
        }

        let reader = self.schedule_read_register(descriptor.register);
        let value = self.xdm.read_deferred_result(reader)?.into_u32();

        tracing::debug!("Read register {}: {value:#010x}", descriptor.name);
        self.cache.update(index, value);

        Ok(value)
    }

    /// Writes a register by table index.
    ///
    /// The write lands in the cache and is flushed to the core by
    /// [`XtensaCommunicationInterface::restore_context`] before resuming.
    pub fn write_register(&mut self, index: usize, value: u32) -> Result<(), XtensaError> {
        if index >= XT_NUM_REGS {
            return Err(XtensaError::InvalidArgument);
        }
        if !self.is_halted {
            return Err(XtensaError::NotHalted);
        }

        self.cache.set_value(index, value);
        Ok(())
    }

    /// Writes a special register that has no table entry, such as ICOUNT or
    /// the IBREAK registers, and flushes the queue.
    pub(crate) fn write_special_and_flush(
        &mut self,
        number: u8,
        value: u32,
    ) -> Result<(), XtensaError> {
        if !self.is_halted {
            return Err(XtensaError::NotHalted);
        }

        self.acquire_scratch(REG_IDX_AR0)?;
        self.schedule_write_special(number, value);
        self.invalidate_special_aliases(number);
        self.xdm.execute()
    }

    /// Invalidates every table entry carrying the given SR number.
    ///
    /// With DEBUG_LEVEL = 6 the only live alias is `pc`/EPC6, but writes
    /// through one name must not leave a stale value behind another.
    fn invalidate_special_aliases(&mut self, number: u8) {
        for (index, descriptor) in ESP108_REGISTERS.iter().enumerate() {
            if descriptor.register == Register::Special(number)
                && !self.cache.entry(index).is_dirty()
            {
                self.cache.invalidate(index);
            }
        }
    }

    // --- bulk transfer -------------------------------------------------

    /// Fills the register cache with the full architectural state and
    /// returns the DEBUGCAUSE value sampled in the same batch.
    ///
    /// Assumes the core has just halted. All read operations are pipelined
    /// into one batch, executed in one go, and sorted out afterwards.
    pub fn fetch_all_registers(&mut self) -> Result<DebugCause, XtensaError> {
        let mut readers = Vec::with_capacity(XT_NUM_REGS);

        // DDR first; every recipe below clobbers it.
        readers.push((REG_IDX_DDR, self.xdm.schedule_read_ddr()));

        // A0..A15 before anything scribbles over them.
        for i in 0..16u8 {
            readers.push((
                general_index(i),
                self.schedule_read_cpu_register(CpuRegister::windowed(i)),
            ));
        }

        // The visible window is captured, so a0 is free as a scratch
        // register for the special and user registers.
        for (index, descriptor) in ESP108_REGISTERS.iter().enumerate() {
            match descriptor.register {
                Register::Special(n) => readers.push((index, self.schedule_read_special(n))),
                Register::User(n) => readers.push((index, self.schedule_read_user(n))),
                Register::General(_) | Register::Debug(_) => {}
            }
        }

        // DEBUGCAUSE has no table entry but the halt handling wants it.
        let cause_reader = self.schedule_read_special(sr::DEBUGCAUSE);

        // A16..A63: rotate the window in steps of four WINDOWBASE units and
        // capture each newly visible window. The fourth rotation completes
        // the cycle, leaving WINDOWBASE where it started.
        for window in 1..4u8 {
            self.xdm.schedule_execute_instruction(Instruction::Rotw(4));
            for i in 0..16u8 {
                readers.push((
                    general_index(window * 16 + i),
                    self.schedule_read_cpu_register(CpuRegister::windowed(i)),
                ));
            }
        }
        self.xdm.schedule_execute_instruction(Instruction::Rotw(4));

        self.xdm.execute()?;

        for (index, reader) in readers {
            let value = self.xdm.read_deferred_result(reader)?.into_u32();
            self.cache.update(index, value);
            tracing::trace!(
                "Register {}: {value:#010x}",
                ESP108_REGISTERS[index].name
            );
        }

        let cause = DebugCause(self.xdm.read_deferred_result(cause_reader)?.into_u32());

        // The scratch traffic above left the value of the last special read
        // in a0; put the captured value back so every entry really is clean.
        let a0 = self.cache.entry(REG_IDX_AR0).value();
        self.schedule_write_cpu_register(CpuRegister::A0, a0);
        self.xdm.execute()?;

        Ok(cause)
    }

    /// Writes every dirty cache entry back to the core.
    ///
    /// Special, user and debug registers go first (highest table index
    /// first), general registers after, because the SR/UR write recipes use
    /// a0 as scratch and would clobber freshly restored AR values.
    pub fn restore_context(&mut self) -> Result<(), XtensaError> {
        if !self.is_halted {
            return Err(XtensaError::NotHalted);
        }

        tracing::debug!("Restoring context");

        // Writing a special or user register goes through a0, so a0 itself
        // must join the dirty set before it is collected; the general pass
        // below then rewrites it after the scratch traffic is over.
        let scratch_needed = self
            .cache
            .dirty_indices_descending()
            .any(|i| needs_scratch(ESP108_REGISTERS[i].register));
        if scratch_needed {
            self.acquire_scratch(REG_IDX_AR0)?;
        }

        let dirty: Vec<usize> = self.cache.dirty_indices_descending().collect();

        for &index in dirty
            .iter()
            .filter(|&&i| !matches!(ESP108_REGISTERS[i].register, Register::General(_)))
        {
            let value = self.cache.entry(index).value();
            self.schedule_write_register(ESP108_REGISTERS[index].register, value);
            self.cache.mark_clean(index);
        }

        for &index in dirty
            .iter()
            .filter(|&&i| matches!(ESP108_REGISTERS[i].register, Register::General(_)))
        {
            let value = self.cache.entry(index).value();
            self.schedule_write_register(ESP108_REGISTERS[index].register, value);
            self.cache.mark_clean(index);
        }

        self.xdm.execute()
    }

    // --- memory access -------------------------------------------------

    /// Reads `count` elements of `size` bytes each from `address`.
    ///
    /// `size` must be 1, 2 or 4 and `address` must be aligned to it;
    /// 16/32-bit accesses to misaligned addresses are fatal on this core.
    pub fn read_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), XtensaError> {
        self.check_memory_args(address, size, count, buffer.len())?;

        tracing::debug!("Reading {count} x {size} bytes from {address:#010x}");

        // a0 holds the chunk base address, a1 the element in flight.
        self.acquire_scratch(REG_IDX_AR0)?;
        self.acquire_scratch(REG_IDX_AR1)?;

        let mut address = address;
        let mut remaining = count;
        let mut buffer = &mut buffer[..(size * count) as usize];

        while remaining > 0 {
            let chunk = remaining.min(MAX_MEMORY_CHUNK);
            let (chunk_buf, rest) =
                std::mem::take(&mut buffer).split_at_mut((chunk * size) as usize);

            self.read_memory_chunk(address, size, chunk, chunk_buf)?;

            address += chunk * size;
            remaining -= chunk;
            buffer = rest;
        }

        Ok(())
    }

    fn read_memory_chunk(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), XtensaError> {
        self.schedule_write_cpu_register(CpuRegister::A0, address);

        let mut readers = Vec::with_capacity(count as usize);
        for imm8 in 0..count as u8 {
            let load = match size {
                4 => Instruction::L32I(CpuRegister::A0, CpuRegister::A1, imm8),
                2 => Instruction::L16Ui(CpuRegister::A0, CpuRegister::A1, imm8),
                _ => Instruction::L8Ui(CpuRegister::A0, CpuRegister::A1, imm8),
            };
            self.xdm.schedule_execute_instruction(load);
            self.xdm
                .schedule_execute_instruction(Instruction::Wsr(sr::DDR, CpuRegister::A1));
            readers.push(
                self.xdm
                    .schedule_nexus_read_sized(crate::xdm::naradr::DDR, 8 * size),
            );
        }

        self.xdm.execute()?;
        self.xdm.status()?.check_exec()?;

        for (i, reader) in readers.into_iter().enumerate() {
            let value = self.xdm.read_deferred_result(reader)?.into_u32();
            let bytes = value.to_le_bytes();
            buffer[i * size as usize..][..size as usize].copy_from_slice(&bytes[..size as usize]);
        }

        Ok(())
    }

    /// Writes `count` elements of `size` bytes each to `address`.
    pub fn write_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), XtensaError> {
        self.check_memory_args(address, size, count, buffer.len())?;

        tracing::debug!("Writing {count} x {size} bytes to {address:#010x}");

        self.acquire_scratch(REG_IDX_AR0)?;
        self.acquire_scratch(REG_IDX_AR1)?;

        let mut address = address;
        let mut remaining = count;
        let mut buffer = &buffer[..(size * count) as usize];

        while remaining > 0 {
            let chunk = remaining.min(MAX_MEMORY_CHUNK);
            let (chunk_buf, rest) = buffer.split_at((chunk * size) as usize);

            self.write_memory_chunk(address, size, chunk, chunk_buf)?;

            address += chunk * size;
            remaining -= chunk;
            buffer = rest;
        }

        Ok(())
    }

    fn write_memory_chunk(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), XtensaError> {
        self.schedule_write_cpu_register(CpuRegister::A0, address);

        for imm8 in 0..count as u8 {
            let mut bytes = [0u8; 4];
            bytes[..size as usize]
                .copy_from_slice(&buffer[imm8 as usize * size as usize..][..size as usize]);
            self.schedule_write_cpu_register(CpuRegister::A1, u32::from_le_bytes(bytes));

            let store = match size {
                4 => Instruction::S32I(CpuRegister::A0, CpuRegister::A1, imm8),
                2 => Instruction::S16I(CpuRegister::A0, CpuRegister::A1, imm8),
                _ => Instruction::S8I(CpuRegister::A0, CpuRegister::A1, imm8),
            };
            self.xdm.schedule_execute_instruction(store);
        }

        self.xdm.execute()?;
        self.xdm.status()?.check_exec()?;

        Ok(())
    }

    fn check_memory_args(
        &self,
        address: u32,
        size: u32,
        count: u32,
        buffer_len: usize,
    ) -> Result<(), XtensaError> {
        if !self.is_halted {
            return Err(XtensaError::NotHalted);
        }
        if !matches!(size, 1 | 2 | 4) || count == 0 {
            return Err(XtensaError::InvalidArgument);
        }
        let Some(bytes) = size.checked_mul(count) else {
            return Err(XtensaError::InvalidArgument);
        };
        if buffer_len < bytes as usize {
            return Err(XtensaError::InvalidArgument);
        }
        if address % size != 0 {
            return Err(XtensaError::UnalignedAccess);
        }
        Ok(())
    }

    /// Reads `buffer.len()` bytes from `address` with no alignment
    /// requirements.
    ///
    /// The access is widened to aligned 32-bit reads; IRAM and IROM only
    /// tolerate word-sized accesses.
    pub fn read_buffer(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), XtensaError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let aligned_address = address & !3;
        let aligned_count = ((address + buffer.len() as u32 + 3) & !3) - aligned_address;

        if aligned_address == address && aligned_count as usize == buffer.len() {
            return self.read_memory(address, 4, aligned_count / 4, buffer);
        }

        let mut aligned = vec![0u8; aligned_count as usize];
        self.read_memory(aligned_address, 4, aligned_count / 4, &mut aligned)?;

        let offset = (address & 3) as usize;
        buffer.copy_from_slice(&aligned[offset..][..buffer.len()]);
        Ok(())
    }

    /// Writes `buffer` to `address` with no alignment requirements.
    ///
    /// Partial head and tail words are completed with a read-modify-write so
    /// the whole transfer can run as aligned 32-bit stores.
    pub fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> Result<(), XtensaError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let aligned_address = address & !3;
        let aligned_count = ((address + buffer.len() as u32 + 3) & !3) - aligned_address;

        if aligned_address == address && aligned_count as usize == buffer.len() {
            return self.write_memory(address, 4, aligned_count / 4, buffer);
        }

        let mut aligned = vec![0u8; aligned_count as usize];

        // Fill in the head word with what is currently in memory.
        self.read_buffer(aligned_address, &mut aligned[..4])?;
        if aligned_count > 4 {
            // Same for the tail word.
            let tail = aligned_count as usize - 4;
            self.read_buffer(aligned_address + tail as u32, &mut aligned[tail..])?;
        }

        let offset = (address & 3) as usize;
        aligned[offset..][..buffer.len()].copy_from_slice(buffer);

        self.write_memory(aligned_address, 4, aligned_count / 4, &aligned)
    }
}

/// Whether accessing the register clobbers a0.
fn needs_scratch(register: Register) -> bool {
    matches!(register, Register::Special(_) | Register::User(_))
}
