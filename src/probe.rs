//! The JTAG transport contract consumed by the driver.
//!
//! The driver never talks to a probe directly; it enqueues IR+DR shift pairs
//! into a [`JtagCommandQueue`] and flushes them in one batch. Captured scan
//! data only becomes observable through a [`DeferredResultIndex`] after the
//! flush returns, which makes "read before flush" unrepresentable.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;

pub mod fake_probe;

/// An error of the debug probe itself.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum DebugProbeError {
    /// A USB transfer error occurred: {0}
    Usb(String),

    /// The probe operation timed out.
    Timeout,

    /// No answering TAP was found on the scan chain.
    TargetNotFound,

    /// The probe does not support this operation: {0}.
    NotImplemented(&'static str),

    /// A probe-specific error occurred: {0}
    Other(String),
}

/// Low-level access to a JTAG scan chain with a single Xtensa TAP.
///
/// `address` is the IR opcode to select before the DR shift. Implementations
/// own the IR width and must leave the TAP in the Run-Test/Idle state after
/// every scan.
pub trait JtagAccess: fmt::Debug {
    /// Configures the length of the TAP instruction register in bits.
    fn set_ir_length(&mut self, len: u8);

    /// Configures the number of idle cycles inserted after each DR access.
    fn set_idle_cycles(&mut self, idle_cycles: u8);

    /// Returns the currently configured idle cycles.
    fn idle_cycles(&self) -> u8;

    /// Read a JTAG register.
    ///
    /// This emulates a read by performing a write with all zeros to the DR.
    fn read_register(&mut self, address: u32, len: u32) -> Result<BitVec, DebugProbeError> {
        let data = vec![0u8; len.div_ceil(8) as usize];

        self.write_register(address, &data, len)
    }

    /// Write to a JTAG register.
    ///
    /// Selects `address` in the IR if necessary, then shifts `len` bits of
    /// `data` through the DR. The bits shifted out of the DR are returned.
    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
    ) -> Result<BitVec, DebugProbeError>;

    /// Executes a queue of JTAG commands as one batch.
    ///
    /// Commands execute strictly in enqueue order. On the first failing
    /// command the batch stops and the results gathered so far are returned
    /// inside the error.
    fn write_register_batch(
        &mut self,
        writes: &JtagCommandQueue,
    ) -> Result<DeferredResultSet, BatchExecutionError> {
        let mut results = DeferredResultSet::new();

        for (idx, write) in writes.iter() {
            match self
                .write_register(write.address, &write.data, write.len)
                .map_err(crate::Error::Probe)
                .and_then(|response| (write.transform)(write, &response))
            {
                Ok(res) => results.push(idx, res),
                Err(e) => return Err(BatchExecutionError::new(e, results)),
            }
        }

        Ok(results)
    }

    /// Asserts the target reset line.
    fn target_reset_assert(&mut self) -> Result<(), DebugProbeError>;

    /// Deasserts the target reset line.
    fn target_reset_deassert(&mut self) -> Result<(), DebugProbeError>;
}

/// A low-level JTAG register write command.
#[derive(Debug, Clone)]
pub struct JtagWriteCommand {
    /// The IR opcode selecting the register to write to.
    pub address: u32,

    /// The data to be shifted into the DR.
    pub data: Vec<u8>,

    /// The number of bits in `data`.
    pub len: u32,

    /// A function to transform the raw response into a [`CommandResult`].
    pub transform: fn(&JtagWriteCommand, &BitSlice) -> Result<CommandResult, crate::Error>,
}

/// Results generated by executed [`JtagWriteCommand`]s.
#[derive(Debug, Clone)]
pub enum CommandResult {
    /// No result.
    None,

    /// A single byte.
    U8(u8),

    /// A single 32-bit word.
    U32(u32),
}

impl CommandResult {
    /// Returns the result as a `u32`.
    ///
    /// # Panics
    ///
    /// Panics if the result is not a `u32`.
    pub fn into_u32(self) -> u32 {
        match self {
            CommandResult::U32(val) => val,
            _ => panic!("CommandResult is not a u32"),
        }
    }

    /// Returns the result as a `u8`.
    ///
    /// # Panics
    ///
    /// Panics if the result is not a `u8`.
    pub fn into_u8(self) -> u8 {
        match self {
            CommandResult::U8(val) => val,
            _ => panic!("CommandResult is not a u8"),
        }
    }
}

/// An error that occurred during batched command execution.
#[derive(thiserror::Error, Debug)]
pub struct BatchExecutionError {
    /// The error that occurred during execution.
    #[source]
    pub error: crate::Error,

    /// The results of the commands that were executed before the error occurred.
    pub results: DeferredResultSet,
}

impl BatchExecutionError {
    pub(crate) fn new(error: crate::Error, results: DeferredResultSet) -> BatchExecutionError {
        BatchExecutionError { error, results }
    }
}

impl fmt::Display for BatchExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch failed with {}. Successful command count {}",
            self.error,
            self.results.len()
        )
    }
}

/// A set of batched commands that will be executed all at once.
///
/// This list maintains which commands' results can be read by the issuing
/// code, which is used to skip capturing unread parts of the response.
#[derive(Default, Debug)]
pub struct JtagCommandQueue {
    commands: Vec<(DeferredResultIndex, JtagWriteCommand)>,
}

impl JtagCommandQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a command for later execution.
    ///
    /// Returns a token value that can be used to retrieve the result of the
    /// command.
    pub fn schedule(&mut self, command: JtagWriteCommand) -> DeferredResultIndex {
        let index = DeferredResultIndex::new();
        self.commands.push((index.clone(), command));
        index
    }

    /// Returns the number of commands in the queue.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(DeferredResultIndex, JtagWriteCommand)> {
        self.commands.iter()
    }
}

/// The set of results returned by executing a batched command.
#[derive(Debug, Default)]
pub struct DeferredResultSet(HashMap<DeferredResultIndex, CommandResult>);

impl DeferredResultSet {
    /// Creates a new empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, idx: &DeferredResultIndex, result: CommandResult) {
        self.0.insert(idx.clone(), result);
    }

    /// Returns the number of results in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn merge_from(&mut self, other: DeferredResultSet) {
        self.0.extend(other.0);
        self.0.retain(|k, _| k.should_capture());
    }

    /// Takes a result from the set.
    pub fn take(
        &mut self,
        index: DeferredResultIndex,
    ) -> Result<CommandResult, DeferredResultIndex> {
        self.0.remove(&index).ok_or(index)
    }
}

/// An index type used to retrieve the result of a deferred command.
///
/// This type can detect if the result of a command is not used.
#[derive(Eq)]
pub struct DeferredResultIndex(Arc<()>);

impl PartialEq for DeferredResultIndex {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DeferredResultIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredResultIndex")
            .field(&self.id())
            .finish()
    }
}

impl DeferredResultIndex {
    // Intentionally private. User code must not be able to create these.
    fn new() -> Self {
        Self(Arc::new(()))
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn should_capture(&self) -> bool {
        // Both the queue and the user code may hold on to at most one of the
        // references. The queue execution can detect that the user dropped
        // their read reference, meaning the read data would be inaccessible.
        Arc::strong_count(&self.0) > 1
    }

    // Intentionally private. User code must not be able to clone these.
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl std::hash::Hash for DeferredResultIndex {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}
