//! A JTAG debug-target driver for the ESP108, the Tensilica 108Mini core
//! inside the ESP32.
//!
//! The JTAG pins talk to a TAP with a 5-bit instruction register. One
//! instruction matters for debugging: NARSEL, which alternatingly presents
//! the Nexus Address and Data registers as the DR and so reaches the 128
//! registers of the on-chip debug module. Debugging is mostly done by using
//! those registers to feed the core instructions to execute, combined with a
//! data register (DDR) that is directly readable and writable from the JTAG
//! port.
//!
//! On top of that wire protocol this crate layers:
//!
//! - [`probe::JtagAccess`], the queued transport contract a probe driver
//!   implements;
//! - [`xdm::Xdm`], the Nexus transaction and power-handshake layer;
//! - [`communication_interface::XtensaCommunicationInterface`], the
//!   instruction-injection engine with the register file and memory access;
//! - [`Esp108`], the target state machine the host debugger drives.
//!
//! The core cannot be debugged while its power and debug domains sleep, so
//! every poll re-runs the PWRCTL wakeup handshake; see the module
//! documentation of [`xdm`] for the JTAGDEBUGUSE arming rules.

pub mod arch;
pub mod communication_interface;
pub mod core;
pub mod probe;
pub mod register_cache;
pub mod registers;
pub mod xdm;

pub use crate::communication_interface::{XtensaCommunicationInterface, XtensaError};
pub use crate::core::{
    Breakpoint, BreakpointKind, Esp108, HaltReason, TargetState, XT_NUM_BREAKPOINTS,
};

/// The top-level error type handed to the host framework.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// An error with the debug probe occurred.
    Probe(#[from] probe::DebugProbeError),

    /// An Xtensa driver error occurred: {0}
    Xtensa(#[source] XtensaError),
}

impl From<XtensaError> for Error {
    fn from(err: XtensaError) -> Self {
        match err {
            XtensaError::DebugProbe(e) => Error::Probe(e),
            other => Error::Xtensa(other),
        }
    }
}
