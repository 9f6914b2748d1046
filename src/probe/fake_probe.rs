//! A mock probe which can be used for testing things or for dry runs.
//!
//! The fake probe terminates the JTAG wire protocol in software: it models
//! the Nexus register file, the power handshake and enough of the core (the
//! AR window, special and user registers, a byte-addressed memory) to
//! execute the instructions the driver injects through DIR0EXEC. Every scan
//! is recorded so tests can assert on the exact wire traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitvec::field::BitField;
use bitvec::vec::BitVec;

use crate::probe::{DebugProbeError, JtagAccess};
use crate::xdm::{naradr, PWRSTAT_COREWASRESET, PWRSTAT_DEBUGWASRESET};

const FAKE_IDCODE: u32 = 0x120034E5;
const FAKE_OCDID: u32 = 0x24036405;

const DCR_DEBUGINTERRUPT: u32 = 1 << 1;

const SR_DDR: u8 = 104;
const SR_DEBUGCAUSE: u8 = 233;
const SR_ICOUNT: u8 = 236;
const SR_ICOUNTLEVEL: u8 = 237;
const SR_EPC6: u8 = 182;

/// One recorded IR+DR shift pair.
#[derive(Clone, Debug)]
pub struct Scan {
    /// The IR opcode the scan selected.
    pub ir: u32,
    /// The DR length in bits.
    pub len: u32,
    /// The bytes shifted into the DR.
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct CoreModel {
    /// The physical AR register file.
    ars: [u32; 64],
    /// Current window base, in units of four registers.
    windowbase: u8,
    srs: HashMap<u8, u32>,
    urs: HashMap<u8, u32>,
    memory: HashMap<u32, u8>,
    stopped: bool,
}

impl Default for CoreModel {
    fn default() -> Self {
        Self {
            ars: [0; 64],
            windowbase: 0,
            srs: HashMap::new(),
            urs: HashMap::new(),
            memory: HashMap::new(),
            stopped: false,
        }
    }
}

impl CoreModel {
    fn ar(&self, operand: u8) -> u32 {
        self.ars[self.physical(operand)]
    }

    fn set_ar(&mut self, operand: u8, value: u32) {
        let index = self.physical(operand);
        self.ars[index] = value;
    }

    fn physical(&self, operand: u8) -> usize {
        (self.windowbase as usize * 4 + operand as usize) % 64
    }

    fn sr(&self, number: u8) -> u32 {
        self.srs.get(&number).copied().unwrap_or(0)
    }

    fn load(&self, address: u32, size: u32) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate().take(size as usize) {
            *byte = self
                .memory
                .get(&(address + i as u32))
                .copied()
                .unwrap_or(0);
        }
        u32::from_le_bytes(bytes)
    }

    fn store(&mut self, address: u32, size: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate().take(size as usize) {
            self.memory.insert(address + i as u32, *byte);
        }
    }

    fn halt(&mut self, debug_cause: u32) {
        self.stopped = true;
        *self.srs.entry(SR_DEBUGCAUSE).or_insert(0) |= debug_cause;
    }

    /// Executes one injected instruction word.
    fn execute(&mut self, word: u32) {
        if word & 0xFFF00F == 0x408000 {
            // ROTW
            let n = ((word >> 4) & 0x0F) as u8;
            self.windowbase = (self.windowbase + n) % 16;
            return;
        }

        if word == 0xF1E000 || word == 0xF1E100 {
            // RFDO; when the instruction counter is armed, the core retires
            // a single instruction and drops right back into the debug
            // exception.
            self.srs.insert(SR_DEBUGCAUSE, 0);
            if self.sr(SR_ICOUNTLEVEL) > 0 && self.sr(SR_ICOUNT) != 0 {
                let pc = self.sr(SR_EPC6).wrapping_add(3);
                self.srs.insert(SR_EPC6, pc);
                self.srs.insert(SR_ICOUNT, 0);
                self.halt(1 << 0);
            } else {
                self.stopped = false;
            }
            return;
        }

        let op0 = word & 0x0F;
        let t = ((word >> 4) & 0x0F) as u8;

        if op0 == 0 {
            let sr = ((word >> 8) & 0xFF) as u8;
            match (word >> 16) & 0xFF {
                // RSR
                0x03 => {
                    let value = self.sr(sr);
                    self.set_ar(t, value);
                }
                // WSR
                0x13 => {
                    let value = self.ar(t);
                    self.srs.insert(sr, value);
                }
                // XSR
                0x61 => {
                    let ar = self.ar(t);
                    let old = self.sr(sr);
                    self.srs.insert(sr, ar);
                    self.set_ar(t, old);
                }
                // RUR; the user register number spans the s and t slots.
                0xE3 => {
                    let ur = ((word >> 4) & 0xFF) as u8;
                    let r = ((word >> 12) & 0x0F) as u8;
                    let value = self.urs.get(&ur).copied().unwrap_or(0);
                    self.set_ar(r, value);
                }
                // WUR
                0xF3 => {
                    let value = self.ar(t);
                    self.urs.insert(sr, value);
                }
                _ => {}
            }
            return;
        }

        if op0 == 2 {
            let r = (word >> 12) & 0x0F;
            let s = ((word >> 8) & 0x0F) as u8;
            let imm8 = (word >> 16) & 0xFF;
            match r {
                // L8UI / L16UI / L32I
                0 => {
                    let value = self.load(self.ar(s) + imm8, 1);
                    self.set_ar(t, value);
                }
                1 => {
                    let value = self.load(self.ar(s) + imm8 * 2, 2);
                    self.set_ar(t, value);
                }
                2 => {
                    let value = self.load(self.ar(s) + imm8 * 4, 4);
                    self.set_ar(t, value);
                }
                // S8I / S16I / S32I
                4 => self.store(self.ar(s) + imm8, 1, self.ar(t)),
                5 => self.store(self.ar(s) + imm8 * 2, 2, self.ar(t)),
                6 => self.store(self.ar(s) + imm8 * 4, 4, self.ar(t)),
                _ => {}
            }
        }
    }
}

#[derive(Debug)]
struct FakeProbeInner {
    ir_length: u8,
    idle_cycles: u8,
    pwrctl: u8,
    pwrstat: u8,
    dcr: u32,
    /// The latched Nexus address register.
    nar: u8,
    /// NARSEL alternates between the address and data registers; true when
    /// the next DR shift hits the data register.
    nar_is_data: bool,
    nexus_misc: HashMap<u8, u32>,
    core: CoreModel,
    scans: Vec<Scan>,
    reset_asserted: bool,
}

impl FakeProbeInner {
    fn new() -> Self {
        Self {
            ir_length: 5,
            idle_cycles: 0,
            pwrctl: 0,
            // A fresh device reports both sticky was-reset flags.
            pwrstat: PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET,
            dcr: 0,
            nar: 0,
            nar_is_data: false,
            nexus_misc: HashMap::new(),
            core: CoreModel::default(),
            scans: Vec::new(),
            reset_asserted: false,
        }
    }

    fn nexus_write(&mut self, address: u8, value: u32) {
        match address {
            naradr::DCRSET => {
                self.dcr |= value;
                if self.dcr & DCR_DEBUGINTERRUPT != 0 {
                    self.core.halt(1 << 5);
                }
            }
            naradr::DCRCLR => self.dcr &= !value,
            naradr::DDR => {
                self.core.srs.insert(SR_DDR, value);
            }
            naradr::DIR0EXEC => self.core.execute(value),
            _ => {
                self.nexus_misc.insert(address, value);
            }
        }
    }

    fn nexus_read(&self, address: u8) -> u32 {
        match address {
            naradr::OCDID => FAKE_OCDID,
            naradr::DSR => {
                let mut dsr = 1 << 0; // exec done
                if self.core.stopped {
                    dsr |= 1 << 4;
                }
                dsr
            }
            naradr::DDR => self.core.sr(SR_DDR),
            naradr::DCRSET | naradr::DCRCLR => self.dcr,
            _ => self.nexus_misc.get(&address).copied().unwrap_or(0),
        }
    }

    fn reset(&mut self) {
        self.pwrstat |= PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET;
        self.dcr = 0;
        self.core = CoreModel {
            memory: std::mem::take(&mut self.core.memory),
            ..CoreModel::default()
        };
    }
}

/// This is a mock probe which can be used for mocking things in tests or
/// for dry runs.
///
/// Clones share the same device model, so a test can keep one handle for
/// inspection while the driver owns the other.
#[derive(Clone, Debug)]
pub struct FakeProbe {
    inner: Arc<Mutex<FakeProbeInner>>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProbe {
    /// Creates a fake probe attached to a freshly reset device.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeProbeInner::new())),
        }
    }

    /// Returns all scans recorded so far.
    pub fn scans(&self) -> Vec<Scan> {
        self.inner.lock().unwrap().scans.clone()
    }

    /// Forgets the recorded scans.
    pub fn clear_scans(&self) {
        self.inner.lock().unwrap().scans.clear();
    }

    /// Stops or resumes the modeled core.
    pub fn set_halted(&self, halted: bool) {
        let mut inner = self.inner.lock().unwrap();
        if halted {
            inner.core.halt(1 << 5);
        } else {
            inner.core.stopped = false;
        }
    }

    /// Simulates an external reset.
    pub fn trigger_reset(&self) {
        self.inner.lock().unwrap().reset();
    }

    /// Returns whether the reset line is currently asserted.
    pub fn reset_asserted(&self) -> bool {
        self.inner.lock().unwrap().reset_asserted
    }

    /// Writes bytes into the modeled memory.
    pub fn set_memory(&self, address: u32, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for (i, byte) in data.iter().enumerate() {
            inner.core.memory.insert(address + i as u32, *byte);
        }
    }

    /// Reads bytes back out of the modeled memory.
    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        (0..len)
            .map(|i| {
                inner
                    .core
                    .memory
                    .get(&(address + i as u32))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Sets a physical AR register.
    pub fn set_ar(&self, index: usize, value: u32) {
        self.inner.lock().unwrap().core.ars[index] = value;
    }

    /// Returns a physical AR register.
    pub fn ar(&self, index: usize) -> u32 {
        self.inner.lock().unwrap().core.ars[index]
    }

    /// Sets a special register of the modeled core.
    pub fn set_special(&self, number: u8, value: u32) {
        self.inner.lock().unwrap().core.srs.insert(number, value);
    }

    /// Returns a special register of the modeled core.
    pub fn special(&self, number: u8) -> u32 {
        self.inner.lock().unwrap().core.sr(number)
    }

    /// Sets a user register of the modeled core.
    pub fn set_user(&self, number: u8, value: u32) {
        self.inner.lock().unwrap().core.urs.insert(number, value);
    }
}

fn response(value: u32, len: u32) -> BitVec {
    let mut bits = BitVec::repeat(false, len as usize);
    bits.store_le(value);
    bits
}

impl JtagAccess for FakeProbe {
    fn set_ir_length(&mut self, len: u8) {
        self.inner.lock().unwrap().ir_length = len;
    }

    fn set_idle_cycles(&mut self, idle_cycles: u8) {
        self.inner.lock().unwrap().idle_cycles = idle_cycles;
    }

    fn idle_cycles(&self) -> u8 {
        self.inner.lock().unwrap().idle_cycles
    }

    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
    ) -> Result<BitVec, DebugProbeError> {
        let mut inner = self.inner.lock().unwrap();

        inner.scans.push(Scan {
            ir: address,
            len,
            data: data.to_vec(),
        });

        let mut word = [0u8; 4];
        let bytes = data.len().min(4);
        word[..bytes].copy_from_slice(&data[..bytes]);
        let value = u32::from_le_bytes(word);

        // Selecting another instruction leaves NARSEL back at the address
        // register.
        if address != 0x1C {
            inner.nar_is_data = false;
        }

        Ok(match address {
            // PWRCTL: shifts out the previous control byte.
            0x08 => {
                let previous = inner.pwrctl;
                inner.pwrctl = value as u8;
                response(previous as u32, len)
            }
            // PWRSTAT: shifts out the status, write-1-to-clear on the
            // sticky flags.
            0x09 => {
                let status = inner.pwrstat;
                inner.pwrstat &= !(value as u8 & (PWRSTAT_DEBUGWASRESET | PWRSTAT_COREWASRESET));
                response(status as u32, len)
            }
            // NARSEL: DR shifts alternate between the address and data
            // registers. The address shift reports the status of the
            // previous transaction; the model never fails one.
            0x1C if !inner.nar_is_data => {
                inner.nar = value as u8;
                inner.nar_is_data = true;
                response(0, len)
            }
            0x1C => {
                inner.nar_is_data = false;
                let reg = inner.nar >> 1;
                if inner.nar & 1 != 0 {
                    inner.nexus_write(reg, value);
                    response(0, len)
                } else {
                    response(inner.nexus_read(reg), len)
                }
            }
            0x1E => response(FAKE_IDCODE, len),
            _ => response(0, len),
        })
    }

    fn target_reset_assert(&mut self) -> Result<(), DebugProbeError> {
        self.inner.lock().unwrap().reset_asserted = true;
        Ok(())
    }

    fn target_reset_deassert(&mut self) -> Result<(), DebugProbeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reset_asserted = false;
        inner.reset();
        Ok(())
    }
}
