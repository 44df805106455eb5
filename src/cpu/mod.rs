mod bios;
mod dos;
mod instr;
mod operand;
mod ports;

use anyhow::{Result, bail};

pub use bios::{BIOS_TICKS_PER_DAY, BiosTicker};
pub use dos::{DosInterrupts, DosLoader, LazyDos};
pub use instr::BIMODAL_BIOS_SELECTOR;
pub use operand::Location;
pub use ports::{HostPorts, PortIo};

pub const EFLAGS_IF: u32 = 0x0000_0200;
pub const EFLAGS_DF: u32 = 0x0000_0400;
pub const EFLAGS_VM: u32 = 0x0002_0000;

/// NT exception codes the emulator hands back to the trap dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionCode {
    AccessViolation = 0xc000_0005,
    IllegalInstruction = 0xc000_001d,
    PrivilegedInstruction = 0xc000_0096,
    /// `sti` re-enabled interrupts while one was pending.
    Vm86Sti = 0x8000_0111,
}

impl ExceptionCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Outcome of emulating one trapped instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emulation {
    /// The context now describes the state after the instruction.
    Handled,
    /// The caller must deliver this exception.
    Unhandled(ExceptionCode),
}

impl Emulation {
    /// 0 when handled, the exception code otherwise.
    pub fn status(self) -> u32 {
        match self {
            Emulation::Handled => 0,
            Emulation::Unhandled(code) => code.code(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reg {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Reg {
    pub(crate) fn from_bits(value: u8) -> Result<Self> {
        match value {
            0b000 => Ok(Reg::Eax),
            0b001 => Ok(Reg::Ecx),
            0b010 => Ok(Reg::Edx),
            0b011 => Ok(Reg::Ebx),
            0b100 => Ok(Reg::Esp),
            0b101 => Ok(Reg::Ebp),
            0b110 => Ok(Reg::Esi),
            0b111 => Ok(Reg::Edi),
            _ => bail!("Invalid register bits, {:#5b}", value),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl SegReg {
    /// Decode the `reg` field of `mov sreg, r/m16`; 6 and 7 are reserved.
    pub(crate) fn from_bits(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SegReg::Es),
            1 => Ok(SegReg::Cs),
            2 => Ok(SegReg::Ss),
            3 => Ok(SegReg::Ds),
            4 => Ok(SegReg::Fs),
            5 => Ok(SegReg::Gs),
            _ => bail!("Invalid segment register bits, {:#5b}", value),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Register snapshot of a thread that trapped on an instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub gpr: [u32; 8],
    pub seg: [u16; 6],
    pub eip: u32,
    pub eflags: u32,
}

impl Context {
    pub fn reg(&self, reg: Reg) -> u32 {
        self.gpr[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.gpr[reg.index()] = value;
    }

    pub fn reg16(&self, reg: Reg) -> u16 {
        self.reg(reg) as u16
    }

    /// Replace the low word, keeping the high word.
    pub fn set_reg16(&mut self, reg: Reg, value: u16) {
        let r = &mut self.gpr[reg.index()];
        *r = (*r & 0xffff_0000) | u32::from(value);
    }

    pub fn set_reg8(&mut self, reg: Reg, value: u8) {
        let r = &mut self.gpr[reg.index()];
        *r = (*r & 0xffff_ff00) | u32::from(value);
    }

    pub fn sreg(&self, seg: SegReg) -> u16 {
        self.seg[seg.index()]
    }

    pub fn set_sreg(&mut self, seg: SegReg, value: u16) {
        self.seg[seg.index()] = value;
    }

    pub fn cs(&self) -> u16 {
        self.sreg(SegReg::Cs)
    }

    pub fn ss(&self) -> u16 {
        self.sreg(SegReg::Ss)
    }

    pub fn is_v86(&self) -> bool {
        self.eflags & EFLAGS_VM != 0
    }
}
