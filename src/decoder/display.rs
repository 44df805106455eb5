use super::{Instruction, InstructionKind, ModRm, PortOperand, Rep, Width};
use crate::cpu::{Reg, SegReg};
use std::fmt;

const REG16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const REG32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const BASE16: [&str; 8] = [
    "%bx,%si", "%bx,%di", "%bp,%si", "%bp,%di", "%si", "%di", "%bp", "%bx",
];

impl fmt::Display for SegReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegReg::Es => "es",
            SegReg::Cs => "cs",
            SegReg::Ss => "ss",
            SegReg::Ds => "ds",
            SegReg::Fs => "fs",
            SegReg::Gs => "gs",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REG32[*self as usize])
    }
}

impl fmt::Display for Rep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rep::Repne => f.write_str("repne"),
            Rep::Repe => f.write_str("rep"),
        }
    }
}

fn suffix(width: Width) -> char {
    match width {
        Width::Byte => 'b',
        Width::Word => 'w',
        Width::Dword => 'l',
    }
}

fn accumulator(width: Width) -> &'static str {
    match width {
        Width::Byte => "%al",
        Width::Word => "%ax",
        Width::Dword => "%eax",
    }
}

fn register(index: u8, long: bool) -> String {
    let names = if long { &REG32 } else { &REG16 };
    format!("%{}", names[usize::from(index & 7)])
}

/// AT&T rendering of a mod/rm operand, without segment override.
struct Operand<'a> {
    modrm: &'a ModRm,
    long_op: bool,
}

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.modrm;
        if m.is_register() {
            return f.write_str(&register(m.rm, self.long_op));
        }
        if m.is_absolute() {
            return write!(f, "{:#x}", m.disp);
        }
        if m.disp != 0 {
            let disp = m.disp as i32;
            if disp < 0 {
                write!(f, "-{:#x}", disp.unsigned_abs())?;
            } else {
                write!(f, "{disp:#x}")?;
            }
        }
        if !m.addr32 {
            return write!(f, "({})", BASE16[usize::from(m.rm)]);
        }
        match m.sib {
            None => write!(f, "({})", register(m.rm, true)),
            Some(sib) => {
                let base = sib & 7;
                let index = (sib >> 3) & 7;
                let scale = 1u8 << (sib >> 6);
                f.write_str("(")?;
                if !(base == 5 && m.mode == 0) {
                    f.write_str(&register(base, true))?;
                }
                if index != 4 {
                    write!(f, ",{},{scale}", register(index, true))?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let override_prefix = self
            .prefixes
            .segment
            .map(|seg| format!("%{seg}:"))
            .unwrap_or_default();

        match &self.kind {
            InstructionKind::PopSeg(seg) => write!(f, "pop %{seg}"),
            InstructionKind::LoadFarPointer { seg, dst, src } => {
                let operand = Operand {
                    modrm: src,
                    long_op: self.long_op,
                };
                write!(
                    f,
                    "l{seg} {override_prefix}{operand},{}",
                    register(*dst as u8, self.long_op)
                )
            }
            InstructionKind::MovSeg { dst, src } => {
                let operand = Operand {
                    modrm: src,
                    long_op: false,
                };
                match SegReg::from_bits(*dst) {
                    Ok(seg) => write!(f, "mov {override_prefix}{operand},%{seg}"),
                    Err(_) => write!(f, "mov {override_prefix}{operand},%sr{dst}"),
                }
            }
            InstructionKind::Ins(width) => {
                if let Some(rep) = self.prefixes.rep {
                    write!(f, "{rep} ")?;
                }
                write!(f, "ins{}", suffix(*width))
            }
            InstructionKind::Outs(width) => {
                if let Some(rep) = self.prefixes.rep {
                    write!(f, "{rep} ")?;
                }
                write!(f, "outs{}", suffix(*width))?;
                if let Some(seg) = self.prefixes.segment {
                    write!(f, " %{seg}:(%si)")?;
                }
                Ok(())
            }
            InstructionKind::In { width, port } => match port {
                PortOperand::Imm(p) => write!(f, "in ${p:#x},{}", accumulator(*width)),
                PortOperand::Dx => write!(f, "in (%dx),{}", accumulator(*width)),
            },
            InstructionKind::Out { width, port } => match port {
                PortOperand::Imm(p) => write!(f, "out {},${p:#x}", accumulator(*width)),
                PortOperand::Dx => write!(f, "out {},(%dx)", accumulator(*width)),
            },
            InstructionKind::Int(n) => write!(f, "int ${n:#x}"),
            InstructionKind::Iret => f.write_str(if self.long_op { "iretl" } else { "iret" }),
            InstructionKind::Cli => f.write_str("cli"),
            InstructionKind::Sti => f.write_str("sti"),
            InstructionKind::Unknown { .. } => {
                f.write_str("(bad)")?;
                for byte in &self.bytes {
                    write!(f, " {byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}
