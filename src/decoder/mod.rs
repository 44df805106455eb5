//! Decoder for the x86 instructions that trap in 16-bit protected mode.
//!
//! Only the instructions the emulator knows how to finish are decoded in
//! full; everything else becomes [`InstructionKind::Unknown`] after its
//! prefixes and opcode have been consumed.

use crate::cpu::{Reg, SegReg};
use crate::memory::MemoryImage;
use anyhow::Result;
use anyhow::bail;

mod display;

/// The architectural limit on instruction length, prefixes included.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    Repne,
    Repe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefixes {
    /// Last segment override seen.
    pub segment: Option<SegReg>,
    pub operand_size: bool,
    pub address_size: bool,
    pub lock: bool,
    pub rep: Option<Rep>,
    /// Number of prefix bytes.
    pub len: usize,
}

/// A decoded mod/rm byte with its SIB byte and displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
    pub sib: Option<u8>,
    /// Sign-extended displacement, or the absolute offset of the
    /// displacement-only forms.
    pub disp: u32,
    /// Decoded with 32-bit addressing.
    pub addr32: bool,
}

impl ModRm {
    pub fn is_register(&self) -> bool {
        self.mode == 3
    }

    /// The displacement-only encodings: mod 0 with rm 6 (16-bit) or rm 5
    /// (32-bit, no SIB byte).
    pub fn is_absolute(&self) -> bool {
        if self.mode != 0 {
            return false;
        }
        if self.addr32 {
            self.sib.is_none() && self.rm == 5
        } else {
            self.rm == 6
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOperand {
    Imm(u8),
    Dx,
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    PopSeg(SegReg),
    /// `lds`/`les`/`lfs`/`lgs`/`lss`.
    LoadFarPointer {
        seg: SegReg,
        dst: Reg,
        src: ModRm,
    },
    /// `mov sreg, r/m16`; `dst` is the raw `reg` field.
    MovSeg {
        dst: u8,
        src: ModRm,
    },
    Ins(Width),
    Outs(Width),
    In {
        width: Width,
        port: PortOperand,
    },
    Out {
        width: Width,
        port: PortOperand,
    },
    Int(u8),
    Iret,
    Cli,
    Sti,
    Unknown {
        escaped: bool,
        opcode: u8,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub address: u32,
    pub bytes: Vec<u8>,
    pub prefixes: Prefixes,
    /// 32-bit operand size after prefixes.
    pub long_op: bool,
    /// 32-bit address size after prefixes.
    pub long_addr: bool,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Size {
    Byte,
    /// Word or dword depending on the operand size.
    Full,
}

impl Size {
    fn resolve(self, long_op: bool) -> Width {
        match (self, long_op) {
            (Size::Byte, _) => Width::Byte,
            (Size::Full, false) => Width::Word,
            (Size::Full, true) => Width::Dword,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    PopSeg(SegReg),
    FarPointer(SegReg),
    MovSeg,
    Ins(Size),
    Outs(Size),
    InImm(Size),
    OutImm(Size),
    InDx(Size),
    OutDx(Size),
    Int,
    Iret,
    Cli,
    Sti,
}

struct OpcodeEntry {
    /// Follows a 0x0f escape byte.
    escaped: bool,
    opcode: u8,
    form: Form,
}

const fn op(escaped: bool, opcode: u8, form: Form) -> OpcodeEntry {
    OpcodeEntry {
        escaped,
        opcode,
        form,
    }
}

const OPCODES: &[OpcodeEntry] = &[
    op(false, 0x07, Form::PopSeg(SegReg::Es)),
    op(false, 0x17, Form::PopSeg(SegReg::Ss)),
    op(false, 0x1f, Form::PopSeg(SegReg::Ds)),
    op(true, 0xa1, Form::PopSeg(SegReg::Fs)),
    op(true, 0xa9, Form::PopSeg(SegReg::Gs)),
    op(false, 0xc4, Form::FarPointer(SegReg::Es)),
    op(false, 0xc5, Form::FarPointer(SegReg::Ds)),
    op(true, 0xb2, Form::FarPointer(SegReg::Ss)),
    op(true, 0xb4, Form::FarPointer(SegReg::Fs)),
    op(true, 0xb5, Form::FarPointer(SegReg::Gs)),
    op(false, 0x8e, Form::MovSeg),
    op(false, 0x6c, Form::Ins(Size::Byte)),
    op(false, 0x6d, Form::Ins(Size::Full)),
    op(false, 0x6e, Form::Outs(Size::Byte)),
    op(false, 0x6f, Form::Outs(Size::Full)),
    op(false, 0xe4, Form::InImm(Size::Byte)),
    op(false, 0xe5, Form::InImm(Size::Full)),
    op(false, 0xe6, Form::OutImm(Size::Byte)),
    op(false, 0xe7, Form::OutImm(Size::Full)),
    op(false, 0xec, Form::InDx(Size::Byte)),
    op(false, 0xed, Form::InDx(Size::Full)),
    op(false, 0xee, Form::OutDx(Size::Byte)),
    op(false, 0xef, Form::OutDx(Size::Full)),
    op(false, 0xcd, Form::Int),
    op(false, 0xcf, Form::Iret),
    op(false, 0xfa, Form::Cli),
    op(false, 0xfb, Form::Sti),
];

fn lookup(escaped: bool, opcode: u8) -> Option<Form> {
    OPCODES
        .iter()
        .find(|e| e.escaped == escaped && e.opcode == opcode)
        .map(|e| e.form)
}

pub struct Decoder<'a> {
    memory: &'a MemoryImage,
}

impl<'a> Decoder<'a> {
    pub fn new(memory: &'a MemoryImage) -> Self {
        Self { memory }
    }

    fn fetch(&self, start: u32, bytes: &mut Vec<u8>) -> Result<u8> {
        if bytes.len() >= MAX_INSTRUCTION_LEN {
            bail!("instruction at {start:#x} exceeds {MAX_INSTRUCTION_LEN} bytes");
        }
        let byte = self.memory.fetch_code(start.wrapping_add(bytes.len() as u32), 1)?[0];
        bytes.push(byte);
        Ok(byte)
    }

    fn fetch_word(&self, start: u32, bytes: &mut Vec<u8>) -> Result<u16> {
        let lo = self.fetch(start, bytes)?;
        let hi = self.fetch(start, bytes)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn fetch_dword(&self, start: u32, bytes: &mut Vec<u8>) -> Result<u32> {
        let lo = self.fetch_word(start, bytes)?;
        let hi = self.fetch_word(start, bytes)?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    fn decode_modrm(&self, start: u32, bytes: &mut Vec<u8>, long_addr: bool) -> Result<ModRm> {
        let byte = self.fetch(start, bytes)?;
        let mode = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;

        let mut modrm = ModRm {
            mode,
            reg,
            rm,
            sib: None,
            disp: 0,
            addr32: long_addr,
        };
        if mode == 3 {
            return Ok(modrm);
        }

        if long_addr {
            if rm == 4 {
                modrm.sib = Some(self.fetch(start, bytes)?);
            }
            let base = modrm.sib.map_or(rm, |sib| sib & 7);
            modrm.disp = match mode {
                0 if base == 5 => self.fetch_dword(start, bytes)?,
                1 => self.fetch(start, bytes)? as i8 as u32,
                2 => self.fetch_dword(start, bytes)?,
                _ => 0,
            };
        } else {
            modrm.disp = match mode {
                0 if rm == 6 => u32::from(self.fetch_word(start, bytes)?),
                1 => self.fetch(start, bytes)? as i8 as u32,
                2 => self.fetch_word(start, bytes)? as i16 as u32,
                _ => 0,
            };
        }
        Ok(modrm)
    }

    /// Decode the instruction at linear address `start`. `default_32bit` is
    /// the default operand and address size of the code segment.
    pub fn decode_instruction(&self, start: u32, default_32bit: bool) -> Result<Instruction> {
        let mut bytes = Vec::with_capacity(MAX_INSTRUCTION_LEN);
        let mut prefixes = Prefixes::default();

        let first = loop {
            let byte = self.fetch(start, &mut bytes)?;
            match byte {
                0x26 => prefixes.segment = Some(SegReg::Es),
                0x2e => prefixes.segment = Some(SegReg::Cs),
                0x36 => prefixes.segment = Some(SegReg::Ss),
                0x3e => prefixes.segment = Some(SegReg::Ds),
                0x64 => prefixes.segment = Some(SegReg::Fs),
                0x65 => prefixes.segment = Some(SegReg::Gs),
                0x66 => prefixes.operand_size = true,
                0x67 => prefixes.address_size = true,
                0xf0 => prefixes.lock = true,
                0xf2 => prefixes.rep = Some(Rep::Repne),
                0xf3 => prefixes.rep = Some(Rep::Repe),
                _ => break byte,
            }
        };
        prefixes.len = bytes.len() - 1;

        let long_op = default_32bit != prefixes.operand_size;
        let long_addr = default_32bit != prefixes.address_size;

        let (escaped, opcode) = if first == 0x0f {
            (true, self.fetch(start, &mut bytes)?)
        } else {
            (false, first)
        };

        let kind = match lookup(escaped, opcode) {
            None => InstructionKind::Unknown { escaped, opcode },
            Some(form) => match form {
                Form::PopSeg(seg) => InstructionKind::PopSeg(seg),
                Form::FarPointer(seg) => {
                    let src = self.decode_modrm(start, &mut bytes, long_addr)?;
                    InstructionKind::LoadFarPointer {
                        seg,
                        dst: Reg::from_bits(src.reg)?,
                        src,
                    }
                }
                Form::MovSeg => {
                    let src = self.decode_modrm(start, &mut bytes, long_addr)?;
                    InstructionKind::MovSeg { dst: src.reg, src }
                }
                Form::Ins(size) => InstructionKind::Ins(size.resolve(long_op)),
                Form::Outs(size) => InstructionKind::Outs(size.resolve(long_op)),
                Form::InImm(size) => InstructionKind::In {
                    width: size.resolve(long_op),
                    port: PortOperand::Imm(self.fetch(start, &mut bytes)?),
                },
                Form::OutImm(size) => InstructionKind::Out {
                    width: size.resolve(long_op),
                    port: PortOperand::Imm(self.fetch(start, &mut bytes)?),
                },
                Form::InDx(size) => InstructionKind::In {
                    width: size.resolve(long_op),
                    port: PortOperand::Dx,
                },
                Form::OutDx(size) => InstructionKind::Out {
                    width: size.resolve(long_op),
                    port: PortOperand::Dx,
                },
                Form::Int => InstructionKind::Int(self.fetch(start, &mut bytes)?),
                Form::Iret => InstructionKind::Iret,
                Form::Cli => InstructionKind::Cli,
                Form::Sti => InstructionKind::Sti,
            },
        };

        Ok(Instruction {
            address: start,
            bytes,
            prefixes,
            long_op,
            long_addr,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySegment, Protection};

    fn decode_at(code: &[u8], default_32bit: bool) -> Result<Instruction> {
        let mut segment = MemorySegment::new(0x1000, 0x20, Protection::READ);
        segment.data[..code.len()].copy_from_slice(code);
        let memory = MemoryImage::new(vec![segment]);
        Decoder::new(&memory).decode_instruction(0x1000, default_32bit)
    }

    fn decode(code: &[u8]) -> Instruction {
        decode_at(code, false).unwrap()
    }

    #[test]
    fn prefixes_accumulate() {
        let inst = decode(&[0x26, 0x2e, 0x66, 0x66, 0xf3, 0x6d]);
        assert_eq!(inst.prefixes.segment, Some(SegReg::Cs));
        assert_eq!(inst.prefixes.rep, Some(Rep::Repe));
        assert_eq!(inst.prefixes.len, 5);
        // a repeated operand-size prefix still flips only once
        assert!(inst.long_op);
        assert!(!inst.long_addr);
        assert_eq!(inst.kind, InstructionKind::Ins(Width::Dword));
        assert_eq!(inst.len(), 6);
    }

    #[test]
    fn prefixes_flip_a_32bit_default() {
        let inst = decode_at(&[0x66, 0x67, 0xcf], true).unwrap();
        assert!(!inst.long_op);
        assert!(!inst.long_addr);
        assert_eq!(inst.kind, InstructionKind::Iret);
    }

    #[test]
    fn escaped_opcodes() {
        assert_eq!(decode(&[0x0f, 0xa1]).kind, InstructionKind::PopSeg(SegReg::Fs));
        assert_eq!(
            decode(&[0x0f, 0xa0]).kind,
            InstructionKind::Unknown {
                escaped: true,
                opcode: 0xa0
            }
        );
    }

    #[test]
    fn sixteen_bit_modrm_displacements() {
        // lds si, [bp-2]
        let inst = decode(&[0xc5, 0x76, 0xfe]);
        let InstructionKind::LoadFarPointer { seg, dst, src } = inst.kind else {
            panic!("unexpected {:?}", inst.kind);
        };
        assert_eq!((seg, dst), (SegReg::Ds, Reg::Esi));
        assert_eq!((src.mode, src.rm), (1, 6));
        assert_eq!(src.disp, 0xffff_fffe);
        assert!(!src.is_absolute());

        // mov es, [0x1234]
        let inst = decode(&[0x8e, 0x06, 0x34, 0x12]);
        let InstructionKind::MovSeg { dst, src } = inst.kind else {
            panic!("unexpected {:?}", inst.kind);
        };
        assert_eq!(dst, 0);
        assert!(src.is_absolute());
        assert_eq!(src.disp, 0x1234);
        assert_eq!(inst.len(), 4);
    }

    #[test]
    fn thirty_two_bit_modrm_with_sib() {
        // les eax, [ebx+ecx*4+0x10]
        let inst = decode_at(&[0xc4, 0x44, 0x8b, 0x10], true).unwrap();
        let InstructionKind::LoadFarPointer { src, .. } = inst.kind else {
            panic!("unexpected {:?}", inst.kind);
        };
        assert_eq!(src.sib, Some(0x8b));
        assert_eq!(src.disp, 0x10);
        assert_eq!(inst.len(), 4);

        // les eax, [0x00401000]
        let inst = decode_at(&[0xc4, 0x05, 0x00, 0x10, 0x40, 0x00], true).unwrap();
        let InstructionKind::LoadFarPointer { src, .. } = inst.kind else {
            panic!("unexpected {:?}", inst.kind);
        };
        assert!(src.is_absolute());
        assert_eq!(src.disp, 0x0040_1000);
    }

    #[test]
    fn port_immediates() {
        let inst = decode(&[0xe6, 0xf8]);
        assert_eq!(
            inst.kind,
            InstructionKind::Out {
                width: Width::Byte,
                port: PortOperand::Imm(0xf8)
            }
        );
        assert_eq!(inst.len(), 2);
    }

    #[test]
    fn endless_prefixes_are_rejected() {
        assert!(decode_at(&[0x66; 16], false).is_err());
    }

    #[test]
    fn opcode_table_has_no_duplicates() {
        for (i, a) in OPCODES.iter().enumerate() {
            for b in &OPCODES[i + 1..] {
                assert!(
                    !(a.escaped == b.escaped && a.opcode == b.opcode),
                    "duplicate opcode {:#04x}",
                    a.opcode
                );
            }
        }
    }

    #[test]
    fn every_other_opcode_is_unknown() {
        for escaped in [false, true] {
            for opcode in 0..=0xffu8 {
                let prefix_byte = matches!(
                    opcode,
                    0x0f | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3
                );
                if !escaped && prefix_byte {
                    continue;
                }
                let mut code = if escaped { vec![0x0f, opcode] } else { vec![opcode] };
                code.extend_from_slice(&[0; 6]);
                let inst = decode(&code);
                let unknown = matches!(inst.kind, InstructionKind::Unknown { .. });
                assert_eq!(unknown, lookup(escaped, opcode).is_none(), "opcode {opcode:#04x}");
            }
        }
    }
}
