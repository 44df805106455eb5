use super::{Context, Reg, SegReg};
use crate::decoder::ModRm;
use crate::machine::Machine;
use crate::selector::Ldt;

/// Where a mod/rm operand lives once its address has been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Register(Reg),
    Linear(u32),
}

const BASE16: [(Option<Reg>, Option<Reg>); 8] = [
    (Some(Reg::Ebx), Some(Reg::Esi)),
    (Some(Reg::Ebx), Some(Reg::Edi)),
    (Some(Reg::Ebp), Some(Reg::Esi)),
    (Some(Reg::Ebp), Some(Reg::Edi)),
    (Some(Reg::Esi), None),
    (Some(Reg::Edi), None),
    (Some(Reg::Ebp), None),
    (Some(Reg::Ebx), None),
];

impl Machine {
    /// Linear address of `seg:offset` for an access of `size` bytes, as seen
    /// by code running with `ctx`.
    pub(crate) fn translate(&self, ctx: &Context, seg: u16, offset: u32, size: u32) -> Option<u32> {
        if ctx.is_v86() {
            return Some((u32::from(seg) << 4).wrapping_add(offset & 0xffff));
        }
        if Ldt::is_system(seg) {
            return Some(offset);
        }
        if seg & 7 != 7 {
            return None;
        }
        self.ldt.translate(seg, offset, size)
    }

    /// Effective `segment:offset` of a memory operand, before validation.
    pub(crate) fn effective_address(
        &self,
        ctx: &Context,
        modrm: &ModRm,
        seg_override: Option<SegReg>,
    ) -> (u16, u32) {
        let (default_seg, offset) = if modrm.addr32 {
            effective_address32(ctx, modrm)
        } else {
            effective_address16(ctx, modrm)
        };
        (ctx.sreg(seg_override.unwrap_or(default_seg)), offset)
    }

    /// Resolve a mod/rm operand of `size` bytes. Memory operands are checked
    /// against the descriptor limit for the whole access.
    pub(crate) fn operand_location(
        &self,
        ctx: &Context,
        modrm: &ModRm,
        seg_override: Option<SegReg>,
        size: u32,
    ) -> Option<Location> {
        if modrm.is_register() {
            return Some(Location::Register(Reg::from_bits(modrm.rm).ok()?));
        }
        let (seg, offset) = self.effective_address(ctx, modrm, seg_override);
        self.translate(ctx, seg, offset, size).map(Location::Linear)
    }
}

fn effective_address16(ctx: &Context, modrm: &ModRm) -> (SegReg, u32) {
    if modrm.is_absolute() {
        return (SegReg::Ds, modrm.disp & 0xffff);
    }
    let (base, index) = BASE16[usize::from(modrm.rm)];
    let seg = if base == Some(Reg::Ebp) {
        SegReg::Ss
    } else {
        SegReg::Ds
    };
    let sum = [base, index]
        .into_iter()
        .flatten()
        .fold(modrm.disp, |acc, r| acc.wrapping_add(u32::from(ctx.reg16(r))));
    (seg, sum & 0xffff)
}

fn effective_address32(ctx: &Context, modrm: &ModRm) -> (SegReg, u32) {
    if modrm.is_absolute() {
        return (SegReg::Ds, modrm.disp);
    }

    let (base_bits, index) = match modrm.sib {
        Some(sib) => {
            let index_bits = (sib >> 3) & 7;
            let index = (index_bits != 4).then(|| {
                let reg = Reg::from_bits(index_bits).unwrap_or(Reg::Eax);
                ctx.reg(reg) << (sib >> 6)
            });
            (sib & 7, index.unwrap_or(0))
        }
        None => (modrm.rm, 0),
    };

    // mod 0 with a SIB base of 5: disp32 plus the scaled index, no base
    if modrm.mode == 0 && base_bits == 5 {
        return (SegReg::Ds, modrm.disp.wrapping_add(index));
    }

    let base_reg = Reg::from_bits(base_bits).unwrap_or(Reg::Eax);
    let seg = if matches!(base_reg, Reg::Esp | Reg::Ebp) {
        SegReg::Ss
    } else {
        SegReg::Ds
    };
    let offset = ctx
        .reg(base_reg)
        .wrapping_add(index)
        .wrapping_add(modrm.disp);
    (seg, offset)
}
