//! Emulation of instructions that trap when 16-bit code runs in protected
//! mode or V86 mode.

use log::{debug, trace, warn};

use super::operand::Location;
use super::{Context, EFLAGS_DF, Emulation, ExceptionCode, Reg, SegReg};
use crate::decoder::{Decoder, Instruction, InstructionKind, ModRm, PortOperand, Width};
use crate::machine::{Machine, Thread};
use crate::selector::Ldt;

/// The selector some compilers hard-code to reach the BIOS data area.
pub const BIMODAL_BIOS_SELECTOR: u16 = 0x40;

/// What a handler did with the instruction.
enum Step {
    /// Completed; EIP moves past the instruction.
    Next,
    /// Completed and already set CS:EIP.
    Jumped,
    /// Completed, but the caller must deliver `code`.
    Signal(ExceptionCode),
    /// Report `code` without trying a GP handler.
    Fault(ExceptionCode),
    /// Not emulated; nothing was changed.
    Unable,
}

impl Machine {
    /// Emulate the instruction at `ctx.cs:ctx.eip` that raised `code`.
    ///
    /// On [`Emulation::Handled`] the context reflects the completed
    /// instruction. Otherwise the context and memory are unchanged, apart
    /// from a redirection to the code segment's GP fault handler, which also
    /// counts as handled.
    pub fn emulate_instruction(
        &mut self,
        thread: &mut Thread,
        ctx: &mut Context,
        code: ExceptionCode,
    ) -> Emulation {
        self.sync_bios_ticks();

        let default_32bit = !ctx.is_v86() && self.ldt.is_32bit(ctx.cs());
        let Some(address) = self.translate(ctx, ctx.cs(), ctx.eip, 1) else {
            debug!(target: "instr", "cannot address code at {:04x}:{:08x}", ctx.cs(), ctx.eip);
            return Emulation::Unhandled(code);
        };

        let inst = match Decoder::new(&self.memory).decode_instruction(address, default_32bit) {
            Ok(inst) => inst,
            Err(err) => {
                debug!(target: "instr", "cannot decode at {:04x}:{:08x}: {err}", ctx.cs(), ctx.eip);
                return self.gp_fallback(ctx, code);
            }
        };
        trace!(target: "instr", "{:04x}:{:08x} {inst}", ctx.cs(), ctx.eip);

        let step = match inst.kind {
            InstructionKind::PopSeg(seg) => self.emulate_pop_seg(ctx, &inst, seg),
            InstructionKind::LoadFarPointer { seg, dst, src } => {
                self.emulate_load_far_pointer(ctx, &inst, seg, dst, &src)
            }
            InstructionKind::MovSeg { dst, src } => self.emulate_mov_seg(ctx, &inst, dst, &src),
            InstructionKind::Ins(width) => self.emulate_ins(ctx, &inst, width),
            InstructionKind::Outs(width) => self.emulate_outs(ctx, &inst, width),
            InstructionKind::In { width, port } => {
                let port = port_number(ctx, port);
                let value = self.inport(ctx, port, width.bytes() as u8);
                match width {
                    Width::Byte => ctx.set_reg8(Reg::Eax, value as u8),
                    Width::Word => ctx.set_reg16(Reg::Eax, value as u16),
                    Width::Dword => ctx.set_reg(Reg::Eax, value),
                }
                Step::Next
            }
            InstructionKind::Out { width, port } => {
                let port = port_number(ctx, port);
                let value = ctx.reg(Reg::Eax);
                self.outport(ctx, port, width.bytes() as u8, value);
                Step::Next
            }
            InstructionKind::Int(number) => self.emulate_int(ctx, &inst, number),
            InstructionKind::Iret => self.emulate_iret(ctx, &inst),
            InstructionKind::Cli => {
                thread.vif = false;
                Step::Next
            }
            InstructionKind::Sti => {
                thread.vif = true;
                if thread.vm86_pending {
                    thread.vm86_pending = false;
                    Step::Signal(ExceptionCode::Vm86Sti)
                } else {
                    Step::Next
                }
            }
            _ => Step::Unable,
        };

        match step {
            Step::Next => {
                ctx.eip = advance(ctx, &inst);
                Emulation::Handled
            }
            Step::Jumped => Emulation::Handled,
            Step::Signal(signal) => {
                ctx.eip = advance(ctx, &inst);
                Emulation::Unhandled(signal)
            }
            Step::Fault(fault) => Emulation::Unhandled(fault),
            Step::Unable => self.gp_fallback(ctx, code),
        }
    }

    /// Substitute a selector that could not be loaded, if there is a known
    /// replacement for it.
    fn replace_selector(&mut self, ctx: &Context, selector: u16) -> Option<u16> {
        if !ctx.is_v86() && Ldt::is_system(ctx.cs()) && self.relay_code.contains(&ctx.eip) {
            debug!(target: "instr", "selector {selector:#06x} reloaded by relay code, using 0");
            return Some(0);
        }
        if selector == BIMODAL_BIOS_SELECTOR {
            self.bios.ensure_started();
            self.sync_bios_ticks();
            return Some(self.bios_data_sel);
        }
        None
    }

    /// Linear address of `size` bytes at SS:(E)SP + `offset`.
    fn stack_address(&self, ctx: &Context, offset: u32, size: u32) -> Option<u32> {
        let esp = ctx.reg(Reg::Esp);
        let sp = if !ctx.is_v86() && self.ldt.is_32bit(ctx.ss()) {
            esp.wrapping_add(offset)
        } else {
            esp.wrapping_add(offset) & 0xffff
        };
        self.translate(ctx, ctx.ss(), sp, size)
    }

    fn add_stack(&self, ctx: &mut Context, delta: i32) {
        let esp = ctx.reg(Reg::Esp);
        if !ctx.is_v86() && self.ldt.is_32bit(ctx.ss()) {
            ctx.set_reg(Reg::Esp, esp.wrapping_add_signed(delta));
        } else {
            ctx.set_reg16(Reg::Esp, (esp as u16).wrapping_add_signed(delta as i16));
        }
    }

    fn emulate_pop_seg(&mut self, ctx: &mut Context, inst: &Instruction, seg: SegReg) -> Step {
        let size = if inst.long_op { 4 } else { 2 };
        let Some(addr) = self.stack_address(ctx, 0, size) else {
            return Step::Unable;
        };
        let Ok(value) = self.memory.read_word(addr) else {
            return Step::Unable;
        };
        let Some(selector) = self.replace_selector(ctx, value) else {
            return Step::Unable;
        };
        ctx.set_sreg(seg, selector);
        self.add_stack(ctx, size as i32);
        Step::Next
    }

    fn emulate_load_far_pointer(
        &mut self,
        ctx: &mut Context,
        inst: &Instruction,
        seg: SegReg,
        dst: Reg,
        src: &ModRm,
    ) -> Step {
        let offset_size = if inst.long_op { 4 } else { 2 };
        let Some(Location::Linear(addr)) =
            self.operand_location(ctx, src, inst.prefixes.segment, offset_size + 2)
        else {
            return Step::Unable;
        };

        let offset = if inst.long_op {
            self.memory.read_dword(addr)
        } else {
            self.memory.read_word(addr).map(u32::from)
        };
        let selector = self.memory.read_word(addr.wrapping_add(offset_size));
        let (Ok(offset), Ok(selector)) = (offset, selector) else {
            return Step::Unable;
        };
        let Some(selector) = self.replace_selector(ctx, selector) else {
            return Step::Unable;
        };

        if inst.long_op {
            ctx.set_reg(dst, offset);
        } else {
            ctx.set_reg16(dst, offset as u16);
        }
        ctx.set_sreg(seg, selector);
        Step::Next
    }

    fn emulate_mov_seg(&mut self, ctx: &mut Context, inst: &Instruction, dst: u8, src: &ModRm) -> Step {
        let seg = match SegReg::from_bits(dst) {
            Ok(SegReg::Cs) | Err(_) => return Step::Unable,
            Ok(seg) => seg,
        };
        let value = match self.operand_location(ctx, src, inst.prefixes.segment, 2) {
            Some(Location::Register(reg)) => ctx.reg16(reg),
            Some(Location::Linear(addr)) => match self.memory.read_word(addr) {
                Ok(value) => value,
                Err(_) => return Step::Unable,
            },
            None => return Step::Unable,
        };
        let Some(selector) = self.replace_selector(ctx, value) else {
            return Step::Unable;
        };
        ctx.set_sreg(seg, selector);
        Step::Next
    }

    /// Work out the addresses touched by a string port instruction. Returns
    /// the first offset, the per-element step, the element count and the
    /// linear base of the segment, or `None` if any element is out of reach.
    fn string_io_range(
        &self,
        ctx: &Context,
        inst: &Instruction,
        seg: u16,
        index: Reg,
        width: Width,
    ) -> Option<(u32, i64, u32, u32)> {
        let size = width.bytes();
        let count = match (inst.prefixes.rep, inst.long_addr) {
            (None, _) => 1,
            (Some(_), true) => ctx.reg(Reg::Ecx),
            (Some(_), false) => u32::from(ctx.reg16(Reg::Ecx)),
        };
        let step = if ctx.eflags & EFLAGS_DF != 0 {
            -i64::from(size)
        } else {
            i64::from(size)
        };
        let start = if inst.long_addr {
            ctx.reg(index)
        } else {
            u32::from(ctx.reg16(index))
        };
        let base = self.translate(ctx, seg, 0, 1).unwrap_or(0);
        if count == 0 {
            return Some((start, step, 0, base));
        }

        let last = i64::from(start) + step * (i64::from(count) - 1);
        let (low, high) = if step < 0 { (last, i64::from(start)) } else { (i64::from(start), last) };
        let limit = if inst.long_addr { 1i64 << 32 } else { 1i64 << 16 };
        if low < 0 || high + i64::from(size) > limit {
            return None;
        }
        let span = (high - low) as u32 + size;
        let linear = self.translate(ctx, seg, low as u32, span)?;
        if !self.memory.covers_range(linear, span as usize) {
            return None;
        }
        Some((start, step, count, linear.wrapping_sub(low as u32)))
    }

    fn finish_string_io(&self, ctx: &mut Context, inst: &Instruction, index: Reg, start: u32, step: i64, count: u32) {
        let end = (i64::from(start) + step * i64::from(count)) as u32;
        if inst.long_addr {
            ctx.set_reg(index, end);
        } else {
            ctx.set_reg16(index, end as u16);
        }
        if inst.prefixes.rep.is_some() {
            if inst.long_addr {
                ctx.set_reg(Reg::Ecx, 0);
            } else {
                ctx.set_reg16(Reg::Ecx, 0);
            }
        }
    }

    /// `ins` always stores through ES:(E)DI.
    fn emulate_ins(&mut self, ctx: &mut Context, inst: &Instruction, width: Width) -> Step {
        let seg = ctx.sreg(SegReg::Es);
        let Some((start, step, count, base)) = self.string_io_range(ctx, inst, seg, Reg::Edi, width) else {
            return Step::Unable;
        };
        let port = ctx.reg16(Reg::Edx);
        let size = width.bytes();

        for i in 0..count {
            let offset = (i64::from(start) + step * i64::from(i)) as u32;
            let value = self.inport(ctx, port, size as u8);
            let bytes = value.to_le_bytes();
            if let Err(err) = self
                .memory
                .write_data(base.wrapping_add(offset), &bytes[..size as usize])
            {
                warn!(target: "instr", "ins store failed after validation: {err}");
            }
        }
        self.finish_string_io(ctx, inst, Reg::Edi, start, step, count);
        Step::Next
    }

    /// `outs` reads from DS:(E)SI unless a segment override says otherwise.
    fn emulate_outs(&mut self, ctx: &mut Context, inst: &Instruction, width: Width) -> Step {
        let seg = ctx.sreg(inst.prefixes.segment.unwrap_or(SegReg::Ds));
        let Some((start, step, count, base)) = self.string_io_range(ctx, inst, seg, Reg::Esi, width) else {
            return Step::Unable;
        };
        let port = ctx.reg16(Reg::Edx);
        let size = width.bytes();

        for i in 0..count {
            let offset = (i64::from(start) + step * i64::from(i)) as u32;
            let mut bytes = [0u8; 4];
            match self.memory.read_bytes(base.wrapping_add(offset), size as usize) {
                Ok(data) => bytes[..size as usize].copy_from_slice(data),
                Err(err) => warn!(target: "instr", "outs load failed after validation: {err}"),
            }
            self.outport(ctx, port, size as u8, u32::from_le_bytes(bytes));
        }
        self.finish_string_io(ctx, inst, Reg::Esi, start, step, count);
        Step::Next
    }

    fn emulate_int(&mut self, ctx: &mut Context, inst: &Instruction, number: u8) -> Step {
        if !ctx.is_v86() && Ldt::is_system(ctx.cs()) {
            debug!(target: "instr", "int {number:#04x} from 32-bit code");
            return Step::Fault(ExceptionCode::AccessViolation);
        }
        let Some(dos) = self.dos.get_or_init() else {
            warn!(target: "instr", "no DOS emulation for int {number:#04x}");
            return Step::Unable;
        };

        let saved = ctx.eip;
        ctx.eip = advance(ctx, inst);
        if dos.emulate_interrupt(&mut self.memory, ctx, number) {
            Step::Jumped
        } else {
            ctx.eip = saved;
            Step::Unable
        }
    }

    fn emulate_iret(&mut self, ctx: &mut Context, inst: &Instruction) -> Step {
        if !ctx.is_v86() && Ldt::is_system(ctx.cs()) {
            return Step::Unable;
        }
        let (size, frame) = if inst.long_op { (4, 12) } else { (2, 6) };
        let Some(addr) = self.stack_address(ctx, 0, frame) else {
            return Step::Unable;
        };

        let read = |i: u32| -> Option<u32> {
            let at = addr.wrapping_add(i * size);
            if inst.long_op {
                self.memory.read_dword(at).ok()
            } else {
                self.memory.read_word(at).ok().map(u32::from)
            }
        };
        let (Some(ip), Some(cs), Some(flags)) = (read(0), read(1), read(2)) else {
            return Step::Unable;
        };

        ctx.eip = ip;
        ctx.set_sreg(SegReg::Cs, cs as u16);
        ctx.eflags = if inst.long_op {
            flags
        } else {
            (ctx.eflags & 0xffff_0000) | flags
        };
        self.add_stack(ctx, frame as i32);
        Step::Jumped
    }

    /// Last resort for 16-bit code: far-call the GP fault handler the
    /// faulting module registered, if any.
    fn gp_fallback(&mut self, ctx: &mut Context, code: ExceptionCode) -> Emulation {
        if ctx.is_v86() {
            return Emulation::Unhandled(code);
        }
        let cs = ctx.cs();
        let Some(handler) = self.has_gp_handler(cs, ctx.eip as u16) else {
            return Emulation::Unhandled(code);
        };

        let sp = ctx.reg(Reg::Esp).wrapping_sub(4);
        let sp = if self.ldt.is_32bit(ctx.ss()) { sp } else { sp & 0xffff };
        let Some(addr) = self.translate(ctx, ctx.ss(), sp, 4) else {
            return Emulation::Unhandled(code);
        };
        let mut frame = [0u8; 4];
        frame[..2].copy_from_slice(&(ctx.eip as u16).to_le_bytes());
        frame[2..].copy_from_slice(&cs.to_le_bytes());
        if self.memory.write_data(addr, &frame).is_err() {
            return Emulation::Unhandled(code);
        }

        debug!(target: "instr", "redirecting fault at {cs:04x}:{:04x} to GP handler {handler}", ctx.eip);
        self.add_stack(ctx, -4);
        ctx.set_sreg(SegReg::Cs, handler.selector());
        ctx.eip = u32::from(handler.offset());
        Emulation::Handled
    }
}

fn port_number(ctx: &Context, port: PortOperand) -> u16 {
    match port {
        PortOperand::Imm(p) => u16::from(p),
        PortOperand::Dx => ctx.reg16(Reg::Edx),
    }
}

/// EIP past `inst`, wrapping at 64 KiB in 16-bit code.
fn advance(ctx: &Context, inst: &Instruction) -> u32 {
    let next = ctx.eip.wrapping_add(inst.len() as u32);
    if inst.long_addr || ctx.eip > 0xffff {
        next
    } else {
        next & 0xffff
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::{Config, RelayCode};
    use crate::cpu::{DosInterrupts, LazyDos, PortIo};
    use crate::memory::MemoryImage;
    use crate::selector::SelectorFlags;

    const FAULT: ExceptionCode = ExceptionCode::PrivilegedInstruction;

    type PortLog = Rc<RefCell<Vec<(u16, u8, Option<u32>)>>>;

    struct Recorder {
        log: PortLog,
        input: u32,
    }

    impl PortIo for Recorder {
        fn inport(&mut self, port: u16, size: u8) -> u32 {
            self.log.borrow_mut().push((port, size, None));
            self.input
        }

        fn outport(&mut self, port: u16, size: u8, value: u32) {
            self.log.borrow_mut().push((port, size, Some(value)));
        }
    }

    struct Fixture {
        machine: Machine,
        thread: Thread,
        ctx: Context,
        code: u16,
        data: u16,
        stack: u16,
        ports: PortLog,
    }

    impl Fixture {
        fn new(input: u32) -> Self {
            Self::with_config(Config::default(), input)
        }

        fn with_config(config: Config, input: u32) -> Self {
            let mut machine = Machine::new(config);
            let code = machine.global_alloc(0x100, SelectorFlags::CODE, 0).unwrap();
            let data = machine.global_alloc(0x100, SelectorFlags::empty(), 0).unwrap();
            let stack = machine.global_alloc(0x100, SelectorFlags::empty(), 0).unwrap();
            let ports = PortLog::default();
            machine.set_port_io(Box::new(Recorder {
                log: Rc::clone(&ports),
                input,
            }));

            let mut ctx = Context::default();
            ctx.set_sreg(SegReg::Cs, code);
            ctx.set_sreg(SegReg::Ds, data);
            ctx.set_sreg(SegReg::Es, data);
            ctx.set_sreg(SegReg::Ss, stack);
            ctx.set_reg(Reg::Esp, 0x80);

            Self {
                machine,
                thread: Thread::default(),
                ctx,
                code,
                data,
                stack,
                ports,
            }
        }

        fn code(mut self, bytes: &[u8]) -> Self {
            self.machine.write_bytes16(self.code, 0, bytes).unwrap();
            self
        }

        fn push_words(&mut self, words: &[u16]) {
            for (i, w) in words.iter().enumerate() {
                self.machine
                    .write_word16(self.stack, 0x80 + 2 * i as u32, *w)
                    .unwrap();
            }
        }

        fn run(&mut self) -> Emulation {
            self.machine
                .emulate_instruction(&mut self.thread, &mut self.ctx, FAULT)
        }
    }

    #[test]
    fn pop_bimodal_selector_maps_bios_data() {
        let mut f = Fixture::new(0).code(&[0x07]);
        f.push_words(&[BIMODAL_BIOS_SELECTOR]);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.sreg(SegReg::Es), f.machine.bios_data_sel);
        assert_eq!(f.ctx.reg(Reg::Esp), 0x82);
        assert_eq!(f.ctx.eip, 1);
        assert!(f.machine.bios_ticker().is_running());

        f.ctx.eip = 0;
        f.ctx.set_reg(Reg::Esp, 0x80);
        assert_eq!(f.run(), Emulation::Handled);
        assert!(f.machine.bios_ticker().is_running());
    }

    #[test]
    fn relay_code_reload_clears_the_selector() {
        let mut config = Config::default();
        config.emulator.relay_code = Some(RelayCode {
            start: 0x1000,
            end: 0x1010,
        });
        let mut f = Fixture::with_config(config, 0);
        f.machine.memory.write_byte(0x1008, 0x07).unwrap();
        f.push_words(&[0x1234, 0]);
        f.ctx.set_sreg(SegReg::Cs, 0x23);
        f.ctx.eip = 0x1008;

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.sreg(SegReg::Es), 0);
        assert_eq!(f.ctx.eip, 0x1009);
        // 32-bit code pops a dword
        assert_eq!(f.ctx.reg(Reg::Esp), 0x84);
        assert!(!f.machine.bios_ticker().is_running());

        // the same selector outside the relay range is not replaceable
        f.machine.memory.write_byte(0x1010, 0x07).unwrap();
        f.ctx.eip = 0x1010;
        f.ctx.set_reg(Reg::Esp, 0x80);
        let before = f.ctx;
        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx, before);
    }

    #[test]
    fn pop_gs_maps_bios_data() {
        let mut f = Fixture::new(0).code(&[0x0f, 0xa9]);
        f.push_words(&[BIMODAL_BIOS_SELECTOR]);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.sreg(SegReg::Gs), f.machine.bios_data_sel);
        assert_eq!(f.ctx.reg(Reg::Esp), 0x82);
        assert_eq!(f.ctx.eip, 2);
    }

    #[test]
    fn unknown_selector_leaves_state_alone() {
        let mut f = Fixture::new(0).code(&[0x1f]);
        f.push_words(&[0x1234]);
        let before = f.ctx;

        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx, before);
        assert!(!f.machine.bios_ticker().is_running());
    }

    #[test]
    fn out_to_immediate_port() {
        let mut f = Fixture::new(0).code(&[0xe6, 0xf8]);
        f.ctx.set_reg(Reg::Eax, 0x1241);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(*f.ports.borrow(), [(0xf8, 1, Some(0x41))]);
        assert_eq!(f.ctx.eip, 2);
    }

    #[test]
    fn out_to_dx_port() {
        let mut f = Fixture::new(0).code(&[0xee]);
        f.ctx.set_reg(Reg::Eax, 0x41);
        f.ctx.set_reg(Reg::Edx, 0x3f8);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(*f.ports.borrow(), [(0x3f8, 1, Some(0x41))]);
        assert_eq!(f.ctx.eip, 1);
    }

    #[test]
    fn in_word_keeps_upper_eax() {
        let mut f = Fixture::new(0xbeef).code(&[0xed]);
        f.ctx.set_reg(Reg::Eax, 0x1234_0000);
        f.ctx.set_reg(Reg::Edx, 0x60);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.reg(Reg::Eax), 0x1234_beef);
        assert_eq!(*f.ports.borrow(), [(0x60, 2, None)]);
    }

    #[test]
    fn rep_insb_fills_es_di() {
        let mut f = Fixture::new(0x5a).code(&[0xf3, 0x6c]);
        f.ctx.set_reg(Reg::Ecx, 4);
        f.ctx.set_reg(Reg::Edi, 0x10);
        f.ctx.set_reg(Reg::Edx, 0x60);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.machine.read_bytes16(f.data, 0x10, 5).unwrap(), [0x5a, 0x5a, 0x5a, 0x5a, 0]);
        assert_eq!(f.ctx.reg(Reg::Edi), 0x14);
        assert_eq!(f.ctx.reg(Reg::Ecx), 0);
        assert_eq!(f.ctx.eip, 2);
        assert_eq!(f.ports.borrow().len(), 4);
    }

    #[test]
    fn rep_insb_past_the_limit_does_nothing() {
        let mut f = Fixture::new(0x5a).code(&[0xf3, 0x6c]);
        f.ctx.set_reg(Reg::Ecx, 4);
        f.ctx.set_reg(Reg::Edi, 0xfe);
        let before = f.ctx;

        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx, before);
        assert!(f.ports.borrow().is_empty());
    }

    #[test]
    fn outsb_walks_down_with_df() {
        let mut f = Fixture::new(0).code(&[0xf3, 0x6e]);
        f.machine.write_bytes16(f.data, 0, &[1, 2, 3, 4]).unwrap();
        f.ctx.eflags |= EFLAGS_DF;
        f.ctx.set_reg(Reg::Esi, 3);
        f.ctx.set_reg(Reg::Ecx, 2);
        f.ctx.set_reg(Reg::Edx, 0x80);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(*f.ports.borrow(), [(0x80, 1, Some(4)), (0x80, 1, Some(3))]);
        assert_eq!(f.ctx.reg(Reg::Esi), 1);
        assert_eq!(f.ctx.reg(Reg::Ecx), 0);
    }

    #[test]
    fn outsw_honours_segment_override() {
        let mut f = Fixture::new(0).code(&[0x26, 0x6f]);
        let other = f.machine.global_alloc(0x10, SelectorFlags::empty(), 0).unwrap();
        f.machine.write_word16(other, 0, 0xcafe).unwrap();
        f.ctx.set_sreg(SegReg::Es, other);
        f.ctx.set_reg(Reg::Edx, 0x80);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(*f.ports.borrow(), [(0x80, 2, Some(0xcafe))]);
        assert_eq!(f.ctx.reg(Reg::Esi), 2);
        assert_eq!(f.ctx.eip, 2);
    }

    #[test]
    fn iret_pops_ip_cs_flags() {
        let mut f = Fixture::new(0).code(&[0xcf]);
        let code = f.code;
        f.push_words(&[0x1234, code, 0x0202]);
        f.ctx.eflags = 0x0001_0000;

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.eip, 0x1234);
        assert_eq!(f.ctx.cs(), code);
        assert_eq!(f.ctx.eflags, 0x0001_0202);
        assert_eq!(f.ctx.reg(Reg::Esp), 0x86);
    }

    #[test]
    fn iret_from_system_code_is_refused() {
        let mut f = Fixture::new(0);
        f.machine.memory.write_byte(0x1000, 0xcf).unwrap();
        f.ctx.set_sreg(SegReg::Cs, 0x23);
        f.ctx.eip = 0x1000;
        let before = f.ctx;

        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx, before);
    }

    #[test]
    fn sti_delivers_pending_interrupt() {
        let mut f = Fixture::new(0).code(&[0xfa, 0xfb]);
        f.thread.vif = true;

        assert_eq!(f.run(), Emulation::Handled);
        assert!(!f.thread.vif);

        f.thread.vm86_pending = true;
        assert_eq!(f.run(), Emulation::Unhandled(ExceptionCode::Vm86Sti));
        assert!(f.thread.vif);
        assert!(!f.thread.vm86_pending);
        assert_eq!(f.ctx.eip, 2);
    }

    struct Dos;

    impl DosInterrupts for Dos {
        fn emulate_interrupt(&mut self, _: &mut MemoryImage, ctx: &mut Context, number: u8) -> bool {
            if number != 0x21 {
                return false;
            }
            ctx.set_reg16(Reg::Eax, 0x0a03);
            true
        }
    }

    #[test]
    fn int_goes_to_dos_emulation() {
        let mut f = Fixture::new(0).code(&[0xcd, 0x21, 0xcd, 0x10]);
        f.machine.set_dos(LazyDos::with_handler(Box::new(Dos)));

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.reg16(Reg::Eax), 0x0a03);
        assert_eq!(f.ctx.eip, 2);

        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx.eip, 2);
    }

    #[test]
    fn int_from_system_code_is_an_access_violation() {
        let mut f = Fixture::new(0);
        f.machine.set_dos(LazyDos::with_handler(Box::new(Dos)));
        f.machine.memory.write_data(0x1000, &[0xcd, 0x21]).unwrap();
        f.ctx.set_sreg(SegReg::Cs, 0x23);
        f.ctx.eip = 0x1000;

        assert_eq!(f.run(), Emulation::Unhandled(ExceptionCode::AccessViolation));
        assert_eq!(f.ctx.eip, 0x1000);
    }

    #[test]
    fn mov_sreg_from_register_and_memory() {
        // mov ds, ax; mov es, [bx]
        let mut f = Fixture::new(0).code(&[0x8e, 0xd8, 0x8e, 0x07]);
        let data = f.data;
        f.ctx.set_reg(Reg::Eax, 0xffff_0040);
        f.ctx.set_reg(Reg::Ebx, 0x20);
        f.machine.write_word16(data, 0x20, 0x40).unwrap();

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.sreg(SegReg::Ds), f.machine.bios_data_sel);
        assert_eq!(f.ctx.eip, 2);

        // [bx] now goes through the new DS, which is the BIOS data area
        f.machine.write_word16(f.machine.bios_data_sel, 0x20, 0x40).unwrap();
        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.sreg(SegReg::Es), f.machine.bios_data_sel);
        assert_eq!(f.ctx.eip, 4);
    }

    #[test]
    fn mov_to_cs_is_refused() {
        let mut f = Fixture::new(0).code(&[0x8e, 0xc8]);
        f.ctx.set_reg(Reg::Eax, 0x40);
        let before = f.ctx;

        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx, before);
    }

    #[test]
    fn lds_loads_offset_and_selector() {
        // lds si, [0x10]
        let mut f = Fixture::new(0).code(&[0xc5, 0x36, 0x10, 0x00]);
        let data = f.data;
        f.machine.write_word16(data, 0x10, 0x5678).unwrap();
        f.machine.write_word16(data, 0x12, 0x40).unwrap();
        f.ctx.set_reg(Reg::Esi, 0xaaaa_0000);

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.reg(Reg::Esi), 0xaaaa_5678);
        assert_eq!(f.ctx.sreg(SegReg::Ds), f.machine.bios_data_sel);
        assert_eq!(f.ctx.eip, 4);
    }

    #[test]
    fn lss_loads_stack_segment_and_register() {
        // lss bx, [0x10]
        let mut f = Fixture::new(0).code(&[0x0f, 0xb2, 0x1e, 0x10, 0x00]);
        let data = f.data;
        f.machine.write_word16(data, 0x10, 0x0400).unwrap();
        f.machine.write_word16(data, 0x12, BIMODAL_BIOS_SELECTOR).unwrap();

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.reg16(Reg::Ebx), 0x0400);
        assert_eq!(f.ctx.ss(), f.machine.bios_data_sel);
        assert_eq!(f.ctx.eip, 5);
    }

    #[test]
    fn lds_from_register_is_refused() {
        let mut f = Fixture::new(0).code(&[0xc5, 0xf0]);
        let before = f.ctx;
        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx, before);
    }

    #[test]
    fn unknown_opcode_without_gp_handler_is_unhandled() {
        let mut f = Fixture::new(0).code(&[0x0f, 0x0b]);
        assert_eq!(f.run(), Emulation::Unhandled(FAULT));
        assert_eq!(f.ctx.eip, 0);
    }

    #[test]
    fn v86_pop_uses_real_mode_stack() {
        let mut f = Fixture::new(0);
        f.machine.memory.write_byte(0x2000, 0x07).unwrap();
        f.machine.memory.write_word(0x3080, BIMODAL_BIOS_SELECTOR).unwrap();
        f.ctx.eflags = crate::cpu::EFLAGS_VM;
        f.ctx.set_sreg(SegReg::Cs, 0x200);
        f.ctx.set_sreg(SegReg::Ss, 0x300);
        f.ctx.eip = 0;

        assert_eq!(f.run(), Emulation::Handled);
        assert_eq!(f.ctx.sreg(SegReg::Es), f.machine.bios_data_sel);
        assert_eq!(f.ctx.reg(Reg::Esp), 0x82);
    }
}
