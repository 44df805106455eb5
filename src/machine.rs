use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut, Range};
use std::time::Duration;

use anyhow::bail;
use log::warn;

use crate::config::Config;
use crate::cpu::{BiosTicker, Context, HostPorts, LazyDos, PortIo};
use crate::memory::{MemoryImage, MemorySegment, Protection};
use crate::module::ModuleRegistry;
use crate::selector::{Ldt, SegPtr, SelectorFlags};

/// Real-mode memory plus the HMA, mapped at linear address 0.
pub const DOS_MEMORY_SIZE: usize = 0x11_0000;
/// Linear address of the BIOS data area (segment 0x40).
pub const BIOS_DATA_BASE: u32 = 0x400;
const BIOS_DATA_LIMIT: u32 = 0xff;

/// Addresses of the host routines a self-loading module calls back into.
/// They are written into the module's self-load header before `BootApp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelThunks {
    pub entry_addr_proc: SegPtr,
    pub my_alloc: SegPtr,
    pub set_owner: SegPtr,
}

/// Backend that runs 16-bit guest code on behalf of the loader.
pub trait Call16 {
    /// Far-call `target` with `args` pushed left to right (Pascal order) on
    /// the thread's current 16-bit stack. Returns DX:AX.
    fn call16(
        &mut self,
        machine: &mut Machine,
        thread: &mut Thread,
        target: SegPtr,
        args: &[u16],
    ) -> anyhow::Result<u32>;

    /// Far-call `ctx.cs:ctx.eip` with the given register state.
    fn call16_regs(
        &mut self,
        machine: &mut Machine,
        thread: &mut Thread,
        ctx: &mut Context,
    ) -> anyhow::Result<()>;

    fn kernel_thunks(&self) -> KernelThunks {
        KernelThunks::default()
    }
}

/// Used when no execution backend has been installed.
#[derive(Debug, Default)]
pub struct NoCall16;

impl Call16 for NoCall16 {
    fn call16(&mut self, _: &mut Machine, _: &mut Thread, target: SegPtr, _: &[u16]) -> anyhow::Result<u32> {
        bail!("no 16-bit execution backend to call {target}")
    }

    fn call16_regs(&mut self, _: &mut Machine, _: &mut Thread, ctx: &mut Context) -> anyhow::Result<()> {
        bail!(
            "no 16-bit execution backend to call {}",
            SegPtr::new(ctx.cs(), ctx.eip as u16)
        )
    }
}

/// Per-thread state of a 16-bit task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Thread {
    /// Current 16-bit stack, as SS:SP.
    pub stack16: SegPtr,
    /// Virtual interrupt flag toggled by `cli`/`sti`.
    pub vif: bool,
    /// A virtual interrupt is waiting for `sti`.
    pub vm86_pending: bool,
}

impl Thread {
    /// Switch to another 16-bit stack until the returned guard is dropped.
    pub fn switch_stack(&mut self, stack: SegPtr) -> StackSwitch<'_> {
        let saved = std::mem::replace(&mut self.stack16, stack);
        StackSwitch {
            thread: self,
            saved,
        }
    }
}

pub struct StackSwitch<'a> {
    thread: &'a mut Thread,
    saved: SegPtr,
}

impl StackSwitch<'_> {
    pub fn saved(&self) -> SegPtr {
        self.saved
    }
}

impl Deref for StackSwitch<'_> {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        self.thread
    }
}

impl DerefMut for StackSwitch<'_> {
    fn deref_mut(&mut self) -> &mut Thread {
        self.thread
    }
}

impl Drop for StackSwitch<'_> {
    fn drop(&mut self) {
        self.thread.stack16 = self.saved;
    }
}

/// DOS file handles visible to 16-bit code.
#[derive(Debug)]
pub struct DosHandles {
    files: BTreeMap<u16, File>,
}

/// 0-4 are the standard DOS devices.
const FIRST_FILE_HANDLE: u16 = 5;

impl Default for DosHandles {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }
}

impl DosHandles {
    /// Duplicate `file` into a new handle sharing its file offset.
    pub fn dup(&mut self, file: &File) -> io::Result<u16> {
        let handle = (FIRST_FILE_HANDLE..=u16::MAX)
            .find(|h| !self.files.contains_key(h))
            .ok_or_else(|| io::Error::other("DOS handle table full"))?;

        self.files.insert(handle, file.try_clone()?);
        Ok(handle)
    }

    pub fn get_mut(&mut self, handle: u16) -> Option<&mut File> {
        self.files.get_mut(&handle)
    }

    pub fn close(&mut self, handle: u16) -> bool {
        self.files.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Process-wide state of the emulated Win16 environment.
pub struct Machine {
    pub memory: MemoryImage,
    pub ldt: Ldt,
    pub modules: ModuleRegistry,
    pub files: DosHandles,
    pub config: Config,
    /// Selector standing in for the bimodal 0x40 selector.
    pub bios_data_sel: u16,
    pub relay_code: Range<u32>,
    pub(crate) bios: BiosTicker,
    pub(crate) dos: LazyDos,
    pub(crate) ports: Box<dyn PortIo>,
    pub(crate) callbacks: Box<dyn Call16>,
}

impl Machine {
    pub fn new(config: Config) -> Self {
        let memory = MemoryImage::new(vec![MemorySegment::new(
            0,
            DOS_MEMORY_SIZE,
            Protection::READ | Protection::WRITE | Protection::EXEC,
        )]);
        let relay_code = config
            .emulator
            .relay_code
            .map_or(0..0, |relay| relay.range());

        let mut machine = Self {
            memory,
            ldt: Ldt::new(),
            modules: ModuleRegistry::default(),
            files: DosHandles::default(),
            bios_data_sel: 0,
            relay_code,
            bios: BiosTicker::new(Duration::from_millis(config.emulator.bios_tick_ms)),
            dos: LazyDos::default(),
            ports: Box::new(HostPorts::new(config.ports.device.clone())),
            callbacks: Box::new(NoCall16),
            config,
        };

        // The LDT is empty at this point, so this cannot fail.
        match machine.alloc_alias(BIOS_DATA_BASE, BIOS_DATA_LIMIT, SelectorFlags::empty()) {
            Ok(sel) => machine.bios_data_sel = sel,
            Err(err) => warn!(target: "instr", "no BIOS data selector: {err}"),
        }
        machine
    }

    pub fn set_port_io(&mut self, ports: Box<dyn PortIo>) {
        self.ports = ports;
    }

    pub fn set_callbacks(&mut self, callbacks: Box<dyn Call16>) {
        self.callbacks = callbacks;
    }

    pub fn set_dos(&mut self, dos: LazyDos) {
        self.dos = dos;
    }

    pub fn bios_ticker(&self) -> &BiosTicker {
        &self.bios
    }

    /// Run `f` with the callback backend taken out of the machine, so that the
    /// backend can itself get `&mut Machine`.
    pub(crate) fn with_callbacks<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Call16, &mut Machine) -> R,
    ) -> R {
        let mut callbacks = std::mem::replace(&mut self.callbacks, Box::new(NoCall16));
        let result = f(callbacks.as_mut(), self);
        self.callbacks = callbacks;
        result
    }
}
