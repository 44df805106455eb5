use std::fmt;

use bitflags::bitflags;
use log::debug;

use crate::error::{LoadError, Result};
use crate::machine::Machine;
use crate::memory::{MemoryError, MemorySegment, Protection};

/// First LDT index handed out to guest segments; lower entries are the host's.
pub const FIRST_USER_ENTRY: usize = 16;
pub const LDT_SIZE: usize = 8192;

/// Guest segments are carved out of linear memory above the DOS area and HMA.
const HEAP_FLOOR: u32 = 0x0011_0000;
const HEAP_ALIGN: u32 = 0x1_0000;

/// A 16:16 far pointer, selector in the high word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegPtr(pub u32);

impl SegPtr {
    pub const fn new(selector: u16, offset: u16) -> Self {
        Self(((selector as u32) << 16) | offset as u32)
    }

    pub const fn selector(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn offset(self) -> u16 {
        self.0 as u16
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SegPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.selector(), self.offset())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SelectorFlags: u8 {
        const CODE = 0x1;
        /// 32-bit default operand and address size (the descriptor's B/D bit).
        const BIG = 0x2;
        const READONLY = 0x4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdtEntry {
    pub base: u32,
    pub limit: u32,
    pub flags: SelectorFlags,
    pub owner: u16,
    /// Whether freeing the selector also releases the linear memory behind it.
    pub owns_memory: bool,
}

/// The local descriptor table of the emulated process.
#[derive(Debug, Clone)]
pub struct Ldt {
    entries: Vec<Option<LdtEntry>>,
}

impl Default for Ldt {
    fn default() -> Self {
        Self::new()
    }
}

impl Ldt {
    pub fn new() -> Self {
        Self {
            entries: vec![None; LDT_SIZE],
        }
    }

    /// Selectors with the table-indicator bit clear belong to the host's flat
    /// address space rather than to the guest's LDT.
    pub const fn is_system(selector: u16) -> bool {
        selector & 4 == 0
    }

    pub const fn selector_for(index: usize) -> u16 {
        ((index as u16) << 3) | 7
    }

    pub fn get(&self, selector: u16) -> Option<&LdtEntry> {
        if Self::is_system(selector) {
            return None;
        }
        self.entries
            .get(usize::from(selector >> 3))
            .and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, selector: u16) -> Option<&mut LdtEntry> {
        if Self::is_system(selector) {
            return None;
        }
        self.entries
            .get_mut(usize::from(selector >> 3))
            .and_then(Option::as_mut)
    }

    pub fn alloc(&mut self, entry: LdtEntry) -> Option<u16> {
        let index = (FIRST_USER_ENTRY..LDT_SIZE).find(|&i| self.entries[i].is_none())?;
        self.entries[index] = Some(entry);
        Some(Self::selector_for(index))
    }

    pub fn free(&mut self, selector: u16) -> Option<LdtEntry> {
        if Self::is_system(selector) {
            return None;
        }
        self.entries
            .get_mut(usize::from(selector >> 3))
            .and_then(Option::take)
    }

    /// Default operand size of code running in (or stack addressed through)
    /// `selector`. The host's own selectors are flat 32-bit.
    pub fn is_32bit(&self, selector: u16) -> bool {
        if Self::is_system(selector) {
            return true;
        }
        self.get(selector)
            .is_some_and(|entry| entry.flags.contains(SelectorFlags::BIG))
    }

    /// Translate `selector:offset` for an access of `size` bytes, checking the
    /// whole access against the descriptor limit.
    pub fn translate(&self, selector: u16, offset: u32, size: u32) -> Option<u32> {
        let entry = self.get(selector)?;
        let last = u64::from(offset) + u64::from(size.max(1)) - 1;
        if last > u64::from(entry.limit) {
            return None;
        }
        Some(entry.base.wrapping_add(offset))
    }

    /// Selectors owned by `owner`, in table order.
    pub fn owned_by(&self, owner: u16) -> Vec<u16> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                Some(entry) if entry.owner == owner => Some(Self::selector_for(i)),
                _ => None,
            })
            .collect()
    }
}

impl Machine {
    /// Allocate a zeroed segment of `size` bytes (1..=64 KiB) and a selector
    /// describing it.
    pub fn global_alloc(&mut self, size: u32, flags: SelectorFlags, owner: u16) -> Result<u16> {
        let size = size.clamp(1, 0x1_0000);
        let base = self
            .memory
            .find_free_range(size as usize, HEAP_ALIGN, HEAP_FLOOR)
            .ok_or(LoadError::OutOfSelectors)?;

        let prot = if flags.contains(SelectorFlags::CODE) {
            Protection::READ | Protection::WRITE | Protection::EXEC
        } else {
            Protection::READ | Protection::WRITE
        };
        self.memory
            .add_segment(MemorySegment::new(base, size as usize, prot));

        let entry = LdtEntry {
            base,
            limit: size - 1,
            flags,
            owner,
            owns_memory: true,
        };
        match self.ldt.alloc(entry) {
            Some(selector) => {
                debug!(target: "segment", "allocated {selector:#06x} base={base:#x} size={size:#x} owner={owner:#06x}");
                Ok(selector)
            }
            None => {
                self.memory.remove_segment(base);
                Err(LoadError::OutOfSelectors)
            }
        }
    }

    /// Describe existing linear memory with a new selector.
    pub fn alloc_alias(&mut self, base: u32, limit: u32, flags: SelectorFlags) -> Result<u16> {
        self.ldt
            .alloc(LdtEntry {
                base,
                limit,
                flags,
                owner: 0,
                owns_memory: false,
            })
            .ok_or(LoadError::OutOfSelectors)
    }

    pub fn global_free(&mut self, selector: u16) -> bool {
        match self.ldt.free(selector) {
            Some(entry) => {
                if entry.owns_memory {
                    self.memory.remove_segment(entry.base);
                }
                true
            }
            None => false,
        }
    }

    pub fn global_size(&self, selector: u16) -> u32 {
        self.ldt.get(selector).map_or(0, |entry| entry.limit + 1)
    }

    pub fn far_set_owner(&mut self, selector: u16, owner: u16) {
        if let Some(entry) = self.ldt.get_mut(selector) {
            entry.owner = owner;
        }
    }

    pub fn far_get_owner(&self, selector: u16) -> u16 {
        self.ldt.get(selector).map_or(0, |entry| entry.owner)
    }

    fn linear(&self, selector: u16, offset: u32, size: usize) -> std::result::Result<u32, MemoryError> {
        self.ldt
            .translate(selector, offset, size as u32)
            .ok_or(MemoryError::InvalidSelector {
                selector,
                offset,
                size,
            })
    }

    pub fn read_bytes16(&self, selector: u16, offset: u32, size: usize) -> std::result::Result<&[u8], MemoryError> {
        let addr = self.linear(selector, offset, size)?;
        self.memory.read_bytes(addr, size)
    }

    pub fn write_bytes16(&mut self, selector: u16, offset: u32, data: &[u8]) -> std::result::Result<(), MemoryError> {
        let addr = self.linear(selector, offset, data.len())?;
        self.memory.write_data(addr, data)
    }

    pub fn read_byte16(&self, selector: u16, offset: u32) -> std::result::Result<u8, MemoryError> {
        Ok(self.read_bytes16(selector, offset, 1)?[0])
    }

    pub fn read_word16(&self, selector: u16, offset: u32) -> std::result::Result<u16, MemoryError> {
        let addr = self.linear(selector, offset, 2)?;
        self.memory.read_word(addr)
    }

    pub fn read_dword16(&self, selector: u16, offset: u32) -> std::result::Result<u32, MemoryError> {
        let addr = self.linear(selector, offset, 4)?;
        self.memory.read_dword(addr)
    }

    pub fn write_byte16(&mut self, selector: u16, offset: u32, value: u8) -> std::result::Result<(), MemoryError> {
        self.write_bytes16(selector, offset, &[value])
    }

    pub fn write_word16(&mut self, selector: u16, offset: u32, value: u16) -> std::result::Result<(), MemoryError> {
        self.write_bytes16(selector, offset, &value.to_le_bytes())
    }

    pub fn write_dword16(&mut self, selector: u16, offset: u32, value: u32) -> std::result::Result<(), MemoryError> {
        self.write_bytes16(selector, offset, &value.to_le_bytes())
    }
}
