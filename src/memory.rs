use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Access rights of a block of guest linear memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

/// A contiguous block of guest linear memory backed by a host buffer.
#[derive(Debug, Clone)]
pub struct MemorySegment {
    pub base: u32,
    pub data: Vec<u8>,
    pub prot: Protection,
}

impl MemorySegment {
    pub fn new(base: u32, size: usize, prot: Protection) -> Self {
        Self {
            base,
            data: vec![0u8; size],
            prot,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn end(&self) -> u64 {
        u64::from(self.base) + self.data.len() as u64
    }
}

/// The guest's linear address space: 16-bit selectors, V86 segments and flat
/// system addresses all resolve to addresses in here.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    segments: Vec<MemorySegment>,
}

impl MemoryImage {
    pub fn new(segments: Vec<MemorySegment>) -> Self {
        let mut image = Self { segments };
        image.segments.sort_by_key(|seg| seg.base);
        image
    }

    pub fn segments(&self) -> &[MemorySegment] {
        &self.segments
    }

    pub fn read_bytes(&self, addr: u32, size: usize) -> Result<&[u8], MemoryError> {
        self.read_range(addr, size, Protection::READ, "read")
    }

    /// Instruction bytes are read without an execute check: the caller is the
    /// trap handler inspecting an instruction the CPU already fetched.
    pub fn fetch_code(&self, addr: u32, size: usize) -> Result<&[u8], MemoryError> {
        self.read_range(addr, size, Protection::empty(), "fetch")
    }

    pub fn read_byte(&self, addr: u32) -> Result<u8, MemoryError> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    pub fn read_word(&self, addr: u32) -> Result<u16, MemoryError> {
        let bytes = self.read_bytes(addr, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_dword(&self, addr: u32) -> Result<u32, MemoryError> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_data(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let size = data.len();
        if size == 0 {
            return Ok(());
        }
        let end = u64::from(addr) + size as u64;

        let segment = self
            .segment_containing_mut(addr, end)
            .ok_or(MemoryError::Unmapped { addr, size })?;

        if !segment.prot.contains(Protection::WRITE) {
            return Err(MemoryError::AccessViolation {
                addr,
                access: "write",
            });
        }

        let offset = (addr - segment.base) as usize;
        segment.data[offset..offset + size].copy_from_slice(data);
        Ok(())
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write_data(addr, &[value])
    }

    pub fn write_word(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write_data(addr, &value.to_le_bytes())
    }

    pub fn write_dword(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_data(addr, &value.to_le_bytes())
    }

    fn read_range(
        &self,
        addr: u32,
        size: usize,
        required: Protection,
        access: &'static str,
    ) -> Result<&[u8], MemoryError> {
        let end = u64::from(addr) + size as u64;

        let segment = self
            .segment_containing(addr, end)
            .ok_or(MemoryError::Unmapped { addr, size })?;

        if !segment.prot.contains(required) {
            return Err(MemoryError::AccessViolation { addr, access });
        }

        let offset = (addr - segment.base) as usize;
        Ok(&segment.data[offset..offset + size])
    }

    fn segment_containing(&self, start: u32, end: u64) -> Option<&MemorySegment> {
        self.segments
            .iter()
            .find(|seg| start >= seg.base && end <= seg.end())
    }

    fn segment_containing_mut(&mut self, start: u32, end: u64) -> Option<&mut MemorySegment> {
        self.segments
            .iter_mut()
            .find(|seg| start >= seg.base && end <= seg.end())
    }

    /// Return true if any segment fully covers the given address range.
    pub fn covers_range(&self, addr: u32, size: usize) -> bool {
        self.segment_containing(addr, u64::from(addr) + size as u64)
            .is_some()
    }

    pub fn add_segment(&mut self, segment: MemorySegment) {
        self.segments.push(segment);
        self.segments.sort_by_key(|s| s.base);
    }

    /// Remove the segment starting exactly at `base`.
    pub fn remove_segment(&mut self, base: u32) -> Option<MemorySegment> {
        let idx = self.segments.iter().position(|s| s.base == base)?;
        Some(self.segments.remove(idx))
    }

    /// Find a free, `align`-aligned range of `size` bytes at or above `floor`.
    pub fn find_free_range(&self, size: usize, align: u32, floor: u32) -> Option<u32> {
        let align = u64::from(align.max(1));
        let align_up = |v: u64| v.div_ceil(align) * align;
        let mut candidate = align_up(u64::from(floor));

        for seg in &self.segments {
            if seg.end() <= candidate {
                continue;
            }
            if candidate + size as u64 <= u64::from(seg.base) {
                break;
            }
            candidate = align_up(seg.end());
        }

        if candidate + size as u64 <= 0x1_0000_0000 {
            Some(candidate as u32)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("no segment covers range {addr:#x}+{size}")]
    Unmapped { addr: u32, size: usize },
    #[error("segment at {addr:#x} missing permission to {access}")]
    AccessViolation { addr: u32, access: &'static str },
    #[error("selector {selector:#06x} cannot address offset {offset:#x} (+{size})")]
    InvalidSelector {
        selector: u16,
        offset: u32,
        size: usize,
    },
}
