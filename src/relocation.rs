//! Segment relocation records and their application.

use log::{error, trace, warn};

use crate::error::{LoadError, Result};
use crate::machine::Machine;
use crate::memory::MemoryError;
use crate::selector::SegPtr;

/// Value patched in for imports that cannot be resolved.
pub const UNRESOLVED_IMPORT: u32 = 0xdead_beef;

const KIND_MASK: u8 = 0x03;
const ADDITIVE: u8 = 0x04;
/// `target1` of an internal reference naming an entry ordinal.
const MOVEABLE_SEGMENT: u16 = 0xff;
const CHAIN_END: u16 = 0xffff;

/// Shape of the value stored at a fixup location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    LowByte,
    Selector,
    /// 16:16 far pointer, offset first.
    Pointer32,
    Offset16,
    /// 16:32 far pointer.
    Pointer48,
    Offset32,
}

impl AddressType {
    pub const MAX: u8 = 13;

    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::LowByte,
            2 => Self::Selector,
            3 => Self::Pointer32,
            5 => Self::Offset16,
            11 => Self::Pointer48,
            13 => Self::Offset32,
            _ => return None,
        })
    }
}

/// The address types this loader can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Patch {
    LowByte,
    Selector,
    Pointer,
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTarget {
    Segment { segment: u16, offset: u16 },
    Entry { ordinal: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    Internal(InternalTarget),
    /// `module` is a 1-based index into the module table.
    ImportOrdinal { module: u16, ordinal: u16 },
    /// `name_offset` points into the importing module's imported-names table.
    ImportName { module: u16, name_offset: u16 },
    OsFixup,
}

/// One 8-byte record of a segment's relocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationRecord {
    pub address_type: u8,
    pub relocation_type: u8,
    pub offset: u16,
    pub target1: u16,
    pub target2: u16,
}

impl RelocationRecord {
    pub const SIZE: usize = 8;

    pub fn parse(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            address_type: raw[0],
            relocation_type: raw[1],
            offset: u16::from_le_bytes([raw[2], raw[3]]),
            target1: u16::from_le_bytes([raw[4], raw[5]]),
            target2: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Split a raw table into records. Trailing bytes that do not make up a
    /// whole record are ignored.
    pub fn parse_table(data: &[u8]) -> Vec<Self> {
        data.chunks_exact(Self::SIZE)
            .filter_map(|chunk| <&[u8; Self::SIZE]>::try_from(chunk).ok())
            .map(Self::parse)
            .collect()
    }

    pub fn is_additive(&self) -> bool {
        self.relocation_type & ADDITIVE != 0
    }

    pub fn kind(&self) -> RelocationKind {
        match self.relocation_type & KIND_MASK {
            0 if self.target1 & 0xff == MOVEABLE_SEGMENT => RelocationKind::Internal(InternalTarget::Entry {
                ordinal: self.target2,
            }),
            0 => RelocationKind::Internal(InternalTarget::Segment {
                segment: self.target1,
                offset: self.target2,
            }),
            1 => RelocationKind::ImportOrdinal {
                module: self.target1,
                ordinal: self.target2,
            },
            2 => RelocationKind::ImportName {
                module: self.target1,
                name_offset: self.target2,
            },
            _ => RelocationKind::OsFixup,
        }
    }

    fn unknown_address_type(&self, index: usize) -> LoadError {
        LoadError::UnknownAddressType {
            index,
            address_type: self.address_type,
            relocation_type: self.relocation_type,
            offset: self.offset,
            target1: self.target1,
            target2: self.target2,
        }
    }
}

impl Machine {
    /// Patch segment `segnum` of module `handle` with `records`.
    ///
    /// Unresolvable imports are patched with [`UNRESOLVED_IMPORT`]; only an
    /// address type this loader cannot write fails the table.
    pub fn apply_relocations(&mut self, handle: u16, segnum: u16, records: &[RelocationRecord]) -> Result<()> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        let sel = module
            .segment(segnum)
            .ok_or(LoadError::NoSuchSegment { module: handle, segment: segnum })?
            .selector;
        let name = module.name();

        for (index, rec) in records.iter().enumerate() {
            let Some(target) = self.resolve_target(handle, &name, rec)? else {
                trace!(target: "fixup", "{name}.{segnum}: OS fixup at {:04x} skipped", rec.offset);
                continue;
            };

            if rec.address_type > AddressType::MAX {
                error!(target: "fixup", "{name}.{segnum}: corrupt relocation record {index}, address type {}", rec.address_type);
                return Err(rec.unknown_address_type(index));
            }
            let shape = match AddressType::from_raw(rec.address_type) {
                Some(AddressType::LowByte) => Patch::LowByte,
                Some(AddressType::Selector) => Patch::Selector,
                Some(AddressType::Pointer32) => Patch::Pointer,
                Some(AddressType::Offset16) => Patch::Offset,
                _ => {
                    error!(target: "fixup", "{name}.{segnum}: unsupported address type {} in record {index}", rec.address_type);
                    return Err(rec.unknown_address_type(index));
                }
            };

            trace!(
                target: "fixup",
                "{name}.{segnum} record {index}: {shape:?} at {:04x} -> {target} ({})",
                rec.offset,
                if rec.is_additive() { "additive" } else { "chain" }
            );

            if rec.is_additive() {
                self.apply_additive(sel, rec.offset, shape, target);
            } else {
                self.apply_chain(sel, rec.offset, shape, target);
            }
        }
        Ok(())
    }

    /// `Ok(None)` for records that carry nothing to patch.
    fn resolve_target(&self, handle: u16, importer: &str, rec: &RelocationRecord) -> Result<Option<SegPtr>> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;

        let target = match rec.kind() {
            RelocationKind::OsFixup => return Ok(None),
            RelocationKind::Internal(InternalTarget::Entry { ordinal }) => {
                self.get_entry_point(handle, ordinal).unwrap_or_default()
            }
            RelocationKind::Internal(InternalTarget::Segment { segment, offset }) => {
                let selector = module
                    .segment(segment)
                    .ok_or(LoadError::NoSuchSegment { module: handle, segment })?
                    .selector;
                SegPtr::new(selector, offset)
            }
            RelocationKind::ImportOrdinal { module: index, ordinal } => {
                let Some(dll) = self.imported_module(handle, index) else {
                    error!(target: "fixup", "{importer}: module #{index} not in module table, ordinal {ordinal} unresolved");
                    return Ok(Some(SegPtr(UNRESOLVED_IMPORT)));
                };
                self.get_entry_point(dll, ordinal).unwrap_or_else(|| {
                    error!(target: "fixup", "{importer}: no entry point for {}.{ordinal}", self.module_name(dll));
                    SegPtr(UNRESOLVED_IMPORT)
                })
            }
            RelocationKind::ImportName { module: index, name_offset } => {
                let func = module
                    .imported_name(name_offset)
                    .map(|n| String::from_utf8_lossy(n).into_owned())
                    .unwrap_or_default();
                let Some(dll) = self.imported_module(handle, index) else {
                    error!(target: "fixup", "{importer}: module #{index} not in module table, '{func}' unresolved");
                    return Ok(Some(SegPtr(UNRESOLVED_IMPORT)));
                };
                let ordinal = self.get_ordinal(dll, &func);
                let found = (ordinal != 0)
                    .then(|| self.get_entry_point(dll, ordinal))
                    .flatten();
                found.unwrap_or_else(|| {
                    error!(target: "fixup", "{importer}: no entry point for {}.{func}", self.module_name(dll));
                    SegPtr(UNRESOLVED_IMPORT)
                })
            }
        };
        Ok(Some(target))
    }

    fn imported_module(&self, handle: u16, index: u16) -> Option<u16> {
        let module = self.modules.get(handle)?;
        let dll = *module.module_table.get(usize::from(index).checked_sub(1)?)?;
        self.modules.get(dll).map(|_| dll)
    }

    fn module_name(&self, handle: u16) -> String {
        self.modules
            .get(handle)
            .map_or_else(|| format!("{handle:#06x}"), |m| m.name())
    }

    /// Add `target` to the location at `offset`. A location that does not
    /// fit in the segment is logged and skipped.
    fn apply_additive(&mut self, sel: u16, offset: u16, shape: Patch, target: SegPtr) {
        if let Err(err) = self.add_target(sel, u32::from(offset), shape, target) {
            warn!(target: "fixup", "additive fixup at {sel:04x}:{offset:04x} skipped: {err}");
        }
    }

    fn add_target(&mut self, sel: u16, at: u32, shape: Patch, target: SegPtr) -> std::result::Result<(), MemoryError> {
        match shape {
            Patch::LowByte => {
                let value = self.read_byte16(sel, at)?;
                self.write_byte16(sel, at, value.wrapping_add(target.offset() as u8))
            }
            Patch::Offset => {
                let value = self.read_word16(sel, at)?;
                self.write_word16(sel, at, value.wrapping_add(target.offset()))
            }
            Patch::Pointer => {
                let value = self.read_word16(sel, at)?;
                self.read_word16(sel, at + 2)?;
                self.write_word16(sel, at, value.wrapping_add(target.offset()))?;
                self.write_word16(sel, at + 2, target.selector())
            }
            Patch::Selector => {
                let value = self.read_word16(sel, at)?;
                if value != 0 {
                    warn!(target: "fixup", "additive selector fixup at {sel:04x}:{at:04x} over {value:#06x}, left alone");
                    Ok(())
                } else {
                    self.write_word16(sel, at, target.selector())
                }
            }
        }
    }

    fn write_target(&mut self, sel: u16, at: u32, shape: Patch, target: SegPtr) -> std::result::Result<(), MemoryError> {
        match shape {
            Patch::LowByte => self.write_byte16(sel, at, target.offset() as u8),
            Patch::Offset => self.write_word16(sel, at, target.offset()),
            Patch::Pointer => self.write_dword16(sel, at, target.0),
            Patch::Selector => self.write_word16(sel, at, target.selector()),
        }
    }

    /// Write `target` to every location of the chain starting at `offset`.
    /// Each location holds the offset of the next one. A link word that runs
    /// off the end of the segment ends the chain.
    fn apply_chain(&mut self, sel: u16, mut offset: u16, shape: Patch, target: SegPtr) {
        let size = self.global_size(sel);
        loop {
            let at = u32::from(offset);
            let next = self.read_word16(sel, at).ok();
            if let Err(err) = self.write_target(sel, at, shape, target) {
                warn!(target: "fixup", "fixup at {sel:04x}:{offset:04x} skipped: {err}");
            }

            let Some(next) = next else {
                break;
            };
            if next == offset || u32::from(next) >= size || next == CHAIN_END {
                break;
            }
            offset = next;
        }
    }
}
