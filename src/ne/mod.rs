//! In-memory form of a New Executable module.

mod entry;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use goblin::pe::header::{DOS_MAGIC, PE_MAGIC, PE_POINTER_OFFSET};
use log::debug;

use crate::error::{LoadError, Result};

pub use entry::{CONSTANT_SEGMENT, Entry, EntryBundle, EntryFlags};
pub(crate) use entry::{find_entry, find_entry_mut};

const NE_HEADER_SIZE: usize = 0x40;
const SEGMENT_ENTRY_SIZE: usize = 8;
const MIN_PROGRAM_STACK: u16 = 0x1400;

const EXE_TYPE_WINDOWS: u8 = 2;
const EXE_TYPE_WIN386: u8 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u16 {
        const SINGLEDATA = 0x0001;
        const MULTIPLEDATA = 0x0002;
        const WIN32 = 0x0010;
        const BUILTIN = 0x0020;
        const SELFLOAD = 0x0800;
        const LINKERROR = 0x2000;
        const CALLWEP = 0x4000;
        const LIBMODULE = 0x8000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u16 {
        const DATA = 0x0001;
        const ALLOCATED = 0x0002;
        const LOADED = 0x0004;
        const ITERATED = 0x0008;
        const MOVEABLE = 0x0010;
        const SHAREABLE = 0x0020;
        const PRELOAD = 0x0040;
        const READONLY = 0x0080;
        const RELOC_DATA = 0x0100;
        const DISCARDABLE = 0x1000;
        const BIT32 = 0x2000;
    }
}

/// Little-endian cursor over the raw file image.
pub(crate) struct Bytes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Bytes<'a> {
    pub(crate) fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(LoadError::BadFormat("table runs past end of file"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeHeader {
    pub linker_version: u8,
    pub linker_revision: u8,
    pub flags: ModuleFlags,
    pub autodata: u16,
    pub heap_size: u16,
    pub stack_size: u16,
    /// Initial `segment:offset`, segment being a 1-based segment number.
    pub cs_ip: (u16, u16),
    pub ss_sp: (u16, u16),
    pub alignment_shift: u16,
    pub exe_type: u8,
    pub expected_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    /// File position in alignment units; 0 means the segment has no image.
    pub filepos: u16,
    pub size: u16,
    pub flags: SegmentFlags,
    pub minsize: u16,
    /// Selector once the segment has been allocated.
    pub selector: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: Vec<u8>,
    pub ordinal: u16,
}

#[derive(Debug)]
pub struct NeModule {
    pub handle: u16,
    pub path: PathBuf,
    pub file: Option<File>,
    pub header: NeHeader,
    pub segments: Vec<SegmentEntry>,
    /// First entry is the module name.
    pub resident_names: Vec<NameEntry>,
    /// First entry is the module description.
    pub nonresident_names: Vec<NameEntry>,
    /// Offsets into `imported_names`, one per referenced module.
    pub module_refs: Vec<u16>,
    /// Handles of the referenced modules, filled in by DLL loading.
    pub module_table: Vec<u16>,
    pub imported_names: Vec<u8>,
    pub entries: Vec<EntryBundle>,
    /// Stack segment used for self-loader callouts.
    pub self_loading_sel: u16,
    pub dlls_to_init: Vec<u16>,
    pub usage: u16,
}

impl NeModule {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let mut module = Self::parse(&bytes, path)?;
        module.file = Some(File::open(path)?);
        Ok(module)
    }

    /// Build a module from a file image. The result has no backing file and
    /// no handle; both are attached by the caller.
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        let mut mz = Bytes::new(bytes, 0);
        if mz.u16().map_err(|_| LoadError::NotMz)? != DOS_MAGIC {
            return Err(LoadError::NotMz);
        }
        let lfanew = Bytes::new(bytes, PE_POINTER_OFFSET as usize)
            .u32()
            .map_err(|_| LoadError::NotMz)? as usize;

        let signature = Bytes::new(bytes, lfanew).take(4).unwrap_or(&[]);
        if signature.len() == 4 && u32::from_le_bytes([signature[0], signature[1], signature[2], signature[3]]) == PE_MAGIC {
            return Err(LoadError::Win32Executable);
        }
        match signature.get(..2) {
            Some(b"NE") => {}
            Some(b"LX") | Some(b"LE") => return Err(LoadError::LinearExecutable),
            _ => return Err(LoadError::BadFormat("missing NE signature")),
        }

        let raw = Bytes::new(bytes, lfanew).take(NE_HEADER_SIZE)?;
        let mut h = Bytes::new(raw, 2);
        let linker_version = h.u8()?;
        let linker_revision = h.u8()?;
        let entry_table = h.u16()?;
        let _entry_table_len = h.u16()?;
        let _crc = h.u32()?;
        let mut flags = ModuleFlags::from_bits_retain(h.u16()?);
        let autodata = h.u16()?;
        let heap_size = h.u16()?;
        let mut stack_size = h.u16()?;
        let cs_ip = {
            let ip = h.u16()?;
            (h.u16()?, ip)
        };
        let ss_sp = {
            let sp = h.u16()?;
            (h.u16()?, sp)
        };
        let segment_count = h.u16()?;
        let module_ref_count = h.u16()?;
        let nonresident_size = h.u16()?;
        let segment_table = h.u16()?;
        let _resource_table = h.u16()?;
        let resident_table = h.u16()?;
        let module_ref_table = h.u16()?;
        let imported_table = h.u16()?;
        let nonresident_table = h.u32()?;
        let _moveable_entries = h.u16()?;
        let alignment_shift = h.u16()?;
        let _resource_count = h.u16()?;
        let exe_type = h.u8()?;
        let _other_flags = h.u8()?;
        let _fastload = h.u32()?;
        let _swap_area = h.u16()?;
        let expected_version = h.u16()?;

        if exe_type != EXE_TYPE_WINDOWS && exe_type != EXE_TYPE_WIN386 {
            return Err(LoadError::UnsupportedOs(exe_type));
        }
        if alignment_shift > 15 {
            return Err(LoadError::BadFormat("alignment shift out of range"));
        }

        flags.remove(ModuleFlags::WIN32 | ModuleFlags::BUILTIN);
        if !flags.contains(ModuleFlags::LIBMODULE) && stack_size < MIN_PROGRAM_STACK {
            stack_size = MIN_PROGRAM_STACK;
        }

        let at = |offset: u16| lfanew + usize::from(offset);

        let mut table = Bytes::new(bytes, at(segment_table));
        let mut segments = Vec::with_capacity(segment_count.into());
        for _ in 0..segment_count {
            let raw = table.take(SEGMENT_ENTRY_SIZE)?;
            let mut s = Bytes::new(raw, 0);
            let filepos = s.u16()?;
            let size = s.u16()?;
            let mut seg_flags = SegmentFlags::from_bits_retain(s.u16()?);
            let minsize = s.u16()?;
            seg_flags.remove(SegmentFlags::ALLOCATED | SegmentFlags::LOADED);
            segments.push(SegmentEntry {
                filepos,
                size,
                flags: seg_flags,
                minsize,
                selector: 0,
            });
        }

        let resident_names = parse_name_table(&mut Bytes::new(bytes, at(resident_table)))?;

        let mut refs = Bytes::new(bytes, at(module_ref_table));
        let module_refs = (0..module_ref_count)
            .map(|_| refs.u16())
            .collect::<Result<Vec<_>>>()?;

        // The imported-names table has no length field; it runs up to the
        // entry table.
        let imported_names = if entry_table > imported_table {
            Bytes::new(bytes, at(imported_table))
                .take(usize::from(entry_table - imported_table))?
                .to_vec()
        } else {
            Vec::new()
        };

        let entries = entry::parse_entry_table(&mut Bytes::new(bytes, at(entry_table)))?;

        let nonresident_names = if nonresident_size != 0 {
            Bytes::new(bytes, nonresident_table as usize)
                .take(usize::from(nonresident_size))
                .and_then(|raw| parse_name_table(&mut Bytes::new(raw, 0)))
                .unwrap_or_else(|err| {
                    debug!(target: "module", "ignoring non-resident names: {err}");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        let module = Self {
            handle: 0,
            path: path.to_path_buf(),
            file: None,
            header: NeHeader {
                linker_version,
                linker_revision,
                flags,
                autodata,
                heap_size,
                stack_size,
                cs_ip,
                ss_sp,
                alignment_shift,
                exe_type,
                expected_version,
            },
            segments,
            resident_names,
            nonresident_names,
            module_refs,
            module_table: Vec::new(),
            imported_names,
            entries,
            self_loading_sel: 0,
            dlls_to_init: Vec::new(),
            usage: 0,
        };
        debug!(target: "module", "built {} from {}: {} segments, {} imports", module.name(), path.display(), module.segments.len(), module.module_refs.len());
        Ok(module)
    }

    pub fn name(&self) -> String {
        self.resident_names
            .first()
            .map(|n| String::from_utf8_lossy(&n.name).into_owned())
            .unwrap_or_default()
    }

    pub fn flags(&self) -> ModuleFlags {
        self.header.flags
    }

    pub fn is_self_loading(&self) -> bool {
        self.header.flags.contains(ModuleFlags::SELFLOAD)
    }

    pub fn segment(&self, segnum: u16) -> Option<&SegmentEntry> {
        self.segments.get(usize::from(segnum).checked_sub(1)?)
    }

    pub fn segment_mut(&mut self, segnum: u16) -> Option<&mut SegmentEntry> {
        self.segments.get_mut(usize::from(segnum).checked_sub(1)?)
    }

    /// Length-prefixed string at `offset` in the imported-names table.
    pub fn imported_name(&self, offset: u16) -> Option<&[u8]> {
        let start = usize::from(offset);
        let len = usize::from(*self.imported_names.get(start)?);
        self.imported_names.get(start + 1..start + 1 + len)
    }

    /// Selector of the automatic data segment, or 0 when the module has none.
    pub fn dgroup_selector(&self) -> u16 {
        if !self
            .header
            .flags
            .intersects(ModuleFlags::SINGLEDATA | ModuleFlags::MULTIPLEDATA)
        {
            return 0;
        }
        self.segment(self.header.autodata).map_or(0, |s| s.selector)
    }

    pub fn entry(&self, ordinal: u16) -> Option<&Entry> {
        find_entry(&self.entries, ordinal)
    }
}

fn parse_name_table(bytes: &mut Bytes<'_>) -> Result<Vec<NameEntry>> {
    let mut names = Vec::new();
    loop {
        let len = bytes.u8()?;
        if len == 0 {
            break;
        }
        let name = bytes.take(len.into())?.to_vec();
        let ordinal = bytes.u16()?;
        names.push(NameEntry { name, ordinal });
    }
    Ok(names)
}
