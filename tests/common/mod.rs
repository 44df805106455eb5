#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub const SINGLEDATA: u16 = 0x0001;
pub const MULTIPLEDATA: u16 = 0x0002;
pub const SELFLOAD: u16 = 0x0800;
pub const LIBMODULE: u16 = 0x8000;

pub const SEG_DATA: u16 = 0x0001;
pub const SEG_ITERATED: u16 = 0x0008;
pub const SEG_RELOC: u16 = 0x0100;

pub const EXPORTED: u8 = 0x01;
pub const SHARED: u8 = 0x02;

const LFANEW: usize = 0x40;
const ALIGN_SHIFT: u16 = 4;

/// One 8-byte relocation record.
pub fn reloc(address_type: u8, relocation_type: u8, offset: u16, target1: u16, target2: u16) -> [u8; 8] {
    let mut rec = [0u8; 8];
    rec[0] = address_type;
    rec[1] = relocation_type;
    rec[2..4].copy_from_slice(&offset.to_le_bytes());
    rec[4..6].copy_from_slice(&target1.to_le_bytes());
    rec[6..8].copy_from_slice(&target2.to_le_bytes());
    rec
}

/// An iterated-data record: `run` repeated `repeat` times.
pub fn iterated(repeat: u16, run: &[u8]) -> Vec<u8> {
    let mut out = repeat.to_le_bytes().to_vec();
    out.extend_from_slice(&(run.len() as u16).to_le_bytes());
    out.extend_from_slice(run);
    out
}

#[derive(Debug, Clone)]
pub struct Segment {
    data: Vec<u8>,
    flags: u16,
    minsize: u16,
    relocs: Vec<[u8; 8]>,
    has_image: bool,
}

impl Segment {
    pub fn code(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            flags: 0,
            minsize: data.len() as u16,
            relocs: Vec::new(),
            has_image: true,
        }
    }

    pub fn data(data: &[u8]) -> Self {
        Self {
            flags: SEG_DATA,
            ..Self::code(data)
        }
    }

    /// A data segment with no file image.
    pub fn bss(minsize: u16) -> Self {
        Self {
            data: Vec::new(),
            flags: SEG_DATA,
            minsize,
            relocs: Vec::new(),
            has_image: false,
        }
    }

    pub fn minsize(mut self, minsize: u16) -> Self {
        self.minsize = minsize;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn reloc(mut self, rec: [u8; 8]) -> Self {
        self.relocs.push(rec);
        self.flags |= SEG_RELOC;
        self
    }
}

struct Export {
    name: Option<String>,
    segment: u8,
    offset: u16,
    flags: u8,
}

pub struct NeBuilder {
    name: String,
    flags: u16,
    autodata: u16,
    heap_size: u16,
    stack_size: u16,
    cs_ip: (u16, u16),
    ss_sp: (u16, u16),
    segments: Vec<Segment>,
    exports: Vec<Export>,
    module_refs: Vec<u16>,
    imported_names: Vec<u8>,
}

impl NeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: SINGLEDATA,
            autodata: 0,
            heap_size: 0,
            stack_size: 0,
            cs_ip: (0, 0),
            ss_sp: (0, 0),
            segments: Vec::new(),
            exports: Vec::new(),
            module_refs: Vec::new(),
            // offset 0 is the empty name
            imported_names: vec![0],
        }
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn autodata(mut self, segnum: u16) -> Self {
        self.autodata = segnum;
        self
    }

    pub fn heap(mut self, size: u16) -> Self {
        self.heap_size = size;
        self
    }

    pub fn stack(mut self, segnum: u16, size: u16) -> Self {
        self.ss_sp = (segnum, 0);
        self.stack_size = size;
        self
    }

    pub fn entry_point(mut self, segnum: u16, offset: u16) -> Self {
        self.cs_ip = (segnum, offset);
        self
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Export `name` as the next ordinal.
    pub fn export(mut self, name: &str, segment: u8, offset: u16, flags: u8) -> Self {
        self.exports.push(Export {
            name: Some(name.to_ascii_uppercase()),
            segment,
            offset,
            flags,
        });
        self
    }

    /// Add an entry without a resident name as the next ordinal.
    pub fn entry(mut self, segment: u8, offset: u16, flags: u8) -> Self {
        self.exports.push(Export {
            name: None,
            segment,
            offset,
            flags,
        });
        self
    }

    /// Leave the next `count` ordinals unused.
    pub fn unused(mut self, count: u8) -> Self {
        self.exports.push(Export {
            name: None,
            segment: 0,
            offset: u16::from(count),
            flags: 0,
        });
        self
    }

    /// Reference another module; its index in the module table is the
    /// number of imports so far.
    pub fn import(mut self, module: &str) -> Self {
        let offset = self.name_offset(module);
        self.module_refs.push(offset);
        self
    }

    /// Offset of `name` in the imported-names table, adding it if needed.
    pub fn name_offset(&mut self, name: &str) -> u16 {
        let mut pos = 1;
        while pos < self.imported_names.len() {
            let len = usize::from(self.imported_names[pos]);
            if &self.imported_names[pos + 1..pos + 1 + len] == name.as_bytes() {
                return pos as u16;
            }
            pos += 1 + len;
        }
        let offset = self.imported_names.len() as u16;
        self.imported_names.push(name.len() as u8);
        self.imported_names.extend_from_slice(name.as_bytes());
        offset
    }

    pub fn build(&self) -> Vec<u8> {
        let mut tables = Vec::new();
        let table_base = 0x40usize;
        let rel = |tables: &Vec<u8>| (table_base + tables.len()) as u16;

        let segment_table = rel(&tables);
        // placeholder, patched once segment positions are known
        tables.resize(self.segments.len() * 8, 0);

        let resident_table = rel(&tables);
        push_name(&mut tables, &self.name, 0);
        let mut ordinal = 0;
        for export in &self.exports {
            if export.segment == 0 {
                ordinal += export.offset;
                continue;
            }
            ordinal += 1;
            if let Some(name) = &export.name {
                push_name(&mut tables, name, ordinal);
            }
        }
        tables.push(0);

        let module_ref_table = rel(&tables);
        for offset in &self.module_refs {
            tables.extend_from_slice(&offset.to_le_bytes());
        }

        let imported_table = rel(&tables);
        tables.extend_from_slice(&self.imported_names);

        let entry_table = rel(&tables);
        for export in &self.exports {
            if export.segment == 0 {
                tables.extend_from_slice(&[export.offset as u8, 0]);
                continue;
            }
            tables.extend_from_slice(&[1, export.segment, export.flags]);
            tables.extend_from_slice(&export.offset.to_le_bytes());
        }
        tables.push(0);
        let entry_len = rel(&tables) - entry_table;

        let mut header = vec![0u8; 0x40];
        header[0..2].copy_from_slice(b"NE");
        header[2] = 5;
        let mut put = |at: usize, value: u16| header[at..at + 2].copy_from_slice(&value.to_le_bytes());
        put(0x04, entry_table);
        put(0x06, entry_len);
        put(0x0c, self.flags);
        put(0x0e, self.autodata);
        put(0x10, self.heap_size);
        put(0x12, self.stack_size);
        put(0x14, self.cs_ip.1);
        put(0x16, self.cs_ip.0);
        put(0x18, self.ss_sp.1);
        put(0x1a, self.ss_sp.0);
        put(0x1c, self.segments.len() as u16);
        put(0x1e, self.module_refs.len() as u16);
        put(0x22, segment_table);
        put(0x24, resident_table);
        put(0x26, resident_table);
        put(0x28, module_ref_table);
        put(0x2a, imported_table);
        put(0x32, ALIGN_SHIFT);
        put(0x3e, 0x030a);
        header[0x36] = 2;

        let mut image = vec![0u8; LFANEW];
        image[0..2].copy_from_slice(b"MZ");
        image[0x3c..0x40].copy_from_slice(&(LFANEW as u32).to_le_bytes());
        image.extend_from_slice(&header);
        image.extend_from_slice(&tables);

        let mut seg_entries = Vec::new();
        for seg in &self.segments {
            let align = 1usize << ALIGN_SHIFT;
            let filepos = if seg.has_image {
                image.resize(image.len().div_ceil(align) * align, 0);
                let pos = image.len();
                image.extend_from_slice(&seg.data);
                if !seg.relocs.is_empty() {
                    image.extend_from_slice(&(seg.relocs.len() as u16).to_le_bytes());
                    for rec in &seg.relocs {
                        image.extend_from_slice(rec);
                    }
                }
                (pos >> ALIGN_SHIFT) as u16
            } else {
                0
            };
            let mut entry = Vec::with_capacity(8);
            entry.extend_from_slice(&filepos.to_le_bytes());
            entry.extend_from_slice(&(seg.data.len() as u16).to_le_bytes());
            entry.extend_from_slice(&seg.flags.to_le_bytes());
            entry.extend_from_slice(&seg.minsize.to_le_bytes());
            seg_entries.extend(entry);
        }
        let start = LFANEW + usize::from(segment_table);
        image[start..start + seg_entries.len()].copy_from_slice(&seg_entries);
        image
    }

    pub fn write(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

fn push_name(out: &mut Vec<u8>, name: &str, ordinal: u16) {
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&ordinal.to_le_bytes());
}
