//! Allocating, reading and relocating the segments of an NE module,
//! including the callout protocol of self-loading modules.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use log::{debug, trace, warn};

use crate::error::{LoadError, Result};
use crate::machine::{Machine, Thread};
use crate::ne::SegmentFlags;
use crate::relocation::RelocationRecord;
use crate::selector::{SegPtr, SelectorFlags};

const MAX_SEGMENT_SIZE: u32 = 0x1_0000;

/// Size of the stack segment used for self-loader callouts.
pub const SELF_LOAD_STACK_SIZE: u32 = 0xff00;
/// Room left at the top of that stack for the callout's frame.
const CALL_FRAME_SIZE: u16 = 0x20;

/// Offsets into the self-load header at the start of segment 1.
pub mod self_load {
    pub const BOOT_APP: u32 = 0x04;
    pub const LOAD_APP_SEG: u32 = 0x08;
    pub const MY_ALLOC: u32 = 0x10;
    pub const ENTRY_ADDR_PROC: u32 = 0x14;
    pub const SET_OWNER: u32 = 0x24;
}

fn selector_flags(flags: SegmentFlags) -> SelectorFlags {
    let mut sel = SelectorFlags::empty();
    if !flags.contains(SegmentFlags::DATA) {
        sel |= SelectorFlags::CODE;
    }
    if flags.contains(SegmentFlags::BIT32) {
        sel |= SelectorFlags::BIG;
    }
    sel
}

/// Expand an iterated segment image: a sequence of repeat count, run length
/// and run bytes. Returns `None` if a record is truncated or the output would
/// exceed `capacity`.
pub fn expand_iterated(mut data: &[u8], capacity: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (header, rest) = data.split_at_checked(4)?;
        let repeat = usize::from(u16::from_le_bytes([header[0], header[1]]));
        let run = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let (bytes, rest) = rest.split_at_checked(run)?;

        if out.len() + run * repeat > capacity {
            return None;
        }
        for _ in 0..repeat {
            out.extend_from_slice(bytes);
        }
        data = rest;
    }
    Some(out)
}

fn read_exact_at(file: &mut File, pos: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = Vec::with_capacity(len);
    file.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(LoadError::ShortRead {
            pos,
            expected: len,
            got: buf.len(),
        });
    }
    Ok(buf)
}

impl Machine {
    /// Give every segment of `handle` its selector and memory.
    pub fn create_all_segments(&mut self, handle: u16) -> Result<()> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        let header = module.header.clone();
        let segments = module.segments.clone();

        for (index, seg) in segments.iter().enumerate() {
            let segnum = index as u16 + 1;
            let mut size = match seg.minsize {
                0 => MAX_SEGMENT_SIZE,
                n => u32::from(n),
            };
            if segnum == header.ss_sp.0 {
                size += u32::from(header.stack_size);
            }
            if segnum == header.autodata {
                size += u32::from(header.heap_size);
            }
            let size = size.min(MAX_SEGMENT_SIZE);

            let selector = self.global_alloc(size, selector_flags(seg.flags), handle)?;
            if let Some(entry) = self
                .modules
                .get_mut(handle)
                .and_then(|m| m.segment_mut(segnum))
            {
                entry.selector = selector;
                entry.flags.insert(SegmentFlags::ALLOCATED);
            }
            trace!(target: "segment", "segment {segnum}: selector {selector:04x}, {size:#x} bytes");
        }
        Ok(())
    }

    /// Read segment `segnum` into its memory and apply its relocations.
    /// Loading a segment twice is a no-op.
    pub fn load_segment(&mut self, thread: &mut Thread, handle: u16, segnum: u16) -> Result<()> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        let seg = *module.segment(segnum).ok_or(LoadError::NoSuchSegment {
            module: handle,
            segment: segnum,
        })?;

        if seg.flags.contains(SegmentFlags::LOADED) {
            return Ok(());
        }
        if seg.filepos == 0 {
            trace!(target: "segment", "{}.{segnum} has no file image", module.name());
            self.mark_loaded(handle, segnum);
            return Ok(());
        }
        if module.is_self_loading() && segnum > 1 {
            return self.self_load_segment(thread, handle, segnum);
        }

        let pos = u64::from(seg.filepos) << module.header.alignment_shift;
        let len = match (seg.size, seg.minsize) {
            (0, 0) => MAX_SEGMENT_SIZE as usize,
            (0, min) => usize::from(min),
            (size, _) => usize::from(size),
        };
        debug!(target: "segment", "loading {}.{segnum}: {len:#x} bytes at {pos:#x}, flags {:?}", module.name(), seg.flags);

        let file = self
            .modules
            .get_mut(handle)
            .and_then(|m| m.file.as_mut())
            .ok_or(LoadError::NoFile(handle))?;
        let raw = read_exact_at(file, pos, len)?;

        let image = if seg.flags.contains(SegmentFlags::ITERATED) {
            let capacity = self.global_size(seg.selector) as usize;
            expand_iterated(&raw, capacity).ok_or(LoadError::BadIteratedData { segment: segnum })?
        } else {
            raw
        };
        self.write_bytes16(seg.selector, 0, &image)?;
        self.mark_loaded(handle, segnum);

        if !seg.flags.contains(SegmentFlags::RELOC_DATA) {
            return Ok(());
        }

        let file = self
            .modules
            .get_mut(handle)
            .and_then(|m| m.file.as_mut())
            .ok_or(LoadError::NoFile(handle))?;
        let table_pos = pos + len as u64;
        let count = read_exact_at(file, table_pos, 2)?;
        let count = usize::from(u16::from_le_bytes([count[0], count[1]]));
        if count == 0 {
            return Ok(());
        }
        let raw = read_exact_at(file, table_pos + 2, count * RelocationRecord::SIZE)?;
        let records = RelocationRecord::parse_table(&raw);
        trace!(target: "fixup", "segment {segnum}: {count} relocations");

        self.apply_relocations(handle, segnum, &records)
    }

    /// Load every segment of `handle`. Self-loading modules get segment 1 and
    /// `BootApp` first, then the remaining segments through `LoadAppSeg`.
    pub fn load_all_segments(&mut self, thread: &mut Thread, handle: u16) -> Result<()> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        let count = module.segments.len() as u16;

        if module.is_self_loading() {
            self.load_segment(thread, handle, 1)?;
            self.boot_self_loader(thread, handle)?;
            for segnum in 2..=count {
                self.load_segment(thread, handle, segnum)?;
            }
        } else {
            for segnum in 1..=count {
                self.load_segment(thread, handle, segnum)?;
            }
        }
        Ok(())
    }

    /// The `MyAlloc` service of the self-load protocol. Returns the handle
    /// in the low word and the selector in the high word, 0 on failure.
    pub fn my_alloc(&mut self, flags: SegmentFlags, segnum: u16, size: u32, owner: u16) -> u32 {
        if size == 0 && !flags.contains(SegmentFlags::MOVEABLE) {
            return 0;
        }
        match self.global_alloc(size, selector_flags(flags), owner) {
            Ok(sel) => {
                trace!(target: "segment", "MyAlloc for segment {segnum}: {sel:04x}");
                (u32::from(sel) << 16) | u32::from(sel)
            }
            Err(err) => {
                warn!(target: "segment", "MyAlloc({size:#x}) for segment {segnum} failed: {err}");
                0
            }
        }
    }

    fn mark_loaded(&mut self, handle: u16, segnum: u16) {
        if let Some(seg) = self
            .modules
            .get_mut(handle)
            .and_then(|m| m.segment_mut(segnum))
        {
            seg.flags.insert(SegmentFlags::LOADED);
        }
    }

    fn boot_self_loader(&mut self, thread: &mut Thread, handle: u16) -> Result<()> {
        let header_sel = self
            .modules
            .get(handle)
            .and_then(|m| m.segment(1))
            .ok_or(LoadError::NoSuchSegment { module: handle, segment: 1 })?
            .selector;

        let thunks = self.callbacks.kernel_thunks();
        self.write_dword16(header_sel, self_load::ENTRY_ADDR_PROC, thunks.entry_addr_proc.0)?;
        self.write_dword16(header_sel, self_load::MY_ALLOC, thunks.my_alloc.0)?;
        self.write_dword16(header_sel, self_load::SET_OWNER, thunks.set_owner.0)?;

        let stack = self.global_alloc(SELF_LOAD_STACK_SIZE, SelectorFlags::empty(), handle)?;
        let module = self
            .modules
            .get_mut(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        module.self_loading_sel = stack;
        let autodata = module.header.autodata;
        let dgroup = module.segment(autodata).map(|s| s.selector);

        let boot_app = SegPtr(self.read_dword16(header_sel, self_load::BOOT_APP)?);
        debug!(target: "segment", "calling BootApp at {boot_app} for module {handle:#06x}");
        self.self_loader_callout(thread, handle, boot_app, &[])?;

        // BootApp is known to overwrite the dgroup handle.
        if let (Some(selector), Some(seg)) = (
            dgroup,
            self.modules
                .get_mut(handle)
                .and_then(|m| m.segment_mut(autodata)),
        ) {
            seg.selector = selector;
        }
        Ok(())
    }

    fn self_load_segment(&mut self, thread: &mut Thread, handle: u16, segnum: u16) -> Result<()> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        let header_sel = module
            .segment(1)
            .ok_or(LoadError::NoSuchSegment { module: handle, segment: 1 })?
            .selector;
        let old = module
            .segment(segnum)
            .ok_or(LoadError::NoSuchSegment { module: handle, segment: segnum })?
            .selector;
        let is_dgroup = segnum == module.header.autodata;

        let load_app_seg = SegPtr(self.read_dword16(header_sel, self_load::LOAD_APP_SEG)?);
        debug!(target: "segment", "calling LoadAppSeg at {load_app_seg} for segment {segnum}");
        let ret = self.self_loader_callout(thread, handle, load_app_seg, &[segnum])?;
        let new = ret as u16;

        if new != 0 && new != old {
            if is_dgroup {
                // Other code may already point into the original dgroup.
                let size = self.global_size(new).min(self.global_size(old)) as usize;
                let data = self.read_bytes16(new, 0, size)?.to_vec();
                self.write_bytes16(old, 0, &data)?;
                self.global_free(new);
                trace!(target: "segment", "dgroup reloaded into {new:04x}, copied back to {old:04x}");
            } else {
                self.global_free(old);
                if let Some(seg) = self
                    .modules
                    .get_mut(handle)
                    .and_then(|m| m.segment_mut(segnum))
                {
                    seg.selector = new;
                }
                trace!(target: "segment", "segment {segnum} moved from {old:04x} to {new:04x}");
            }
        }
        self.mark_loaded(handle, segnum);
        Ok(())
    }

    /// Call into the self-loader on its own stack, with the module file
    /// duplicated into a DOS handle for the duration of the call. The
    /// arguments are the module handle, the file handle, then `extra`.
    fn self_loader_callout(&mut self, thread: &mut Thread, handle: u16, target: SegPtr, extra: &[u16]) -> Result<u32> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        let stack = SegPtr::new(
            module.self_loading_sel,
            SELF_LOAD_STACK_SIZE as u16 - CALL_FRAME_SIZE,
        );
        let file = module.file.as_ref().ok_or(LoadError::NoFile(handle))?;
        let hfile = self.files.dup(file)?;

        let mut args = vec![handle, hfile];
        args.extend_from_slice(extra);

        let result = {
            let mut frame = thread.switch_stack(stack);
            self.with_callbacks(|callbacks, machine| callbacks.call16(machine, &mut frame, target, &args))
        };
        self.files.close(hfile);
        result.map_err(LoadError::Callout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn record(repeat: u16, run: &[u8]) -> Vec<u8> {
        let mut out = repeat.to_le_bytes().to_vec();
        out.extend_from_slice(&(run.len() as u16).to_le_bytes());
        out.extend_from_slice(run);
        out
    }

    #[test]
    fn iterated_records_repeat_their_runs() {
        let mut data = record(3, b"ab");
        data.extend(record(1, b"xyz"));
        assert_eq!(expand_iterated(&data, 0x100).unwrap(), b"abababxyz");
    }

    #[test]
    fn iterated_data_must_be_well_formed() {
        let data = record(2, b"abcd");
        assert!(expand_iterated(&data[..data.len() - 1], 0x100).is_none());
        assert!(expand_iterated(&data[..3], 0x100).is_none());
        assert!(expand_iterated(&data, 7).is_none());
        assert_eq!(expand_iterated(&[], 0x100).unwrap(), b"");
    }

    #[test]
    fn random_iterated_streams_expand_exactly() {
        let mut rng = StdRng::seed_from_u64(0x4e45);
        for _ in 0..64 {
            let mut stream = Vec::new();
            let mut expected = Vec::new();
            for _ in 0..rng.random_range(1..8) {
                let repeat = rng.random_range(0..20u16);
                let run: Vec<u8> = (0..rng.random_range(0..16)).map(|_| rng.random()).collect();
                stream.extend(record(repeat, &run));
                for _ in 0..repeat {
                    expected.extend_from_slice(&run);
                }
            }
            assert_eq!(expand_iterated(&stream, 0x10000).unwrap(), expected);
        }
    }

    #[test]
    fn segment_flags_pick_descriptor_type() {
        assert_eq!(selector_flags(SegmentFlags::empty()), SelectorFlags::CODE);
        assert_eq!(selector_flags(SegmentFlags::DATA), SelectorFlags::empty());
        assert_eq!(
            selector_flags(SegmentFlags::BIT32),
            SelectorFlags::CODE | SelectorFlags::BIG
        );
    }

    #[test]
    fn my_alloc_returns_handle_and_selector() {
        let mut machine = Machine::new(crate::config::Config::default());
        assert_eq!(machine.my_alloc(SegmentFlags::DATA, 2, 0, 0x100), 0);
        let ret = machine.my_alloc(SegmentFlags::DATA, 2, 0x200, 0x100);
        let sel = ret as u16;
        assert_eq!((ret >> 16) as u16, sel);
        assert_eq!(machine.global_size(sel), 0x200);
        assert_eq!(machine.far_get_owner(sel), 0x100);
    }
}
