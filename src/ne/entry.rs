//! The NE entry table: exported ordinals grouped in bundles.

use bitflags::bitflags;

use super::Bytes;
use crate::error::{LoadError, Result};

/// Segment number used by entries whose "offset" is a constant value.
pub const CONSTANT_SEGMENT: u8 = 0xfe;

const BUNDLE_UNUSED: u8 = 0x00;
const BUNDLE_CONSTANT: u8 = 0xfe;
const BUNDLE_MOVEABLE: u8 = 0xff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u8 {
        const EXPORTED = 0x01;
        const SHARED_DATA = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub flags: EntryFlags,
    /// 1-based segment number, or [`CONSTANT_SEGMENT`].
    pub segment: u8,
    pub offset: u16,
    pub moveable: bool,
}

impl Entry {
    pub fn is_constant(&self) -> bool {
        self.segment == CONSTANT_SEGMENT
    }
}

/// A run of consecutive ordinals `first + 1 ..= first + entries.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryBundle {
    pub first: u16,
    pub entries: Vec<Entry>,
}

impl EntryBundle {
    pub fn last(&self) -> u16 {
        self.first + self.entries.len() as u16
    }

    pub fn ordinals(&self) -> impl Iterator<Item = (u16, &Entry)> {
        (self.first + 1..=self.last()).zip(self.entries.iter())
    }
}

/// Decode the on-disk entry table. Unused bundles only advance the ordinal
/// counter, so the result has gaps between bundles.
pub(crate) fn parse_entry_table(bytes: &mut Bytes<'_>) -> Result<Vec<EntryBundle>> {
    let mut bundles = Vec::new();
    let mut ordinal: u16 = 0;

    loop {
        let count = bytes.u8()?;
        if count == 0 {
            break;
        }
        let kind = bytes.u8()?;
        let next = ordinal
            .checked_add(u16::from(count))
            .ok_or(LoadError::BadFormat("entry table has more than 65535 ordinals"))?;

        if kind == BUNDLE_UNUSED {
            ordinal = next;
            continue;
        }

        let mut entries = Vec::with_capacity(count.into());
        for _ in 0..count {
            let entry = match kind {
                BUNDLE_MOVEABLE => {
                    let flags = EntryFlags::from_bits_retain(bytes.u8()?);
                    let _int_3fh = bytes.u16()?;
                    let segment = bytes.u8()?;
                    let offset = bytes.u16()?;
                    Entry {
                        flags,
                        segment,
                        offset,
                        moveable: true,
                    }
                }
                segment => {
                    let flags = EntryFlags::from_bits_retain(bytes.u8()?);
                    let offset = bytes.u16()?;
                    Entry {
                        flags,
                        segment: if segment == BUNDLE_CONSTANT {
                            CONSTANT_SEGMENT
                        } else {
                            segment
                        },
                        offset,
                        moveable: false,
                    }
                }
            };
            entries.push(entry);
        }

        bundles.push(EntryBundle {
            first: ordinal,
            entries,
        });
        ordinal = next;
    }

    Ok(bundles)
}

pub(crate) fn find_entry(bundles: &[EntryBundle], ordinal: u16) -> Option<&Entry> {
    bundles
        .iter()
        .find(|b| ordinal > b.first && ordinal <= b.last())
        .map(|b| &b.entries[usize::from(ordinal - b.first - 1)])
}

pub(crate) fn find_entry_mut(bundles: &mut [EntryBundle], ordinal: u16) -> Option<&mut Entry> {
    bundles
        .iter_mut()
        .find(|b| ordinal > b.first && ordinal <= b.last())
        .map(|b| &mut b.entries[usize::from(ordinal - b.first - 1)])
}
