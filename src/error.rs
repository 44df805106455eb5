use std::io;

use thiserror::Error;

use crate::memory::MemoryError;

pub type Result<T> = std::result::Result<T, LoadError>;

/// Everything that can make building a module or loading one of its segments
/// fail. Unresolved imports are not errors: they are patched with a sentinel.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("not an MZ executable")]
    NotMz,

    #[error("file is a Win32 (PE) executable")]
    Win32Executable,

    #[error("file is an OS/2 linear executable")]
    LinearExecutable,

    #[error("corrupt NE image: {0}")]
    BadFormat(&'static str),

    #[error("unsupported target operating system {0}")]
    UnsupportedOs(u8),

    #[error("short read at file offset {pos:#x}: expected {expected} bytes, got {got}")]
    ShortRead {
        pos: u64,
        expected: usize,
        got: usize,
    },

    #[error("segment {segment} has malformed iterated data")]
    BadIteratedData { segment: u16 },

    #[error(
        "unknown relocation address type {address_type:#04x} (record {index}: type {relocation_type}, offset {offset:#06x}, target {target1:#06x} {target2:#06x})"
    )]
    UnknownAddressType {
        index: usize,
        address_type: u8,
        relocation_type: u8,
        offset: u16,
        target1: u16,
        target2: u16,
    },

    #[error("module {module:#06x} has no segment {segment}")]
    NoSuchSegment { module: u16, segment: u16 },

    #[error("no module with handle {0:#06x}")]
    NoSuchModule(u16),

    #[error("module {0:#06x} has no backing file")]
    NoFile(u16),

    #[error("could not load '{name}' required by '{required_by}'")]
    MissingDependency {
        name: String,
        required_by: String,
        #[source]
        source: Box<LoadError>,
    },

    #[error("out of selectors")]
    OutOfSelectors,

    #[error("16-bit callout failed: {0:#}")]
    Callout(anyhow::Error),
}
