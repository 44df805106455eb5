//! Loader for 16-bit Windows NE modules and emulator for the privileged
//! instructions their code traps on.

pub mod config;
pub mod cpu;
pub mod decoder;
pub mod error;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod module;
pub mod ne;
pub mod prolog;
pub mod relocation;
pub mod selector;

pub use config::Config;
pub use cpu::{Context, Emulation, ExceptionCode};
pub use error::{LoadError, Result};
pub use machine::{Call16, KernelThunks, Machine, Thread};
pub use ne::NeModule;
pub use selector::SegPtr;
