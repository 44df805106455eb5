use log::{debug, warn};

use super::Context;
use crate::memory::MemoryImage;

/// Software interrupt emulation for protected-mode 16-bit code.
pub trait DosInterrupts {
    /// Emulate `int number`. `ctx.eip` already points past the instruction.
    /// Returns false when the interrupt is not supported.
    fn emulate_interrupt(&mut self, memory: &mut MemoryImage, ctx: &mut Context, number: u8) -> bool;
}

pub type DosLoader = Box<dyn FnMut() -> anyhow::Result<Box<dyn DosInterrupts>>>;

/// The DOS interrupt subsystem, brought up on the first `int` that needs it.
#[derive(Default)]
pub struct LazyDos {
    handler: Option<Box<dyn DosInterrupts>>,
    loader: Option<DosLoader>,
}

impl LazyDos {
    pub fn new(loader: DosLoader) -> Self {
        Self {
            handler: None,
            loader: Some(loader),
        }
    }

    pub fn with_handler(handler: Box<dyn DosInterrupts>) -> Self {
        Self {
            handler: Some(handler),
            loader: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.handler.is_some()
    }

    pub fn get_or_init(&mut self) -> Option<&mut (dyn DosInterrupts + 'static)> {
        if self.handler.is_none() {
            let loader = self.loader.as_mut()?;
            match loader() {
                Ok(handler) => {
                    debug!(target: "instr", "DOS interrupt emulation initialized");
                    self.handler = Some(handler);
                }
                Err(err) => {
                    warn!(target: "instr", "could not initialize DOS interrupt emulation: {err:#}");
                    return None;
                }
            }
        }
        self.handler.as_deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Nothing;

    impl DosInterrupts for Nothing {
        fn emulate_interrupt(&mut self, _: &mut MemoryImage, _: &mut Context, _: u8) -> bool {
            false
        }
    }

    #[test]
    fn loader_runs_once() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let mut dos = LazyDos::new(Box::new(move || {
            counter.set(counter.get() + 1);
            Ok(Box::new(Nothing) as Box<dyn DosInterrupts>)
        }));

        assert!(!dos.is_initialized());
        assert!(dos.get_or_init().is_some());
        assert!(dos.get_or_init().is_some());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failed_initialization_is_retried() {
        let mut attempts = 0;
        let mut dos = LazyDos::new(Box::new(move || {
            attempts += 1;
            if attempts == 1 {
                anyhow::bail!("no DOS memory");
            }
            Ok(Box::new(Nothing) as Box<dyn DosInterrupts>)
        }));
        assert!(dos.get_or_init().is_none());
        assert!(dos.get_or_init().is_some());
    }

    #[test]
    fn without_a_loader_there_is_no_handler() {
        assert!(LazyDos::default().get_or_init().is_none());
    }
}
