use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::machine::{BIOS_DATA_BASE, Machine};

/// Timer ticks in 24 hours; the BIOS counter wraps here.
pub const BIOS_TICKS_PER_DAY: u32 = 0x1800b0;
/// Offset of the tick counter in the BIOS data area.
const TICK_COUNT_OFFSET: u32 = 0x6c;

/// The simulated 18.2 Hz BIOS timer. The thread is started at most once and
/// is never joined.
#[derive(Debug)]
pub struct BiosTicker {
    interval: Duration,
    ticks: Option<Arc<AtomicU32>>,
}

impl BiosTicker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ticks: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticks.is_some()
    }

    pub fn ticks(&self) -> Option<u32> {
        self.ticks
            .as_ref()
            .map(|t| t.load(Ordering::Relaxed) % BIOS_TICKS_PER_DAY)
    }

    /// Start the tick thread unless it is already running.
    pub fn ensure_started(&mut self) {
        if self.ticks.is_some() {
            return;
        }
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let interval = self.interval;

        let spawned = thread::Builder::new()
            .name("bios-tick".into())
            .spawn(move || {
                loop {
                    thread::sleep(interval);
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .map(drop);
        self.record_start(ticks, spawned);
    }

    /// Keep the counter only if its thread exists; a failed start is retried
    /// on the next call.
    fn record_start(&mut self, ticks: Arc<AtomicU32>, spawned: io::Result<()>) {
        match spawned {
            Ok(()) => {
                debug!(target: "instr", "BIOS tick thread started, {:?} per tick", self.interval);
                self.ticks = Some(ticks);
            }
            Err(err) => warn!(target: "instr", "could not start BIOS tick thread: {err}"),
        }
    }
}

impl Machine {
    /// Copy the tick count into the BIOS data area.
    pub(crate) fn sync_bios_ticks(&mut self) {
        if let Some(ticks) = self.bios.ticks() {
            if let Err(err) = self
                .memory
                .write_dword(BIOS_DATA_BASE + TICK_COUNT_OFFSET, ticks)
            {
                trace!(target: "instr", "cannot mirror BIOS ticks: {err}");
            }
        }
    }
}
