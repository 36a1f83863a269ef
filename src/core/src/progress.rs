//! Out-of-band progress reporting.
//!
//! The pipeline publishes through a caller-supplied sink; the sink must be
//! safe to invoke from any worker thread. Delivery is coalesced so a fast
//! run does not flood a UI with per-layer updates.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Which stage of the run an update describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Layer decoding (phase 1 of the phased pipeline).
    Decode,
    /// Scanline building (phase 2).
    Scanline,
    /// PNG compression (phase 3, or the whole per-layer pipeline).
    Compress,
    /// Final archive assembly.
    Package,
}

/// One progress update. `current` counts fully finished layers and never
/// decreases over a run, whatever the phase says.
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    pub phase: Phase,
    pub current: u32,
    pub total: u32,
    pub workers: u32,
}

/// Sink signature accepted by the conversion API.
pub type ProgressSink<'a> = &'a (dyn Fn(Progress) + Sync);

const MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Rate-limiting wrapper around the caller's sink.
///
/// At most one update per ~200 ms reaches the sink, except that a terminal
/// update (`current == total`) always goes through. Also enforces that
/// `current` is non-decreasing even when workers race to publish.
pub(crate) struct Coalescer<'a> {
    sink: Option<ProgressSink<'a>>,
    state: Mutex<CoalesceState>,
}

struct CoalesceState {
    last_emit: Option<Instant>,
    last_current: u32,
}

impl<'a> Coalescer<'a> {
    pub(crate) fn new(sink: Option<ProgressSink<'a>>) -> Coalescer<'a> {
        Coalescer {
            sink,
            state: Mutex::new(CoalesceState {
                last_emit: None,
                last_current: 0,
            }),
        }
    }

    pub(crate) fn publish(&self, update: Progress) {
        let sink = match self.sink {
            Some(s) => s,
            None => return,
        };
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if update.current < state.last_current {
                return;
            }
            let terminal = update.current >= update.total;
            let due = match state.last_emit {
                Some(t) => now.duration_since(t) >= MIN_INTERVAL,
                None => true,
            };
            if !terminal && !due {
                return;
            }
            state.last_emit = Some(now);
            state.last_current = update.current;
        }
        sink(update);
    }
}
