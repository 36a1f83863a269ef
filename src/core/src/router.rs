//! Accelerator backend selection and failure policy.
//!
//! The application registers one [`Accelerator`] per compiled-in backend at
//! startup; each run then asks the router for a [`Selection`] according to
//! the user's preference. The selection carries the run-scoped failure
//! accounting: accelerator errors fall back to the CPU path, and a backend
//! that fails three times in a row is disabled for the remainder of that
//! run.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::accel::{
    self, AccelError, AccelKind, Accelerator, AcceleratorInfo, AcceleratorSession, FrameDims,
    VramBudget,
};
use crate::options::BackendPreference;

/// Consecutive failures after which a backend is benched for the run.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Registry of available accelerator backends.
#[derive(Default)]
pub struct Router {
    backends: SmallVec<[Box<dyn Accelerator>; 4]>,
}

impl Router {
    /// An empty registry: every selection resolves to CPU.
    pub fn new() -> Router {
        Router::default()
    }

    /// Register a backend. Later registrations of the same kind shadow
    /// earlier ones.
    pub fn register(&mut self, accel: Box<dyn Accelerator>) {
        self.backends.retain(|b| b.kind() != accel.kind());
        self.backends.push(accel);
    }

    /// Cheap availability probe for one backend kind.
    pub fn available(&self, kind: AccelKind) -> bool {
        self.backends
            .iter()
            .any(|b| b.kind() == kind && b.available())
    }

    fn probe(&self, kind: AccelKind) -> Option<(&dyn Accelerator, AcceleratorInfo)> {
        let backend = self.backends.iter().find(|b| b.kind() == kind)?;
        if !backend.available() {
            return None;
        }
        match backend.probe() {
            Ok(info) => {
                debug!(
                    "{}: {} with {} MiB, tensor cores: {}",
                    kind,
                    info.device_name,
                    info.vram_bytes >> 20,
                    info.has_tensor_cores
                );
                Some((backend.as_ref(), info))
            }
            Err(e) => {
                warn!("{}: probe failed: {}", kind, e);
                None
            }
        }
    }

    /// Resolve a backend for one run. `None` means the run stays on CPU.
    ///
    /// `Auto` prefers Metal on Apple platforms, then CUDA when the device
    /// carries tensor cores, then OpenCL; an explicit preference
    /// short-circuits the priority list.
    pub fn select(&self, preference: BackendPreference) -> Option<Selection<'_>> {
        let picked = match preference {
            BackendPreference::OpenCl => self.probe(AccelKind::OpenCl),
            BackendPreference::Cuda => self.probe(AccelKind::Cuda),
            BackendPreference::Metal => self.probe(AccelKind::Metal),
            BackendPreference::Auto => {
                let metal = if cfg!(target_os = "macos") {
                    self.probe(AccelKind::Metal)
                } else {
                    None
                };
                metal
                    .or_else(|| {
                        self.probe(AccelKind::Cuda)
                            .filter(|(_, info)| info.has_tensor_cores)
                    })
                    .or_else(|| self.probe(AccelKind::OpenCl))
            }
        };
        picked.map(|(accel, info)| {
            info!("selected {} backend ({})", accel.kind(), info.device_name);
            let budget = VramBudget::new(info.vram_bytes, accel::DEFAULT_HEADROOM_BYTES);
            Selection {
                accel,
                info,
                budget,
                consecutive_failures: AtomicU32::new(0),
                disabled: AtomicBool::new(false),
            }
        })
    }
}

/// The backend a run settled on, plus the run-scoped failure and memory
/// accounting.
pub struct Selection<'r> {
    accel: &'r dyn Accelerator,
    info: AcceleratorInfo,
    budget: VramBudget,
    consecutive_failures: AtomicU32,
    disabled: AtomicBool,
}

impl<'r> Selection<'r> {
    /// Backend kind.
    pub fn kind(&self) -> AccelKind {
        self.accel.kind()
    }

    /// Device properties captured at probe time.
    pub fn info(&self) -> &AcceleratorInfo {
        &self.info
    }

    /// The run's device-memory budget (VRAM minus headroom).
    pub fn budget(&self) -> &VramBudget {
        &self.budget
    }

    /// Layers the device can hold concurrently for these dimensions.
    pub fn max_concurrent_layers(&self, dims: &FrameDims) -> u32 {
        accel::max_concurrent_layers(self.budget.budget(), dims)
    }

    /// Open a session; counts as a failure if it errors.
    pub fn open(&self, dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        match self.accel.open(dims) {
            Ok(session) => Ok(session),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Whether the failure policy has benched this backend.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Record a recovered failure (the caller is falling back to CPU).
    /// Returns true when this failure disabled the backend.
    pub fn record_failure(&self, error: &AccelError) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "{}: {} (consecutive failure {} of {})",
            self.kind(),
            error,
            failures,
            MAX_CONSECUTIVE_FAILURES
        );
        if failures >= MAX_CONSECUTIVE_FAILURES {
            if !self.disabled.swap(true, Ordering::AcqRel) {
                warn!("{}: disabled for the remainder of the run", self.kind());
            }
            true
        } else {
            false
        }
    }

    /// Record a successful launch, resetting the consecutive-failure count.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }
}
