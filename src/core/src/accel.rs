//! Accelerator abstraction shared by the GPU backend crates.
//!
//! Backends implement [`Accelerator`] (cheap availability probing plus
//! session creation) and [`AcceleratorSession`] (the scanline kernels).
//! Sessions produce output byte-identical to the CPU path in
//! [`crate::scanline`]; that equivalence is part of the contract and is what
//! the router's fallback logic relies on. The core crate never links a GPU
//! API itself, it only talks through these traits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::profile::TargetProfile;

/// Identity of an accelerator backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelKind {
    OpenCl,
    Cuda,
    Metal,
}

impl fmt::Display for AccelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelKind::OpenCl => write!(f, "opencl"),
            AccelKind::Cuda => write!(f, "cuda"),
            AccelKind::Metal => write!(f, "metal"),
        }
    }
}

/// What a backend learned about its device at probe time.
#[derive(Clone, Debug)]
pub struct AcceleratorInfo {
    /// Marketing name of the device, for logs and telemetry.
    pub device_name: String,
    /// Total device memory, bytes.
    pub vram_bytes: u64,
    /// Whether the device carries tensor cores; promotes CUDA in automatic
    /// backend selection.
    pub has_tensor_cores: bool,
}

/// Backend-local failures. Every variant maps to a CPU fallback in the
/// scheduler; none is fatal unless the run is pinned with
/// `GpuMode::GpuOnly`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AccelError {
    /// The backend's library or device is not present on this machine.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A device allocation failed.
    #[error("out of device memory (requested {0} bytes)")]
    OutOfDeviceMemory(u64),
    /// A kernel failed to build or launch.
    #[error("kernel launch failed (code {0})")]
    LaunchFailed(i32),
    /// A host/device copy or synchronization failed.
    #[error("device transfer failed (code {0})")]
    TransferFailed(i32),
}

/// Geometry of the scanline transform for one run. Built once from the
/// source resolution and the target profile, then shared with sessions so
/// the CPU path and every kernel agree on the mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDims {
    /// Source subpixels per row.
    pub src_w: u32,
    /// Rows per layer.
    pub height: u32,
    /// Output pixels per row.
    pub out_width: u32,
    /// PNG channels per output pixel (3 = RGB, 1 = greyscale).
    pub channels: u32,
    /// Source subpixels consumed per output pixel (3 = RGB, 2 = grey pair).
    pub subpixels_per_pixel: u32,
    /// Centered left padding in source subpixels.
    pub pad_left: u32,
}

impl FrameDims {
    /// Derive the transform geometry for a source of `src_w x height`
    /// rendered to `profile`.
    pub fn new(src_w: u32, height: u32, profile: &TargetProfile) -> FrameDims {
        FrameDims {
            src_w,
            height,
            out_width: profile.out_width,
            channels: profile.board.channels(),
            subpixels_per_pixel: profile.board.subpixels_per_pixel(),
            pad_left: profile.pad_left(src_w),
        }
    }

    /// Bytes per PNG row including the filter byte.
    pub fn row_stride(&self) -> usize {
        1 + self.out_width as usize * self.channels as usize
    }

    /// Length of one layer's filtered-scanline buffer.
    pub fn scanline_len(&self) -> usize {
        self.row_stride() * self.height as usize
    }

    /// Length of one layer's decoded greyscale buffer.
    pub fn grey_len(&self) -> usize {
        self.src_w as usize * self.height as usize
    }

    /// Memory footprint of one in-flight layer, the unit of the VRAM and
    /// batch-size budgets.
    pub fn layer_footprint(&self) -> u64 {
        self.grey_len() as u64
            + u64::from(self.out_width) * u64::from(self.channels) * u64::from(self.height)
    }
}

/// How many layers fit in `budget` bytes of device memory. Zero means the
/// device cannot hold even one layer and the backend is unusable for these
/// dimensions.
pub fn max_concurrent_layers(budget: u64, dims: &FrameDims) -> u32 {
    let per_layer = dims.layer_footprint().max(1);
    (budget / per_layer).min(u64::from(u32::MAX)) as u32
}

/// An accelerator backend, registered with the router at program start.
pub trait Accelerator: Send + Sync {
    /// Which API this backend drives.
    fn kind(&self) -> AccelKind;

    /// Cheap availability probe: load the canonical shared library and
    /// resolve one symbol. Must not initialize the device.
    fn available(&self) -> bool;

    /// Initialize the driver far enough to report device properties.
    fn probe(&self) -> Result<AcceleratorInfo, AccelError>;

    /// Create a session holding device buffers sized for `dims`.
    fn open(&self, dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError>;
}

/// Device state for one run: compiled kernels plus buffers sized to the
/// frame. Sessions are not shared between threads; the per-layer path gives
/// each worker its own, the batch path serializes launches on one.
pub trait AcceleratorSession: Send {
    /// Transform one decoded layer (`dims.grey_len()` bytes) into filtered
    /// scanlines (`dims.scanline_len()` bytes), byte-identical to
    /// [`crate::scanline::build_into`].
    fn build_scanlines(&mut self, grey: &[u8], out: &mut [u8]) -> Result<(), AccelError>;

    /// Batch variant: `layer_count` concatenated layers in, the same number
    /// of concatenated scanline buffers out, one device round trip.
    fn batch_build_scanlines(
        &mut self,
        grey: &[u8],
        layer_count: u32,
        out: &mut [u8],
    ) -> Result<(), AccelError>;
}

/// Default VRAM headroom left for the display compositor and driver.
pub const DEFAULT_HEADROOM_BYTES: u64 = 5 * (1 << 29); // 2.5 GiB

/// Tracked device-memory budget with compare-and-swap reservation.
///
/// The budget is `vram - headroom`; `try_reserve` either admits the whole
/// delta or changes nothing, so the tracked total can never overshoot.
#[derive(Debug)]
pub struct VramBudget {
    budget: u64,
    used: AtomicU64,
}

impl VramBudget {
    /// Build a budget from the device's reported memory and a headroom.
    /// When the headroom swallows all of VRAM, half the VRAM is used
    /// instead so small devices degrade rather than disappear.
    pub fn new(vram_bytes: u64, headroom: u64) -> VramBudget {
        let budget = if vram_bytes > headroom {
            vram_bytes - headroom
        } else {
            vram_bytes / 2
        };
        VramBudget {
            budget,
            used: AtomicU64::new(0),
        }
    }

    /// The reservable total.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Currently reserved bytes.
    pub fn in_use(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Try to reserve `delta` bytes; false leaves the counter untouched.
    pub fn try_reserve(&self, delta: u64) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(delta) {
                Some(n) if n <= self.budget => n,
                _ => return false,
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Return `delta` bytes to the budget.
    pub fn release(&self, delta: u64) {
        self.used.fetch_sub(delta.min(self.in_use()), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::TargetProfile;

    fn dims() -> FrameDims {
        let profile = TargetProfile::rgb8("t", 128, 50.0, 0.0);
        FrameDims::new(384, 64, &profile)
    }

    #[test]
    fn frame_dims_strides() {
        let d = dims();
        assert_eq!(d.row_stride(), 1 + 128 * 3);
        assert_eq!(d.scanline_len(), (1 + 384) * 64);
        assert_eq!(d.grey_len(), 384 * 64);
        assert_eq!(d.pad_left, 0);
    }

    #[test]
    fn budget_counts_whole_layers() {
        let d = dims();
        let per_layer = d.layer_footprint();
        assert_eq!(max_concurrent_layers(per_layer * 7 + 1, &d), 7);
        assert_eq!(max_concurrent_layers(per_layer - 1, &d), 0);
    }

    #[test]
    fn vram_reserve_rolls_back_on_overflow() {
        let b = VramBudget::new(1000 + DEFAULT_HEADROOM_BYTES, DEFAULT_HEADROOM_BYTES);
        assert_eq!(b.budget(), 1000);
        assert!(b.try_reserve(600));
        assert!(!b.try_reserve(500));
        assert_eq!(b.in_use(), 600);
        assert!(b.try_reserve(400));
        b.release(1000);
        assert_eq!(b.in_use(), 0);
    }

    #[test]
    fn tiny_devices_keep_half_their_vram() {
        let b = VramBudget::new(1 << 30, DEFAULT_HEADROOM_BYTES);
        assert_eq!(b.budget(), 1 << 29);
    }
}
