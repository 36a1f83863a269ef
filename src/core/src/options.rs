//! Per-run configuration.

/// Deflate level used when first encoding layer PNGs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PngLevel {
    /// Speed-first: encode at level 1 and let the recompressor tighten the
    /// output later if the policy asks for it.
    Auto,
    /// Fixed zlib level, 0..=9.
    Level(u8),
}

impl PngLevel {
    /// The concrete zlib level this setting resolves to.
    pub fn resolve(self) -> u8 {
        match self {
            PngLevel::Auto => 1,
            PngLevel::Level(l) => l.min(9),
        }
    }

    /// Whether the initial encode is "low effort" for the purposes of the
    /// adaptive recompression policy.
    pub fn is_low(self) -> bool {
        self.resolve() <= 3
    }
}

/// Policy for re-deflating layer PNGs after the initial encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecompressMode {
    /// Never recompress.
    Off,
    /// Always recompress at level 9, keeping the result.
    On,
    /// Recompress and keep the result even when it is larger.
    Force,
    /// Recompress only when the encoder ran at a low level (<= 3); keep the
    /// smaller of the two files.
    Adaptive,
}

/// How hard the run insists on GPU acceleration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuMode {
    /// Use an accelerator when one is available, fall back to CPU otherwise.
    Auto,
    /// Fail the run if no accelerator can be used; accelerator errors become
    /// fatal instead of falling back.
    GpuOnly,
    /// Never touch an accelerator.
    CpuOnly,
}

/// Which accelerator backend to use when several are registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendPreference {
    /// Prefer Metal on Apple platforms, then CUDA on devices with tensor
    /// cores, then OpenCL, then CPU.
    Auto,
    /// Pin to the OpenCL backend.
    OpenCl,
    /// Pin to the CUDA backend.
    Cuda,
    /// Pin to the Metal backend.
    Metal,
}

/// Everything a single conversion run can be asked to do differently.
///
/// `Default` gives the speed-first configuration: auto PNG level, adaptive
/// recompression, automatic backend selection, per-layer pipeline, worker
/// count derived from the CPU topology.
#[derive(Clone, Debug)]
pub struct Options {
    /// Initial deflate level for layer PNGs.
    pub png_level: PngLevel,
    /// Recompression policy applied after the initial encode.
    pub recompress_mode: RecompressMode,
    /// GPU insistence.
    pub gpu_mode: GpuMode,
    /// Backend preference when `gpu_mode` permits acceleration.
    pub gpu_backend: BackendPreference,
    /// Run the phased (batched) pipeline even without a GPU. A run with an
    /// active accelerator is always phased.
    pub use_phased: bool,
    /// Ignore every registered accelerator, equivalent to `GpuMode::CpuOnly`
    /// but kept separate so callers can express "the user unticked the
    /// acceleration box" without losing their GPU mode setting.
    pub disable_native_accel: bool,
    /// Explicit CPU worker count; `None` derives from the core count.
    pub cpu_workers: Option<u32>,
    /// Explicit GPU-host worker count; `None` derives from the CPU worker
    /// count capped by what the device memory budget admits.
    pub gpu_host_workers: Option<u32>,
    /// Upper bound on workers as a multiple of the core count, protecting
    /// against runaway explicit overrides.
    pub worker_multiplier_cap: f32,
    /// Emit autotune/benchmark telemetry through the settings store.
    pub analytics: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            png_level: PngLevel::Auto,
            recompress_mode: RecompressMode::Adaptive,
            gpu_mode: GpuMode::Auto,
            gpu_backend: BackendPreference::Auto,
            use_phased: false,
            disable_native_accel: false,
            cpu_workers: None,
            gpu_host_workers: None,
            worker_multiplier_cap: 2.0,
            analytics: false,
        }
    }
}

impl Options {
    /// Resolved CPU worker count: the explicit override when given, otherwise
    /// the logical core count, in both cases clamped by the multiplier cap.
    pub fn resolved_cpu_workers(&self) -> u32 {
        let cores = num_cpus::get().max(1) as u32;
        let cap = ((cores as f32) * self.worker_multiplier_cap.max(1.0)).ceil() as u32;
        let requested = self.cpu_workers.unwrap_or(cores);
        requested.max(1).min(cap)
    }

    /// Whether accelerators may be consulted at all for this run.
    pub fn wants_accel(&self) -> bool {
        !self.disable_native_accel && self.gpu_mode != GpuMode::CpuOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_level_resolves_to_speed_first() {
        assert_eq!(PngLevel::Auto.resolve(), 1);
        assert!(PngLevel::Auto.is_low());
        assert!(!PngLevel::Level(9).is_low());
        assert_eq!(PngLevel::Level(12).resolve(), 9);
    }

    #[test]
    fn worker_count_respects_multiplier_cap() {
        let cores = num_cpus::get().max(1) as u32;
        let mut opt = Options::default();
        opt.cpu_workers = Some(cores * 100);
        assert!(opt.resolved_cpu_workers() <= cores * 2 + 1);
        opt.cpu_workers = Some(0);
        assert_eq!(opt.resolved_cpu_workers(), 1);
    }

    #[test]
    fn cpu_only_disables_accel() {
        let mut opt = Options::default();
        assert!(opt.wants_accel());
        opt.gpu_mode = GpuMode::CpuOnly;
        assert!(!opt.wants_accel());
        opt.gpu_mode = GpuMode::Auto;
        opt.disable_native_accel = true;
        assert!(!opt.wants_accel());
    }
}
