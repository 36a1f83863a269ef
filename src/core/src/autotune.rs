//! CPU-versus-accelerator benchmarking.
//!
//! When a run could go either way (`gpu_mode = Auto`), a short scanline
//! benchmark on a synthetic layer decides whether the selected backend
//! actually beats the host CPU for these dimensions. Results are cached in
//! the application's settings store keyed by backend and geometry, so the
//! benchmark runs once per machine/profile/resolution combination. Every
//! store access is best effort; with no store the accelerator gets the
//! benefit of the doubt.

use std::time::Instant;

use crate::accel::{AccelKind, FrameDims};
use crate::router::Selection;
use crate::scanline;
use crate::settings::SettingsStore;

const BENCH_ROWS: u32 = 256;
const BENCH_REPS: u32 = 3;

/// Cached benchmark outcome for one backend/geometry pair.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BenchRecord {
    pub cpu_ms: f64,
    pub gpu_ms: f64,
    pub backend_code: u32,
}

pub(crate) fn backend_code(kind: AccelKind) -> u32 {
    match kind {
        AccelKind::OpenCl => 1,
        AccelKind::Cuda => 2,
        AccelKind::Metal => 3,
    }
}

fn cache_key(kind: AccelKind, dims: &FrameDims) -> String {
    format!(
        "bench/{}/{}x{}->{}c{}",
        kind, dims.src_w, dims.height, dims.out_width, dims.channels
    )
}

fn decision(record: &BenchRecord) -> bool {
    record.gpu_ms <= record.cpu_ms
}

/// Whether the selected backend should be used for a run over `dims`.
pub fn prefers_accel(
    selection: &Selection<'_>,
    dims: &FrameDims,
    store: Option<&dyn SettingsStore>,
    analytics: bool,
) -> bool {
    let store = match store {
        Some(s) => s,
        None => return true,
    };
    let key = cache_key(selection.kind(), dims);
    if let Some(cached) = store.get(&key) {
        if let Ok(record) = serde_json::from_str::<BenchRecord>(&cached) {
            debug!(
                "benchmark cache hit for {}: cpu {:.2} ms, gpu {:.2} ms",
                key, record.cpu_ms, record.gpu_ms
            );
            return decision(&record);
        }
    }

    let record = match run_benchmark(selection, dims) {
        Some(r) => r,
        // An unbenchmarkable backend still gets tried; the pipeline's
        // fallback policy covers it if it cannot deliver.
        None => return true,
    };
    match serde_json::to_string(&record) {
        Ok(json) => store.put(&key, &json),
        Err(_) => {}
    }
    if analytics {
        info!(
            "autotune {}: cpu {:.2} ms, {} {:.2} ms",
            key,
            record.cpu_ms,
            selection.kind(),
            record.gpu_ms
        );
    }
    decision(&record)
}

fn run_benchmark(selection: &Selection<'_>, dims: &FrameDims) -> Option<BenchRecord> {
    let bench_dims = FrameDims {
        height: dims.height.min(BENCH_ROWS),
        ..*dims
    };
    let grey: Vec<u8> = (0..bench_dims.grey_len())
        .map(|i| (i % 251) as u8)
        .collect();
    let mut out = vec![0u8; bench_dims.scanline_len()];

    let started = Instant::now();
    for _ in 0..BENCH_REPS {
        scanline::build_into(&grey, &bench_dims, &mut out);
    }
    let cpu_ms = started.elapsed().as_secs_f64() * 1e3 / f64::from(BENCH_REPS);

    let mut session = selection.open(&bench_dims).ok()?;
    // Warm-up launch absorbs kernel compilation and first-touch costs.
    session.build_scanlines(&grey, &mut out).ok()?;
    let started = Instant::now();
    for _ in 0..BENCH_REPS {
        session.build_scanlines(&grey, &mut out).ok()?;
    }
    let gpu_ms = started.elapsed().as_secs_f64() * 1e3 / f64::from(BENCH_REPS);

    Some(BenchRecord {
        cpu_ms,
        gpu_ms,
        backend_code: backend_code(selection.kind()),
    })
}
