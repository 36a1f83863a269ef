//! Phased pipeline shape: decode, remap and compress whole batches.
//!
//! Phase 1 decodes a batch of K layers into one contiguous blob (and takes
//! area stats on the way); phase 2 builds every scanline buffer in a single
//! accelerator mega-batch, or fans out across CPU workers; phase 3 deflates
//! each layer in parallel and the batch lands on the spool in order. K is
//! sized so the batch fits the device budget (VRAM minus headroom) on the
//! GPU path, or a host memory ceiling otherwise.

use std::sync::atomic::Ordering;
use std::thread;

use crate::accel::{AccelError, AcceleratorSession};
use crate::area::{self, AreaStats};
use crate::codec;
use crate::error::{Error, Result};
use crate::options::GpuMode;
use crate::png;
use crate::progress::Phase;
use crate::router::Selection;
use crate::scanline;

use super::{alloc_bytes, round_robin, LayerMeta, RunCtx, SpoolWriter};

/// Host memory ceiling for one batch on the CPU fan-out path.
const CPU_BATCH_BUDGET: u64 = 2 << 30;

pub(crate) fn run(
    ctx: &RunCtx<'_>,
    selection: Option<&Selection<'_>>,
    spool: &mut SpoolWriter,
) -> Result<Vec<LayerMeta>> {
    let workers = ctx.options.resolved_cpu_workers().max(1) as usize;
    let gpu_only = ctx.options.gpu_mode == GpuMode::GpuOnly;
    let dims = ctx.dims;
    let grey_len = dims.grey_len();
    let scan_len = dims.scanline_len();
    let footprint = dims.layer_footprint();

    let mut batch_cap = (CPU_BATCH_BUDGET / footprint.max(1)).max(1) as usize;
    let mut gpu: Option<(Box<dyn AcceleratorSession>, &Selection<'_>)> = None;
    if let Some(sel) = selection {
        let device_cap = sel.max_concurrent_layers(&dims) as usize;
        if device_cap == 0 {
            let e = AccelError::OutOfDeviceMemory(footprint);
            if gpu_only {
                return Err(Error::Accel(e));
            }
            sel.record_failure(&e);
        } else {
            match sel.open(&dims) {
                Ok(session) => {
                    batch_cap = batch_cap.min(device_cap);
                    // An explicit host-worker count further bounds how many
                    // layers may be in flight to the device at once.
                    if let Some(hosts) = ctx.options.gpu_host_workers {
                        batch_cap = batch_cap.min(hosts.max(1) as usize);
                    }
                    gpu = Some((session, sel));
                }
                Err(e) => {
                    // `open` already counted the failure.
                    if gpu_only {
                        return Err(Error::Accel(e));
                    }
                }
            }
        }
    }
    debug!(
        "phased pipeline: {} workers, batch of {} layers, accelerator: {}",
        workers,
        batch_cap,
        gpu.as_ref().map(|(_, s)| s.kind().to_string()).unwrap_or_else(|| "none".into()),
    );

    let mut metas = Vec::with_capacity(ctx.layer_count as usize);
    let mut first = 0u32;
    while first < ctx.layer_count {
        if ctx.should_stop() {
            break;
        }
        let k = batch_cap.min((ctx.layer_count - first) as usize);

        // Phase 1: decode and area stats across the batch.
        let mut grey_blob = alloc_bytes(k * grey_len)?;
        let mut stats_slots = vec![AreaStats::default(); k];
        decode_batch(ctx, first, &mut grey_blob, &mut stats_slots, workers);
        if ctx.should_stop() {
            break;
        }

        // Phase 2: scanlines, one device round trip when a backend is live.
        let mut scan_blob = alloc_bytes(k * scan_len)?;
        let mut on_gpu = false;
        let mut drop_gpu = false;
        if let Some((session, sel)) = gpu.as_mut() {
            let reserve = k as u64 * footprint;
            if sel.budget().try_reserve(reserve) {
                let launched =
                    session.batch_build_scanlines(&grey_blob, k as u32, &mut scan_blob);
                sel.budget().release(reserve);
                match launched {
                    Ok(()) => {
                        sel.record_success();
                        on_gpu = true;
                    }
                    Err(e) => {
                        if gpu_only {
                            return Err(Error::Accel(e));
                        }
                        drop_gpu = sel.record_failure(&e);
                        info!(
                            "layers {}..{}: falling back to CPU scanlines",
                            first,
                            first + k as u32
                        );
                    }
                }
            } else {
                let e = AccelError::OutOfDeviceMemory(reserve);
                if gpu_only {
                    return Err(Error::Accel(e));
                }
                drop_gpu = sel.record_failure(&e);
            }
        }
        if drop_gpu {
            gpu = None;
        }
        if !on_gpu {
            cpu_scanline_batch(ctx, &grey_blob, &mut scan_blob, workers);
        }
        drop(grey_blob);
        if ctx.should_stop() {
            break;
        }

        // Phase 3: deflate and wrap each layer, then spool the batch in
        // order.
        let pngs = compress_batch(ctx, &scan_blob, k, workers);
        drop(scan_blob);
        if ctx.should_stop() {
            break;
        }
        for (i, slot) in pngs.into_iter().enumerate() {
            let bytes = match slot {
                Some(bytes) => bytes,
                None => break,
            };
            let index = first + i as u32;
            spool.write_blob(&bytes)?;
            metas.push(LayerMeta {
                index,
                z_mm: ctx.slice.layer_meta(index).z_mm,
                stats: stats_slots[i],
                png_len: bytes.len(),
            });
            ctx.completed.fetch_add(1, Ordering::AcqRel);
            ctx.publish(Phase::Compress, workers as u32);
        }
        first += k as u32;
    }

    Ok(metas)
}

fn decode_batch(
    ctx: &RunCtx<'_>,
    first: u32,
    grey_blob: &mut [u8],
    stats_slots: &mut [AreaStats],
    workers: usize,
) {
    let grey_len = ctx.dims.grey_len();
    let items: Vec<(usize, &mut [u8], &mut AreaStats)> = grey_blob
        .chunks_mut(grey_len)
        .zip(stats_slots.iter_mut())
        .enumerate()
        .map(|(i, (chunk, stat))| (i, chunk, stat))
        .collect();
    let groups = round_robin(items, workers);
    thread::scope(|scope| {
        for group in groups {
            scope.spawn(move || {
                for (i, chunk, stat) in group {
                    if ctx.should_stop() {
                        return;
                    }
                    let index = first + i as u32;
                    match ctx.slice.layer(index) {
                        Ok(encoded) => {
                            codec::decode_into(encoded.data, encoded.key, index, chunk);
                            *stat = area::analyze_raw(
                                chunk,
                                ctx.dims.src_w,
                                ctx.dims.height,
                                ctx.pitch_mm,
                            );
                        }
                        Err(e) => {
                            ctx.record_error(e);
                            return;
                        }
                    }
                    ctx.publish(Phase::Decode, workers as u32);
                }
            });
        }
    });
}

fn cpu_scanline_batch(ctx: &RunCtx<'_>, grey_blob: &[u8], scan_blob: &mut [u8], workers: usize) {
    let grey_len = ctx.dims.grey_len();
    let scan_len = ctx.dims.scanline_len();
    let items: Vec<(&[u8], &mut [u8])> = grey_blob
        .chunks(grey_len)
        .zip(scan_blob.chunks_mut(scan_len))
        .collect();
    let groups = round_robin(items, workers);
    thread::scope(|scope| {
        for group in groups {
            scope.spawn(move || {
                for (grey, out) in group {
                    if ctx.should_stop() {
                        return;
                    }
                    scanline::build_into(grey, &ctx.dims, out);
                    ctx.publish(Phase::Scanline, workers as u32);
                }
            });
        }
    });
}

fn compress_batch(
    ctx: &RunCtx<'_>,
    scan_blob: &[u8],
    k: usize,
    workers: usize,
) -> Vec<Option<Vec<u8>>> {
    let scan_len = ctx.dims.scanline_len();
    let mut pngs: Vec<Option<Vec<u8>>> = (0..k).map(|_| None).collect();
    let items: Vec<(&[u8], &mut Option<Vec<u8>>)> = scan_blob
        .chunks(scan_len)
        .zip(pngs.iter_mut())
        .collect();
    let groups = round_robin(items, workers);
    thread::scope(|scope| {
        for group in groups {
            scope.spawn(move || {
                for (chunk, slot) in group {
                    if ctx.should_stop() {
                        return;
                    }
                    let encoded = png::encode_raw(
                        chunk,
                        ctx.dims.out_width,
                        ctx.dims.height,
                        ctx.dims.channels,
                        ctx.options.png_level,
                    );
                    match png::apply_recompress_policy(
                        encoded,
                        ctx.options.recompress_mode,
                        ctx.options.png_level,
                    ) {
                        Ok(bytes) => *slot = Some(bytes),
                        Err(e) => {
                            ctx.record_error(e);
                            return;
                        }
                    }
                }
            });
        }
    });
    pngs
}
