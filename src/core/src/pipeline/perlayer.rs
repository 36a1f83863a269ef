//! Default pipeline shape: each worker carries one layer end to end.

use std::thread;

use crossbeam_channel::bounded;

use crate::area::{self, AreaStats};
use crate::codec;
use crate::error::Result;
use crate::png;
use crate::progress::Phase;
use crate::scanline;

use super::order::OrderedSink;
use super::{LayerMeta, RunCtx, SpoolWriter};

struct LayerOut {
    index: u32,
    z_mm: f32,
    stats: AreaStats,
    png: Vec<u8>,
}

/// Run the whole conversion with per-layer workers.
///
/// A bounded index queue feeds N workers; each decodes, analyses, remaps
/// and compresses its layer, then parks the finished PNG in the ordered
/// sink. The consumer (this thread) is the only spool writer, so layer
/// blobs land strictly ascending. The admission window of `2 * workers`
/// keeps everyone busy while bounding resident finished layers.
pub(crate) fn run(ctx: &RunCtx<'_>, spool: &mut SpoolWriter) -> Result<Vec<LayerMeta>> {
    let workers = ctx.options.resolved_cpu_workers().max(1) as usize;
    let window = workers * 2;
    let sink: OrderedSink<LayerOut> = OrderedSink::new(window, workers);
    let (tx, rx) = bounded::<u32>(window);
    let mut metas = Vec::with_capacity(ctx.layer_count as usize);

    debug!(
        "per-layer pipeline: {} workers, window {}",
        workers, window
    );

    thread::scope(|scope| {
        let sink = &sink;

        scope.spawn(move || {
            for index in 0..ctx.layer_count {
                if ctx.should_stop() {
                    break;
                }
                if tx.send(index).is_err() {
                    break;
                }
            }
        });

        for _ in 0..workers {
            let rx = rx.clone();
            scope.spawn(move || {
                while let Ok(index) = rx.recv() {
                    if ctx.should_stop() {
                        break;
                    }
                    match process_layer(ctx, index) {
                        Ok(out) => {
                            if !sink.push(u64::from(index), out) {
                                break;
                            }
                        }
                        Err(e) => {
                            ctx.record_error(e);
                            sink.poison();
                            break;
                        }
                    }
                }
                sink.producer_done();
            });
        }
        drop(rx);

        while let Some(out) = sink.pop_next() {
            if let Err(e) = spool.write_blob(&out.png) {
                ctx.record_error(e);
                sink.poison();
                break;
            }
            metas.push(LayerMeta {
                index: out.index,
                z_mm: out.z_mm,
                stats: out.stats,
                png_len: out.png.len(),
            });
            ctx.completed
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            ctx.publish(Phase::Compress, workers as u32);
        }
    });

    Ok(metas)
}

fn process_layer(ctx: &RunCtx<'_>, index: u32) -> Result<LayerOut> {
    let encoded = ctx.slice.layer(index)?;
    let grey = codec::decode(&encoded, ctx.dims.src_w, ctx.dims.height)?;
    let stats = area::analyze(&grey, ctx.pitch_mm);
    let scanlines = scanline::build(&grey, &ctx.dims)?;
    drop(grey);
    let encoded_png = png::encode(&scanlines, ctx.options.png_level);
    drop(scanlines);
    let final_png = png::apply_recompress_policy(
        encoded_png,
        ctx.options.recompress_mode,
        ctx.options.png_level,
    )?;
    Ok(LayerOut {
        index,
        z_mm: ctx.slice.layer_meta(index).z_mm,
        stats,
        png: final_png,
    })
}
