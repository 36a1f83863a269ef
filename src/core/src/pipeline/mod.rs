//! The conversion scheduler.
//!
//! Owns the worker pools and drives reader -> codec -> area -> scanline ->
//! png -> packager for a whole run, in one of two shapes: the default
//! per-layer mode, where each CPU worker carries one layer through every
//! stage, and the phased mode, where whole batches are decoded, remapped
//! (on the accelerator when one is active) and compressed phase by phase.
//!
//! The manifest is the archive's first entry but depends on per-layer area
//! statistics, so finished PNGs are spooled to a scratch file next to the
//! output in layer order and the archive itself is assembled only once the
//! last layer is in. Either the finished archive appears at the output path
//! or nothing is left on disk.

mod order;
mod perlayer;
mod phased;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::accel::{AccelError, FrameDims};
use crate::area::AreaStats;
use crate::autotune;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::options::{GpuMode, Options};
use crate::profile::TargetProfile;
use crate::progress::{Coalescer, Phase, Progress, ProgressSink};
use crate::reader::SliceFile;
use crate::router::Router;
use crate::zip::{layer_entry_name, ZipWriter};

/// What a finished run reports back.
#[derive(Clone, Debug)]
pub struct ConversionReport {
    /// Where the archive landed.
    pub output_path: PathBuf,
    /// Layers converted.
    pub layer_count: u32,
    /// Wall-clock duration of the whole run.
    pub duration: Duration,
    /// Label of the profile the run targeted.
    pub profile_label: String,
    /// Final archive size in bytes.
    pub output_bytes: u64,
}

/// One end-to-end conversion invocation.
///
/// Owns every worker pool and accelerator session for its duration; built
/// with the mandatory inputs and optionally decorated with a progress sink,
/// a cancel token and a settings store before [`BatchRun::execute`].
pub struct BatchRun<'a> {
    source: &'a Path,
    output: &'a Path,
    profile: &'a TargetProfile,
    options: &'a Options,
    router: &'a Router,
    progress: Option<ProgressSink<'a>>,
    cancel: CancelToken,
    settings: Option<&'a dyn crate::settings::SettingsStore>,
}

impl<'a> BatchRun<'a> {
    pub fn new(
        source: &'a Path,
        output: &'a Path,
        profile: &'a TargetProfile,
        options: &'a Options,
        router: &'a Router,
    ) -> BatchRun<'a> {
        BatchRun {
            source,
            output,
            profile,
            options,
            router,
            progress: None,
            cancel: CancelToken::new(),
            settings: None,
        }
    }

    /// Attach a progress sink; it may be invoked from any worker thread.
    pub fn progress(mut self, sink: ProgressSink<'a>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Observe an external cancel token.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.cancel = token.clone();
        self
    }

    /// Attach the application's settings store for the benchmark cache.
    pub fn settings(mut self, store: &'a dyn crate::settings::SettingsStore) -> Self {
        self.settings = Some(store);
        self
    }

    /// Run the conversion to completion.
    pub fn execute(self) -> Result<ConversionReport> {
        let started = Instant::now();
        let slice = SliceFile::open(self.source)?;
        let (src_w, src_h) = slice.resolution();
        self.profile.validate(src_w, slice.print_height_mm())?;
        let dims = FrameDims::new(src_w, src_h, self.profile);
        let layer_count = slice.layer_count();

        let mut selection = if self.options.wants_accel() {
            self.router.select(self.options.gpu_backend)
        } else {
            None
        };
        if self.options.gpu_mode == GpuMode::GpuOnly && selection.is_none() {
            return Err(Error::Accel(AccelError::Unavailable(
                "no accelerator backend is available and the run is GPU-only".into(),
            )));
        }
        if let Some(sel) = selection.as_ref() {
            if self.options.gpu_mode == GpuMode::Auto
                && !autotune::prefers_accel(sel, &dims, self.settings, self.options.analytics)
            {
                info!("{} benchmarks slower than CPU here, staying on CPU", sel.kind());
                selection = None;
            }
        }

        // An active accelerator implies the phased pipeline; the scanline
        // kernels only pay for themselves in mega-batches.
        let phased = self.options.use_phased || selection.is_some();

        let ctx = RunCtx {
            slice: &slice,
            options: self.options,
            dims,
            pitch_mm: self.profile.pitch_mm(),
            cancel: &self.cancel,
            coalescer: Coalescer::new(self.progress),
            failure: Mutex::new(None),
            abort: AtomicBool::new(false),
            completed: AtomicU32::new(0),
            layer_count,
        };

        let spool_path = spool_path_for(self.output);
        let metas = (|| -> Result<Vec<LayerMeta>> {
            if layer_count == 0 {
                return Ok(Vec::new());
            }
            let mut spool = SpoolWriter::create(&spool_path)?;
            let metas = if phased {
                phased::run(&ctx, selection.as_ref(), &mut spool)?
            } else {
                perlayer::run(&ctx, &mut spool)?
            };
            spool.finish()?;
            Ok(metas)
        })();

        let metas = match metas {
            Ok(metas) => metas,
            Err(e) => {
                let _ = fs::remove_file(&spool_path);
                return Err(e);
            }
        };
        if let Some(e) = ctx.failure.lock().take() {
            let _ = fs::remove_file(&spool_path);
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            let _ = fs::remove_file(&spool_path);
            info!("conversion cancelled after {} layers", metas.len());
            return Err(Error::Cancelled);
        }
        debug_assert_eq!(metas.len() as u32, layer_count);

        let packaged = self.package(&ctx, &slice, &spool_path, &metas);
        let _ = fs::remove_file(&spool_path);
        let output_bytes = match packaged {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(self.output);
                return Err(e);
            }
        };

        let duration = started.elapsed();
        info!(
            "converted {} layers to {} in {:.1?}",
            layer_count,
            self.output.display(),
            duration
        );
        Ok(ConversionReport {
            output_path: self.output.to_path_buf(),
            layer_count,
            duration,
            profile_label: self.profile.label.clone(),
            output_bytes,
        })
    }

    /// Assemble the final archive: manifest first, then every spooled layer
    /// PNG in ascending order. Runs on exactly one thread.
    fn package(
        &self,
        ctx: &RunCtx<'_>,
        slice: &SliceFile,
        spool_path: &Path,
        metas: &[LayerMeta],
    ) -> Result<u64> {
        ctx.coalescer.publish(Progress {
            phase: Phase::Package,
            current: ctx.completed.load(Ordering::Acquire),
            total: ctx.layer_count,
            workers: 1,
        });

        let mut manifest = Manifest::new(slice, self.profile);
        for m in metas {
            manifest.push_layer(m.index, m.z_mm, &m.stats);
        }

        let mut writer = ZipWriter::create(self.output)?;
        let result = (|| -> Result<()> {
            writer.add("slice.json", &manifest.to_json()?)?;
            if !metas.is_empty() {
                let mut spool = BufReader::new(File::open(spool_path)?);
                let mut buf = Vec::new();
                for m in metas {
                    buf.resize(m.png_len, 0);
                    spool.read_exact(&mut buf)?;
                    writer.add(&layer_entry_name(m.index, ctx.layer_count), &buf)?;
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = writer.abort();
            return Err(e);
        }
        writer.finalize()?;
        Ok(fs::metadata(self.output)?.len())
    }
}

/// Convert one slice file, blocking until done.
///
/// Thin wrapper over [`BatchRun`] for callers that do not need the builder.
pub fn convert(
    source: &Path,
    output: &Path,
    profile: &TargetProfile,
    options: &Options,
    router: &Router,
    progress: Option<ProgressSink<'_>>,
    cancel: &CancelToken,
) -> Result<ConversionReport> {
    let mut run = BatchRun::new(source, output, profile, options, router).cancel_token(cancel);
    if let Some(sink) = progress {
        run = run.progress(sink);
    }
    run.execute()
}

/// Metadata the packager needs for one finished layer.
pub(crate) struct LayerMeta {
    pub(crate) index: u32,
    pub(crate) z_mm: f32,
    pub(crate) stats: AreaStats,
    pub(crate) png_len: usize,
}

/// Shared per-run state seen by every worker.
pub(crate) struct RunCtx<'a> {
    pub(crate) slice: &'a SliceFile,
    pub(crate) options: &'a Options,
    pub(crate) dims: FrameDims,
    pub(crate) pitch_mm: f64,
    pub(crate) cancel: &'a CancelToken,
    pub(crate) coalescer: Coalescer<'a>,
    pub(crate) failure: Mutex<Option<Error>>,
    pub(crate) abort: AtomicBool,
    pub(crate) completed: AtomicU32,
    pub(crate) layer_count: u32,
}

impl<'a> RunCtx<'a> {
    /// Checked by workers between layers, never mid-layer.
    pub(crate) fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.load(Ordering::Acquire)
    }

    /// Record the first fatal error and stop dispatching new work.
    pub(crate) fn record_error(&self, error: Error) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.abort.store(true, Ordering::Release);
    }

    /// Publish a progress update; `current` is the fully-finished layer
    /// count so updates stay monotonic across phases.
    pub(crate) fn publish(&self, phase: Phase, workers: u32) {
        self.coalescer.publish(Progress {
            phase,
            current: self.completed.load(Ordering::Acquire),
            total: self.layer_count,
            workers,
        });
    }
}

/// Scratch file the packager reads layer PNGs back from, placed next to the
/// output so the final rename-free assembly stays on one filesystem.
fn spool_path_for(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output".into());
    name.push(".part");
    output.with_file_name(name)
}

pub(crate) struct SpoolWriter {
    writer: BufWriter<File>,
}

impl SpoolWriter {
    fn create(path: &Path) -> Result<SpoolWriter> {
        Ok(SpoolWriter {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub(crate) fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Allocate a zeroed buffer, reporting failure as `Error::OutOfMemory`
/// instead of aborting the process.
pub(crate) fn alloc_bytes(len: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::OutOfMemory(len))?;
    v.resize(len, 0);
    Ok(v)
}

/// Deal `items` round-robin into `ways` work lists, preserving per-list
/// order. The deterministic split keeps worker assignment reproducible.
pub(crate) fn round_robin<T>(items: Vec<T>, ways: usize) -> Vec<Vec<T>> {
    let ways = ways.max(1);
    let mut groups: Vec<Vec<T>> = (0..ways).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        groups[i % ways].push(item);
    }
    groups
}
