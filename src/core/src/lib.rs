//! Conversion core for masked-stereolithography slice files.
//!
//! Takes a CTB/CBDDLP slice file and produces the ZIP-packaged PNG-per-layer
//! archive consumed by NanoDLP controllers. The crate is organised as a
//! staged pipeline: [`reader`] parses the source container, [`codec`] expands
//! the per-layer RLE payloads (applying the stream cipher where the file asks
//! for it), [`area`] summarises solid geometry, [`scanline`] remaps subpixel
//! rows onto the target panel and applies the PNG Up filter, [`png`] deflates
//! and wraps the result, and [`zip`] writes the store-only archive. The
//! [`pipeline`] module drives those stages across CPU worker pools and,
//! through the [`router`], across whatever GPU accelerator backends the
//! application registered.
//!
//! Backends live in sibling crates and implement the [`accel`] traits; this
//! crate never links a GPU API directly. An application wires things up like:
//!
//! ```no_run
//! use lith_core::{convert, CancelToken, Options, Router, TargetProfile};
//!
//! let router = Router::new();
//! // router.register(Box::new(lith_backend_opencl::Backend::new()));
//! let profile = TargetProfile::rgb8("mono-4k", 3840, 50.0, 260.0);
//! let report = convert(
//!     "model.ctb".as_ref(),
//!     "model.zip".as_ref(),
//!     &profile,
//!     &Options::default(),
//!     &router,
//!     None,
//!     &CancelToken::new(),
//! )?;
//! println!("{} layers -> {}", report.layer_count, report.output_path.display());
//! # Ok::<(), lith_core::Error>(())
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub use crate::accel::{
    AccelError, AccelKind, Accelerator, AcceleratorInfo, AcceleratorSession, FrameDims,
    VramBudget,
};
pub use crate::cancel::CancelToken;
pub use crate::error::Error;
pub use crate::options::{BackendPreference, GpuMode, Options, PngLevel, RecompressMode};
pub use crate::pipeline::{convert, BatchRun, ConversionReport};
pub use crate::profile::{BoardKind, TargetProfile};
pub use crate::progress::{Phase, Progress, ProgressSink};
pub use crate::reader::SliceFile;
pub use crate::router::{Router, Selection};
pub use crate::settings::{MemorySettings, SettingsStore};

pub mod accel;
pub mod area;
pub mod autotune;
pub mod cancel;
pub mod codec;
pub mod error;
pub mod manifest;
pub mod options;
pub mod pipeline;
pub mod png;
pub mod profile;
pub mod progress;
pub mod reader;
pub mod router;
pub mod scanline;
pub mod settings;
pub mod zip;
