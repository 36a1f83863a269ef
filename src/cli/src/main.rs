//! `lith` — convert CTB/CBDDLP slice files into NanoDLP PNG/ZIP archives.

use std::io::Write;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};

use lith_core::{
    BackendPreference, BatchRun, BoardKind, CancelToken, Error, GpuMode, Options, PngLevel,
    Progress, RecompressMode, Router, TargetProfile,
};

const EXIT_OK: i32 = 0;
const EXIT_CONVERSION: i32 = 1;
const EXIT_BAD_INPUT: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BoardArg {
    Rgb8,
    Grey3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RecompressArg {
    Off,
    On,
    Force,
    Adaptive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum GpuArg {
    Auto,
    GpuOnly,
    CpuOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Auto,
    Opencl,
    Cuda,
    Metal,
}

fn parse_png_level(value: &str) -> Result<PngLevel, String> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(PngLevel::Auto);
    }
    match value.parse::<u8>() {
        Ok(level) if level <= 9 => Ok(PngLevel::Level(level)),
        _ => Err("expected 'auto' or a level 0-9".into()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "lith",
    version,
    about = "Convert CTB/CBDDLP slice files into the PNG/ZIP archive NanoDLP consumes"
)]
struct Cli {
    /// Source slice file (.ctb / .cbddlp / .photon).
    source: PathBuf,

    /// Output archive path; defaults to the source with a .zip extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Named panel preset. Ignored when --out-width and --board are given.
    #[arg(long, default_value = "4k-rgb")]
    profile: String,

    /// Output panel width in pixels (with --board, overrides --profile).
    #[arg(long)]
    out_width: Option<u32>,

    /// Output board class (with --out-width, overrides --profile).
    #[arg(long, value_enum)]
    board: Option<BoardArg>,

    /// Source pixel pitch in micrometres for a custom profile.
    #[arg(long, default_value_t = 50.0)]
    pixel_pitch_um: f32,

    /// Maximum printable height in millimetres for a custom profile
    /// (0 disables the check).
    #[arg(long, default_value_t = 0.0)]
    max_z_mm: f32,

    /// Initial PNG deflate level: 'auto' or 0-9.
    #[arg(long, value_parser = parse_png_level, default_value = "auto")]
    png_level: PngLevel,

    /// Recompression policy for layer PNGs.
    #[arg(long, value_enum, default_value_t = RecompressArg::Adaptive)]
    recompress: RecompressArg,

    /// GPU insistence.
    #[arg(long, value_enum, default_value_t = GpuArg::Auto)]
    gpu: GpuArg,

    /// Accelerator backend preference.
    #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,

    /// Run the phased (batched) pipeline even on CPU.
    #[arg(long)]
    phased: bool,

    /// Ignore all accelerator backends.
    #[arg(long)]
    no_native_accel: bool,

    /// Explicit CPU worker count.
    #[arg(long)]
    cpu_workers: Option<u32>,

    /// Explicit GPU-host worker count.
    #[arg(long)]
    gpu_host_workers: Option<u32>,

    /// Worker cap as a multiple of the core count.
    #[arg(long, default_value_t = 2.0)]
    worker_cap: f32,

    /// Record autotune benchmark telemetry.
    #[arg(long)]
    analytics: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Built-in panel presets.
const PRESETS: &[(&str, BoardKind, u32, f32, f32)] = &[
    ("4k-rgb", BoardKind::Rgb8Bit, 3840, 50.0, 260.0),
    ("8k-rgb", BoardKind::Rgb8Bit, 7680, 28.5, 330.0),
    ("16k-grey", BoardKind::Grey3Bit, 7568, 30.0, 300.0),
];

fn resolve_profile(cli: &Cli) -> Result<TargetProfile, String> {
    if let (Some(out_width), Some(board)) = (cli.out_width, cli.board) {
        let board = match board {
            BoardArg::Rgb8 => BoardKind::Rgb8Bit,
            BoardArg::Grey3 => BoardKind::Grey3Bit,
        };
        return Ok(TargetProfile {
            label: format!("custom-{}", out_width),
            out_width,
            board,
            max_z_mm: cli.max_z_mm,
            pixel_pitch_um: cli.pixel_pitch_um,
        });
    }
    if cli.out_width.is_some() || cli.board.is_some() {
        return Err("custom profiles need both --out-width and --board".into());
    }
    PRESETS
        .iter()
        .find(|(name, ..)| *name == cli.profile)
        .map(|&(name, board, out_width, pitch, max_z)| TargetProfile {
            label: name.to_owned(),
            out_width,
            board,
            max_z_mm: max_z,
            pixel_pitch_um: pitch,
        })
        .ok_or_else(|| {
            let names: Vec<&str> = PRESETS.iter().map(|(n, ..)| *n).collect();
            format!(
                "unknown profile '{}' (available: {})",
                cli.profile,
                names.join(", ")
            )
        })
}

fn build_options(cli: &Cli) -> Options {
    Options {
        png_level: cli.png_level,
        recompress_mode: match cli.recompress {
            RecompressArg::Off => RecompressMode::Off,
            RecompressArg::On => RecompressMode::On,
            RecompressArg::Force => RecompressMode::Force,
            RecompressArg::Adaptive => RecompressMode::Adaptive,
        },
        gpu_mode: match cli.gpu {
            GpuArg::Auto => GpuMode::Auto,
            GpuArg::GpuOnly => GpuMode::GpuOnly,
            GpuArg::CpuOnly => GpuMode::CpuOnly,
        },
        gpu_backend: match cli.backend {
            BackendArg::Auto => BackendPreference::Auto,
            BackendArg::Opencl => BackendPreference::OpenCl,
            BackendArg::Cuda => BackendPreference::Cuda,
            BackendArg::Metal => BackendPreference::Metal,
        },
        use_phased: cli.phased,
        disable_native_accel: cli.no_native_accel,
        cpu_workers: cli.cpu_workers,
        gpu_host_workers: cli.gpu_host_workers,
        worker_multiplier_cap: cli.worker_cap,
        analytics: cli.analytics,
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let profile = match resolve_profile(&cli) {
        Ok(p) => p,
        Err(message) => {
            eprintln!("error: {}", message);
            return EXIT_BAD_INPUT;
        }
    };
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.source.with_extension("zip"));
    let options = build_options(&cli);

    let mut router = Router::new();
    router.register(Box::new(lith_backend_opencl::Backend::new()));
    router.register(Box::new(lith_backend_cuda::Backend::new()));
    router.register(Box::new(lith_backend_metal::Backend::new()));

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            log::warn!("could not install the interrupt handler: {}", e);
        }
    }

    let progress = |p: Progress| {
        eprint!("\r{:?}: {}/{} layers    ", p.phase, p.current, p.total);
        let _ = std::io::stderr().flush();
    };

    let result = BatchRun::new(&cli.source, &output, &profile, &options, &router)
        .progress(&progress)
        .cancel_token(&cancel)
        .execute();

    match result {
        Ok(report) => {
            eprintln!();
            println!(
                "{} layers -> {} ({:.1} MiB, {:.1?})",
                report.layer_count,
                report.output_path.display(),
                report.output_bytes as f64 / (1024.0 * 1024.0),
                report.duration,
            );
            EXIT_OK
        }
        Err(Error::Cancelled) => {
            eprintln!("\ncancelled");
            EXIT_CANCELLED
        }
        Err(Error::InvalidFormat(message)) => {
            eprintln!("\nerror: {}", message);
            EXIT_BAD_INPUT
        }
        Err(e) => {
            eprintln!("\nerror: {}", e);
            EXIT_CONVERSION
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_wellformed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn presets_resolve() {
        let cli = Cli::parse_from(["lith", "model.ctb", "--profile", "16k-grey"]);
        let profile = resolve_profile(&cli).unwrap();
        assert_eq!(profile.board, BoardKind::Grey3Bit);
        assert_eq!(profile.out_width, 7568);
    }

    #[test]
    fn custom_profile_needs_both_flags() {
        let cli = Cli::parse_from(["lith", "model.ctb", "--out-width", "1024"]);
        assert!(resolve_profile(&cli).is_err());
        let cli = Cli::parse_from([
            "lith",
            "model.ctb",
            "--out-width",
            "1024",
            "--board",
            "grey3",
        ]);
        let profile = resolve_profile(&cli).unwrap();
        assert_eq!(profile.board, BoardKind::Grey3Bit);
    }

    #[test]
    fn png_level_parser_accepts_auto_and_digits() {
        assert_eq!(parse_png_level("auto").unwrap(), PngLevel::Auto);
        assert_eq!(parse_png_level("7").unwrap(), PngLevel::Level(7));
        assert!(parse_png_level("11").is_err());
        assert!(parse_png_level("fast").is_err());
    }

    #[test]
    fn options_mirror_flags() {
        let cli = Cli::parse_from([
            "lith",
            "model.ctb",
            "--png-level",
            "9",
            "--recompress",
            "force",
            "--gpu",
            "cpu-only",
            "--phased",
            "--cpu-workers",
            "3",
        ]);
        let options = build_options(&cli);
        assert_eq!(options.png_level, PngLevel::Level(9));
        assert_eq!(options.recompress_mode, RecompressMode::Force);
        assert_eq!(options.gpu_mode, GpuMode::CpuOnly);
        assert!(options.use_phased);
        assert_eq!(options.cpu_workers, Some(3));
    }
}
