//! texmap CLI entrypoint.
//!
//! ```bash
//! texmap formats --json
//! texmap inspect --format nv12 --width 1920 --height 1080
//! texmap map-bench --format nv12 --width 640 --height 480 --iterations 100 --json
//! texmap map-bench --device cuda --format bgrx --width 3840 --height 2160
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use texmap_core::device::DeviceContext;
use texmap_core::device::soft::SoftDevice;
use texmap_core::error::{MemError, Result};
use texmap_core::image::{Image, PixelFormat};
use texmap_core::map::{ImageMap, ImageMapExt, SystemMemoryMap};
use texmap_core::stats::StagingSnapshot;
use texmap_core::{MapperConfig, StagingPolicy, readback_audit};
use texmap_cuda::CudaContext;

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "texmap",
    version,
    about = "Inspect image layouts and benchmark device-to-host mapping",
    arg_required_else_help = true,
    after_help = "Examples:\n  texmap formats --json\n  texmap inspect --format nv12 --width 640 --height 480\n  texmap map-bench --format nv12 --width 640 --height 480 --iterations 100 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List supported pixel formats and their plane geometry.
    Formats(FormatsArgs),
    /// Show per-plane layout and tensor descriptors for an image.
    Inspect(InspectArgs),
    /// Run map/unmap cycles and report staging behaviour and timing.
    MapBench(MapBenchArgs),
}

#[derive(Args, Debug)]
struct FormatsArgs {
    /// Emit machine-readable JSON.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ImageArgs {
    /// Pixel format (nv12, i420, bgrx, bgra, rgbx, rgba, bgr, rgbp, bgrp).
    #[arg(short = 'f', long = "format")]
    format: PixelFormat,

    #[arg(long = "width")]
    width: u32,

    #[arg(long = "height")]
    height: u32,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Row-pitch alignment in bytes (power of two).
    #[arg(long = "pitch-alignment", default_value_t = 64)]
    pitch_alignment: usize,

    /// Emit machine-readable JSON.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeviceArg {
    Soft,
    Cuda,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    GrowOnly,
    ExactMatch,
}

impl From<PolicyArg> for StagingPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::GrowOnly => StagingPolicy::GrowOnly,
            PolicyArg::ExactMatch => StagingPolicy::ExactMatch,
        }
    }
}

#[derive(Args, Debug)]
struct MapBenchArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Number of map/unmap cycles.
    #[arg(short = 'n', long = "iterations", default_value_t = 100)]
    iterations: u32,

    /// Device backend holding the source image.
    #[arg(long = "device", value_enum, default_value_t = DeviceArg::Soft)]
    device: DeviceArg,

    /// CUDA device ordinal (with --device cuda).
    #[arg(long = "ordinal", default_value_t = 0)]
    ordinal: usize,

    /// Mapper config JSON file.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Override the staging reuse policy.
    #[arg(long = "policy", value_enum)]
    policy: Option<PolicyArg>,

    /// Override the staging row-pitch alignment.
    #[arg(long = "pitch-alignment")]
    pitch_alignment: Option<usize>,

    /// Emit machine-readable JSON.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Formats(args) if args.json => Some("formats"),
        Commands::Inspect(args) if args.json => Some("inspect"),
        Commands::MapBench(args) if args.json => Some("map-bench"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Formats(args) => run_formats(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::MapBench(args) => run_map_bench(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

// ─── JSON output ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: u32,
    command: &'a str,
    ok: bool,
    #[serde(flatten)]
    body: T,
}

fn print_json<T: Serialize>(command: &str, body: T) -> Result<()> {
    let envelope = Envelope {
        schema_version: JSON_SCHEMA_VERSION,
        command,
        ok: true,
        body,
    };
    let text = serde_json::to_string(&envelope)
        .map_err(|err| MemError::InvalidArgument(format!("JSON encoding failed: {err}")))?;
    println!("{text}");
    Ok(())
}

fn command_error_json(command: &str, err: &MemError) -> String {
    serde_json::json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "code": err.error_code(),
    })
    .to_string()
}

// ─── formats ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct FormatEntry {
    name: &'static str,
    planes: usize,
    channels: Vec<usize>,
    subsampled: Vec<bool>,
}

fn run_formats(args: FormatsArgs) -> Result<()> {
    let entries: Vec<FormatEntry> = PixelFormat::ALL
        .into_iter()
        .map(|f| FormatEntry {
            name: f.name(),
            planes: f.plane_count(),
            channels: (0..f.plane_count()).map(|p| f.plane_channels(p)).collect(),
            subsampled: (0..f.plane_count())
                .map(|p| f.plane_dims(p, 2, 2) != (2, 2))
                .collect(),
        })
        .collect();

    if args.json {
        #[derive(Serialize)]
        struct Body {
            formats: Vec<FormatEntry>,
        }
        return print_json("formats", Body { formats: entries });
    }

    for entry in &entries {
        println!(
            "{:<6} planes={} channels={:?} subsampled={:?}",
            entry.name, entry.planes, entry.channels, entry.subsampled
        );
    }
    Ok(())
}

// ─── inspect ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PlaneEntry {
    index: usize,
    width: u32,
    height: u32,
    channels: usize,
    offset: usize,
    stride: usize,
    bytes: usize,
    tensor: String,
}

fn plane_entries(image: &Image) -> Result<Vec<PlaneEntry>> {
    let format = image.format();
    (0..image.num_planes())
        .map(|i| {
            let layout = image.plane(i)?;
            let (width, height) = format.plane_dims(i, image.width(), image.height());
            Ok(PlaneEntry {
                index: i,
                width,
                height,
                channels: format.plane_channels(i),
                offset: layout.offset,
                stride: layout.stride,
                bytes: layout.stride * height as usize,
                tensor: image.plane_info(i)?.to_string(),
            })
        })
        .collect()
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let dev = SoftDevice::new(args.pitch_alignment)?;
    let tex = dev.alloc_texture(args.image.format, args.image.width, args.image.height)?;
    let image = tex.image();
    let planes = plane_entries(image)?;

    if args.json {
        #[derive(Serialize)]
        struct Body {
            format: &'static str,
            width: u32,
            height: u32,
            pitch_alignment: usize,
            total_bytes: usize,
            planes: Vec<PlaneEntry>,
        }
        return print_json(
            "inspect",
            Body {
                format: image.format().name(),
                width: image.width(),
                height: image.height(),
                pitch_alignment: args.pitch_alignment,
                total_bytes: image.byte_size(),
                planes,
            },
        );
    }

    println!(
        "{} {}x{} ({} bytes, pitch alignment {})",
        image.format(),
        image.width(),
        image.height(),
        image.byte_size(),
        args.pitch_alignment
    );
    for p in &planes {
        println!(
            "  plane {}: {}x{}x{} offset={} stride={} bytes={} tensor={}",
            p.index, p.width, p.height, p.channels, p.offset, p.stride, p.bytes, p.tensor
        );
    }
    Ok(())
}

// ─── map-bench ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BenchReport {
    device: &'static str,
    format: &'static str,
    width: u32,
    height: u32,
    iterations: u32,
    elapsed_ms: u128,
    avg_map_us: f64,
    checksum: u64,
    readbacks_audited: u64,
    staging: StagingSnapshot,
}

fn resolve_config(args: &MapBenchArgs) -> Result<MapperConfig> {
    let mut config = match &args.config {
        Some(path) => MapperConfig::from_json_file(path)?,
        None => MapperConfig::default(),
    };
    if let Some(policy) = args.policy {
        config.staging_policy = policy.into();
    }
    if let Some(alignment) = args.pitch_alignment {
        config.pitch_alignment = alignment;
    }
    config.validate()?;
    Ok(config)
}

/// Map `image` `iterations` times, reading every mapped byte once.
fn bench_mapper<D: DeviceContext>(
    ctx: Arc<D>,
    image: &Image,
    config: MapperConfig,
    iterations: u32,
) -> Result<(SystemMemoryMap<D>, u128, u64)> {
    let mut map = SystemMemoryMap::with_config(ctx, config)?;
    let mut checksum = 0u64;
    let start = Instant::now();
    for _ in 0..iterations {
        let host = map.map_scoped(image)?;
        for plane in 0..host.num_planes() {
            checksum = host
                .plane_bytes(plane)?
                .iter()
                .fold(checksum, |acc, &b| acc.wrapping_add(b as u64));
        }
    }
    let elapsed_us = start.elapsed().as_micros();
    debug_assert!(!map.is_mapped());
    Ok((map, elapsed_us, checksum))
}

fn run_map_bench(args: MapBenchArgs) -> Result<()> {
    if args.iterations == 0 {
        return Err(MemError::InvalidArgument("--iterations must be > 0".into()));
    }
    let config = resolve_config(&args)?;
    let ImageArgs {
        format,
        width,
        height,
    } = args.image.clone();

    let (device, staging, elapsed_us, checksum) = match args.device {
        DeviceArg::Soft => {
            let dev = Arc::new(SoftDevice::new(config.pitch_alignment)?);
            let mut tex = dev.alloc_texture(format, width, height)?;
            for plane in 0..format.plane_count() {
                tex.fill_plane(plane, |r, c| (r ^ c) as u8)?;
            }
            let (map, us, sum) = bench_mapper(dev, tex.image(), config, args.iterations)?;
            map.stats().report();
            ("soft", map.stats().snapshot(), us, sum)
        }
        DeviceArg::Cuda => {
            let ctx = CudaContext::new(args.ordinal)?;
            let tex = ctx.alloc_texture(format, width, height)?;
            let (map, us, sum) = bench_mapper(ctx, tex.image(), config, args.iterations)?;
            map.stats().report();
            ("cuda", map.stats().snapshot(), us, sum)
        }
    };

    let report = BenchReport {
        device,
        format: format.name(),
        width,
        height,
        iterations: args.iterations,
        elapsed_ms: elapsed_us / 1000,
        avg_map_us: elapsed_us as f64 / args.iterations as f64,
        checksum,
        readbacks_audited: readback_audit::readback_count(),
        staging,
    };

    if args.json {
        return print_json("map-bench", report);
    }

    println!(
        "{} {} {}x{}: {} cycles in {} ms ({:.1} us/map)",
        report.device,
        report.format,
        report.width,
        report.height,
        report.iterations,
        report.elapsed_ms,
        report.avg_map_us
    );
    println!(
        "staging: allocations={} reuses={} releases={} copies={} peak_bytes={}",
        staging.allocations, staging.reuses, staging.releases, staging.copies, staging.peak_bytes
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_json_carries_code_and_schema() {
        let err = MemError::PlaneCountMismatch {
            expected: 2,
            actual: 1,
        };
        let value: serde_json::Value =
            serde_json::from_str(&command_error_json("map-bench", &err)).unwrap();
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["ok"], false);
        assert_eq!(value["code"], 102);
    }

    #[test]
    fn plane_entries_match_packed_layout() {
        let dev = SoftDevice::new(64).unwrap();
        let tex = dev.alloc_texture(PixelFormat::I420, 100, 10).unwrap();
        let planes = plane_entries(tex.image()).unwrap();
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[0].stride, 128);
        assert_eq!(planes[1].offset, 1280);
        assert_eq!((planes[2].width, planes[2].height), (50, 5));
    }
}
