//! Lattice - inspect compute backends and devices
//!
//! # Usage
//!
//! ```bash
//! # List registered backends
//! lattice backends
//!
//! # List devices on the preferred backend
//! lattice devices
//!
//! # Full capability record of device 0 on the host backend, as JSON
//! lattice caps --backend host --device 0 --json
//!
//! # Largest limits across all devices, with settings from a config file
//! lattice limits --config lattice.toml
//! ```

use clap::{Args, Parser, Subcommand};
use lattice_gpu::{logging, registry, Context, ContextOptions, ImageKind};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "lattice")]
#[command(version = "0.1.0")]
#[command(about = "Lattice - back-end neutral compute devices", long_about = None)]
struct Cli {
    /// Log filter, e.g. "debug" or "lattice_gpu=trace"
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ContextArgs {
    /// Backend id ("auto" walks backend-order)
    #[arg(short, long)]
    backend: Option<String>,

    /// Path to a lattice.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered backend ids
    Backends,

    /// List the devices of a context
    Devices {
        #[command(flatten)]
        context: ContextArgs,
    },

    /// Show the capability record of one device
    Caps {
        #[command(flatten)]
        context: ContextArgs,

        /// Device index; defaults to the context's default device
        #[arg(short, long)]
        device: Option<usize>,
    },

    /// Show the largest limits across all devices of a context
    Limits {
        #[command(flatten)]
        context: ContextArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    match &cli.log {
        Some(filter) => {
            std::env::set_var("RUST_LOG", filter);
            logging::init_from_env();
        }
        None => logging::init(),
    }

    let result = match cli.command {
        Commands::Backends => {
            list_backends();
            Ok(())
        }
        Commands::Devices { context } => list_devices(&context),
        Commands::Caps { context, device } => show_caps(&context, device),
        Commands::Limits { context } => show_limits(&context),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn open_context(args: &ContextArgs) -> Result<Context, String> {
    let mut options = match &args.config {
        Some(path) => ContextOptions::load(path).map_err(|e| e.to_string())?,
        None => ContextOptions::default(),
    }
    .from_env();
    if let Some(backend) = &args.backend {
        options = options.with_backend(backend);
    }
    log::debug!("backend preference: {:?}", options.backend_preference());
    Context::from_options(&options).map_err(|e| e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON encoding failed: {}", e))
}

fn list_backends() {
    for id in registry::registered_ids() {
        println!("{}", id);
    }
}

fn list_devices(args: &ContextArgs) -> Result<(), String> {
    let context = open_context(args)?;
    let infos: Vec<_> = context.devices().iter().map(|d| d.info()).collect();
    if args.json {
        println!("{}", to_json(&infos)?);
        return Ok(());
    }

    let default_index = context.default_device().id().index;
    println!("Backend: {}", context.backend_id());
    for info in &infos {
        let marker = if info.index == default_index { "*" } else { " " };
        println!(
            "{} [{}] {} ({:?}, {:?})",
            marker, info.index, info.name, info.vendor, info.device_type
        );
    }
    Ok(())
}

fn show_caps(args: &ContextArgs, index: Option<usize>) -> Result<(), String> {
    let context = open_context(args)?;
    let device = match index {
        Some(index) => context.device(index).map_err(|e| e.to_string())?,
        None => context.default_device(),
    };
    let info = device.info();
    if args.json {
        println!("{}", to_json(&info)?);
        return Ok(());
    }

    let caps = &info.capabilities;
    println!("{} [{}] on '{}'", info.name, info.index, info.backend);
    println!("  Global memory:       {} bytes", caps.global_memory_size);
    println!("  Max allocation:      {} bytes", caps.max_mem_alloc);
    println!(
        "  Local memory:        {} bytes{}",
        caps.local_memory_size,
        if caps.is_compliant() { "" } else { " (below minimum)" }
    );
    println!("  SIMD width:          {}", caps.simd_width);
    println!("  Compute units:       {}", caps.compute_units);
    println!("  Max local size:      {}", caps.max_total_local_size);
    println!("  Profiling:           {}", caps.profiling_support);
    println!("  Double precision:    {}", caps.double_support);
    println!("  Argument buffers:    {}", caps.argument_buffer_support);
    println!("  Image features:      {:?}", caps.image_features);

    let supported: Vec<String> = ImageKind::ALL
        .iter()
        .filter(|kind| caps.supports(**kind))
        .map(|kind| format!("{:?}", kind))
        .collect();
    println!("  Image kinds:         {}", supported.join(", "));
    Ok(())
}

fn show_limits(args: &ContextArgs) -> Result<(), String> {
    let context = open_context(args)?;
    let limits = context.aggregate_limits();
    if args.json {
        println!("{}", to_json(&limits)?);
        return Ok(());
    }
    println!("Backend: {} ({} devices)", context.backend_id(), context.devices().len());
    println!("  Local memory:  {} bytes", limits.local_memory_size);
    println!("  SIMD width:    {}", limits.simd_width);
    println!("  Compute units: {}", limits.compute_units);
    Ok(())
}
