//! Sandboxed Module Host Command-Line Interface
//!
//! This CLI provides tools for:
//! - Computing the byte layout a module is created with
//! - Emitting and test-mapping callback trampolines
//! - Loading a module, resolving exports and writing state snapshots
//!
//! Module loading needs the native host library; enable the `waterbox`
//! feature for the `inspect` and `snapshot` commands.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use wbx_host::forge::{emit_x86_64, Trampoline, TrampolineKind, MAX_ARITY};
use wbx_host::{LayoutKb, MemoryLayout, SessionConfig};

#[derive(Parser)]
#[command(name = "wbx")]
#[command(author, version, about = "Sandboxed module host CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the byte layout for a set of KB sizes or a session config
    Layout {
        /// Session config file; overrides the size flags
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Growable heap size in KB
        #[arg(long, default_value = "0")]
        sbrk_kb: usize,

        /// Sealed heap size in KB
        #[arg(long, default_value = "0")]
        sealed_kb: usize,

        /// Invisible heap size in KB
        #[arg(long, default_value = "0")]
        invis_kb: usize,

        /// Plain heap size in KB
        #[arg(long, default_value = "0")]
        plain_kb: usize,

        /// mmap region size in KB
        #[arg(long, default_value = "0")]
        mmap_kb: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Emit the machine code of a callback trampoline
    Forge {
        /// Target function address (hex with 0x, or decimal)
        #[arg(long, value_parser = parse_addr, default_value = "0")]
        target: usize,

        /// Bound value appended after the caller's arguments
        #[arg(long, value_parser = parse_addr, default_value = "0")]
        bound: usize,

        /// Number of caller arguments (0-5)
        #[arg(short, long, default_value = "0")]
        arity: usize,

        /// How control returns from the target
        #[arg(short, long, value_enum, default_value = "return")]
        kind: KindArg,

        /// Also map the stub into executable memory, then release it
        #[arg(long)]
        map: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Load a module and resolve exported symbols
    #[cfg(feature = "waterbox")]
    Inspect {
        /// Session config file
        #[arg(short, long)]
        config: PathBuf,

        /// Symbols to resolve
        #[arg(short, long = "symbol", required = true)]
        symbols: Vec<String>,
    },

    /// Load a module, mount files, seal and write a state snapshot
    #[cfg(feature = "waterbox")]
    Snapshot {
        /// Session config file
        #[arg(short, long)]
        config: PathBuf,

        /// Read-only mounts as NAME=PATH
        #[arg(short, long = "mount", value_parser = parse_mount)]
        mounts: Vec<(String, PathBuf)>,

        /// Snapshot output file
        #[arg(short, long, default_value = "state.bin")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    /// Call the target and return to the caller
    Return,
    /// Jump into the target
    Tail,
}

impl From<KindArg> for TrampolineKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Return => TrampolineKind::ReturnPreserving,
            KindArg::Tail => TrampolineKind::TailRedirect,
        }
    }
}

#[derive(Serialize)]
struct ForgeReport {
    kind: TrampolineKind,
    arity: usize,
    target: String,
    bound: String,
    len: usize,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mapped_at: Option<String>,
}

fn parse_addr(s: &str) -> std::result::Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[cfg(feature = "waterbox")]
fn parse_mount(s: &str) -> std::result::Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected NAME=PATH, got '{}'", s)),
    }
}

fn hex_bytes(code: &[u8]) -> String {
    code.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn load_config(path: &Path) -> Result<SessionConfig> {
    SessionConfig::from_json_file(path).with_context(|| format!("Failed to load config {:?}", path))
}

fn cmd_layout(config: Option<PathBuf>, kb: LayoutKb, json: bool) -> Result<()> {
    let kb = match config {
        Some(path) => load_config(&path)?.layout,
        None => kb,
    };
    let layout = MemoryLayout::from_kb(kb).context("Layout does not fit in the address space")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    println!("=== Module Memory Layout ===");
    println!();
    println!("  Segment   {:>8}  {:>12}", "KB", "Bytes");
    println!("  sbrk      {:>8}  {:>12}", kb.sbrk_kb, layout.sbrk_size);
    println!("  sealed    {:>8}  {:>12}", kb.sealed_kb, layout.sealed_size);
    println!("  invis     {:>8}  {:>12}", kb.invis_kb, layout.invis_size);
    println!("  plain     {:>8}  {:>12}", kb.plain_kb, layout.plain_size);
    println!("  mmap      {:>8}  {:>12}", kb.mmap_kb, layout.mmap_size);
    println!();
    println!("  Total:              {:>12}", layout.total());

    Ok(())
}

fn cmd_forge(target: usize, bound: usize, arity: usize, kind: TrampolineKind, map: bool, json: bool) -> Result<()> {
    if arity > MAX_ARITY {
        bail!("Arity {} not supported (max {})", arity, MAX_ARITY);
    }

    let code = emit_x86_64(target as u64, bound as u64, arity, kind);
    info!("Emitted {} bytes for {:?} arity {}", code.len(), kind, arity);

    let mapped_at = if map {
        let stub = Trampoline::create(target, bound, arity, kind).context("Failed to map trampoline")?;
        let addr = stub.addr();
        stub.destroy().context("Failed to release trampoline")?;
        Some(format!("{:#x}", addr))
    } else {
        None
    };

    let report = ForgeReport {
        kind,
        arity,
        target: format!("{:#x}", target),
        bound: format!("{:#x}", bound),
        len: code.len(),
        code: hex_bytes(&code),
        mapped_at,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Kind:    {:?}", report.kind);
    println!("Arity:   {}", report.arity);
    println!("Target:  {}", report.target);
    println!("Bound:   {}", report.bound);
    println!("Length:  {} bytes", report.len);
    println!("Code:    {}", report.code);
    if let Some(addr) = &report.mapped_at {
        println!("Mapped:  {} (released)", addr);
    }

    Ok(())
}

#[cfg(feature = "waterbox")]
fn cmd_inspect(config: PathBuf, symbols: Vec<String>) -> Result<()> {
    use wbx_host::{SandboxSession, WaterboxEngine};

    let config = load_config(&config)?;
    let session = SandboxSession::<WaterboxEngine>::open(&config)
        .with_context(|| format!("Failed to load module {:?}", config.module))?;

    {
        let active = session.activate()?;
        for name in &symbols {
            match active.resolve_symbol(name) {
                Ok(addr) => println!("{:<32} {}", name, addr),
                Err(e) => println!("{:<32} ({})", name, e),
            }
        }
    }

    session.destroy()?;
    Ok(())
}

#[cfg(feature = "waterbox")]
fn cmd_snapshot(config: PathBuf, mounts: Vec<(String, PathBuf)>, output: PathBuf) -> Result<()> {
    use wbx_host::{SandboxSession, WaterboxEngine};

    let config = load_config(&config)?;
    let session = SandboxSession::<WaterboxEngine>::open(&config)
        .with_context(|| format!("Failed to load module {:?}", config.module))?;

    let state = {
        let active = session.activate()?;

        for (name, path) in &mounts {
            let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
            active.mount_readonly(name, &data)?;
            info!("Mounted {} from {:?}", name, path);
        }

        active.seal()?;
        let state = active.save_state()?;

        for (name, _) in &mounts {
            active.unmount_readonly(name)?;
        }
        state
    };

    std::fs::write(&output, &state).with_context(|| format!("Failed to write {:?}", output))?;
    println!("Wrote {} byte snapshot of {} to {:?}", state.len(), session.name(), output);

    session.destroy()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Layout {
            config,
            sbrk_kb,
            sealed_kb,
            invis_kb,
            plain_kb,
            mmap_kb,
            json,
        } => cmd_layout(config, LayoutKb::new(sbrk_kb, sealed_kb, invis_kb, plain_kb, mmap_kb), json),

        Commands::Forge {
            target,
            bound,
            arity,
            kind,
            map,
            json,
        } => cmd_forge(target, bound, arity, kind.into(), map, json),

        #[cfg(feature = "waterbox")]
        Commands::Inspect { config, symbols } => cmd_inspect(config, symbols),

        #[cfg(feature = "waterbox")]
        Commands::Snapshot { config, mounts, output } => cmd_snapshot(config, mounts, output),
    }
}
