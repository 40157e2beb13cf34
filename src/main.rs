//! prelinkedit - Injects kernel extensions into macOS prelinked kernels.
//!
//! Inspect a prelinked kernel or append kext bundles to it.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memmap2::Mmap;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use prelinkedit::plist::value::plist_root;
use prelinkedit::plist::{PlistDict, XmlDocument};
use prelinkedit::prelinked::constants::*;
use prelinkedit::prelinked::KextHandle;
use prelinkedit::util::checked_align_up;
use prelinkedit::{inject_kexts, required_capacity, KextBundle, MachOView, PrelinkedContext};

/// Install location recorded for injected bundles.
const DEFAULT_BUNDLE_PREFIX: &str = "/Library/Extensions";

/// Injects kernel extensions into macOS prelinked kernel images.
#[derive(Parser, Debug)]
#[command(name = "prelinkedit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inject kext bundles into a prelinked kernel
    Inject {
        /// Path to the prelinked kernel
        prelinked: PathBuf,

        /// Kext bundle to inject (repeatable, injected in order)
        #[arg(short, long = "kext", required = true)]
        kexts: Vec<PathBuf>,

        /// Output path for the patched prelinked kernel
        #[arg(short, long)]
        output: PathBuf,

        /// Directory injected bundles are recorded under
        #[arg(long, default_value = DEFAULT_BUNDLE_PREFIX)]
        bundle_prefix: String,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// Show prelinked kernel information
    Info {
        /// Path to the prelinked kernel
        prelinked: PathBuf,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inject {
            prelinked,
            kexts,
            output,
            bundle_prefix,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_inject(&prelinked, &kexts, &output, &bundle_prefix)
        }
        Commands::Info {
            prelinked,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_info(&prelinked)
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Maps a file read-only.
fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    // SAFETY: the mapping is read-only and only lives for this process.
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to map: {}", path.display()))?;
    Ok(mmap)
}

/// Reads a kext bundle directory into memory.
fn load_bundle(path: &Path, bundle_prefix: &str) -> Result<KextBundle> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        bail!("Invalid bundle path: {}", path.display());
    };

    let plist_path = path.join("Contents").join("Info.plist");
    let info_plist =
        fs::read(&plist_path).with_context(|| format!("Failed to read: {}", plist_path.display()))?;

    let doc = XmlDocument::parse(&info_plist)
        .with_context(|| format!("Failed to parse: {}", plist_path.display()))?;
    let executable_name = plist_root(&doc)
        .and_then(|root| PlistDict::new(&doc, root))
        .and_then(|dict| dict.string("CFBundleExecutable").map(|s| s.into_owned()));

    let executable = match executable_name {
        Some(executable_name) => {
            let relative = format!("Contents/MacOS/{executable_name}");
            let exe_path = path.join(&relative);
            let bytes =
                fs::read(&exe_path).with_context(|| format!("Failed to read: {}", exe_path.display()))?;
            debug!("Loaded executable {} ({} bytes)", exe_path.display(), bytes.len());
            Some((relative, bytes))
        }
        None => {
            debug!("{} has no executable", name);
            None
        }
    };

    Ok(KextBundle {
        bundle_path: format!("{}/{}", bundle_prefix.trim_end_matches('/'), name),
        info_plist,
        executable,
    })
}

fn cmd_inject(prelinked: &Path, kexts: &[PathBuf], output: &Path, bundle_prefix: &str) -> Result<()> {
    let start = Instant::now();
    let mmap = map_file(prelinked)?;

    let bundles = kexts
        .iter()
        .map(|path| load_bundle(path, bundle_prefix))
        .collect::<Result<Vec<_>>>()?;

    let capacity = required_capacity(mmap.len(), &bundles).context("Failed to plan image capacity")?;
    info!(
        "Reserved {:#x} bytes for {} kext(s) on top of {:#x}",
        capacity - mmap.len(),
        bundles.len(),
        mmap.len()
    );

    let mut image = vec![0u8; capacity];
    image[..mmap.len()].copy_from_slice(&mmap);

    let size = inject_kexts(&mut image, mmap.len(), &bundles)
        .with_context(|| format!("Failed to inject kexts into {}", prelinked.display()))?;

    fs::write(output, &image[..size as usize])
        .with_context(|| format!("Failed to write: {}", output.display()))?;

    info!(
        "Wrote {} ({:#x} bytes) in {:.2?}",
        output.display(),
        size,
        start.elapsed()
    );
    Ok(())
}

fn cmd_info(prelinked: &Path) -> Result<()> {
    let mmap = map_file(prelinked)?;

    let view = MachOView::new(&mmap).with_context(|| format!("Failed to parse: {}", prelinked.display()))?;

    println!("Prelinked Kernel Information");
    println!("============================");
    println!("Path:         {}", prelinked.display());
    println!("Header:       {}", view.header);
    println!("Size:         {:#x}", mmap.len());

    println!("\nPrelink regions:");
    for (segment, section) in [
        (PRELINK_TEXT_SEGMENT, PRELINK_TEXT_SECTION),
        (PRELINK_INFO_SEGMENT, PRELINK_INFO_SECTION),
    ] {
        match view.segment(segment) {
            Some(seg) => println!("  {}", seg.command),
            None => println!("  {} (missing)", segment),
        }
        match view.section(segment, section) {
            Some(sect) => println!("  {}", sect.section),
            None => println!("  {},{} (missing)", segment, section),
        }
    }

    // Loading needs the meaningful size padded to the prelink alignment.
    let padded = checked_align_up(mmap.len() as u64, u64::from(PRELINKED_ALIGNMENT))
        .context("Image size overflows")?;
    let mut image = vec![0u8; padded as usize];
    image[..mmap.len()].copy_from_slice(&mmap);

    let context = PrelinkedContext::new(&mut image, mmap.len())
        .with_context(|| format!("Failed to load prelinked context: {}", prelinked.display()))?;

    println!("\nFrontiers:");
    println!("  Used size:         {:#x}", context.used_size());
    println!("  Last address:      {:#018x}", context.last_address());
    println!("  Last load address: {:#018x}", context.last_load_address());

    if let Some(kernel) = context.registry().get(KextHandle::KERNEL) {
        println!("\nKernel:");
        println!("  {}", kernel);
    }

    println!("\nKexts ({}):", context.kext_count());
    if let (Some(doc), Some(list)) = (context.document(), context.kext_list()) {
        for (i, &entry) in doc.node(list).children().iter().enumerate() {
            let Some(dict) = PlistDict::new(doc, entry) else {
                continue;
            };
            let identifier = dict.string("CFBundleIdentifier").unwrap_or_default();
            let bundle_path = dict.string(PRELINK_INFO_BUNDLE_PATH_KEY).unwrap_or_default();
            match dict.integer(PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY) {
                Some(load) => println!("  [{:4}] {:#018x} {} {}", i, load, identifier, bundle_path),
                None => println!("  [{:4}] {:>18} {} {}", i, "-", identifier, bundle_path),
            }
        }
    }

    Ok(())
}
