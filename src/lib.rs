//! prelinkedit - Kext injection for prelinked kernel images.
//!
//! This library appends kernel extensions to a macOS prelinked kernel: the
//! kext executable is copied past the existing prelinked text, linked against
//! the kernel, and described in the image's embedded prelink info plist.
//!
//! # Features
//!
//! - In-place editing of a caller-owned image buffer
//! - Capacity planning before any byte is written
//! - Order-preserving plist editing with `ID`/`IDREF` support
//! - Pluggable linking through [`KextLinker`]
//!
//! # Example
//!
//! ```no_run
//! use prelinkedit::{required_capacity, inject_kexts, KextBundle};
//!
//! fn main() -> prelinkedit::Result<()> {
//!     let kernel = std::fs::read("/path/to/prelinkedkernel").expect("read kernel");
//!     let bundle = KextBundle {
//!         bundle_path: "/Library/Extensions/Foo.kext".to_string(),
//!         info_plist: std::fs::read("Foo.kext/Contents/Info.plist").expect("read plist"),
//!         executable: None,
//!     };
//!
//!     let mut image = kernel.clone();
//!     image.resize(required_capacity(kernel.len(), std::slice::from_ref(&bundle))?, 0);
//!     let size = inject_kexts(&mut image, kernel.len(), &[bundle])?;
//!     image.truncate(size as usize);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod macho;
pub mod plist;
pub mod prelinked;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use error::{Error, ErrorKind, Result};
pub use macho::MachOView;
pub use prelinked::{
    reserve_kext_size, KextExecutable, KextLinker, Phase, PrelinkedContext, PrelinkedKext, SymbolLinker,
};

use prelinked::constants::PRELINKED_ALIGNMENT;
use tracing::info;

/// A kext bundle loaded into memory.
#[derive(Debug, Clone)]
pub struct KextBundle {
    /// Path the bundle is recorded under, e.g. `/Library/Extensions/Foo.kext`
    pub bundle_path: String,
    /// Contents of `Contents/Info.plist`
    pub info_plist: Vec<u8>,
    /// Executable path relative to the bundle and its bytes, if the kext has code
    pub executable: Option<(String, Vec<u8>)>,
}

impl KextBundle {
    /// Returns the executable in the form injection takes it.
    pub fn executable(&self) -> Option<KextExecutable<'_>> {
        self.executable.as_ref().map(|(path, bytes)| KextExecutable {
            path,
            bytes,
        })
    }

    /// Adds this bundle's worst-case image growth to `reserved`.
    pub fn reserve(&self, reserved: &mut u32) -> Result<()> {
        let size = |len: usize| u32::try_from(len).map_err(|_| Error::CapacityOverflow);
        let executable_size = match &self.executable {
            Some((_, bytes)) => size(bytes.len())?,
            None => 0,
        };
        reserve_kext_size(reserved, size(self.info_plist.len())?, executable_size)
    }
}

/// Returns the buffer size needed to inject `bundles` into an image whose
/// meaningful size is `used_size`.
pub fn required_capacity(used_size: usize, bundles: &[KextBundle]) -> Result<usize> {
    let mut reserved = u32::try_from(used_size).map_err(|_| Error::CapacityOverflow)?;
    reserved = util::align_size(reserved, PRELINKED_ALIGNMENT)?;
    for bundle in bundles {
        bundle.reserve(&mut reserved)?;
    }
    Ok(reserved as usize)
}

/// Injects `bundles` into the image in `image[..used_size]` with the default
/// linker and returns the new meaningful size.
///
/// `image` must be large enough; see [`required_capacity`].
pub fn inject_kexts(image: &mut [u8], used_size: usize, bundles: &[KextBundle]) -> Result<u32> {
    let mut context = PrelinkedContext::new(image, used_size)?;
    context.inject_prepare()?;
    for bundle in bundles {
        context.inject_kext(&bundle.bundle_path, &bundle.info_plist, bundle.executable())?;
    }
    context.inject_complete()?;

    info!(
        kexts = bundles.len(),
        size = format_args!("{:#x}", context.used_size()),
        "injected kexts"
    );
    Ok(context.into_used_size())
}
