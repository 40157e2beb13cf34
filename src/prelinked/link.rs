//! Linking of injected kext executables against the kernel and each other.
//!
//! Injection only needs two things from a linker: a descriptor for the kernel
//! itself to seed the registry, and for each executable a finished descriptor
//! plus the number of bytes it occupies once mapped. [`KextLinker`] is that
//! seam; [`SymbolLinker`] is the default implementation.

use tracing::{debug, warn};

use super::constants::*;
use super::kext::{KextHandle, KextRegistry, KextSymbol, PrelinkedKext};
use crate::error::{Error, Result};
use crate::macho::{MachOView, Nlist64};
use crate::plist::value::PlistDict;
use crate::util::checked_align_up;

/// Everything a linker is given for one executable.
pub struct LinkRequest<'r, 'v> {
    /// Bundle path, for diagnostics
    pub bundle_path: &'r str,
    /// View over the executable as copied into the image
    pub executable: &'r MachOView<'v>,
    /// The kext's Info.plist root dictionary
    pub info: PlistDict<'r>,
    /// Address the executable will be mapped at
    pub load_address: u64,
    /// Runtime address of the executable's kmod_info
    pub kmod_address: u64,
    /// Bytes left in the image past the executable's start
    pub available: u32,
    /// Kexts linked so far, kernel first
    pub registry: &'r KextRegistry,
    /// Working memory that persists across link calls
    pub scratch: &'r mut Option<Vec<u8>>,
}

/// Result of a successful link.
#[derive(Debug)]
pub struct LinkedKext {
    /// The finished descriptor
    pub kext: PrelinkedKext,
    /// Bytes the executable occupies once mapped
    pub load_size: u32,
}

/// A linking engine for injected kexts.
pub trait KextLinker {
    /// Builds the descriptor for the kernel at the root of the registry.
    fn cached_kernel(&mut self, kernel: &MachOView<'_>) -> Result<PrelinkedKext>;

    /// Links one executable.
    fn link(&mut self, request: LinkRequest<'_, '_>) -> Result<LinkedKext>;
}

/// Resolves imports by name against the kernel and declared dependencies.
///
/// Dependencies come from `OSBundleLibraries`: `com.apple.kpi.*` and
/// `com.apple.kernel*` resolve to the kernel, anything else must already be in
/// the registry. Every undefined external symbol has to resolve, and exports
/// are recorded at their runtime address.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolLinker;

impl SymbolLinker {
    /// Creates a linker.
    pub fn new() -> Self {
        Self
    }

    fn dependencies(request: &LinkRequest<'_, '_>) -> Vec<KextHandle> {
        let mut dependencies = Vec::new();
        let Some(libraries) = request.info.dict("OSBundleLibraries") else {
            return dependencies;
        };

        for library in libraries.keys() {
            let handle = if library.starts_with("com.apple.kpi.") || library.starts_with("com.apple.kernel") {
                Some(KextHandle::KERNEL)
            } else {
                request.registry.find_by_identifier(library)
            };

            match handle {
                Some(handle) if !dependencies.contains(&handle) => dependencies.push(handle),
                Some(_) => {}
                None => warn!(
                    bundle = request.bundle_path,
                    library, "dependency is not prelinked, skipping"
                ),
            }
        }
        dependencies
    }
}

/// Exported symbols of an image: external, defined, not private.
fn exports<'a, 'v>(view: &'a MachOView<'v>) -> impl Iterator<Item = (Nlist64, &'v str)> + 'a {
    view.symbols().filter_map(move |symbol| {
        if !symbol.is_external() || symbol.is_private_external() {
            return None;
        }
        if !symbol.is_section_defined() && !symbol.is_absolute() {
            return None;
        }
        Some((symbol, view.symbol_name(&symbol)?))
    })
}

/// Bit set over string-table offsets, backed by the scratch buffer.
fn mark(seen: &mut [u8], strx: u32) -> bool {
    let (byte, bit) = ((strx / 8) as usize, strx % 8);
    match seen.get_mut(byte) {
        Some(slot) if *slot & (1 << bit) != 0 => false,
        Some(slot) => {
            *slot |= 1 << bit;
            true
        }
        None => true,
    }
}

impl KextLinker for SymbolLinker {
    fn cached_kernel(&mut self, kernel: &MachOView<'_>) -> Result<PrelinkedKext> {
        let text = kernel
            .segment("__TEXT")
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__TEXT".to_string(),
            })?;
        let last_address = kernel.last_address().ok_or(Error::EmptyAddressSpace)?;

        let mut symbols = Vec::new();
        symbols
            .try_reserve(kernel.symbol_count() as usize)
            .map_err(|e| Error::out_of_memory("kernel symbols", e))?;
        symbols.extend(exports(kernel).map(|(symbol, name)| KextSymbol {
            name: name.to_string(),
            address: symbol.n_value,
        }));

        debug!(symbols = symbols.len(), "built kernel pseudo-kext");

        Ok(PrelinkedKext {
            identifier: PRELINK_KERNEL_IDENTIFIER.to_string(),
            load_address: text.command.vmaddr,
            size: last_address.saturating_sub(text.command.vmaddr),
            kmod_address: 0,
            symbols,
            dependencies: Vec::new(),
        })
    }

    fn link(&mut self, request: LinkRequest<'_, '_>) -> Result<LinkedKext> {
        let link_error = |reason: String| Error::Link {
            bundle_path: request.bundle_path.to_string(),
            reason,
        };

        let identifier = request
            .info
            .string("CFBundleIdentifier")
            .ok_or_else(|| link_error("missing CFBundleIdentifier".to_string()))?
            .into_owned();
        let executable = request.executable;

        let extent = executable
            .last_address()
            .and_then(|last| checked_align_up(last, u64::from(PRELINKED_ALIGNMENT)))
            .ok_or_else(|| link_error("executable occupies no address space".to_string()))?;
        let load_size = u32::try_from(extent)
            .ok()
            .filter(|&size| size <= request.available)
            .ok_or_else(|| link_error(format!("needs {extent:#x} bytes, {:#x} available", request.available)))?;

        let dependencies = Self::dependencies(&request);

        for symbol in executable.symbols() {
            if !symbol.is_undefined() || !symbol.is_external() {
                continue;
            }
            let name = executable
                .symbol_name(&symbol)
                .ok_or_else(|| link_error(format!("bad string index {:#x}", symbol.n_strx)))?;
            if request.registry.resolve_symbol(name, &dependencies).is_none() {
                return Err(Error::UnresolvedSymbol {
                    identifier,
                    symbol: name.to_string(),
                });
            }
        }

        let strsize = executable.symtab().map_or(0, |symtab| symtab.strsize as usize);
        let seen = request.scratch.get_or_insert_with(Vec::new);
        seen.clear();
        seen.try_reserve(strsize.div_ceil(8))
            .map_err(|e| Error::out_of_memory("link scratch", e))?;
        seen.resize(strsize.div_ceil(8), 0);

        let mut symbols = Vec::new();
        for (symbol, name) in exports(executable) {
            if !mark(seen, symbol.n_strx) {
                continue;
            }
            let address = if symbol.is_absolute() {
                symbol.n_value
            } else {
                request
                    .load_address
                    .checked_add(symbol.n_value)
                    .ok_or(Error::CapacityOverflow)?
            };
            symbols.push(KextSymbol {
                name: name.to_string(),
                address,
            });
        }

        debug!(
            identifier = identifier.as_str(),
            load_address = format_args!("{:#x}", request.load_address),
            load_size = format_args!("{load_size:#x}"),
            exports = symbols.len(),
            dependencies = dependencies.len(),
            "linked kext"
        );

        Ok(LinkedKext {
            kext: PrelinkedKext {
                identifier,
                load_address: request.load_address,
                size: u64::from(load_size),
                kmod_address: request.kmod_address,
                symbols,
                dependencies,
            },
            load_size,
        })
    }
}
