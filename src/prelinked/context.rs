//! Prelinked image context: loading, bookkeeping and teardown.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::address::find_last_load_address;
use super::constants::*;
use super::kext::KextRegistry;
use super::link::{KextLinker, SymbolLinker};
use super::pool::DependencyPool;
use crate::error::{Error, Result};
use crate::macho::{MachOView, SectionRef, SegmentRef};
use crate::plist::value::{cast, dict_get, plist_root, PlistType};
use crate::plist::{NodeId, XmlDocument};
use crate::util::{align_size, checked_align_up};

/// Where a context is in the injection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Loaded, not yet prepared for injection
    Loaded,
    /// Prepared; kexts may be injected
    Prepared,
    /// Prelink info written back; the image is final
    Completed,
    /// A failure left the image inconsistent; the context must be discarded
    Poisoned,
}

impl Phase {
    /// Returns the phase name.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Loaded => "loaded",
            Phase::Prepared => "prepared",
            Phase::Completed => "completed",
            Phase::Poisoned => "poisoned",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Editing context over a prelinked kernel image.
///
/// The context borrows the image buffer for its whole lifetime. The buffer's
/// length is the capacity available for appended kexts; only the first
/// [`used_size`](Self::used_size) bytes are meaningful.
///
/// The pipeline is [`inject_prepare`](Self::inject_prepare), any number of
/// [`inject_kext`](Self::inject_kext) calls, then
/// [`inject_complete`](Self::inject_complete).
pub struct PrelinkedContext<'a, L: KextLinker = SymbolLinker> {
    pub(super) image: &'a mut [u8],
    pub(super) capacity: u32,
    pub(super) used_size: u32,
    pub(super) last_address: u64,
    pub(super) last_load_address: u64,
    pub(super) info_segment: SegmentRef,
    pub(super) info_section: SectionRef,
    pub(super) text_segment: SegmentRef,
    pub(super) text_section: SectionRef,
    pub(super) document: Option<XmlDocument>,
    pub(super) kext_list: Option<NodeId>,
    pub(super) pool: DependencyPool<Rc<str>>,
    pub(super) scratch: Option<Vec<u8>>,
    pub(super) registry: KextRegistry,
    pub(super) linker: L,
    pub(super) phase: Phase,
}

impl<'a> PrelinkedContext<'a> {
    /// Loads the image in `image[..used_size]` with the default linker.
    pub fn new(image: &'a mut [u8], used_size: usize) -> Result<Self> {
        Self::with_linker(image, used_size, SymbolLinker::new())
    }
}

impl<'a, L: KextLinker> PrelinkedContext<'a, L> {
    /// Loads the image in `image[..used_size]`, linking kexts with `linker`.
    ///
    /// The meaningful size is padded with zeroes to [`PRELINKED_ALIGNMENT`].
    /// The prelink info plist is parsed, the frontiers are derived, and the
    /// registry is seeded with the kernel.
    pub fn with_linker(image: &'a mut [u8], used_size: usize, linker: L) -> Result<Self> {
        let capacity = u32::try_from(image.len()).map_err(|_| Error::OutOfRange {
            what: "image capacity",
            value: image.len() as u64,
        })?;
        let used_size = u32::try_from(used_size)
            .ok()
            .filter(|&used| used <= capacity)
            .ok_or(Error::RegionOutOfBounds {
                offset: 0,
                size: used_size as u64,
                available: image.len(),
            })?;

        let mut context = Self {
            image,
            capacity,
            used_size,
            last_address: 0,
            last_load_address: 0,
            info_segment: SegmentRef { command_offset: 0 },
            info_section: SectionRef { struct_offset: 0 },
            text_segment: SegmentRef { command_offset: 0 },
            text_section: SectionRef { struct_offset: 0 },
            document: None,
            kext_list: None,
            pool: DependencyPool::new(),
            scratch: None,
            registry: KextRegistry::new(),
            linker,
            phase: Phase::Loaded,
        };

        // On failure `context` is dropped, which tears it down.
        context.load()?;
        Ok(context)
    }

    fn load(&mut self) -> Result<()> {
        let aligned = align_size(self.used_size, PRELINKED_ALIGNMENT)?;
        if aligned > self.capacity {
            return Err(Error::buffer_too_small(aligned.into(), self.capacity.into()));
        }
        self.image[self.used_size as usize..aligned as usize].fill(0);
        self.used_size = aligned;

        let view = MachOView::new(&self.image[..aligned as usize])?;
        self.last_address = Self::align(view.last_address().ok_or(Error::EmptyAddressSpace)?)?;

        let segment = |name: &str| {
            view.segment(name).ok_or_else(|| Error::SegmentNotFound {
                name: name.to_string(),
            })
        };
        let section = |segment: &str, section: &str| {
            view.section(segment, section)
                .ok_or_else(|| Error::SectionNotFound {
                    segment: segment.to_string(),
                    section: section.to_string(),
                })
        };

        self.info_segment = segment(PRELINK_INFO_SEGMENT)?.handle();
        let info = section(PRELINK_INFO_SEGMENT, PRELINK_INFO_SECTION)?;
        self.info_section = info.handle();
        self.text_segment = segment(PRELINK_TEXT_SEGMENT)?.handle();
        self.text_section = section(PRELINK_TEXT_SEGMENT, PRELINK_TEXT_SECTION)?.handle();

        let info_size = u32::try_from(info.section.size).map_err(|_| Error::OutOfRange {
            what: "prelink info size",
            value: info.section.size,
        })?;
        let info_start = info.section.offset as usize;
        let info_bytes = info_start
            .checked_add(info_size as usize)
            .and_then(|end| self.image.get(info_start..end))
            .ok_or(Error::RegionOutOfBounds {
                offset: info_start as u64,
                size: info_size.into(),
                available: self.image.len(),
            })?;

        let document = XmlDocument::parse(info_bytes)?;
        let root = plist_root(&document)
            .and_then(|root| cast(&document, root, PlistType::Dict))
            .ok_or_else(|| Error::PlistStructure("prelink info root is not a dictionary".to_string()))?;
        let kext_list = dict_get(&document, root, PRELINK_INFO_DICTIONARY_KEY)
            .and_then(|list| cast(&document, list, PlistType::Array))
            .ok_or_else(|| Error::PlistStructure(format!("{PRELINK_INFO_DICTIONARY_KEY} array is missing")))?;

        self.last_load_address = find_last_load_address(&document, kext_list).ok_or_else(|| {
            Error::PlistStructure("unable to derive the last kext load address".to_string())
        })?;

        debug!(
            used_size = format_args!("{:#x}", self.used_size),
            capacity = format_args!("{:#x}", self.capacity),
            last_address = format_args!("{:#x}", self.last_address),
            last_load_address = format_args!("{:#x}", self.last_load_address),
            kexts = document.child_count(kext_list),
            "loaded prelinked image"
        );

        self.document = Some(document);
        self.kext_list = Some(kext_list);

        let kernel = self.linker.cached_kernel(&view)?;
        self.registry.push(kernel);
        Ok(())
    }

    /// Releases everything the context owns. Safe to call repeatedly and on a
    /// partially loaded context.
    fn teardown(&mut self) {
        if self.document.take().is_some() {
            trace!("released prelink info document");
        }
        self.kext_list = None;
        if !self.pool.is_empty() {
            trace!(entries = self.pool.len(), "released dependency pool");
        }
        self.pool.clear();
        if self.scratch.take().is_some() {
            trace!("released link scratch buffer");
        }
        if !self.registry.is_empty() {
            trace!(kexts = self.registry.len(), "released kext registry");
        }
        self.registry.clear();
    }

    /// Tears the context down, releasing the image borrow.
    pub fn free(mut self) {
        self.teardown();
    }

    /// Fails unless the context is in `expected`.
    pub(super) fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<()> {
        match self.phase {
            Phase::Poisoned => Err(Error::Poisoned),
            phase if phase == expected => Ok(()),
            phase => Err(Error::PhaseViolation {
                operation,
                phase: phase.name(),
            }),
        }
    }

    /// Aligns `value` to [`PRELINKED_ALIGNMENT`].
    pub(super) fn align(value: u64) -> Result<u64> {
        checked_align_up(value, PRELINKED_ALIGNMENT.into()).ok_or(Error::CapacityOverflow)
    }

    /// Returns the meaningful size of the image.
    pub fn used_size(&self) -> u32 {
        self.used_size
    }

    /// Returns the total size the image may grow to.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the first free virtual address for source bytes.
    pub fn last_address(&self) -> u64 {
        self.last_address
    }

    /// Returns the first free load address for kext executables.
    pub fn last_load_address(&self) -> u64 {
        self.last_load_address
    }

    /// Returns the pipeline phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the number of entries in the prelink info kext array.
    pub fn kext_count(&self) -> usize {
        match (&self.document, self.kext_list) {
            (Some(document), Some(list)) => document.child_count(list),
            _ => 0,
        }
    }

    /// Returns the prelink info document.
    pub fn document(&self) -> Option<&XmlDocument> {
        self.document.as_ref()
    }

    /// Returns the kext array node of the prelink info document.
    pub fn kext_list(&self) -> Option<NodeId> {
        self.kext_list
    }

    /// Returns the linked kexts, kernel first.
    pub fn registry(&self) -> &KextRegistry {
        &self.registry
    }

    /// Returns the number of serialized kext fragments held for the document.
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Returns the meaningful prefix of the image.
    pub fn image(&self) -> &[u8] {
        &self.image[..self.used_size as usize]
    }

    /// Tears the context down and returns the meaningful size of the image.
    pub fn into_used_size(mut self) -> u32 {
        self.teardown();
        self.used_size
    }
}

impl<L: KextLinker> Drop for PrelinkedContext<'_, L> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<L: KextLinker> fmt::Debug for PrelinkedContext<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrelinkedContext")
            .field("phase", &self.phase)
            .field("used_size", &format_args!("{:#x}", self.used_size))
            .field("capacity", &format_args!("{:#x}", self.capacity))
            .field("last_address", &format_args!("{:#x}", self.last_address))
            .field("last_load_address", &format_args!("{:#x}", self.last_load_address))
            .field("kexts", &self.kext_count())
            .field("registry", &self.registry.len())
            .finish()
    }
}
