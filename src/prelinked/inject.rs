//! Kext injection pipeline.
//!
//! Kexts are appended past the prelinked text, which is grown to cover them.
//! The prelink info plist is lifted out of the image by
//! [`inject_prepare`](PrelinkedContext::inject_prepare), edited in memory while
//! kexts are injected, and written back to the new tail by
//! [`inject_complete`](PrelinkedContext::inject_complete).

use std::rc::Rc;

use tracing::{debug, info, warn};

use super::address::find_kmod_address;
use super::constants::*;
use super::context::{Phase, PrelinkedContext};
use super::kext::PrelinkedKext;
use super::link::{KextLinker, LinkRequest};
use crate::error::{Error, Result};
use crate::macho::MachOView;
use crate::plist::value::{cast, plist_depth, plist_root, PlistDict, PlistType};
use crate::plist::{NodeId, XmlDocument};
use crate::util::{add_size, align_size, lower_hex};

/// A kext executable to inject.
#[derive(Debug, Clone, Copy)]
pub struct KextExecutable<'e> {
    /// Path of the executable relative to the bundle, e.g. `Contents/MacOS/Foo`
    pub path: &'e str,
    /// Executable bytes
    pub bytes: &'e [u8],
}

/// An executable copied to the image tail but not yet committed.
struct StagedExecutable {
    size: u32,
    aligned_size: u32,
    kmod_address: u64,
}

fn append_integer(doc: &mut XmlDocument, dict: NodeId, key: &str, value: u64) -> Result<()> {
    doc.append(dict, "key", None, Some(key))?;
    doc.append(dict, "integer", Some(PRELINK_INFO_INTEGER_ATTRIBUTES), Some(&lower_hex(value)))?;
    Ok(())
}

fn append_string(doc: &mut XmlDocument, dict: NodeId, key: &str, value: &str) -> Result<()> {
    doc.append(dict, "key", None, Some(key))?;
    doc.append(dict, "string", None, Some(value))?;
    Ok(())
}

impl<L: KextLinker> PrelinkedContext<'_, L> {
    /// Lifts the prelink info out of the image so kexts can be appended.
    ///
    /// If the prelink info is the last region of the image it is truncated
    /// away. Its segment and section are cleared either way. The prelinked
    /// text must then end exactly at the image tail.
    pub fn inject_prepare(&mut self) -> Result<()> {
        self.expect_phase("inject_prepare", Phase::Loaded)?;

        let result = self.prepare();
        self.phase = match result {
            Ok(()) => Phase::Prepared,
            Err(_) => Phase::Poisoned,
        };
        result
    }

    fn prepare(&mut self) -> Result<()> {
        let info = self.info_segment.read(self.image)?;
        let info_end = info.file_end().ok_or(Error::CapacityOverflow)?;
        if Self::align(info_end)? == u64::from(self.used_size) {
            let start = Self::align(info.fileoff)?;
            self.used_size = u32::try_from(start).map_err(|_| Error::CapacityOverflow)?;
            debug!(used_size = format_args!("{start:#x}"), "truncated prelink info");
        }

        self.info_segment.update(self.image, |segment| {
            segment.vmaddr = 0;
            segment.vmsize = 0;
            segment.fileoff = 0;
            segment.filesize = 0;
        })?;
        self.info_section.update(self.image, |section| {
            section.addr = 0;
            section.size = 0;
            section.offset = 0;
        })?;

        let last_address = MachOView::new(self.image)?
            .last_address()
            .ok_or(Error::EmptyAddressSpace)?;
        self.last_address = Self::align(last_address)?;

        let text = self.text_segment.read(self.image)?;
        let text_end = Self::align(text.file_end().ok_or(Error::CapacityOverflow)?)?;
        if text_end != u64::from(self.used_size) {
            return Err(Error::TextNotAtTail {
                text_end,
                used_size: self.used_size,
            });
        }

        info!(
            used_size = format_args!("{:#x}", self.used_size),
            last_address = format_args!("{:#x}", self.last_address),
            "prepared prelinked image for injection"
        );
        Ok(())
    }

    /// Injects one kext.
    ///
    /// `info_plist` is the kext's Info.plist; `bundle_path` is recorded in it.
    /// With an executable, the executable is appended to the image, linked at
    /// the next load address, and the prelinked text grows by its footprint.
    ///
    /// Failures before the executable is linked leave every size and address
    /// untouched, so the call can be retried. If recording the kext fails
    /// after its executable has been committed, the context becomes
    /// [`Phase::Poisoned`] and must be discarded.
    pub fn inject_kext(
        &mut self,
        bundle_path: &str,
        info_plist: &[u8],
        executable: Option<KextExecutable<'_>>,
    ) -> Result<()> {
        self.expect_phase("inject_kext", Phase::Prepared)?;

        let staged = match executable {
            Some(executable) => Some(self.stage_executable(bundle_path, executable.bytes)?),
            None => None,
        };

        let mut doc = XmlDocument::parse(info_plist)?;
        let root = plist_root(&doc)
            .and_then(|root| cast(&doc, root, PlistType::Dict))
            .ok_or_else(|| Error::PlistStructure(format!("Info.plist of '{bundle_path}' is not a dictionary")))?;

        append_string(&mut doc, root, PRELINK_INFO_BUNDLE_PATH_KEY, bundle_path)?;
        if let (Some(executable), Some(staged)) = (executable, &staged) {
            append_string(&mut doc, root, PRELINK_INFO_EXECUTABLE_RELATIVE_PATH_KEY, executable.path)?;
            append_integer(&mut doc, root, PRELINK_INFO_EXECUTABLE_SOURCE_ADDR_KEY, self.last_address)?;
            append_integer(&mut doc, root, PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY, self.last_load_address)?;
            append_integer(&mut doc, root, PRELINK_INFO_KMOD_INFO_KEY, staged.kmod_address)?;
        }

        let kext = match &staged {
            Some(staged) => Some(self.link_executable(bundle_path, &mut doc, root, staged)?),
            None => None,
        };

        // Past this point an executable's footprint is already committed.
        let committed = kext.is_some();
        let result = self.record(&doc, kext);
        if let Err(ref e) = result {
            if committed {
                warn!(bundle = bundle_path, error = %e, "kext committed but not recorded");
                self.phase = Phase::Poisoned;
            }
            return result;
        }

        info!(
            bundle = bundle_path,
            executable = staged.is_some(),
            kexts = self.kext_count(),
            "injected kext"
        );
        Ok(())
    }

    /// Returns the end of an append of `size` bytes at the image tail.
    fn tail_end(&self, size: u32) -> Result<u32> {
        self.used_size
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or_else(|| {
                Error::buffer_too_small(u64::from(self.used_size) + u64::from(size), self.capacity.into())
            })
    }

    /// Copies an executable to the image tail and resolves its kmod_info.
    fn stage_executable(&mut self, bundle_path: &str, bytes: &[u8]) -> Result<StagedExecutable> {
        let size = u32::try_from(bytes.len()).map_err(|_| Error::CapacityOverflow)?;
        let aligned_size = align_size(size, PRELINKED_ALIGNMENT)?;
        let end = self.tail_end(aligned_size)?;

        let start = self.used_size as usize;
        let tail = &mut self.image[start..end as usize];
        tail[..bytes.len()].copy_from_slice(bytes);
        tail[bytes.len()..].fill(0);

        let view = MachOView::new(&self.image[start..start + bytes.len()])?;
        let kmod_address = find_kmod_address(&view, self.last_load_address, size).ok_or_else(|| {
            Error::KmodInfoUnresolved {
                bundle_path: bundle_path.to_string(),
            }
        })?;

        debug!(
            bundle = bundle_path,
            size = format_args!("{size:#x}"),
            kmod_address = format_args!("{kmod_address:#x}"),
            "staged kext executable"
        );

        Ok(StagedExecutable {
            size,
            aligned_size,
            kmod_address,
        })
    }

    /// Links a staged executable and commits its footprint.
    fn link_executable(
        &mut self,
        bundle_path: &str,
        doc: &mut XmlDocument,
        root: NodeId,
        staged: &StagedExecutable,
    ) -> Result<PrelinkedKext> {
        let start = self.used_size as usize;
        let available = self.capacity - self.used_size;

        let linked = {
            let view = MachOView::new(&self.image[start..start + staged.size as usize])?;
            let info = PlistDict::new(doc, root)
                .ok_or_else(|| Error::PlistStructure("Info.plist root is not a dictionary".to_string()))?;
            self.linker.link(LinkRequest {
                bundle_path,
                executable: &view,
                info,
                load_address: self.last_load_address,
                kmod_address: staged.kmod_address,
                available,
                registry: &self.registry,
                scratch: &mut self.scratch,
            })?
        };

        if linked.load_size > available {
            return Err(Error::Link {
                bundle_path: bundle_path.to_string(),
                reason: format!("linker used {:#x} bytes, {available:#x} available", linked.load_size),
            });
        }
        if linked.load_size < staged.aligned_size {
            warn!(
                bundle = bundle_path,
                load_size = format_args!("{:#x}", linked.load_size),
                "load size smaller than executable, using executable size"
            );
        }
        let load_size = linked.load_size.max(staged.aligned_size);

        append_integer(doc, root, PRELINK_INFO_EXECUTABLE_SIZE_KEY, load_size.into())?;

        let used_size = add_size(self.used_size, load_size)?;
        let last_address = self
            .last_address
            .checked_add(load_size.into())
            .ok_or(Error::CapacityOverflow)?;
        let last_load_address = self
            .last_load_address
            .checked_add(load_size.into())
            .ok_or(Error::CapacityOverflow)?;

        let mut text_segment = self.text_segment.read(self.image)?;
        text_segment.vmsize = text_segment
            .vmsize
            .checked_add(load_size.into())
            .ok_or(Error::CapacityOverflow)?;
        text_segment.filesize = text_segment
            .filesize
            .checked_add(load_size.into())
            .ok_or(Error::CapacityOverflow)?;
        let mut text_section = self.text_section.read(self.image)?;
        text_section.size = text_section
            .size
            .checked_add(load_size.into())
            .ok_or(Error::CapacityOverflow)?;

        self.image[start + staged.aligned_size as usize..used_size as usize].fill(0);
        self.text_segment.write(self.image, &text_segment)?;
        self.text_section.write(self.image, &text_section)?;
        self.used_size = used_size;
        self.last_address = last_address;
        self.last_load_address = last_load_address;

        debug!(
            bundle = bundle_path,
            load_size = format_args!("{load_size:#x}"),
            used_size = format_args!("{used_size:#x}"),
            "committed kext executable"
        );

        Ok(linked.kext)
    }

    /// Adds the kext's plist entry to the kext array and its descriptor to the
    /// registry.
    fn record(&mut self, doc: &XmlDocument, kext: Option<PrelinkedKext>) -> Result<()> {
        let fragment: Rc<str> = doc.export(plist_depth(doc))?.into();
        self.pool.insert(Rc::clone(&fragment)).map_err(|(_, e)| e)?;

        let kext_list = self.kext_list.ok_or(Error::Poisoned)?;
        self.document
            .as_mut()
            .ok_or(Error::Poisoned)?
            .append_verbatim(kext_list, "dict", fragment)?;

        if let Some(kext) = kext {
            self.registry.push(kext);
        }
        Ok(())
    }

    /// Writes the prelink info back to the image tail.
    pub fn inject_complete(&mut self) -> Result<()> {
        self.expect_phase("inject_complete", Phase::Prepared)?;

        let document = self.document.as_ref().ok_or(Error::Poisoned)?;
        let mut exported = document.export(0)?.into_bytes();
        exported
            .try_reserve_exact(1)
            .map_err(|e| Error::out_of_memory("exported plist", e))?;
        exported.push(0);

        let size = u32::try_from(exported.len()).map_err(|_| Error::CapacityOverflow)?;
        let aligned_size = align_size(size, PRELINKED_ALIGNMENT)?;
        let end = self.tail_end(aligned_size)?;
        let last_address = self
            .last_address
            .checked_add(aligned_size.into())
            .ok_or(Error::CapacityOverflow)?;

        let (offset, address) = (self.used_size, self.last_address);
        self.info_segment.update(self.image, |segment| {
            segment.vmaddr = address;
            segment.vmsize = size.into();
            segment.fileoff = offset.into();
            segment.filesize = size.into();
        })?;
        self.info_section.update(self.image, |section| {
            section.addr = address;
            section.size = size.into();
            section.offset = offset;
        })?;

        let tail = &mut self.image[offset as usize..end as usize];
        tail[..exported.len()].copy_from_slice(&exported);
        tail[exported.len()..].fill(0);

        self.used_size = end;
        self.last_address = last_address;
        self.phase = Phase::Completed;

        info!(
            info_size = format_args!("{size:#x}"),
            used_size = format_args!("{end:#x}"),
            kexts = self.kext_count(),
            "completed prelinked image"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::plist::value::{dict_get, string_value};
    use crate::prelinked::address::find_last_load_address;
    use crate::prelinked::link::LinkedKext;
    use crate::testutil::{KextBuilder, PrelinkedBuilder, TestImage, TEST_KEXT_INFO};

    const BUNDLE: &str = "/Library/Extensions/TestDriver.kext";
    const EXECUTABLE_PATH: &str = "Contents/MacOS/TestDriver";

    fn prepared(image: &mut TestImage) -> PrelinkedContext<'_> {
        let mut context = PrelinkedContext::new(&mut image.buffer, image.used).unwrap();
        context.inject_prepare().unwrap();
        context
    }

    fn executable(bytes: &[u8]) -> Option<KextExecutable<'_>> {
        Some(KextExecutable {
            path: EXECUTABLE_PATH,
            bytes,
        })
    }

    /// Returns the dictionary of the last kext array entry.
    fn last_entry<L: KextLinker>(context: &PrelinkedContext<'_, L>) -> (XmlDocument, NodeId) {
        // Round trip through text so verbatim fragments become real nodes.
        let text = context.document().unwrap().export(0).unwrap();
        let doc = XmlDocument::parse(text.as_bytes()).unwrap();
        let root = plist_root(&doc).unwrap();
        let list = dict_get(&doc, root, PRELINK_INFO_DICTIONARY_KEY).unwrap();
        let last = doc.child(list, doc.child_count(list) - 1).unwrap();
        (doc, last)
    }

    fn value(doc: &XmlDocument, dict: NodeId, key: &str) -> Option<String> {
        let node = dict_get(doc, dict, key)?;
        string_value(doc, node)
            .map(|s| s.into_owned())
            .or_else(|| doc.node(node).text().map(str::to_string))
    }

    #[test]
    fn test_prepare_truncates_prelink_info() {
        let mut image = PrelinkedBuilder::new().build();
        let context = prepared(&mut image);

        assert_eq!(context.phase(), Phase::Prepared);
        assert_eq!(context.used_size(), 0x2000);
        assert_eq!(context.last_address(), 0x180000);
        assert_eq!(context.last_load_address(), 0x180000);

        let view = MachOView::new(context.image()).unwrap();
        let info = view.segment(PRELINK_INFO_SEGMENT).unwrap();
        assert_eq!(info.command.vmaddr, 0);
        assert_eq!(info.command.filesize, 0);
        assert_eq!(info.sections[0].section.size, 0);
    }

    #[test]
    fn test_prepare_requires_text_at_tail() {
        let mut image = PrelinkedBuilder::new().info_offset(0x3000).build();
        let mut context = PrelinkedContext::new(&mut image.buffer, image.used).unwrap();

        let err = context.inject_prepare().unwrap_err();
        assert!(matches!(err, Error::TextNotAtTail { .. }));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(context.phase(), Phase::Poisoned);

        let err = context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), None).unwrap_err();
        assert!(matches!(err, Error::Poisoned));
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
    }

    #[test]
    fn test_phase_order() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = PrelinkedContext::new(&mut image.buffer, image.used).unwrap();

        let err = context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), None).unwrap_err();
        assert!(matches!(err, Error::PhaseViolation { .. }));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(context.inject_complete().is_err());

        context.inject_prepare().unwrap();
        assert!(context.inject_prepare().is_err());
        context.inject_complete().unwrap();
        assert_eq!(context.phase(), Phase::Completed);
        assert!(context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), None).is_err());
        assert!(context.inject_complete().is_err());
    }

    #[test]
    fn test_metadata_only_injection() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);

        context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), None).unwrap();

        assert_eq!(context.used_size(), 0x2000);
        assert_eq!(context.last_address(), 0x180000);
        assert_eq!(context.last_load_address(), 0x180000);
        assert_eq!(context.registry().len(), 1);
        assert_eq!(context.kext_count(), 2);
        assert_eq!(context.pool_len(), 1);

        let (doc, entry) = last_entry(&context);
        assert_eq!(value(&doc, entry, PRELINK_INFO_BUNDLE_PATH_KEY).as_deref(), Some(BUNDLE));
        assert_eq!(value(&doc, entry, "CFBundleIdentifier").as_deref(), Some("com.example.TestDriver"));
        assert!(dict_get(&doc, entry, PRELINK_INFO_EXECUTABLE_SOURCE_ADDR_KEY).is_none());
        assert!(dict_get(&doc, entry, PRELINK_INFO_EXECUTABLE_SIZE_KEY).is_none());
    }

    #[test]
    fn test_injected_plist_keeps_string_values() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);

        let info = "<plist version=\"1.0\">\n<dict>\n\t<key>CFBundleIdentifier</key>\n\t<string>com.example.Spacer</string>\n\
                    \t<key>Sep</key>\n\t<string> </string>\n\t<key>Note</key>\n\t<string><![CDATA[a<b]]></string>\n</dict>\n</plist>\n";
        context.inject_kext(BUNDLE, info.as_bytes(), None).unwrap();

        let exported = context.document().unwrap().export(0).unwrap();
        assert!(exported.contains("<key>Sep</key><string> </string>"));
        assert!(exported.contains("<key>Note</key><string>a&lt;b</string>"));

        let (doc, entry) = last_entry(&context);
        assert_eq!(value(&doc, entry, "Sep").as_deref(), Some(" "));
        assert_eq!(value(&doc, entry, "Note").as_deref(), Some("a<b"));
    }

    #[test]
    fn test_full_injection() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);
        let exe = KextBuilder::new().kmod_info_at(0x1000).import("_IOLog").build();
        assert_eq!(exe.len(), 0x2050);

        context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&exe)).unwrap();

        assert_eq!(context.used_size(), 0x5000);
        assert_eq!(context.last_address(), 0x183000);
        assert_eq!(context.last_load_address(), 0x183000);
        assert_eq!(context.kext_count(), 2);
        assert_eq!(context.registry().len(), 2);
        assert_eq!(context.pool_len(), 1);

        let (doc, entry) = last_entry(&context);
        assert_eq!(value(&doc, entry, PRELINK_INFO_BUNDLE_PATH_KEY).as_deref(), Some(BUNDLE));
        assert_eq!(
            value(&doc, entry, PRELINK_INFO_EXECUTABLE_RELATIVE_PATH_KEY).as_deref(),
            Some(EXECUTABLE_PATH)
        );
        assert_eq!(value(&doc, entry, PRELINK_INFO_EXECUTABLE_SOURCE_ADDR_KEY).as_deref(), Some("0x180000"));
        assert_eq!(value(&doc, entry, PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY).as_deref(), Some("0x180000"));
        assert_eq!(value(&doc, entry, PRELINK_INFO_KMOD_INFO_KEY).as_deref(), Some("0x181000"));
        assert_eq!(value(&doc, entry, PRELINK_INFO_EXECUTABLE_SIZE_KEY).as_deref(), Some("0x3000"));
        let size_node = dict_get(&doc, entry, PRELINK_INFO_EXECUTABLE_SIZE_KEY).unwrap();
        assert_eq!(doc.node(size_node).attribute("size"), Some("64"));

        let image = context.image();
        assert_eq!(&image[0x2000..0x4050], &exe[..]);
        assert!(image[0x4050..0x5000].iter().all(|&b| b == 0));

        let view = MachOView::new(image).unwrap();
        let text = view.segment(PRELINK_TEXT_SEGMENT).unwrap();
        assert_eq!(text.command.vmsize, 0x4000);
        assert_eq!(text.command.filesize, 0x4000);
        assert_eq!(text.sections[0].section.size, 0x4000);

        let kext = context.registry().iter().last().unwrap();
        assert_eq!(kext.identifier, "com.example.TestDriver");
        assert_eq!(kext.load_address, 0x180000);
        assert_eq!(kext.kmod_address, 0x181000);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut image = PrelinkedBuilder::new().capacity(0x4000).build();
        let mut context = prepared(&mut image);
        let exe = KextBuilder::new().kmod_info_at(0x1000).build();

        let err = context
            .inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&exe))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BufferTooSmall);
        assert_eq!(context.used_size(), 0x2000);
        assert_eq!(context.last_address(), 0x180000);
        assert_eq!(context.kext_count(), 1);
        assert_eq!(context.phase(), Phase::Prepared);
    }

    #[test]
    fn test_tail_overflow_is_buffer_too_small() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);
        let kext = KextBuilder::new().kmod_info_at(0x1000).build();

        context.used_size = u32::MAX - 0x800;
        let err = context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&kext)).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferTooSmall { needed, .. } if needed == u64::from(u32::MAX - 0x800) + 0x3000
        ));
        assert_eq!(err.kind(), ErrorKind::BufferTooSmall);

        let err = context.inject_complete().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BufferTooSmall);
        assert_eq!(context.used_size(), u32::MAX - 0x800);
    }

    #[test]
    fn test_kmod_resolution_failure() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);
        let exe = KextBuilder::new().kmod_info_at(0x9000).build();

        let err = context
            .inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&exe))
            .unwrap_err();
        assert!(matches!(err, Error::KmodInfoUnresolved { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert_eq!(context.used_size(), 0x2000);
        assert_eq!(context.last_address(), 0x180000);
        assert_eq!(context.last_load_address(), 0x180000);
        assert_eq!(context.kext_count(), 1);
        assert_eq!(context.registry().len(), 1);
        assert_eq!(context.pool_len(), 0);

        // The raw copy is overwritten by the next attempt.
        let exe = KextBuilder::new().kmod_info_at(0x1000).build();
        context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&exe)).unwrap();
        assert_eq!(context.used_size(), 0x5000);
    }

    #[test]
    fn test_invalid_info_plist() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);

        for info in ["<array/>", "<dict>", "plain text"] {
            let err = context.inject_kext(BUNDLE, info.as_bytes(), None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidImage, "{info}");
        }
        assert_eq!(context.kext_count(), 1);
        assert_eq!(context.phase(), Phase::Prepared);
    }

    #[test]
    fn test_link_failure_leaves_frontiers() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);
        let exe = KextBuilder::new().kmod_info_at(0x1000).import("_notInKernel").build();

        let err = context
            .inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&exe))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert_eq!(context.used_size(), 0x2000);
        assert_eq!(context.last_load_address(), 0x180000);
        assert_eq!(context.kext_count(), 1);
        assert_eq!(context.phase(), Phase::Prepared);
    }

    #[test]
    fn test_complete_round_trip() {
        let mut image = PrelinkedBuilder::new().build();
        let mut context = prepared(&mut image);

        let family = KextBuilder::new()
            .kmod_info_at(0x1000)
            .export("_familyHelper", 0x800)
            .import("_IOLog")
            .build();
        let family_info = "<plist version=\"1.0\"><dict>\
            <key>CFBundleIdentifier</key><string>com.example.Family</string>\
            <key>OSBundleLibraries</key><dict><key>com.apple.kpi.iokit</key><string>8.0</string></dict>\
            </dict></plist>";
        context
            .inject_kext("/Library/Extensions/Family.kext", family_info.as_bytes(), executable(&family))
            .unwrap();

        let client = KextBuilder::new()
            .kmod_info_at(0x1000)
            .import("_familyHelper")
            .build();
        let client_info = "<dict><key>CFBundleIdentifier</key><string>com.example.Client</string>\
            <key>OSBundleLibraries</key><dict><key>com.example.Family</key><string>1.0</string></dict></dict>";
        context
            .inject_kext("/Library/Extensions/Client.kext", client_info.as_bytes(), executable(&client))
            .unwrap();

        context
            .inject_kext("/Library/Extensions/Codeless.kext", TEST_KEXT_INFO.as_bytes(), None)
            .unwrap();

        assert_eq!(context.pool_len(), 3);
        assert_eq!(context.registry().len(), 3);
        let client_kext = context.registry().iter().last().unwrap();
        assert_eq!(client_kext.load_address, 0x183000);
        assert_eq!(client_kext.dependencies.len(), 1);

        context.inject_complete().unwrap();
        assert_eq!(context.last_address(), 0x187000);
        let used = context.used_size();
        assert_eq!(used, 0x9000);

        let view = MachOView::new(context.image()).unwrap();
        let info = view.section(PRELINK_INFO_SEGMENT, PRELINK_INFO_SECTION).unwrap();
        assert_eq!(info.section.addr, 0x186000);
        assert_eq!(info.section.offset, 0x8000);

        let start = info.section.offset as usize;
        let bytes = &context.image()[start..start + info.section.size as usize];
        assert_eq!(bytes.last(), Some(&0));
        let doc = XmlDocument::parse(bytes).unwrap();
        let root = plist_root(&doc).unwrap();
        let list = dict_get(&doc, root, PRELINK_INFO_DICTIONARY_KEY).unwrap();
        assert_eq!(doc.child_count(list), 4);

        let bundles: Vec<String> = (1..4)
            .map(|i| value(&doc, doc.child(list, i).unwrap(), PRELINK_INFO_BUNDLE_PATH_KEY).unwrap())
            .collect();
        assert_eq!(
            bundles,
            [
                "/Library/Extensions/Family.kext",
                "/Library/Extensions/Client.kext",
                "/Library/Extensions/Codeless.kext"
            ]
        );

        // The codeless kext is last and carries no load range.
        assert_eq!(find_last_load_address(&doc, list), None);

        assert_eq!(context.into_used_size(), used);
    }

    /// Reports a fixed load size for every executable.
    struct FixedSizeLinker(u32);

    impl KextLinker for FixedSizeLinker {
        fn cached_kernel(&mut self, _kernel: &MachOView<'_>) -> Result<PrelinkedKext> {
            Ok(PrelinkedKext {
                identifier: PRELINK_KERNEL_IDENTIFIER.to_string(),
                ..Default::default()
            })
        }

        fn link(&mut self, request: LinkRequest<'_, '_>) -> Result<LinkedKext> {
            request.scratch.get_or_insert_with(Vec::new).push(1);
            Ok(LinkedKext {
                kext: PrelinkedKext {
                    identifier: "fixed".to_string(),
                    load_address: request.load_address,
                    size: self.0.into(),
                    kmod_address: request.kmod_address,
                    ..Default::default()
                },
                load_size: self.0,
            })
        }
    }

    fn inject_with_fixed_size(load_size: u32) -> (u32, Option<String>, Result<()>) {
        let mut image = PrelinkedBuilder::new().build();
        image.buffer[0x4000..0x8000].fill(0xEE);
        let mut context =
            PrelinkedContext::with_linker(&mut image.buffer, image.used, FixedSizeLinker(load_size)).unwrap();
        context.inject_prepare().unwrap();

        let exe = KextBuilder::new().kmod_info_at(0x1000).build();
        let result = context.inject_kext(BUNDLE, TEST_KEXT_INFO.as_bytes(), executable(&exe));
        let size = result.as_ref().ok().and_then(|_| {
            let (doc, entry) = last_entry(&context);
            value(&doc, entry, PRELINK_INFO_EXECUTABLE_SIZE_KEY)
        });
        if result.is_ok() {
            let end = context.used_size() as usize;
            assert!(context.image()[0x4050..end].iter().all(|&b| b == 0));
        }
        (context.used_size(), size, result)
    }

    #[test]
    fn test_larger_load_size_wins() {
        let (used, size, result) = inject_with_fixed_size(0x5000);
        result.unwrap();
        assert_eq!(used, 0x7000);
        assert_eq!(size.as_deref(), Some("0x5000"));
    }

    #[test]
    fn test_smaller_load_size_is_raised() {
        let (used, size, result) = inject_with_fixed_size(0x1000);
        result.unwrap();
        assert_eq!(used, 0x5000);
        assert_eq!(size.as_deref(), Some("0x3000"));
    }

    #[test]
    fn test_load_size_beyond_capacity() {
        let (used, size, result) = inject_with_fixed_size(0x20000);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidImage);
        assert_eq!(used, 0x2000);
        assert_eq!(size, None);
    }
}
