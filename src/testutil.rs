//! Builders for synthetic Mach-O images used across the test suite.

use zerocopy::IntoBytes;

use crate::macho::*;
use crate::prelinked::constants::*;

const KEXT_TEXT_SIZE: u64 = 0x2000;
const KEXT_FILE_SIZE: usize = 0x2050;
const KEXT_VM_EXTENT: u64 = 0x3000;

/// Builds a minimal kext executable: `__TEXT`, `__LINKEDIT` and a symbol table.
pub struct KextBuilder {
    kmod_info: Option<u64>,
    imports: Vec<String>,
    exports: Vec<(String, u64)>,
}

impl KextBuilder {
    pub fn new() -> Self {
        Self {
            kmod_info: None,
            imports: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn kmod_info_at(mut self, value: u64) -> Self {
        self.kmod_info = Some(value);
        self
    }

    pub fn import(mut self, name: &str) -> Self {
        self.imports.push(name.to_string());
        self
    }

    pub fn export(mut self, name: &str, value: u64) -> Self {
        self.exports.push((name.to_string(), value));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut symbols: Vec<(String, u8, u64)> = Vec::new();
        if let Some(value) = self.kmod_info {
            symbols.push((KMOD_INFO_SYMBOL.to_string(), N_SECT | N_EXT, value));
        }
        for (name, value) in &self.exports {
            symbols.push((name.clone(), N_SECT | N_EXT, *value));
        }
        for name in &self.imports {
            symbols.push((name.clone(), N_UNDF | N_EXT, 0));
        }

        let (nlists, strings) = symbol_table(&symbols);
        let symoff = KEXT_TEXT_SIZE as usize;
        let stroff = symoff + nlists.len();
        let size = KEXT_FILE_SIZE.max(stroff + strings.len());

        let mut data = vec![0u8; size];

        let mut text = SegmentCommand64::default();
        text.set_name("__TEXT");
        text.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;
        text.vmsize = KEXT_TEXT_SIZE;
        text.filesize = KEXT_TEXT_SIZE;
        text.nsects = 1;
        text.maxprot = 7;
        text.initprot = 5;

        let mut text_section = Section64::default();
        text_section.set_name("__text");
        text_section.set_segment_name("__TEXT");
        text_section.addr = 0x400;
        text_section.size = KEXT_TEXT_SIZE - 0x400;
        text_section.offset = 0x400;

        let mut linkedit = SegmentCommand64::default();
        linkedit.set_name("__LINKEDIT");
        linkedit.vmaddr = KEXT_TEXT_SIZE;
        linkedit.vmsize = KEXT_VM_EXTENT - KEXT_TEXT_SIZE;
        linkedit.fileoff = KEXT_TEXT_SIZE;
        linkedit.filesize = (size as u64) - KEXT_TEXT_SIZE;
        linkedit.maxprot = 1;
        linkedit.initprot = 1;

        let symtab = SymtabCommand {
            symoff: symoff as u32,
            nsyms: symbols.len() as u32,
            stroff: stroff as u32,
            strsize: (size - stroff) as u32,
            ..Default::default()
        };

        let mut commands = Vec::new();
        commands.extend_from_slice(text.as_bytes());
        commands.extend_from_slice(text_section.as_bytes());
        commands.extend_from_slice(linkedit.as_bytes());
        commands.extend_from_slice(symtab.as_bytes());

        let header = MachHeader64 {
            filetype: MH_KEXT_BUNDLE,
            ncmds: 3,
            sizeofcmds: commands.len() as u32,
            ..Default::default()
        };

        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data[MachHeader64::SIZE..MachHeader64::SIZE + commands.len()].copy_from_slice(&commands);
        data[symoff..stroff].copy_from_slice(&nlists);
        data[stroff..stroff + strings.len()].copy_from_slice(&strings);
        data
    }
}

/// Builds an nlist array and string table for `(name, type, value)` triples.
fn symbol_table(symbols: &[(String, u8, u64)]) -> (Vec<u8>, Vec<u8>) {
    let mut nlists = Vec::new();
    let mut strings = vec![0u8];
    for (name, n_type, value) in symbols {
        let nlist = Nlist64 {
            n_strx: strings.len() as u32,
            n_type: *n_type,
            n_sect: if n_type & N_TYPE == N_SECT { 1 } else { 0 },
            n_desc: 0,
            n_value: *value,
        };
        nlists.extend_from_slice(nlist.as_bytes());
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);
    }
    (nlists, strings)
}

/// An existing kext entry whose load range is `[0x100000, 0x180000)`.
pub const KERNEL_KEXT_ENTRY: &str = "<dict><key>CFBundleIdentifier</key><string>com.apple.kpi.bsd</string>\
<key>_PrelinkExecutableLoadAddr</key><integer size=\"64\">0x100000</integer>\
<key>_PrelinkExecutableSize</key><integer size=\"64\">0x80000</integer></dict>";

/// Info.plist of an injected test kext.
pub const TEST_KEXT_INFO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>CFBundleIdentifier</key>
	<string>com.example.TestDriver</string>
	<key>CFBundleExecutable</key>
	<string>TestDriver</string>
	<key>OSBundleLibraries</key>
	<dict>
		<key>com.apple.kpi.iokit</key>
		<string>8.0</string>
	</dict>
</dict>
</plist>
"#;

/// A synthetic prelinked image and its meaningful length.
pub struct TestImage {
    pub buffer: Vec<u8>,
    pub used: usize,
}

/// Builds a prelinked image laid out as
/// `__TEXT | __PRELINK_TEXT | __PRELINK_INFO`, with the kernel symbol table
/// inside `__TEXT`.
pub struct PrelinkedBuilder {
    kexts: Vec<String>,
    info: Option<String>,
    omit_segment: Option<&'static str>,
    info_offset: u64,
    capacity: usize,
    kernel_symbols: Vec<(String, u64)>,
}

impl PrelinkedBuilder {
    pub fn new() -> Self {
        Self {
            kexts: vec![KERNEL_KEXT_ENTRY.to_string()],
            info: None,
            omit_segment: None,
            info_offset: 0x2000,
            capacity: 0x10000,
            kernel_symbols: vec![
                ("_IOLog".to_string(), 0x100400),
                ("_OSKextLog".to_string(), 0x100500),
            ],
        }
    }

    pub fn kexts(mut self, kexts: &[&str]) -> Self {
        self.kexts = kexts.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Replaces the whole prelink info plist.
    pub fn info(mut self, info: &str) -> Self {
        self.info = Some(info.to_string());
        self
    }

    pub fn without(mut self, segment: &'static str) -> Self {
        self.omit_segment = Some(segment);
        self
    }

    pub fn info_offset(mut self, offset: u64) -> Self {
        self.info_offset = offset;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn info_text(&self) -> String {
        self.info.clone().unwrap_or_else(|| {
            format!(
                "<dict><key>{PRELINK_INFO_DICTIONARY_KEY}</key><array>{}</array></dict>",
                self.kexts.concat()
            )
        })
    }

    pub fn build(self) -> TestImage {
        let mut info = self.info_text().into_bytes();
        info.push(0);
        let info_len = info.len() as u64;

        let symbols: Vec<(String, u8, u64)> = self
            .kernel_symbols
            .iter()
            .map(|(name, value)| (name.clone(), N_SECT | N_EXT, *value))
            .collect();
        let (nlists, strings) = symbol_table(&symbols);
        let symoff = 0x800usize;
        let stroff = symoff + nlists.len();

        let mut commands = Vec::new();
        let mut ncmds = 0;
        let mut segment = |name: &str, sect: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64| {
            if self.omit_segment == Some(name) {
                return;
            }
            let mut seg = SegmentCommand64::default();
            seg.set_name(name);
            seg.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;
            seg.vmaddr = vmaddr;
            seg.vmsize = vmsize;
            seg.fileoff = fileoff;
            seg.filesize = filesize;
            seg.nsects = 1;

            let mut section = Section64::default();
            section.set_name(sect);
            section.set_segment_name(name);
            section.addr = vmaddr;
            section.size = filesize;
            section.offset = fileoff as u32;

            commands.extend_from_slice(seg.as_bytes());
            commands.extend_from_slice(section.as_bytes());
            ncmds += 1;
        };

        segment("__TEXT", "__text", 0x100000, 0x1000, 0, 0x1000);
        segment(PRELINK_TEXT_SEGMENT, PRELINK_TEXT_SECTION, 0x17F000, 0x1000, 0x1000, 0x1000);
        segment(
            PRELINK_INFO_SEGMENT,
            PRELINK_INFO_SECTION,
            0x180000,
            (info_len + 0xFFF) & !0xFFF,
            self.info_offset,
            info_len,
        );

        let symtab = SymtabCommand {
            symoff: symoff as u32,
            nsyms: symbols.len() as u32,
            stroff: stroff as u32,
            strsize: strings.len() as u32,
            ..Default::default()
        };
        commands.extend_from_slice(symtab.as_bytes());
        ncmds += 1;

        let header = MachHeader64 {
            filetype: MH_EXECUTE,
            ncmds,
            sizeofcmds: commands.len() as u32,
            ..Default::default()
        };

        let used = self.info_offset as usize + info.len();
        let mut buffer = vec![0u8; self.capacity.max(used)];
        buffer[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        buffer[MachHeader64::SIZE..MachHeader64::SIZE + commands.len()].copy_from_slice(&commands);
        buffer[symoff..stroff].copy_from_slice(&nlists);
        buffer[stroff..stroff + strings.len()].copy_from_slice(&strings);
        buffer[self.info_offset as usize..used].copy_from_slice(&info);
        // Recognizable filler for the prelinked text region.
        buffer[0x1000..0x2000].fill(0xCC);

        TestImage { buffer, used }
    }
}
