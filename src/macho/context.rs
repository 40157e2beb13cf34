//! Mach-O views for reading, and offset handles for rewriting, Mach-O images.
//!
//! A [`MachOView`] borrows the bytes it describes; nothing is copied. Segment and
//! section records that need to be rewritten in place are addressed through
//! [`SegmentRef`] and [`SectionRef`], which remember only where the record lives
//! and go through bounds-checked accessors for every read and write.

use std::collections::HashMap;

use zerocopy::{FromBytes, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::{c_str_at, read_u32_le_at};

// =============================================================================
// Record Handles
// =============================================================================

fn record_bytes(data: &[u8], offset: usize, size: usize) -> Result<&[u8]> {
    offset
        .checked_add(size)
        .and_then(|end| data.get(offset..end))
        .ok_or(Error::LoadCommandOverflow { offset })
}

fn record_bytes_mut(data: &mut [u8], offset: usize, size: usize) -> Result<&mut [u8]> {
    offset
        .checked_add(size)
        .and_then(|end| data.get_mut(offset..end))
        .ok_or(Error::LoadCommandOverflow { offset })
}

/// Location of a segment command inside an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRef {
    /// Offset of the segment command from the start of the image
    pub command_offset: usize,
}

impl SegmentRef {
    /// Reads the segment command from `data`.
    pub fn read(&self, data: &[u8]) -> Result<SegmentCommand64> {
        let bytes = record_bytes(data, self.command_offset, SegmentCommand64::SIZE)?;
        SegmentCommand64::read_from_bytes(bytes).map_err(|_| Error::LoadCommandOverflow {
            offset: self.command_offset,
        })
    }

    /// Writes the segment command back into `data`.
    pub fn write(&self, data: &mut [u8], command: &SegmentCommand64) -> Result<()> {
        record_bytes_mut(data, self.command_offset, SegmentCommand64::SIZE)?
            .copy_from_slice(command.as_bytes());
        Ok(())
    }

    /// Reads, modifies and writes back the segment command.
    pub fn update(&self, data: &mut [u8], f: impl FnOnce(&mut SegmentCommand64)) -> Result<()> {
        let mut command = self.read(data)?;
        f(&mut command);
        self.write(data, &command)
    }
}

/// Location of a section record inside an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    /// Offset of the section structure from the start of the image
    pub struct_offset: usize,
}

impl SectionRef {
    /// Reads the section record from `data`.
    pub fn read(&self, data: &[u8]) -> Result<Section64> {
        let bytes = record_bytes(data, self.struct_offset, Section64::SIZE)?;
        Section64::read_from_bytes(bytes).map_err(|_| Error::LoadCommandOverflow {
            offset: self.struct_offset,
        })
    }

    /// Writes the section record back into `data`.
    pub fn write(&self, data: &mut [u8], section: &Section64) -> Result<()> {
        record_bytes_mut(data, self.struct_offset, Section64::SIZE)?
            .copy_from_slice(section.as_bytes());
        Ok(())
    }

    /// Reads, modifies and writes back the section record.
    pub fn update(&self, data: &mut [u8], f: impl FnOnce(&mut Section64)) -> Result<()> {
        let mut section = self.read(data)?;
        f(&mut section);
        self.write(data, &section)
    }
}

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }

    /// Returns a handle for rewriting this segment command.
    pub fn handle(&self) -> SegmentRef {
        SegmentRef {
            command_offset: self.command_offset,
        }
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure
    pub section: Section64,
    /// Offset of the section structure in the file
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        self.section.name()
    }

    /// Returns a handle for rewriting this section record.
    pub fn handle(&self) -> SectionRef {
        SectionRef {
            struct_offset: self.struct_offset,
        }
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

// =============================================================================
// Mach-O View
// =============================================================================

/// Read-only view over a 64-bit Mach-O image.
///
/// The view parses the header and load commands once and then answers segment,
/// section and symbol queries against the borrowed bytes.
#[derive(Debug)]
pub struct MachOView<'a> {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
    data: &'a [u8],
    segment_indices: HashMap<String, usize>,
}

impl<'a> MachOView<'a> {
    /// Parses the header and load commands of `data`.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::InvalidMachoMagic(read_u32_le_at(data, 0).unwrap_or(0)))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut view = Self {
            header,
            load_commands: Vec::new(),
            data,
            segment_indices: HashMap::new(),
        };

        view.parse_load_commands()?;

        Ok(view)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_bytes(record_bytes(
                self.data,
                offset,
                LoadCommand::SIZE,
            )?)
            .map_err(|_| Error::LoadCommandOverflow { offset })?;

            if (lc.cmdsize as usize) < LoadCommand::SIZE
                || offset + lc.cmdsize as usize > end_offset
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = record_bytes(self.data, offset, lc.cmdsize as usize)?;
            let cmd_info = self.parse_load_command(lc, cmd_data, offset)?;

            if let LoadCommandInfo::Segment(ref seg) = cmd_info {
                self.segment_indices
                    .entry(seg.name().to_string())
                    .or_insert(self.load_commands.len());
            }

            self.load_commands.push(cmd_info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(
        &self,
        lc: LoadCommand,
        data: &[u8],
        offset: usize,
    ) -> Result<LoadCommandInfo> {
        match lc.cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0;

                let needed = SegmentCommand64::SIZE + seg.nsects as usize * Section64::SIZE;
                if needed > data.len() {
                    return Err(Error::LoadCommandOverflow { offset });
                }

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut sect_offset = SegmentCommand64::SIZE;

                for _ in 0..seg.nsects {
                    let sect = Section64::read_from_prefix(&data[sect_offset..])
                        .map_err(|_| Error::LoadCommandOverflow {
                            offset: offset + sect_offset,
                        })?
                        .0;

                    sections.push(SectionInfo {
                        section: sect,
                        struct_offset: offset + sect_offset,
                    });

                    sect_offset += Section64::SIZE;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SYMTAB => {
                let symtab = SymtabCommand::read_from_prefix(data)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0;

                Ok(LoadCommandInfo::Symtab {
                    command: symtab,
                    offset,
                })
            }

            cmd => Ok(LoadCommandInfo::Unknown {
                cmd,
                cmdsize: lc.cmdsize,
                offset,
            }),
        }
    }

    /// Returns a reference to a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&SectionInfo> {
        self.segment(segment)?.section(section)
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Symtab { command, .. } = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns the highest virtual address occupied by any segment.
    ///
    /// Returns `None` when no segment occupies address space or the end of a
    /// segment overflows.
    pub fn last_address(&self) -> Option<u64> {
        let mut last = 0u64;
        for seg in self.segments() {
            last = last.max(seg.command.vm_end()?);
        }
        (last != 0).then_some(last)
    }

    /// Returns the number of entries in the symbol table.
    pub fn symbol_count(&self) -> u32 {
        self.symtab().map_or(0, |symtab| symtab.nsyms)
    }

    /// Returns the symbol at `index`, or `None` past the end of a well-formed table.
    pub fn symbol_by_index(&self, index: u32) -> Option<Nlist64> {
        let symtab = self.symtab()?;
        if index >= symtab.nsyms {
            return None;
        }
        let offset = (symtab.symoff as usize).checked_add(index as usize * Nlist64::SIZE)?;
        let bytes = record_bytes(self.data, offset, Nlist64::SIZE).ok()?;
        Nlist64::read_from_bytes(bytes).ok()
    }

    /// Returns an iterator over all readable symbols.
    pub fn symbols(&self) -> impl Iterator<Item = Nlist64> + '_ {
        (0..self.symbol_count()).map_while(|index| self.symbol_by_index(index))
    }

    /// Returns the name of a symbol from the string table.
    pub fn symbol_name(&self, symbol: &Nlist64) -> Option<&'a str> {
        let symtab = self.symtab()?;
        if symbol.n_strx >= symtab.strsize {
            return None;
        }
        let strtab_end = (symtab.stroff as usize).checked_add(symtab.strsize as usize)?;
        let strtab = self.data.get(symtab.stroff as usize..strtab_end)?;
        c_str_at(strtab, symbol.n_strx as usize)
    }

    /// Finds the first symbol with exactly the given name.
    pub fn find_symbol(&self, name: &str) -> Option<Nlist64> {
        self.symbols()
            .find(|symbol| self.symbol_name(symbol) == Some(name))
    }

    /// Returns true if the symbol's value lies within the image.
    ///
    /// Section-defined symbols must point into one of the image's segments;
    /// other symbol kinds carry no address and are always in range.
    pub fn is_symbol_value_in_range(&self, symbol: &Nlist64) -> bool {
        if !symbol.is_section_defined() {
            return true;
        }
        self.segments()
            .any(|seg| seg.command.contains_addr(symbol.n_value))
    }

    /// Returns the raw data.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}
