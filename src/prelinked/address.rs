//! Address frontier helpers.
//!
//! These compute where the next injected kext will be mapped, and where a kext
//! executable's `kmod_info` structure will live once it is mapped there.

use tracing::debug;

use super::constants::*;
use crate::macho::MachOView;
use crate::plist::value::{dict_entries, integer_value, PlistDict};
use crate::plist::{NodeId, XmlDocument};

/// Returns the first load address past the last kext in `kext_list`.
///
/// Only the last array entry is inspected; entries are assumed to be sorted by
/// load address. A missing load address or size counts as zero. Returns `None`
/// when the array is empty, the last entry is not a dictionary, the sum
/// overflows, or the resulting address is zero.
pub fn find_last_load_address(doc: &XmlDocument, kext_list: NodeId) -> Option<u64> {
    let count = doc.child_count(kext_list);
    let last = doc.child(kext_list, count.checked_sub(1)?)?;
    let entry = PlistDict::new(doc, last)?;

    let mut load_address = None;
    let mut load_size = None;
    for (key, value) in dict_entries(doc, entry.node()) {
        match key {
            Some(PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY) if load_address.is_none() => {
                load_address = Some(integer_value(doc, value)?);
            }
            Some(PRELINK_INFO_EXECUTABLE_SIZE_KEY) if load_size.is_none() => {
                load_size = Some(integer_value(doc, value)?);
            }
            _ => {}
        }
    }

    let last_load_address = load_address
        .unwrap_or(0)
        .checked_add(load_size.unwrap_or(0))?;
    (last_load_address != 0).then_some(last_load_address)
}

/// Resolves the runtime address of `_kmod_info` for an executable that will be
/// mapped at `load_address` and occupy `size` bytes.
pub fn find_kmod_address(executable: &MachOView<'_>, load_address: u64, size: u32) -> Option<u64> {
    let Some(symbol) = executable.find_symbol(KMOD_INFO_SYMBOL) else {
        debug!("{} not found", KMOD_INFO_SYMBOL);
        return None;
    };
    if !executable.is_symbol_value_in_range(&symbol) {
        debug!(
            value = format_args!("{:#x}", symbol.n_value),
            "{} lies outside the executable", KMOD_INFO_SYMBOL
        );
        return None;
    }

    let text = &executable.segment("__TEXT")?.command;
    if text.fileoff > text.vmaddr {
        debug!(
            vmaddr = format_args!("{:#x}", text.vmaddr),
            fileoff = format_args!("{:#x}", text.fileoff),
            "__TEXT file offset exceeds its address"
        );
        return None;
    }

    let address = (text.vmaddr - text.fileoff)
        .checked_add(load_address)?
        .checked_add(symbol.n_value)?;
    let limit = load_address
        .checked_add(u64::from(size))?
        .checked_sub(KMOD_INFO_64_V1_SIZE)?;
    if address > limit {
        debug!(
            address = format_args!("{address:#x}"),
            limit = format_args!("{limit:#x}"),
            "{} does not fit in the executable", KMOD_INFO_SYMBOL
        );
        return None;
    }

    Some(address)
}
