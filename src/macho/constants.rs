//! Mach-O constants and flags used by prelinked kernels and kexts.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Kernel extension bundle
pub const MH_KEXT_BUNDLE: u32 = 0xB;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86_64 all
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;

// =============================================================================
// Load Commands
// =============================================================================

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// 64-bit segment of this file
pub const LC_SEGMENT_64: u32 = 0x19;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is the output of an incremental link
        const INCRLINK = 0x2;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The file has its dynamic undefined references prebound
        const PREBOUND = 0x10;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// Safe to divide up the sections into sub-sections via symbols for dead code stripping
        const SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
        /// The binary has no non-executable heap requirement override
        const NO_HEAP_EXECUTION = 0x1000000;
    }
}
