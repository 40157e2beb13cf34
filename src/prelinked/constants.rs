//! Layout constants and plist keys of prelinked kernel images.

/// Alignment unit for every region appended to the image.
pub const PRELINKED_ALIGNMENT: u32 = 0x1000;

/// Segment holding the serialized prelink info plist.
pub const PRELINK_INFO_SEGMENT: &str = "__PRELINK_INFO";
/// Section holding the serialized prelink info plist.
pub const PRELINK_INFO_SECTION: &str = "__info";
/// Segment holding prelinked kext executables.
pub const PRELINK_TEXT_SEGMENT: &str = "__PRELINK_TEXT";
/// Section holding prelinked kext executables.
pub const PRELINK_TEXT_SECTION: &str = "__text";

/// Root dictionary key holding the kext array.
pub const PRELINK_INFO_DICTIONARY_KEY: &str = "_PrelinkInfoDictionary";
/// Bundle path of a kext.
pub const PRELINK_INFO_BUNDLE_PATH_KEY: &str = "_PrelinkBundlePath";
/// Executable path relative to the bundle.
pub const PRELINK_INFO_EXECUTABLE_RELATIVE_PATH_KEY: &str = "_PrelinkExecutableRelativePath";
/// Address of the executable bytes inside the image.
pub const PRELINK_INFO_EXECUTABLE_SOURCE_ADDR_KEY: &str = "_PrelinkExecutableSourceAddr";
/// Address the executable is mapped at for execution.
pub const PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY: &str = "_PrelinkExecutableLoadAddr";
/// Footprint of the executable.
pub const PRELINK_INFO_EXECUTABLE_SIZE_KEY: &str = "_PrelinkExecutableSize";
/// Runtime address of the kext's kmod_info structure.
pub const PRELINK_INFO_KMOD_INFO_KEY: &str = "_PrelinkKmodInfo";
/// Attributes carried by every integer written into the prelink info.
pub const PRELINK_INFO_INTEGER_ATTRIBUTES: &str = "size=\"64\"";

/// Identifier of the kernel pseudo-kext at the root of the registry.
pub const PRELINK_KERNEL_IDENTIFIER: &str = "__kernel__";

/// Symbol exported by every kext executable describing the module.
pub const KMOD_INFO_SYMBOL: &str = "_kmod_info";
/// Size of the 64-bit version 1 kmod_info structure (4-byte packed).
pub const KMOD_INFO_64_V1_SIZE: u64 = 196;

/// Headroom reserved per kext for the keys injection adds to its Info.plist.
pub const PLIST_RESERVE_SLACK: u32 = 512;
/// Headroom reserved per kext for link-time bookkeeping such as `__LINKEDIT`.
pub const EXECUTABLE_RESERVE_SLACK: u32 = 2 * 4096;
