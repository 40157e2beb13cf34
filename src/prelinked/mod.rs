//! Prelinked kernel editing.
//!
//! A prelinked kernel is a Mach-O image holding the kernel, the executables of
//! bundled kexts in `__PRELINK_TEXT`, and a plist in `__PRELINK_INFO`
//! describing every kext. [`PrelinkedContext`] appends new kexts to such an
//! image while keeping the segment table, the address frontiers and the plist
//! consistent.

pub mod address;
pub mod constants;
mod context;
mod inject;
pub mod kext;
pub mod link;
mod pool;
mod reserve;

pub use context::{Phase, PrelinkedContext};
pub use inject::KextExecutable;
pub use kext::{KextHandle, KextRegistry, KextSymbol, PrelinkedKext};
pub use link::{KextLinker, LinkRequest, LinkedKext, SymbolLinker};
pub use pool::DependencyPool;
pub use reserve::reserve_kext_size;
