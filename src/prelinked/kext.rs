//! Descriptors of kexts present in a prelinked image.

use std::fmt;

/// A symbol a kext makes available to kexts linked against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KextSymbol {
    /// Symbol name, including the leading underscore
    pub name: String,
    /// Runtime address
    pub address: u64,
}

/// Index of a kext inside a [`KextRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KextHandle(usize);

impl KextHandle {
    /// The kernel pseudo-kext, always the first registry entry.
    pub const KERNEL: KextHandle = KextHandle(0);

    /// Returns the registry index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A kext that has been linked into the image.
#[derive(Debug, Clone, Default)]
pub struct PrelinkedKext {
    /// Bundle identifier
    pub identifier: String,
    /// Address the executable is mapped at
    pub load_address: u64,
    /// Footprint of the executable in bytes
    pub size: u64,
    /// Runtime address of the kext's kmod_info, zero for the kernel
    pub kmod_address: u64,
    /// Exported symbols, relocated to `load_address`
    pub symbols: Vec<KextSymbol>,
    /// Kexts this kext was linked against
    pub dependencies: Vec<KextHandle>,
}

impl PrelinkedKext {
    /// Finds an exported symbol by name.
    pub fn symbol(&self, name: &str) -> Option<&KextSymbol> {
        self.symbols.iter().find(|symbol| symbol.name == name)
    }
}

impl fmt::Display for PrelinkedKext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Kext {{ id: \"{}\", load: {:#x}+{:#x}, kmod: {:#x}, symbols: {}, deps: {} }}",
            self.identifier,
            self.load_address,
            self.size,
            self.kmod_address,
            self.symbols.len(),
            self.dependencies.len()
        )
    }
}

/// Ordered collection of every kext the context knows about.
///
/// Entries are only ever appended; a [`KextHandle`] stays valid for the
/// lifetime of the registry.
#[derive(Debug, Default)]
pub struct KextRegistry {
    kexts: Vec<PrelinkedKext>,
}

impl KextRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a kext and returns its handle.
    pub fn push(&mut self, kext: PrelinkedKext) -> KextHandle {
        let handle = KextHandle(self.kexts.len());
        self.kexts.push(kext);
        handle
    }

    /// Returns the kext behind `handle`.
    pub fn get(&self, handle: KextHandle) -> Option<&PrelinkedKext> {
        self.kexts.get(handle.0)
    }

    /// Finds a kext by bundle identifier.
    pub fn find_by_identifier(&self, identifier: &str) -> Option<KextHandle> {
        self.kexts
            .iter()
            .position(|kext| kext.identifier == identifier)
            .map(KextHandle)
    }

    /// Looks up `name` in the exports of the given kexts, in order.
    pub fn resolve_symbol(&self, name: &str, scope: &[KextHandle]) -> Option<u64> {
        scope
            .iter()
            .filter_map(|&handle| self.get(handle))
            .find_map(|kext| kext.symbol(name))
            .map(|symbol| symbol.address)
    }

    /// Returns the number of kexts, including the kernel.
    pub fn len(&self) -> usize {
        self.kexts.len()
    }

    /// Returns true if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.kexts.is_empty()
    }

    /// Iterates over the kexts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PrelinkedKext> {
        self.kexts.iter()
    }

    /// Drops every kext.
    pub fn clear(&mut self) {
        self.kexts = Vec::new();
    }
}
