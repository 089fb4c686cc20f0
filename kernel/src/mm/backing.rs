//! Region backing descriptors (§4.3): what a region's frames are sourced
//! from when a page fault resolves it.

use super::PhysicalAddress;

/// How a [`super::address_space::Region`]'s pages are populated on first
/// fault.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Zero-filled, allocated lazily from the frame allocator.
    Anonymous,
    /// Backed by a range of an ELF image already resident in memory.
    ElfImage {
        image_base: PhysicalAddress,
        file_offset: usize,
    },
    /// Direct 1:1 mapping onto a fixed physical range (device registers,
    /// framebuffers).
    PhysMap { phys_base: PhysicalAddress },
}
