//! Guest physical memory for the bootstrap VM.
//!
//! One contiguous region backed by an anonymous shared mapping, starting
//! at a caller-chosen guest physical base. The hypervisor's only
//! involvement with it is the registration call: after that, guest
//! accesses are backed transparently by host RAM through the mapping.
//!
//! The size invariant (positive multiple of the host page size) is
//! checked before anything is allocated, so an invalid size can never
//! leave a half-built region behind.

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use log::info;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Errors from allocating, loading, or registering guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The requested size is zero or not a multiple of the host page size.
    #[error(
        "Invalid guest memory size {size:#x}: must be a positive multiple of \
         the host page size ({page_size})"
    )]
    InvalidSize {
        /// Requested size in bytes.
        size: usize,
        /// Host page size in bytes.
        page_size: usize,
    },

    /// The backing mmap allocation failed.
    #[error("Failed to allocate {size} bytes of guest memory")]
    Create {
        /// Requested allocation size.
        size: usize,
    },

    /// The guest program does not fit in the region.
    #[error("Guest program of {len} bytes exceeds the {size} byte region")]
    PayloadTooLarge {
        /// Program length in bytes.
        len: usize,
        /// Region size in bytes.
        size: usize,
    },

    /// A write into the region failed.
    #[error("Failed to write {len} bytes to guest memory at {address:#x}")]
    Write {
        /// Guest physical address of the failed write.
        address: u64,
        /// Length of the failed write.
        len: usize,
    },

    /// The slot already backs a region on this VM.
    #[error("Memory slot {slot} is already registered with the VM")]
    SlotInUse {
        /// The contested slot number.
        slot: u32,
    },

    /// KVM rejected the region registration.
    #[error("Failed to register guest memory with the VM: {0}")]
    Register(#[source] kvm_ioctls::Error),

    /// The host virtual address of the region could not be resolved.
    #[error("Failed to resolve host virtual address for guest memory")]
    HostAddress,
}

/// Host page size in bytes.
pub fn host_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A single host-backed guest memory region and its slot bookkeeping.
///
/// The backing mapping must stay valid for the whole lifetime of the VM
/// it is registered with; the VM owner guarantees that by dropping the
/// region only after the vCPU has been released.
#[derive(Debug)]
pub struct GuestRam {
    memory: GuestMemoryMmap,
    size: usize,
    registered_slots: Vec<u32>,
}

impl GuestRam {
    /// Allocate `size` bytes of zero-initialised guest memory.
    ///
    /// `size` must be a positive multiple of the host page size; the
    /// check runs before allocation so failure never allocates anything.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        let page_size = host_page_size();
        if size == 0 || size % page_size != 0 {
            return Err(MemoryError::InvalidSize { size, page_size });
        }

        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)])
            .map_err(|_| MemoryError::Create { size })?;

        info!("Guest memory allocated: {} bytes", size);

        Ok(Self {
            memory,
            size,
            registered_slots: Vec::new(),
        })
    }

    /// Copy a guest program to the start of the region.
    pub fn load(&self, program: &[u8]) -> Result<(), MemoryError> {
        if program.len() > self.size {
            return Err(MemoryError::PayloadTooLarge {
                len: program.len(),
                size: self.size,
            });
        }

        self.memory
            .write_slice(program, GuestAddress(0))
            .map_err(|_| MemoryError::Write {
                address: 0,
                len: program.len(),
            })?;

        info!("Guest program loaded: {} bytes at offset 0", program.len());

        Ok(())
    }

    /// Register the region with `vm` at `slot`, based at guest physical
    /// `guest_base`.
    ///
    /// Each slot backs at most one region for the lifetime of the VM;
    /// redefining or removing a slot is not supported, so a second claim
    /// of the same slot is an error.
    pub fn register(&mut self, vm: &VmFd, slot: u32, guest_base: u64) -> Result<(), MemoryError> {
        if self.registered_slots.contains(&slot) {
            return Err(MemoryError::SlotInUse { slot });
        }

        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_base,
            memory_size: self.size as u64,
            userspace_addr: self.host_address()?,
            flags: 0,
        };

        // The mapping must outlive every run of the VM this is handed to.
        unsafe {
            vm.set_user_memory_region(region)
                .map_err(MemoryError::Register)?;
        }
        self.registered_slots.push(slot);

        info!(
            "Guest memory registered: slot {}, guest physical {:#x}, {} bytes",
            slot, guest_base, self.size,
        );

        Ok(())
    }

    /// Host virtual address of the start of the region, as needed for the
    /// `userspace_addr` field of the registration record.
    pub fn host_address(&self) -> Result<u64, MemoryError> {
        self.memory
            .get_host_address(GuestAddress(0))
            .map(|p| p as u64)
            .map_err(|_| MemoryError::HostAddress)
    }

    /// The underlying mapping, for direct reads and writes.
    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Region size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}
