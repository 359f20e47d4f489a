// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physically contiguous memory for decoder buffers.
//!
//! Both queues of the decoder are backed by a single allocation each, which is shared with the
//! device through a file descriptor and mapped into our address space so that bitstream units can
//! be written into it and decoded frames read out of it.

use std::ffi::c_void;
use std::ffi::CStr;
use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::unistd::ftruncate;
use thiserror::Error;

use crate::utils::retry_on_interrupt;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("cannot allocate an empty buffer")]
    EmptyAllocation,
    #[error("failed to open allocator device {0}: {1}")]
    OpenDevice(String, std::io::Error),
    #[error("failed to allocate {size} bytes: {errno}")]
    Allocate { size: usize, errno: Errno },
    #[error("failed to export allocation as a file descriptor: {0}")]
    Export(Errno),
    #[error("failed to map {size} bytes: {errno}")]
    Map { size: usize, errno: Errno },
}

/// A block of memory that can be shared with the decoder device.
///
/// Dropping it closes the last reference we hold on the memory.
#[derive(Debug)]
pub struct PhysicalBuffer {
    fd: OwnedFd,
    size: usize,
}

impl PhysicalBuffer {
    pub fn new(fd: OwnedFd, size: usize) -> Self {
        Self { fd, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Maps the whole buffer into our address space.
    pub fn map(self, prot: ProtFlags) -> Result<MappedRegion, AllocationError> {
        let len = NonZeroUsize::new(self.size).ok_or(AllocationError::EmptyAllocation)?;

        // SAFETY: we are not mapping at a fixed address, and `self.fd` is a valid file descriptor
        // to an object at least `len` bytes long.
        let addr = retry_on_interrupt(|| unsafe {
            mmap(None, len, prot, MapFlags::MAP_SHARED, &self.fd, 0)
        })
        .map_err(|errno| AllocationError::Map { size: self.size, errno })?;

        Ok(MappedRegion { buffer: self, addr, writable: prot.contains(ProtFlags::PROT_WRITE) })
    }
}

impl AsFd for PhysicalBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A [`PhysicalBuffer`] mapped into our address space.
///
/// The mapping is removed and the memory released when the region is dropped.
#[derive(Debug)]
pub struct MappedRegion {
    buffer: PhysicalBuffer,
    addr: NonNull<c_void>,
    writable: bool,
}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.buffer.size
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.size == 0
    }

    /// File descriptor handed to the device to identify the memory.
    pub fn raw_fd(&self) -> RawFd {
        self.buffer.fd.as_raw_fd()
    }

    /// Address of the start of the mapping.
    pub fn addr(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    /// Returns `len` bytes of the mapping starting at `offset`, or `None` if the range does not
    /// fit.
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }

        // SAFETY: the range was checked against the mapping length above and the mapping lives as
        // long as `self`.
        Some(unsafe {
            std::slice::from_raw_parts((self.addr.as_ptr() as *const u8).add(offset), len)
        })
    }

    /// Mutable counterpart of [`MappedRegion::slice`]. Returns `None` for read-only mappings.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        if !self.writable {
            return None;
        }
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }

        // SAFETY: the range was checked against the mapping length above, the mapping is writable
        // and `&mut self` guarantees exclusive access.
        Some(unsafe {
            std::slice::from_raw_parts_mut((self.addr.as_ptr() as *mut u8).add(offset), len)
        })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: `addr` and the buffer size describe exactly the mapping created in
        // `PhysicalBuffer::map`, and no slice into it can outlive `self`.
        if let Err(e) = unsafe { munmap(self.addr, self.buffer.size) } {
            log::error!("failed to unmap {} bytes: {}", self.buffer.size, e);
        }
    }
}

/// Source of memory for the buffer pool.
pub trait PhysicalAllocator {
    /// Allocates a buffer of at least `size` bytes.
    fn allocate(&self, size: usize) -> Result<PhysicalBuffer, AllocationError>;

    /// Gives the memory back. Dropping the buffer has the same effect.
    fn release(&self, buffer: PhysicalBuffer) {
        log::trace!("releasing {} bytes", buffer.size());
        drop(buffer);
    }
}

/// Allocator backed by anonymous memory files.
///
/// The returned descriptors can be passed around like dma-bufs, which makes this allocator usable
/// for tests and for decoders that do not need physically contiguous memory.
#[derive(Debug, Default)]
pub struct MemfdAllocator;

impl PhysicalAllocator for MemfdAllocator {
    fn allocate(&self, size: usize) -> Result<PhysicalBuffer, AllocationError> {
        if size == 0 {
            return Err(AllocationError::EmptyAllocation);
        }

        const NAME: &CStr = c"vidc-decode";
        let fd = memfd_create(NAME, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|errno| AllocationError::Allocate { size, errno })?;
        retry_on_interrupt(|| ftruncate(&fd, size as i64))
            .map_err(|errno| AllocationError::Allocate { size, errno })?;

        Ok(PhysicalBuffer::new(fd, size))
    }
}

type IonUserHandle = i32;

#[repr(C)]
#[derive(Debug, Default)]
struct IonAllocationData {
    len: usize,
    align: usize,
    heap_id_mask: u32,
    flags: u32,
    handle: IonUserHandle,
}

#[repr(C)]
#[derive(Debug, Default)]
struct IonFdData {
    handle: IonUserHandle,
    fd: i32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct IonHandleData {
    handle: IonUserHandle,
}

const ION_IOC_MAGIC: u8 = b'I';
nix::ioctl_readwrite!(ion_ioc_alloc, ION_IOC_MAGIC, 0, IonAllocationData);
nix::ioctl_readwrite!(ion_ioc_free, ION_IOC_MAGIC, 1, IonHandleData);
nix::ioctl_readwrite!(ion_ioc_map, ION_IOC_MAGIC, 2, IonFdData);

/// Heap the video firmware can address through its IOMMU.
pub const ION_IOMMU_HEAP_ID: u32 = 25;
const ION_ALIGNMENT: usize = 4096;

/// Allocator for the legacy ION interface of Qualcomm kernels.
pub struct IonAllocator {
    ion: File,
    heap_id_mask: u32,
}

impl IonAllocator {
    pub const DEFAULT_PATH: &'static str = "/dev/ion";

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AllocationError> {
        Self::open_with_heap(path, ION_IOMMU_HEAP_ID)
    }

    pub fn open_with_heap<P: AsRef<Path>>(path: P, heap_id: u32) -> Result<Self, AllocationError> {
        let path = path.as_ref();
        let ion = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| AllocationError::OpenDevice(path.display().to_string(), e))?;

        Ok(Self { ion, heap_id_mask: 1 << heap_id })
    }
}

impl PhysicalAllocator for IonAllocator {
    fn allocate(&self, size: usize) -> Result<PhysicalBuffer, AllocationError> {
        if size == 0 {
            return Err(AllocationError::EmptyAllocation);
        }

        let mut alloc = IonAllocationData {
            len: size,
            align: ION_ALIGNMENT,
            heap_id_mask: self.heap_id_mask,
            flags: 0,
            handle: -1,
        };
        // SAFETY: `self.ion` is an open ION device and `alloc` is a properly initialized
        // `ion_allocation_data`.
        retry_on_interrupt(|| unsafe { ion_ioc_alloc(self.ion.as_raw_fd(), &mut alloc) })
            .map_err(|errno| AllocationError::Allocate { size, errno })?;

        log::debug!("ION: allocated {} bytes, handle {}", alloc.len, alloc.handle);

        let mut fd_data = IonFdData { handle: alloc.handle, fd: -1 };
        // SAFETY: `fd_data.handle` was returned by the allocation above.
        let map_res =
            retry_on_interrupt(|| unsafe { ion_ioc_map(self.ion.as_raw_fd(), &mut fd_data) });

        // The exported fd keeps the memory alive on its own, so the handle can go in all cases.
        let mut handle_data = IonHandleData { handle: alloc.handle };
        // SAFETY: `handle_data.handle` was returned by the allocation above.
        if let Err(e) =
            retry_on_interrupt(|| unsafe { ion_ioc_free(self.ion.as_raw_fd(), &mut handle_data) })
        {
            log::error!("ION: failed to free handle {}: {}", alloc.handle, e);
        }

        map_res.map_err(AllocationError::Export)?;
        if fd_data.fd < 0 {
            return Err(AllocationError::Export(Errno::EBADF));
        }

        // SAFETY: ION_IOC_MAP returned a new file descriptor that nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd_data.fd) };

        Ok(PhysicalBuffer::new(fd, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfd_allocate_and_map() {
        let allocator = MemfdAllocator;
        let buffer = allocator.allocate(8192).unwrap();
        assert_eq!(buffer.size(), 8192);

        let mut region = buffer.map(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).unwrap();
        assert_eq!(region.len(), 8192);
        assert!(region.raw_fd() >= 0);

        region.slice_mut(4096, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(region.slice(4096, 4).unwrap(), &[1, 2, 3, 4]);
        assert!(region.slice(8190, 4).is_none());
        assert!(region.slice(usize::MAX, 2).is_none());
    }

    #[test]
    fn read_only_mapping_is_not_writable() {
        let allocator = MemfdAllocator;
        let mut region = allocator.allocate(4096).unwrap().map(ProtFlags::PROT_READ).unwrap();
        assert!(region.slice_mut(0, 1).is_none());
        assert_eq!(region.slice(0, 4).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn empty_allocation_fails() {
        assert!(matches!(MemfdAllocator.allocate(0), Err(AllocationError::EmptyAllocation)));
    }
}
