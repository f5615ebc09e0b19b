//! DMA-capable memory for the frame ring buffer.
//!
//! The card writes frames by bus-master DMA into a physically contiguous
//! region of host memory. In a deployed system that region is provided by a
//! `u-dma-buf` device, which allocates the memory in the kernel and lets
//! userspace map it and read its bus address ([`UdmaBuffer`]). For simulated
//! cards an ordinary page-aligned heap allocation is used ([`HostBuffer`]).

use anyhow::{Context, Result};
use std::alloc::Layout;
use std::os::unix::io::AsRawFd;
use tokio::fs;

/// A region of memory that the card can write frames into.
///
/// The region stays at a fixed address for as long as the object is alive.
pub trait DmaRegion: Send + Sync + std::fmt::Debug {
    /// Gives a pointer to the beginning of the region.
    fn as_ptr(&self) -> *mut u8;

    /// Gives the size of the region in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if the region has zero size.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gives the address of the region as seen by the card.
    fn bus_addr(&self) -> u64;
}

/// DMA buffer provided by a `u-dma-buf` device.
///
/// The device file is opened with `O_SYNC`, which makes `u-dma-buf` map the
/// buffer uncached, so frames written by the card are visible to the CPU
/// without explicit cache maintenance.
#[derive(Debug)]
pub struct UdmaBuffer {
    _file: fs::File,
    buffer: *mut libc::c_void,
    size: usize,
    phys_addr: u64,
}

// The mapping is owned by this struct and is only unmapped on drop.
unsafe impl Send for UdmaBuffer {}
unsafe impl Sync for UdmaBuffer {}

impl UdmaBuffer {
    /// Opens a `u-dma-buf` device.
    ///
    /// The name of the device corresponds to the filename of the character
    /// device in `/dev`, for instance `udmabuf0`.
    pub async fn new(name: &str) -> Result<UdmaBuffer> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(format!("/dev/{name}"))
            .await
            .with_context(|| format!("failed to open /dev/{name}"))?;
        let fd = file.as_raw_fd();
        let size = fs::read_to_string(format!("/sys/class/u-dma-buf/{name}/size"))
            .await?
            .trim_end()
            .parse::<usize>()?;
        let phys_addr = u64::from_str_radix(
            fs::read_to_string(format!("/sys/class/u-dma-buf/{name}/phys_addr"))
                .await?
                .trim_end()
                .trim_start_matches("0x"),
            16,
        )?;
        let buffer = unsafe {
            match libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            ) {
                libc::MAP_FAILED => anyhow::bail!("mmap u-dma-buf failed"),
                x => x,
            }
        };
        tracing::info!(
            "mapped DMA buffer {name}: {size:#x} bytes at bus address {phys_addr:#010x}"
        );
        Ok(UdmaBuffer {
            _file: file,
            buffer,
            size,
            phys_addr,
        })
    }
}

impl DmaRegion for UdmaBuffer {
    fn as_ptr(&self) -> *mut u8 {
        self.buffer as *mut u8
    }

    fn len(&self) -> usize {
        self.size
    }

    fn bus_addr(&self) -> u64 {
        self.phys_addr
    }
}

impl Drop for UdmaBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buffer, self.size);
        }
    }
}

/// Heap-allocated frame memory.
///
/// This is used with simulated cards. The memory is page aligned and zeroed.
/// It is not reachable by real hardware, so it is given an arbitrary 32-bit
/// bus address ([`SIMULATED_BUS_ADDR`] unless chosen otherwise).
#[derive(Debug)]
pub struct HostBuffer {
    ptr: *mut u8,
    layout: Layout,
    bus_addr: u64,
}

/// Bus address reported by [`HostBuffer::new`].
pub const SIMULATED_BUS_ADDR: u64 = 0x1000_0000;

// The allocation is owned by this struct and is only freed on drop.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// Allocates a zeroed buffer of `size` bytes.
    pub fn new(size: usize) -> Result<HostBuffer> {
        HostBuffer::with_bus_addr(size, SIMULATED_BUS_ADDR)
    }

    /// Allocates a zeroed buffer of `size` bytes reporting the bus address
    /// `bus_addr`.
    pub fn with_bus_addr(size: usize, bus_addr: u64) -> Result<HostBuffer> {
        if size == 0 {
            anyhow::bail!("cannot allocate an empty frame buffer");
        }
        let layout = Layout::from_size_align(size, page_size::get())?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            anyhow::bail!("failed to allocate {size:#x} bytes for frame buffer");
        }
        Ok(HostBuffer {
            ptr,
            layout,
            bus_addr,
        })
    }
}

impl DmaRegion for HostBuffer {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn bus_addr(&self) -> u64 {
        self.bus_addr
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_buffer_is_page_aligned_and_zeroed() {
        let buffer = HostBuffer::new(3 * 1024).unwrap();
        assert_eq!(buffer.len(), 3 * 1024);
        assert_eq!(buffer.as_ptr() as usize % page_size::get(), 0);
        let contents = unsafe { std::slice::from_raw_parts(buffer.as_ptr(), buffer.len()) };
        assert!(contents.iter().all(|&b| b == 0));
        assert_eq!(buffer.bus_addr(), SIMULATED_BUS_ADDR);
    }

    #[test]
    fn empty_host_buffer() {
        assert!(HostBuffer::new(0).is_err());
    }
}
