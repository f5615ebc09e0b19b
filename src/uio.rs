//! UIO device access.
//!
//! The card is bound to a UIO driver. Map 0 of the device is BAR0, which holds
//! the DSP host interface, and the character device delivers the PCI
//! interrupt: writing 1 unmasks it and a 4-byte read blocks until it fires.

use anyhow::{Context, Result};
use std::os::unix::io::AsRawFd;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Map index of BAR0.
pub const BAR0: usize = 0;

const SYSFS_UIO: &str = "/sys/class/uio";

/// UIO device of a card.
#[derive(Debug)]
pub struct Uio {
    index: usize,
    file: fs::File,
}

/// Attributes of a UIO map, as listed in sysfs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MapInfo {
    /// Physical address of the region.
    pub addr: u64,
    /// Size of the region in bytes.
    pub size: usize,
    /// Offset of the region within its first page.
    pub offset: usize,
}

/// Memory mapping of a UIO map.
///
/// Dropping this struct unmaps the region.
#[derive(Debug)]
pub struct Mapping {
    base: *mut libc::c_void,
    len: usize,
    info: MapInfo,
}

fn parse_hex(value: &str) -> Result<u64> {
    let value = value.trim_end();
    let digits = value
        .strip_prefix("0x")
        .with_context(|| format!("{value:?} is not a hex value"))?;
    Ok(u64::from_str_radix(digits, 16)?)
}

impl Uio {
    /// Opens the UIO device whose sysfs name is `name`.
    pub async fn open(name: &str) -> Result<Uio> {
        let index = Self::lookup(name)
            .await?
            .with_context(|| format!("UIO device {name} not found"))?;
        let path = format!("/dev/uio{index}");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {path}"))?;
        Ok(Uio { index, file })
    }

    async fn lookup(name: &str) -> Result<Option<usize>> {
        let mut entries = fs::read_dir(SYSFS_UIO)
            .await
            .with_context(|| format!("failed to list {SYSFS_UIO}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|file_name| file_name.strip_prefix("uio"))
                .and_then(|index| index.parse::<usize>().ok())
            else {
                continue;
            };
            if fs::read_to_string(entry.path().join("name")).await?.trim_end() == name {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Gives the index of the device (`N` in `/dev/uioN`).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reads the attributes of map `map`.
    pub async fn map_info(&self, map: usize) -> Result<MapInfo> {
        let dir = format!("{SYSFS_UIO}/uio{}/maps/map{map}", self.index);
        let attribute = |name: &'static str| {
            let path = format!("{dir}/{name}");
            async move {
                let value = fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {path}"))?;
                parse_hex(&value).with_context(|| format!("bad value in {path}"))
            }
        };
        Ok(MapInfo {
            addr: attribute("addr").await?,
            size: usize::try_from(attribute("size").await?)?,
            offset: usize::try_from(attribute("offset").await?)?,
        })
    }

    /// Maps map `map` into memory.
    ///
    /// UIO selects the map through the mmap offset, in units of pages.
    pub async fn map(&self, map: usize) -> Result<Mapping> {
        let info = self.map_info(map).await?;
        // the region may start in the middle of its first page
        let len = info.size + info.offset;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                (map * page_size::get()) as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to map uio{} map{map}", self.index));
        }
        Ok(Mapping { base, len, info })
    }

    /// Unmasks the interrupt.
    ///
    /// UIO masks the interrupt each time it fires, so this is needed before
    /// every wait.
    pub async fn unmask_irq(&mut self) -> Result<()> {
        self.file.write_all(&1u32.to_ne_bytes()).await?;
        Ok(())
    }

    /// Waits for the interrupt.
    ///
    /// Returns the number of interrupts counted by the kernel so far.
    pub async fn wait_irq(&mut self) -> Result<u32> {
        let mut count = [0; 4];
        self.file.read_exact(&mut count).await?;
        Ok(u32::from_ne_bytes(count))
    }
}

impl Mapping {
    /// Gives the virtual address of the region.
    pub fn addr(&self) -> *mut libc::c_void {
        unsafe { self.base.cast::<u8>().add(self.info.offset).cast() }
    }

    /// Gives the size of the region in bytes.
    pub fn size(&self) -> usize {
        self.info.size
    }

    /// Gives the attributes of the mapped region.
    pub fn info(&self) -> MapInfo {
        self.info
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base, self.len) } != 0 {
            tracing::error!(
                "munmap of UIO region failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}
