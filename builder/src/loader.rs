//! Payload acquisition: read the platform binary off the volume this tool was
//! launched from, into memory the OS will treat as firmware-owned.
//!
//! The installed table points the OS at this buffer across the boot hand-off,
//! so it is allocated from the ACPI reclaim pool rather than boot-services
//! data. On every failure path the allocation is released by `Drop`; on
//! success the caller decides when (whether) to let go.

use core::ops::{Deref, DerefMut};

use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode, FileType};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::table::boot::{BootServices, MemoryType};
use uefi::{CStr16, Handle, Status};

use wpbt::WpbtError;

/// An owned pool allocation holding the payload bytes.
pub struct PayloadBuffer<'a> {
    bt: &'a BootServices,
    ptr: *mut u8,
    len: usize,
}

impl PayloadBuffer<'_> {
    /// Physical address the table's HandoffMemoryLocation field will carry.
    /// UEFI identity-maps boot-time allocations, so the pointer value is it.
    pub fn location(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hands the allocation over: the installed table references this memory
    /// and the OS consumes it after boot, so it must never be freed once the
    /// table registration has succeeded.
    pub fn release(self) {
        core::mem::forget(self);
    }
}

impl Deref for PayloadBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is a live pool allocation of `len` bytes.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for PayloadBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` is a live pool allocation of `len` bytes, exclusively
        // owned by this value.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PayloadBuffer<'_> {
    fn drop(&mut self) {
        let _ = self.bt.free_pool(self.ptr);
    }
}

/// Reads the file at `path` on the volume this image was loaded from.
///
/// Fails with `FileTooLarge` when the size does not fit the table's 32-bit
/// payload-size field, and with `ReadIncomplete` when the file system returns
/// fewer bytes than the file claims; a partial payload is never handed on.
pub fn load_payload<'a>(
    bt: &'a BootServices,
    image_handle: Handle,
    path: &CStr16,
) -> Result<PayloadBuffer<'a>, WpbtError> {
    let device = {
        let loaded_image = bt
            .open_protocol_exclusive::<LoadedImage>(image_handle)
            .map_err(|e| access_error("loaded image protocol", e.status()))?;
        loaded_image.device()
    };

    let mut fs = bt
        .open_protocol_exclusive::<SimpleFileSystem>(device)
        .map_err(|e| access_error("simple file system protocol", e.status()))?;
    let mut root = fs
        .open_volume()
        .map_err(|e| access_error("volume", e.status()))?;

    let handle = root
        .open(path, FileMode::Read, FileAttribute::empty())
        .map_err(|e| access_error("payload file", e.status()))?;
    let mut file = match handle
        .into_type()
        .map_err(|e| access_error("payload file", e.status()))?
    {
        FileType::Regular(file) => file,
        FileType::Dir(_) => return Err(access_error("payload file", Status::INVALID_PARAMETER)),
    };

    let info = file
        .get_boxed_info::<FileInfo>()
        .map_err(|e| access_error("file info", e.status()))?;
    let size = info.file_size();
    if size > u32::MAX as u64 {
        return Err(WpbtError::FileTooLarge { len: size });
    }
    let size = size as usize;

    let ptr = bt
        .allocate_pool(MemoryType::ACPI_RECLAIM, size)
        .map_err(|e| {
            log::error!("payload allocation: {:?}", e.status());
            WpbtError::AllocationFailed { len: size }
        })?;
    let mut payload = PayloadBuffer { bt, ptr, len: size };
    payload.fill(0);

    let read = file
        .read(&mut payload)
        .map_err(|e| access_error("payload contents", e.status()))?;
    if read != size {
        return Err(WpbtError::ReadIncomplete { expected: size, read });
    }

    Ok(payload)
}

fn access_error(what: &str, status: Status) -> WpbtError {
    log::error!("{what}: {status:?}");
    WpbtError::FileAccess { status: status.0 }
}
