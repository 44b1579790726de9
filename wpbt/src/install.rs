//! Table registration and post-install repair.
//!
//! The platform registry clones a submitted image into its own memory and may
//! rewrite administrative header fields while doing so. The OS consumer
//! requires OemRevision == 1 in the copy it reads, so after a successful
//! registration the installed clone is located again by signature and patched
//! back when needed. Two distinct handles are involved: the build buffer
//! handed to [`TableRegistry::register_table`], and the installed copy
//! reached only through [`TableLookup::find_table`] afterwards. A pointer into
//! the build buffer is never reused as a pointer to the clone.

use core::ptr::NonNull;
use core::slice;

use crate::error::WpbtError;
use crate::table::{self, TableImage, WpbtView, SIGNATURE};

/// Read access to the platform's installed table set.
pub trait TableLookup {
    /// Address of the platform's retained copy of the table with `signature`,
    /// if one is installed.
    fn find_table(&self, signature: [u8; 4]) -> Option<NonNull<u8>>;
}

/// A platform service that clones byte images into its durable table set.
pub trait TableRegistry: TableLookup {
    /// Registers `image`; the platform clones the bytes and returns an opaque
    /// key for the clone.
    fn register_table(&mut self, image: &[u8]) -> Result<usize, WpbtError>;
}

/// Final placement of the installed table, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledWpbt {
    /// Address of the platform's clone.
    pub address: u64,
    /// Payload address the clone points at.
    pub payload_location: u64,
    /// Payload size in bytes.
    pub payload_size: u32,
    /// Command line bytes embedded in the clone.
    pub command_line_len: u16,
    /// Whether the platform rewrote OemRevision and the clone was repaired.
    pub patched: bool,
}

/// Duplicate guard, run before anything is loaded or built: most platforms
/// happily install several WPBT instances, but the OS honors exactly one, and
/// shadowing an existing table invites undefined consumer behavior.
pub fn ensure_absent(lookup: &impl TableLookup) -> Result<(), WpbtError> {
    match lookup.find_table(SIGNATURE) {
        Some(_) => Err(WpbtError::AlreadyInstalled),
        None => Ok(()),
    }
}

/// Registers `image` and verifies/repairs the installed clone.
///
/// Lookup failure after a successful registration is reported as
/// [`WpbtError::LookupAfterInstall`]: the platform just said the table went
/// in, so not finding it is a platform defect, not a recoverable condition.
pub fn install(
    registry: &mut impl TableRegistry,
    image: &TableImage,
) -> Result<InstalledWpbt, WpbtError> {
    let key = registry.register_table(image.as_bytes())?;
    log::debug!("WPBT registered, table key {key}");

    let installed = registry
        .find_table(SIGNATURE)
        .ok_or(WpbtError::LookupAfterInstall)?;
    // SAFETY: the registry just reported this table installed; its header
    // length field bounds the platform's allocation.
    let installed = unsafe { table_slice_mut(installed) };

    let patched = normalize_oem_revision(installed);
    if patched {
        log::warn!(
            "platform rewrote OemRevision during installation; restored to {}",
            table::OEM_REVISION
        );
    }

    let view = WpbtView::parse(installed).ok_or(WpbtError::LookupAfterInstall)?;
    Ok(InstalledWpbt {
        address: installed.as_ptr() as u64,
        payload_location: view.header.handoff_memory_location.get(),
        payload_size: view.header.handoff_memory_size.get(),
        command_line_len: view.header.command_line_argument_length.get(),
        patched,
    })
}

/// Forces OemRevision to the contractual value, re-checksumming the table's
/// own bytes when a rewrite was needed. Returns whether anything changed;
/// a table that already carries the value is left byte-for-byte untouched.
pub fn normalize_oem_revision(table: &mut [u8]) -> bool {
    if table.len() < table::FIXED_LEN {
        return false;
    }

    let off = table::OEM_REVISION_OFFSET;
    let mut field = [0u8; 4];
    field.copy_from_slice(&table[off..off + 4]);
    if u32::from_le_bytes(field) == table::OEM_REVISION {
        return false;
    }

    table[off..off + 4].copy_from_slice(&table::OEM_REVISION.to_le_bytes());
    table::update_checksum(table);
    true
}

/// Materializes the installed table as a byte slice, using the length field
/// at the standard header offset.
///
/// # Safety
/// `table` must point at an installed ACPI table whose allocation covers the
/// number of bytes its own length field declares.
unsafe fn table_slice_mut<'a>(table: NonNull<u8>) -> &'a mut [u8] {
    let base = table.as_ptr();
    let mut length = [0u8; 4];
    // SAFETY: per the function contract the header is readable.
    unsafe {
        core::ptr::copy_nonoverlapping(base.add(table::LENGTH_OFFSET), length.as_mut_ptr(), 4)
    };
    let length = u32::from_le_bytes(length) as usize;
    // SAFETY: per the function contract the allocation covers `length` bytes.
    unsafe { slice::from_raw_parts_mut(base, length) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::byte_sum;
    use alloc::boxed::Box;
    use pretty_assertions::assert_eq;

    const PAYLOAD_LOCATION: u64 = 0x8000_0000;
    const PAYLOAD_SIZE: u32 = 1024;

    /// In-memory stand-in for the platform: clones registered images, can
    /// simulate the platform rewriting OemRevision during the clone, and can
    /// simulate the failure modes around registration.
    struct MockRegistry {
        installed: Option<Box<[u8]>>,
        clobber_oem_revision: Option<u32>,
        fail_register: Option<usize>,
        hide_after_install: bool,
        register_calls: usize,
    }

    impl MockRegistry {
        fn new() -> Self {
            MockRegistry {
                installed: None,
                clobber_oem_revision: None,
                fail_register: None,
                hide_after_install: false,
                register_calls: 0,
            }
        }
    }

    impl TableLookup for MockRegistry {
        fn find_table(&self, signature: [u8; 4]) -> Option<NonNull<u8>> {
            if self.hide_after_install {
                return None;
            }
            let table = self.installed.as_ref()?;
            if table[..4] != signature[..] {
                return None;
            }
            NonNull::new(table.as_ptr() as *mut u8)
        }
    }

    impl TableRegistry for MockRegistry {
        fn register_table(&mut self, image: &[u8]) -> Result<usize, WpbtError> {
            self.register_calls += 1;
            if let Some(status) = self.fail_register {
                return Err(WpbtError::Registration { status });
            }
            let mut clone = image.to_vec();
            if let Some(rev) = self.clobber_oem_revision {
                let off = table::OEM_REVISION_OFFSET;
                clone[off..off + 4].copy_from_slice(&rev.to_le_bytes());
            }
            self.installed = Some(clone.into_boxed_slice());
            Ok(1)
        }
    }

    fn build_image() -> TableImage {
        TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, None).unwrap()
    }

    #[test]
    fn happy_path_reports_installed_placement() {
        let mut registry = MockRegistry::new();
        let report = install(&mut registry, &build_image()).unwrap();

        let clone = registry.installed.as_ref().unwrap();
        assert_eq!(report.address, clone.as_ptr() as u64);
        assert_eq!(report.payload_location, PAYLOAD_LOCATION);
        assert_eq!(report.payload_size, PAYLOAD_SIZE);
        assert_eq!(report.command_line_len, 0);
        assert!(!report.patched);
        assert_eq!(byte_sum(clone), 0);
    }

    #[test]
    fn clone_with_rewritten_oem_revision_is_repaired() {
        let mut registry = MockRegistry::new();
        registry.clobber_oem_revision = Some(0);

        let report = install(&mut registry, &build_image()).unwrap();
        assert!(report.patched);

        let clone = registry.installed.as_ref().unwrap();
        let off = table::OEM_REVISION_OFFSET;
        let mut field = [0u8; 4];
        field.copy_from_slice(&clone[off..off + 4]);
        assert_eq!(u32::from_le_bytes(field), 1);
        assert_eq!(byte_sum(clone), 0);
    }

    #[test]
    fn clone_already_at_revision_one_is_untouched() {
        let mut registry = MockRegistry::new();
        let image = build_image();
        let report = install(&mut registry, &image).unwrap();

        assert!(!report.patched);
        assert_eq!(&registry.installed.unwrap()[..], image.as_bytes());
    }

    #[test]
    fn duplicate_guard_refuses_before_registration() {
        let mut registry = MockRegistry::new();
        registry.register_table(build_image().as_bytes()).unwrap();
        registry.register_calls = 0;

        assert_eq!(ensure_absent(&registry), Err(WpbtError::AlreadyInstalled));
        assert_eq!(registry.register_calls, 0);
    }

    #[test]
    fn guard_passes_when_no_table_is_installed() {
        let registry = MockRegistry::new();
        assert_eq!(ensure_absent(&registry), Ok(()));
    }

    #[test]
    fn missing_clone_after_install_is_an_internal_fault() {
        let mut registry = MockRegistry::new();
        registry.hide_after_install = true;

        assert_eq!(
            install(&mut registry, &build_image()),
            Err(WpbtError::LookupAfterInstall)
        );
    }

    #[test]
    fn registration_failure_carries_the_status() {
        let mut registry = MockRegistry::new();
        registry.fail_register = Some(0x8000_0000_0000_0009);

        assert_eq!(
            install(&mut registry, &build_image()),
            Err(WpbtError::Registration { status: 0x8000_0000_0000_0009 })
        );
        assert!(registry.installed.is_none());
    }

    #[test]
    fn normalize_ignores_runt_buffers() {
        let mut runt = [0u8; 16];
        assert!(!normalize_oem_revision(&mut runt));
        assert_eq!(runt, [0u8; 16]);
    }
}
