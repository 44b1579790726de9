//! ACPI platform bindings: the table registration protocol and the
//! lookup-by-signature walk over the firmware's installed table set.

use core::ffi::c_void;
use core::ptr::NonNull;

use uefi::proto::unsafe_protocol;
use uefi::table::boot::{
    BootServices, OpenProtocolAttributes, OpenProtocolParams, ScopedProtocol,
};
use uefi::table::cfg::ACPI2_GUID;
use uefi::table::{Boot, SystemTable};
use uefi::{Handle, Status};

use wpbt::{TableLookup, TableRegistry, WpbtError};

const RSDP_SIGNATURE: [u8; 8] = *b"RSD PTR ";
const RSDP_XSDT_OFFSET: usize = 24;
const SDT_LENGTH_OFFSET: usize = 4;
const SDT_HEADER_LEN: usize = 36;
const XSDT_ENTRY_SIZE: usize = core::mem::size_of::<u64>();

/// EFI_ACPI_TABLE_PROTOCOL. Not wrapped by the `uefi` crate, so bound here by
/// GUID with the fn-pointer ABI from the UEFI specification.
#[repr(C)]
#[unsafe_protocol("ffe06bdd-6107-46a6-7bb2-5a9c7ec5275c")]
#[allow(dead_code)] // uninstall is part of the protocol's ABI, unused here
pub struct AcpiTableProtocol {
    install_acpi_table: unsafe extern "efiapi" fn(
        this: *const AcpiTableProtocol,
        table: *const c_void,
        table_size: usize,
        table_key: *mut usize,
    ) -> Status,
    uninstall_acpi_table:
        unsafe extern "efiapi" fn(this: *const AcpiTableProtocol, table_key: usize) -> Status,
}

/// Read-only view of the firmware's installed ACPI tables, reached through
/// the configuration table. Usable before the registration protocol has been
/// located, which is what the duplicate guard needs.
pub struct SystemAcpiTables<'a> {
    st: &'a SystemTable<Boot>,
}

impl<'a> SystemAcpiTables<'a> {
    pub fn new(st: &'a SystemTable<Boot>) -> Self {
        Self { st }
    }

    fn rsdp(&self) -> Option<NonNull<u8>> {
        self.st
            .config_table()
            .iter()
            .find(|entry| entry.guid == ACPI2_GUID)
            .and_then(|entry| NonNull::new(entry.address as *mut u8))
    }
}

impl TableLookup for SystemAcpiTables<'_> {
    fn find_table(&self, signature: [u8; 4]) -> Option<NonNull<u8>> {
        let rsdp = self.rsdp()?;
        // SAFETY: the firmware published this pointer in the configuration
        // table; RSDP, XSDT and every table the XSDT names stay mapped while
        // boot services are up.
        unsafe { find_in_xsdt(rsdp, signature) }
    }
}

/// Walks the XSDT for the first installed table carrying `signature`.
/// The legacy RSDT is ignored: WPBT consumers require ACPI 2.0+ firmware,
/// which always publishes an XSDT.
///
/// # Safety
/// `rsdp` must point at the firmware RSDP, with the XSDT and all referenced
/// tables readable.
unsafe fn find_in_xsdt(rsdp: NonNull<u8>, signature: [u8; 4]) -> Option<NonNull<u8>> {
    let rsdp = rsdp.as_ptr();
    let mut rsdp_sig = [0u8; 8];
    // SAFETY: RSDP is readable per the function contract; reads are unaligned.
    unsafe { core::ptr::copy_nonoverlapping(rsdp, rsdp_sig.as_mut_ptr(), rsdp_sig.len()) };
    if rsdp_sig != RSDP_SIGNATURE {
        return None;
    }

    // SAFETY: the XSDT address field sits inside the readable RSDP.
    let xsdt = unsafe { read_unaligned_u64(rsdp.add(RSDP_XSDT_OFFSET)) } as usize as *const u8;
    if xsdt.is_null() {
        return None;
    }

    // SAFETY: the XSDT header is readable per the function contract.
    let length = unsafe { read_unaligned_u32(xsdt.add(SDT_LENGTH_OFFSET)) } as usize;
    if length < SDT_HEADER_LEN {
        return None;
    }

    let entries = (length - SDT_HEADER_LEN) / XSDT_ENTRY_SIZE;
    for i in 0..entries {
        // SAFETY: entry `i` lies within the XSDT's declared length.
        let entry = unsafe { read_unaligned_u64(xsdt.add(SDT_HEADER_LEN + i * XSDT_ENTRY_SIZE)) };
        let Some(table) = NonNull::new(entry as usize as *mut u8) else {
            continue;
        };

        let mut table_sig = [0u8; 4];
        // SAFETY: the XSDT only names mapped tables, each starting with a
        // standard header.
        unsafe {
            core::ptr::copy_nonoverlapping(table.as_ptr(), table_sig.as_mut_ptr(), table_sig.len())
        };
        if table_sig == signature {
            return Some(table);
        }
    }
    None
}

/// # Safety
/// `ptr` must be valid for an 8-byte read; alignment is not required.
unsafe fn read_unaligned_u64(ptr: *const u8) -> u64 {
    // SAFETY: per the function contract.
    unsafe { core::ptr::read_unaligned(ptr as *const u64) }
}

/// # Safety
/// `ptr` must be valid for a 4-byte read; alignment is not required.
unsafe fn read_unaligned_u32(ptr: *const u8) -> u32 {
    // SAFETY: per the function contract.
    unsafe { core::ptr::read_unaligned(ptr as *const u32) }
}

/// The platform's table registry: the located registration protocol plus the
/// installed-table view used to find the clone again after registration.
pub struct PlatformAcpi<'a> {
    protocol: ScopedProtocol<'a, AcpiTableProtocol>,
    tables: SystemAcpiTables<'a>,
}

impl<'a> PlatformAcpi<'a> {
    /// Locates the registration capability. Missing protocol maps to
    /// [`WpbtError::RegistryUnavailable`]; virtualized firmware commonly
    /// omits it, so the caller-facing diagnostics steer users toward real
    /// hardware rather than a bug report.
    pub fn locate(
        bt: &'a BootServices,
        image_handle: Handle,
        tables: SystemAcpiTables<'a>,
    ) -> Result<Self, WpbtError> {
        let handle = bt.get_handle_for_protocol::<AcpiTableProtocol>().map_err(|e| {
            log::error!("locate EFI_ACPI_TABLE_PROTOCOL: {:?}", e.status());
            WpbtError::RegistryUnavailable
        })?;

        // SAFETY: GET_PROTOCOL imposes no exclusivity; the protocol outlives
        // this application, which exits before boot services end.
        let protocol = unsafe {
            bt.open_protocol::<AcpiTableProtocol>(
                OpenProtocolParams { handle, agent: image_handle, controller: None },
                OpenProtocolAttributes::GetProtocol,
            )
        }
        .map_err(|e| {
            log::error!("open EFI_ACPI_TABLE_PROTOCOL: {:?}", e.status());
            WpbtError::RegistryUnavailable
        })?;

        Ok(Self { protocol, tables })
    }
}

impl TableLookup for PlatformAcpi<'_> {
    fn find_table(&self, signature: [u8; 4]) -> Option<NonNull<u8>> {
        self.tables.find_table(signature)
    }
}

impl TableRegistry for PlatformAcpi<'_> {
    fn register_table(&mut self, image: &[u8]) -> Result<usize, WpbtError> {
        let mut key = 0usize;
        // SAFETY: the fn pointer comes from the firmware's protocol instance;
        // `image` stays valid for the whole call and is cloned inside it.
        let status = unsafe {
            (self.protocol.install_acpi_table)(
                &*self.protocol,
                image.as_ptr() as *const c_void,
                image.len(),
                &mut key,
            )
        };
        if status.is_success() {
            Ok(key)
        } else {
            log::error!("InstallAcpiTable: {status:?}");
            Err(WpbtError::Registration { status: status.0 })
        }
    }
}
