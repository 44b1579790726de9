#![no_std]
#![no_main]

//! wpbt_builder — UEFI shell application that installs a Windows Platform
//! Binary Table (WPBT) for a caller-supplied native binary.
//!
//! Usage (from the UEFI shell, payload on the same volume):
//!   > wpbt_builder.efi <PlatformBinary> [Args]
//!
//! Pipeline, strictly linear: duplicate guard, payload read into ACPI-reclaim
//! memory, table image build, registration, post-install verification of the
//! platform's clone. Every failure is terminal and reported with the step
//! that failed plus the underlying status; nothing is retried.

extern crate alloc;

mod acpi;
mod loader;

use alloc::string::String;
use alloc::vec::Vec;

use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;
use uefi::table::boot::BootServices;
use uefi::table::{Boot, SystemTable};
use uefi::{CString16, Handle, Status};
use uefi_services::println;

use wpbt::{table, TableImage, WpbtError};

#[entry]
fn main(image_handle: Handle, mut system_table: SystemTable<Boot>) -> Status {
    if uefi_services::init(&mut system_table).is_err() {
        return Status::ABORTED;
    }

    match run(image_handle, &system_table) {
        Ok(()) => Status::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            match err {
                WpbtError::MissingPayloadPath => {
                    println!("> wpbt_builder.efi <PlatformBinary> [Args]");
                }
                WpbtError::RegistryUnavailable => {
                    println!("This error may be seen on virtualization software that does");
                    println!("not implement the necessary UEFI protocol(s) for this program.");
                    println!("Try on a physical machine.");
                }
                _ => {}
            }
            exit_status(err)
        }
    }
}

fn run(image_handle: Handle, st: &SystemTable<Boot>) -> Result<(), WpbtError> {
    let bt = st.boot_services();

    let (path, command_line) = parse_command_line(bt, image_handle)?;

    // Bail out before touching anything if a WPBT is already present; the OS
    // only consumes one and an existing table is not ours to shadow.
    let tables = acpi::SystemAcpiTables::new(st);
    wpbt::ensure_absent(&tables)?;

    let payload = loader::load_payload(bt, image_handle, &path)?;
    log::info!("payload loaded: {} bytes at {:#x}", payload.len(), payload.location());

    let image = TableImage::build(
        payload.location(),
        payload.len() as u32,
        command_line.as_deref(),
    )?;

    let mut registry = acpi::PlatformAcpi::locate(bt, image_handle, tables)?;
    let installed = wpbt::install(&mut registry, &image)?;

    println!("Successfully installed WPBT at: {:#x}", installed.address);
    println!("  Binary location at: {:#x}", installed.payload_location);
    println!("  Binary size: {:#x}", installed.payload_size);
    println!("  Command line size: {:#x}", installed.command_line_len);

    // The platform holds its own clone of the table, and the OS consumes the
    // payload memory after boot; only the build buffer is ours to drop.
    payload.release();
    Ok(())
}

/// Pulls the payload path and the verbatim remainder out of the image's load
/// options (the shell places the full command line there). The first token is
/// this program's own name.
fn parse_command_line(
    bt: &BootServices,
    image_handle: Handle,
) -> Result<(CString16, Option<Vec<u8>>), WpbtError> {
    let loaded_image = bt
        .open_protocol_exclusive::<LoadedImage>(image_handle)
        .map_err(|e| {
            log::error!("loaded image protocol: {:?}", e.status());
            WpbtError::MissingPayloadPath
        })?;
    let options = loaded_image
        .load_options_as_cstr16()
        .map_err(|_| WpbtError::MissingPayloadPath)?;
    let units = options.to_u16_slice();

    let (_program, rest) = next_token(units);
    let (path_units, rest) = next_token(rest);
    let path_units = path_units.ok_or(WpbtError::MissingPayloadPath)?;

    let path = String::from_utf16(path_units).map_err(|_| WpbtError::MissingPayloadPath)?;
    let path = CString16::try_from(path.as_str()).map_err(|_| WpbtError::MissingPayloadPath)?;

    let rest = trim_leading_spaces(rest);
    let command_line = if rest.is_empty() {
        None
    } else {
        // UTF-16LE plus terminator, embedded verbatim. Checked up front so an
        // absurd command line fails before the payload is even read.
        let encoded_len = (rest.len() + 1) * 2;
        if encoded_len > table::MAX_COMMAND_LINE_BYTES {
            return Err(WpbtError::ArgumentsTooLong { len: encoded_len });
        }
        let mut bytes = Vec::with_capacity(encoded_len);
        for &unit in rest {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
        Some(bytes)
    };

    Ok((path, command_line))
}

const SPACE: u16 = b' ' as u16;
const QUOTE: u16 = b'"' as u16;

/// Splits off the next whitespace-delimited token, honoring double quotes
/// around it. Returns the token (quotes stripped) and the tail.
fn next_token(units: &[u16]) -> (Option<&[u16]>, &[u16]) {
    let units = trim_leading_spaces(units);
    if units.is_empty() {
        return (None, units);
    }

    if units[0] == QUOTE {
        let body = &units[1..];
        let end = body.iter().position(|&u| u == QUOTE).unwrap_or(body.len());
        let tail_from = (end + 1).min(body.len());
        (Some(&body[..end]), &body[tail_from..])
    } else {
        let end = units.iter().position(|&u| u == SPACE).unwrap_or(units.len());
        (Some(&units[..end]), &units[end..])
    }
}

fn trim_leading_spaces(mut units: &[u16]) -> &[u16] {
    while let [SPACE, rest @ ..] = units {
        units = rest;
    }
    units
}

fn exit_status(err: WpbtError) -> Status {
    match err {
        WpbtError::MissingPayloadPath | WpbtError::ArgumentsTooLong { .. } => {
            Status::INVALID_PARAMETER
        }
        WpbtError::AllocationFailed { .. } => Status::OUT_OF_RESOURCES,
        WpbtError::FileTooLarge { .. } => Status::BAD_BUFFER_SIZE,
        WpbtError::ReadIncomplete { .. } | WpbtError::FileAccess { .. } => Status::DEVICE_ERROR,
        WpbtError::AlreadyInstalled => Status::ACCESS_DENIED,
        WpbtError::RegistryUnavailable => Status::UNSUPPORTED,
        WpbtError::Registration { status } => Status(status),
        WpbtError::LookupAfterInstall => Status::ABORTED,
    }
}
