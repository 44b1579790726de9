//! Windows Platform Binary Table (WPBT) construction and installation.
//!
//! The WPBT is an ACPI table that points the OS loader at a native binary in
//! physical memory, plus optional command line text, for execution early in
//! boot. This crate owns the parts of that job that are pure byte-pushing:
//!
//! - [`table`] builds a checksum-valid table image from a payload address,
//!   payload size and optional command line, and decodes one back.
//! - [`install`] registers a built image with a platform table registry and
//!   repairs the installed clone's OemRevision field when the platform
//!   rewrites it.
//!
//! Platform access (file reads, the ACPI table protocol, the XSDT walk) lives
//! in the UEFI application crate; everything here runs against plain byte
//! slices and the [`install::TableRegistry`] seam, so it is testable on the
//! host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod install;
pub mod table;

pub use error::WpbtError;
pub use install::{ensure_absent, install, InstalledWpbt, TableLookup, TableRegistry};
pub use table::{encode_command_line, TableImage, WpbtView};
