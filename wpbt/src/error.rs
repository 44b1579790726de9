use core::fmt;

/// Everything that can go wrong between "path on the command line" and
/// "table installed". One linear attempt, no retries; the first error ends
/// the run.
///
/// Platform status codes are carried as raw `usize` values so this type stays
/// free of UEFI dependencies; the application logs the typed status at the
/// failure site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpbtError {
    /// No payload path was supplied, or it was not valid text.
    MissingPayloadPath,
    /// Command line bytes (terminator included) exceed the 16-bit length field.
    ArgumentsTooLong { len: usize },
    /// The allocator could not satisfy a request of `len` bytes.
    AllocationFailed { len: usize },
    /// Payload larger than the 32-bit HandoffMemorySize field can express.
    FileTooLarge { len: u64 },
    /// The file system returned fewer bytes than the file claims to hold.
    ReadIncomplete { expected: usize, read: usize },
    /// Opening or reading the payload failed with the given EFI status.
    FileAccess { status: usize },
    /// A WPBT is already present; the OS only honors one, so refuse to shadow it.
    AlreadyInstalled,
    /// The platform exposes no table registration capability.
    RegistryUnavailable,
    /// The registration call rejected the table with the given EFI status.
    Registration { status: usize },
    /// Registration reported success but the table cannot be found by
    /// signature. Should be unreachable; a platform defect if seen.
    LookupAfterInstall,
}

impl fmt::Display for WpbtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPayloadPath => write!(f, "payload path missing or not valid"),
            Self::ArgumentsTooLong { len } => {
                write!(f, "command line arguments are too long: {len} bytes")
            }
            Self::AllocationFailed { len } => write!(f, "memory allocation failed: {len} bytes"),
            Self::FileTooLarge { len } => write!(f, "file size too large: {len} bytes"),
            Self::ReadIncomplete { expected, read } => {
                write!(f, "short read: wanted {expected} bytes, got {read}")
            }
            Self::FileAccess { status } => write!(f, "file access failed: status {status:#x}"),
            Self::AlreadyInstalled => {
                write!(f, "WPBT already exists; refusing to install a second instance")
            }
            Self::RegistryUnavailable => {
                write!(f, "ACPI table protocol is not available on this platform")
            }
            Self::Registration { status } => {
                write!(f, "InstallAcpiTable failed: status {status:#x}")
            }
            Self::LookupAfterInstall => {
                write!(f, "installed WPBT not found by signature; platform tables inconsistent")
            }
        }
    }
}
