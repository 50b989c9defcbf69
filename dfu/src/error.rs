/// Malformed descriptor bytes or memory layout string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A descriptor's `bLength` runs past the end of the buffer
    Truncated {
        offset: usize,
        length: usize,
        remaining: usize,
    },
    /// A descriptor's `bLength` is too small to be valid
    InvalidLength { offset: usize, length: usize },
    /// The buffer does not start with a configuration descriptor
    NotAConfiguration,
    /// The string is not a DfuSe memory layout (`@name/0xADDR/...`)
    NotAMemoryLayout(String),
    /// A segment token could not be decoded
    InvalidSegment(String),
    /// Two segments share an address range
    OverlappingSegments { address: u32 },
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Truncated {
                offset,
                length,
                remaining,
            } => write!(
                f,
                "descriptor at offset {offset} has length {length} but only {remaining} bytes remain"
            ),
            ParseError::InvalidLength { offset, length } => write!(
                f,
                "invalid descriptor length {length} at offset {offset}"
            ),
            ParseError::NotAConfiguration => {
                write!(f, "not a configuration descriptor")
            }
            ParseError::NotAMemoryLayout(s) => {
                write!(f, "not a DfuSe memory layout: \"{s}\"")
            }
            ParseError::InvalidSegment(s) => {
                write!(f, "invalid memory segment: \"{s}\"")
            }
            ParseError::OverlappingSegments { address } => {
                write!(f, "overlapping memory segments at 0x{address:08x}")
            }
        }
    }
}

#[derive(Debug)]
pub enum DfuError {
    Usb(nusb::Error),
    Connection(nusb::Error),
    Disconnected,
    Closed,
    Transfer(nusb::transfer::TransferError),
    InvalidResponse(usize),
    Parse(ParseError),
    Download { status: u8 },
    UnexpectedState(crate::DfuState),
    NoWritableRegion,
    OutOfRange { address: u32, length: usize },
    InvalidBlockSize,
    Timeout,
    Cancelled,
    /// Hotplug watching and status polling run on tokio
    NoRuntime,
}

impl std::error::Error for DfuError {}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::Usb(err) => write!(f, "USB error: {}", err),
            DfuError::Connection(err) => {
                write!(f, "Unable to connect: {}", err)
            }
            DfuError::Disconnected => write!(f, "Device disconnected"),
            DfuError::Closed => write!(f, "Session closed"),
            DfuError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DfuError::InvalidResponse(len) => {
                write!(f, "Invalid response length: {} bytes", len)
            }
            DfuError::Parse(err) => write!(f, "Parse error: {}", err),
            DfuError::Download { status } => {
                write!(
                    f,
                    "DFU download failed: status {} ({})",
                    status,
                    crate::status::status_description(*status)
                )
            }
            DfuError::UnexpectedState(state) => {
                write!(f, "Unexpected device state: {}", state)
            }
            DfuError::NoWritableRegion => {
                write!(f, "No writable memory region")
            }
            DfuError::OutOfRange { address, length } => {
                write!(
                    f,
                    "{} bytes at 0x{:08x} do not fit in writable memory",
                    length, address
                )
            }
            DfuError::InvalidBlockSize => write!(f, "Invalid block size"),
            DfuError::Timeout => {
                write!(f, "Timeout")
            }
            DfuError::Cancelled => write!(f, "Cancelled"),
            DfuError::NoRuntime => {
                write!(f, "Must be called from within a tokio runtime")
            }
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        match err {
            nusb::transfer::TransferError::Disconnected => {
                DfuError::Disconnected
            }
            err => DfuError::Transfer(err),
        }
    }
}

impl From<ParseError> for DfuError {
    fn from(err: ParseError) -> Self {
        DfuError::Parse(err)
    }
}
