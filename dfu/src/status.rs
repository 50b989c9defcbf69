use std::{fmt, time::Duration};

use crate::error::DfuError;

pub(crate) const DFU_STATUS_LEN: u16 = 6;

pub const DFU_STATUS_OK: u8 = 0x00;

/// Device state reported by `DFU_GETSTATUS` (`bState`)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl DfuState {
    pub fn from_raw(state: u8) -> Self {
        match state {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DnloadSync,
            0x04 => DfuState::DnBusy,
            0x05 => DfuState::DnloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0a => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            DfuState::AppIdle => 0x00,
            DfuState::AppDetach => 0x01,
            DfuState::DfuIdle => 0x02,
            DfuState::DnloadSync => 0x03,
            DfuState::DnBusy => 0x04,
            DfuState::DnloadIdle => 0x05,
            DfuState::ManifestSync => 0x06,
            DfuState::Manifest => 0x07,
            DfuState::ManifestWaitReset => 0x08,
            DfuState::UploadIdle => 0x09,
            DfuState::Error => 0x0a,
            DfuState::Unknown(other) => other,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::Error => write!(f, "dfuERROR"),
            DfuState::Unknown(state) => write!(f, "unknown({state})"),
        }
    }
}

/// Reply to `DFU_GETSTATUS`. Only valid for the request that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    status: u8,
    poll_timeout: u32,
    state: DfuState,
}

impl DfuStatus {
    pub fn new(status: u8, poll_timeout: u32, state: DfuState) -> Self {
        DfuStatus {
            status,
            poll_timeout,
            state,
        }
    }

    pub(crate) fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::InvalidResponse(data.len()));
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: DfuState::from_raw(data[4]),
        })
    }

    pub fn to_raw(&self) -> [u8; 6] {
        let timeout = self.poll_timeout.to_le_bytes();
        [
            self.status,
            timeout[0],
            timeout[1],
            timeout[2],
            self.state.to_raw(),
            0,
        ]
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Minimum time the host should wait before the next `DFU_GETSTATUS`
    /// (`bwPollTimeout`)
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout as u64)
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        self.ret(())
    }

    pub fn ret<T>(&self, t: T) -> Result<T, DfuError> {
        if self.status != DFU_STATUS_OK || self.state == DfuState::Error {
            Err(DfuError::from(self))
        } else {
            Ok(t)
        }
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={}, status={} ({})",
            self.state,
            self.status,
            status_description(self.status)
        )
    }
}

impl From<&DfuStatus> for DfuError {
    fn from(st: &DfuStatus) -> Self {
        DfuError::Download { status: st.status }
    }
}

/// Meaning of a `bStatus` code (DFU 1.1, table 6.1.2)
pub fn status_description(status: u8) -> &'static str {
    match status {
        0x00 => "No error condition is present",
        0x01 => "File is not targeted for use by this device",
        0x02 => "File is for this device but fails some vendor-specific test",
        0x03 => "Device is unable to write memory",
        0x04 => "Memory erase function failed",
        0x05 => "Memory erase check failed",
        0x06 => "Program memory function failed",
        0x07 => "Programmed memory failed verification",
        0x08 => "Cannot program memory due to received address that is out of range",
        0x09 => "Received DFU_DNLOAD with wLength = 0, but device does not think that it has all data yet",
        0x0A => "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations",
        0x0B => "iString indicates a vendor specific error",
        0x0C => "Device detected unexpected USB reset signalling",
        0x0D => "Device detected unexpected power on reset",
        0x0E => "Something went wrong, but the device does not know what it was",
        0x0F => "Device stalled an unexpected request",
        _ => "Unknown status",
    }
}
