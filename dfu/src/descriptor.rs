use std::fmt;

use crate::error::ParseError;

pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x1;

const CONFIG_DESC_TYPE: u8 = 0x02;
const CONFIG_DESC_LEN: usize = 9;
const INTERFACE_DESC_TYPE: u8 = 0x04;
const INTERFACE_DESC_LEN: usize = 9;

pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// `raw_desc` must hold at least [DFU_DESC_LEN] bytes.
    pub(crate) fn new(raw_desc: &[u8]) -> Self {
        Self {
            attributes: raw_desc[2],
            detach_timeout: u16::from_le_bytes([raw_desc[3], raw_desc[4]]),
            transfer_size: u16::from_le_bytes([raw_desc[5], raw_desc[6]]),
            dfu_version: u16::from_le_bytes([raw_desc[7], raw_desc[8]]),
        }
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the `DFU_DETACH`
    /// request (`wDetachTimeOut`). If this time elapses without a USB reset,
    /// then the device will terminate the Reconfiguration phase and revert back
    /// to normal operation.
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write transaction
    /// (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification release
    /// (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

impl fmt::Display for DfuDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WillDetach={}, ManifestationTolerant={}, CanUpload={}, CanDnload={}, TransferSize={}, DetachTimeOut={}, Version={:04x}",
            self.will_detach(),
            self.manifestation_tolerant(),
            self.can_upload(),
            self.can_download(),
            self.transfer_size(),
            self.detach_timeout(),
            self.dfu_version(),
        )
    }
}

/// A single descriptor inside a configuration descriptor.
///
/// Interface descriptors own the class-specific and endpoint descriptors
/// that follow them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRecord {
    raw: Vec<u8>,
    children: Vec<DescriptorRecord>,
}

impl DescriptorRecord {
    fn new(raw: &[u8]) -> Self {
        Self {
            raw: raw.to_vec(),
            children: Vec::new(),
        }
    }

    pub fn length(&self) -> usize {
        self.raw.len()
    }
    pub fn descriptor_type(&self) -> u8 {
        self.raw[1]
    }
    /// Descriptor bytes without `bLength` and `bDescriptorType`
    pub fn payload(&self) -> &[u8] {
        &self.raw[2..]
    }
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
    pub fn children(&self) -> &[DescriptorRecord] {
        &self.children
    }

    fn is_interface(&self) -> bool {
        self.descriptor_type() == INTERFACE_DESC_TYPE
            && self.length() >= INTERFACE_DESC_LEN
    }

    fn is_dfu_interface(&self) -> bool {
        self.is_interface()
            && self.raw[5] == DFU_CLASS
            && self.raw[6] == DFU_SUBCLASS
    }

    fn is_dfu_functional(&self) -> bool {
        self.descriptor_type() == DFU_DESC_TYPE
            && self.length() >= DFU_DESC_LEN
    }
}

/// Decoded configuration descriptor (`bDescriptorType` = 2) with all
/// trailing descriptors arranged as a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    configuration_value: u8,
    num_interfaces: u8,
    attributes: u8,
    max_power: u8,
    descriptors: Vec<DescriptorRecord>,
}

impl ConfigurationDescriptor {
    pub fn configuration_value(&self) -> u8 {
        self.configuration_value
    }
    pub fn num_interfaces(&self) -> u8 {
        self.num_interfaces
    }
    pub fn attributes(&self) -> u8 {
        self.attributes
    }
    pub fn max_power(&self) -> u8 {
        self.max_power
    }
    pub fn descriptors(&self) -> &[DescriptorRecord] {
        &self.descriptors
    }

    /// First DFU functional descriptor attached to a DFU interface.
    ///
    /// DFU 1.0 descriptors without `bcdDFUVersion` are skipped.
    pub fn functional_descriptor(&self) -> Option<DfuDescriptor> {
        self.descriptors
            .iter()
            .filter(|desc| desc.is_dfu_interface())
            .flat_map(|intf| intf.children())
            .find(|desc| desc.is_dfu_functional())
            .map(|desc| DfuDescriptor::new(desc.raw()))
    }
}

/// Decode a raw configuration descriptor, as returned by a
/// `GET_DESCRIPTOR(CONFIGURATION)` request.
pub fn parse_configuration_descriptor(
    data: &[u8],
) -> Result<ConfigurationDescriptor, ParseError> {
    if data.len() < 2 || data[1] != CONFIG_DESC_TYPE {
        return Err(ParseError::NotAConfiguration);
    }
    let header_len = data[0] as usize;
    if header_len < CONFIG_DESC_LEN {
        return Err(ParseError::InvalidLength {
            offset: 0,
            length: header_len,
        });
    }
    if header_len > data.len() {
        return Err(ParseError::Truncated {
            offset: 0,
            length: header_len,
            remaining: data.len(),
        });
    }

    let total_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    if total_len < header_len {
        return Err(ParseError::InvalidLength {
            offset: 0,
            length: total_len,
        });
    }
    if total_len > data.len() {
        return Err(ParseError::Truncated {
            offset: 0,
            length: total_len,
            remaining: data.len(),
        });
    }

    let mut descriptors: Vec<DescriptorRecord> = Vec::new();
    let mut in_interface = false;
    let mut offset = header_len;
    while total_len - offset >= 2 {
        let remaining = total_len - offset;
        let length = data[offset] as usize;
        if length < 2 {
            return Err(ParseError::InvalidLength { offset, length });
        }
        if length > remaining {
            return Err(ParseError::Truncated {
                offset,
                length,
                remaining,
            });
        }

        let record = DescriptorRecord::new(&data[offset..offset + length]);
        if record.is_interface() {
            in_interface = true;
            descriptors.push(record);
        } else if in_interface {
            // in_interface guarantees a last element
            if let Some(intf) = descriptors.last_mut() {
                intf.children.push(record);
            }
        } else {
            descriptors.push(record);
        }
        offset += length;
    }

    Ok(ConfigurationDescriptor {
        configuration_value: data[5],
        num_interfaces: data[4],
        attributes: data[7],
        max_power: data[8],
        descriptors,
    })
}

/// Look up the DFU functional descriptor of the selected configuration.
///
/// `Ok(None)` if the configuration value differs or if no DFU interface
/// carries a functional descriptor.
pub fn find_functional_descriptor(
    data: &[u8],
    configuration_value: u8,
) -> Result<Option<DfuDescriptor>, ParseError> {
    let config = parse_configuration_descriptor(data)?;
    if config.configuration_value() != configuration_value {
        return Ok(None);
    }
    Ok(config.functional_descriptor())
}
