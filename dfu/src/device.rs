use log::{debug, info, warn};

use crate::{
    DfuConnection, DfuDescriptor, DfuError, Liveness,
    descriptor::{DFU_CLASS, DFU_SUBCLASS, find_functional_descriptor},
    interface::*,
    transport::{NusbTransport, current_runtime, watch_disconnect},
};

/// Identity of a USB device as seen during enumeration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product_string: Option<String>,
    pub manufacturer_string: Option<String>,
}

impl DeviceIdentity {
    fn from_device_info(dev: &nusb::DeviceInfo) -> Self {
        DeviceIdentity {
            vendor_id: dev.vendor_id(),
            product_id: dev.product_id(),
            serial_number: dev.serial_number().map(String::from),
            product_string: dev.product_string().map(String::from),
            manufacturer_string: dev.manufacturer_string().map(String::from),
        }
    }
}

/// DFU device representation
#[derive(Clone, Debug)]
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    identity: DeviceIdentity,
    interfaces: Vec<DfuInterface>,
}

/// A single DFU interface / alternate setting of a device, as produced by
/// [discover]
#[derive(Clone, Debug)]
pub struct DfuTarget {
    device: DfuDevice,
    interface: DfuInterface,
}

/// Something that can be matched by a [DfuFilter]
pub trait Candidate {
    fn identity(&self) -> &DeviceIdentity;
    fn interface(&self) -> &DfuInterface;
}

/// Outcome of a discovery
#[derive(Debug)]
pub enum Selection<C> {
    /// Nothing matched; not an error
    NotFound,
    Found(C),
    /// More than one match. The caller has to narrow the filter down.
    Ambiguous(Vec<C>),
}

impl<C> Selection<C> {
    pub fn found(self) -> Option<C> {
        match self {
            Selection::Found(c) => Some(c),
            _ => None,
        }
    }
}

/// Device matching rules.
///
/// A serial number takes precedence over the vendor ID. Interface number
/// and alternate setting narrow down devices exposing several DFU
/// interfaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DfuFilter {
    pub vendor_id: Option<u16>,
    pub serial_number: Option<String>,
    pub interface: Option<u8>,
    pub alt_setting: Option<u8>,
}

impl DfuFilter {
    pub fn with_vendor_id(mut self, vid: u16) -> Self {
        self.vendor_id.replace(vid);
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number.replace(serial.into());
        self
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface.replace(interface);
        self
    }

    pub fn with_alt_setting(mut self, alt_setting: u8) -> Self {
        self.alt_setting.replace(alt_setting);
        self
    }

    pub fn matches(
        &self,
        identity: &DeviceIdentity,
        intf: &DfuInterface,
    ) -> bool {
        let device_match = match &self.serial_number {
            Some(serial) => {
                identity.serial_number.as_deref() == Some(serial.as_str())
            }
            None => self.vendor_id.is_none_or(|vid| identity.vendor_id == vid),
        };
        device_match
            && self.interface.is_none_or(|n| intf.interface() == n)
            && self.alt_setting.is_none_or(|alt| intf.alt_setting() == alt)
    }

    /// Never picks one of several matches on its own
    pub fn select<C: Candidate>(&self, candidates: Vec<C>) -> Selection<C> {
        let mut matching: Vec<C> = candidates
            .into_iter()
            .filter(|c| self.matches(c.identity(), c.interface()))
            .collect();
        match matching.len() {
            0 => Selection::NotFound,
            1 => Selection::Found(matching.remove(0)),
            _ => Selection::Ambiguous(matching),
        }
    }
}

impl DfuDevice {
    async fn from_device_info(
        device: nusb::DeviceInfo,
    ) -> Result<Option<Self>, DfuError> {
        let open_dev: nusb::Device = device.open().await?;
        let dfu_interfaces: Vec<DfuInterface> = open_dev
            .configurations()
            .flat_map(|configuration| {
                let config = configuration.configuration_value();
                let device = &device;
                configuration.interface_alt_settings().filter_map(
                    move |alt_setting| {
                        if alt_setting.class() != DFU_CLASS
                            || alt_setting.subclass() != DFU_SUBCLASS
                        {
                            None
                        } else {
                            Some(DfuInterface::new(
                                config,
                                alt_setting.interface_number(),
                                alt_setting.alternate_setting(),
                                alt_setting.protocol(),
                                cached_interface_name(
                                    device,
                                    alt_setting.interface_number(),
                                    alt_setting.alternate_setting(),
                                ),
                            ))
                        }
                    },
                )
            })
            .collect();

        if dfu_interfaces.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DfuDevice {
                identity: DeviceIdentity::from_device_info(&device),
                dev: device,
                interfaces: dfu_interfaces,
            }))
        }
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.dev
    }

    pub fn id(&self) -> nusb::DeviceId {
        self.dev.id()
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.identity.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.identity.product_id
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.identity.serial_number.as_deref()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &Vec<DfuInterface> {
        &self.interfaces
    }

    /// One [DfuTarget] per DFU interface
    pub fn into_targets(self) -> Vec<DfuTarget> {
        self.interfaces
            .iter()
            .map(|intf| DfuTarget {
                device: self.clone(),
                interface: intf.clone(),
            })
            .collect()
    }

    /// Some platforms do not report interface strings during enumeration.
    /// Open the device once more and read them from the device itself.
    pub async fn fix_interface_names(&mut self) -> Result<(), DfuError> {
        if self.interfaces.iter().all(|intf| intf.name().is_some()) {
            return Ok(());
        }
        debug!("Reading interface names from device");
        let open_dev = self.dev.open().await?;
        let names = read_interface_names(&open_dev).await;
        backfill_names(&mut self.interfaces, &names);
        Ok(())
    }

    /// Query the DFU functional descriptor of the first DFU configuration.
    pub async fn dfu_descriptor(
        &self,
    ) -> Result<Option<DfuDescriptor>, DfuError> {
        let config = match self.interfaces.first() {
            Some(intf) => intf.config(),
            None => return Ok(None),
        };
        let open_dev = self.dev.open().await?;
        Ok(read_functional_descriptor(&open_dev, config))
    }

    pub async fn is_dfuse(&self) -> bool {
        matches!(self.dfu_descriptor().await, Ok(Some(desc)) if desc.is_dfuse())
    }

    /// Connect to the DFU interface
    ///
    /// Claims the interface exclusively; fails with [DfuError::Connection]
    /// if it is already claimed or cannot be accessed.
    ///
    /// The session watches for hotplug events and polls status on tokio:
    /// outside a tokio runtime this fails with [DfuError::NoRuntime].
    pub async fn connect(
        &self,
        interface: &DfuInterface,
    ) -> Result<DfuConnection, DfuError> {
        current_runtime()?;
        let dev = self.dev.open().await.map_err(DfuError::Connection)?;

        let active = dev
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active != Some(interface.config()) {
            dev.set_configuration(interface.config())
                .await
                .map_err(DfuError::Connection)?;
        }
        let descriptor = read_functional_descriptor(&dev, interface.config());

        let intf = dev
            .claim_interface(interface.interface())
            .await
            .map_err(DfuError::Connection)?;
        intf.set_alt_setting(interface.alt_setting())
            .await
            .map_err(DfuError::Connection)?;

        let liveness = Liveness::new();
        let connection = DfuConnection::new(
            NusbTransport::new(intf),
            self.identity.clone(),
            interface.clone(),
            descriptor,
            liveness.clone(),
        );
        Ok(match watch_disconnect(self.id(), liveness) {
            Ok(watcher) => connection.with_watcher(watcher),
            Err(err) => {
                warn!("Unable to watch for disconnection: {err}");
                connection
            }
        })
    }
}

impl DfuTarget {
    pub fn device(&self) -> &DfuDevice {
        &self.device
    }

    pub fn interface(&self) -> &DfuInterface {
        &self.interface
    }

    /// Resolve missing interface names and refresh this target's copy
    pub async fn fix_interface_names(&mut self) -> Result<(), DfuError> {
        self.device.fix_interface_names().await?;
        let key = self.interface.key();
        let interfaces = self.device.interfaces();
        if let Some(intf) = interfaces.iter().find(|i| i.key() == key) {
            self.interface = intf.clone();
        }
        Ok(())
    }

    pub async fn connect(&self) -> Result<DfuConnection, DfuError> {
        self.device.connect(&self.interface).await
    }
}

impl Candidate for DfuTarget {
    fn identity(&self) -> &DeviceIdentity {
        self.device.identity()
    }

    fn interface(&self) -> &DfuInterface {
        &self.interface
    }
}

fn cached_interface_name(
    dev: &nusb::DeviceInfo,
    interface: u8,
    alt_setting: u8,
) -> Option<String> {
    if alt_setting != 0 {
        return None;
    }
    dev.interfaces()
        .find(|i| i.interface_number() == interface)?
        .interface_string()
        .map(String::from)
}

fn read_functional_descriptor(
    dev: &nusb::Device,
    config: u8,
) -> Option<DfuDescriptor> {
    let configuration = dev
        .configurations()
        .find(|c| c.configuration_value() == config)?;
    functional_descriptor_of(&configuration)
}

fn functional_descriptor_of(
    configuration: &nusb::descriptors::ConfigurationDescriptor<'_>,
) -> Option<DfuDescriptor> {
    match find_functional_descriptor(
        configuration.as_bytes(),
        configuration.configuration_value(),
    ) {
        Ok(desc) => desc,
        Err(err) => {
            warn!("Unable to parse configuration descriptor: {err}");
            None
        }
    }
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// List the DFU capable devices accessible to this process
pub async fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .await?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut dfu_devices = Vec::with_capacity(devices.len());
    for device in devices {
        let id = (device.vendor_id(), device.product_id());
        match DfuDevice::from_device_info(device).await {
            Ok(Some(dfu_device)) => dfu_devices.push(dfu_device),
            Ok(None) => {}
            Err(err) => {
                warn!("Skipping device {:04x}:{:04x}: {err}", id.0, id.1)
            }
        }
    }
    Ok(dfu_devices)
}

/// Enumerate every DFU interface and match it against `filter`.
///
/// Interface names of a single match are resolved before returning.
pub async fn discover(
    filter: &DfuFilter,
) -> Result<Selection<DfuTarget>, DfuError> {
    let vid = match filter.serial_number {
        Some(_) => None,
        None => filter.vendor_id,
    };
    let candidates: Vec<DfuTarget> = find_dfu_devices(vid, None)
        .await?
        .into_iter()
        .flat_map(DfuDevice::into_targets)
        .collect();

    Ok(match filter.select(candidates) {
        Selection::NotFound => {
            info!("No device found.");
            Selection::NotFound
        }
        Selection::Found(mut target) => {
            target.fix_interface_names().await?;
            Selection::Found(target)
        }
        Selection::Ambiguous(targets) => {
            info!("Multiple DFU interfaces found.");
            Selection::Ambiguous(targets)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{
        DFU_INTERFACE, DFUSE_FUNCTIONAL, config_bytes,
    };

    #[test]
    fn test_functional_descriptor_of_device_configuration() {
        let data = config_bytes(1, &[&DFU_INTERFACE, &DFUSE_FUNCTIONAL]);
        let configuration =
            nusb::descriptors::ConfigurationDescriptor::new(&data).unwrap();

        let desc = functional_descriptor_of(&configuration).unwrap();
        assert!(desc.is_dfuse());
        assert_eq!(desc.transfer_size(), 2048);
        assert!(!desc.manifestation_tolerant());

        let data = config_bytes(2, &[&DFU_INTERFACE]);
        let configuration =
            nusb::descriptors::ConfigurationDescriptor::new(&data).unwrap();
        assert_eq!(functional_descriptor_of(&configuration), None);
    }

    struct TestCandidate {
        identity: DeviceIdentity,
        interface: DfuInterface,
    }

    impl Candidate for TestCandidate {
        fn identity(&self) -> &DeviceIdentity {
            &self.identity
        }
        fn interface(&self) -> &DfuInterface {
            &self.interface
        }
    }

    fn candidate(vid: u16, serial: &str, alt: u8) -> TestCandidate {
        TestCandidate {
            identity: DeviceIdentity {
                vendor_id: vid,
                product_id: 0xdf11,
                serial_number: Some(serial.into()),
                ..Default::default()
            },
            interface: DfuInterface::new(1, 0, alt, 2, None),
        }
    }

    #[test]
    fn test_no_match() {
        let filter = DfuFilter::default().with_vendor_id(0x0483);
        let selection = filter.select(vec![candidate(0x1209, "A", 0)]);
        assert!(matches!(selection, Selection::NotFound));
        let selection = filter.select(Vec::<TestCandidate>::new());
        assert!(matches!(selection, Selection::NotFound));
    }

    #[test]
    fn test_single_match() {
        let filter = DfuFilter::default().with_vendor_id(0x0483);
        let selection = filter.select(vec![
            candidate(0x1209, "A", 0),
            candidate(0x0483, "B", 0),
        ]);
        let found = selection.found().unwrap();
        assert_eq!(found.identity.serial_number.as_deref(), Some("B"));
    }

    #[test]
    fn test_ambiguous() {
        let filter = DfuFilter::default().with_vendor_id(0x0483);
        let selection = filter.select(vec![
            candidate(0x0483, "A", 0),
            candidate(0x0483, "B", 0),
        ]);
        match selection {
            Selection::Ambiguous(c) => assert_eq!(c.len(), 2),
            _ => panic!("expected an ambiguous selection"),
        }
    }

    #[test]
    fn test_serial_takes_precedence() {
        // vendor ID is ignored once a serial number is given
        let filter = DfuFilter::default()
            .with_vendor_id(0x1209)
            .with_serial_number("B");
        let selection = filter.select(vec![
            candidate(0x0483, "A", 0),
            candidate(0x0483, "B", 0),
        ]);
        assert_eq!(selection.found().unwrap().identity.vendor_id, 0x0483);
    }

    #[test]
    fn test_alt_setting_disambiguates() {
        let candidates =
            || vec![candidate(0x0483, "A", 0), candidate(0x0483, "A", 1)];
        let filter = DfuFilter::default().with_vendor_id(0x0483);
        assert!(matches!(filter.select(candidates()), Selection::Ambiguous(_)));

        let filter = filter.with_alt_setting(1);
        let found = filter.select(candidates()).found().unwrap();
        assert_eq!(found.interface.alt_setting(), 1);
    }
}
