use std::{collections::HashMap, num::NonZeroU8, time::Duration};

use log::debug;

use crate::{
    DEFAULT_TIMEOUT,
    descriptor::{DFU_CLASS, DFU_SUBCLASS},
};

/// (configuration value, interface number, alternate setting)
pub type InterfaceKey = (u8, u8, u8);

/// A DFU capable alternate setting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuInterface {
    config: u8,
    interface: u8,
    alt_setting: u8,
    protocol: u8,
    name: Option<String>,
}

impl DfuInterface {
    pub fn new(
        config: u8,
        interface: u8,
        alt_setting: u8,
        protocol: u8,
        name: Option<String>,
    ) -> Self {
        Self {
            config,
            interface,
            alt_setting,
            protocol,
            name,
        }
    }

    pub fn config(&self) -> u8 {
        self.config
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    /// `bInterfaceProtocol`: 1 in runtime mode, 2 in DFU mode
    pub fn protocol(&self) -> u8 {
        self.protocol
    }
    /// Interface string; for DfuSe devices this is the memory layout
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn key(&self) -> InterfaceKey {
        (self.config, self.interface, self.alt_setting)
    }
}

/// Fill in missing interface names from a string table read separately
pub fn backfill_names(
    interfaces: &mut [DfuInterface],
    names: &HashMap<InterfaceKey, String>,
) {
    for intf in interfaces.iter_mut().filter(|intf| intf.name.is_none()) {
        if let Some(name) = names.get(&intf.key()) {
            intf.name = Some(name.clone());
        }
    }
}

/// Read the name of every DFU alternate setting of an opened device
pub(crate) async fn read_interface_names(
    device: &nusb::Device,
) -> HashMap<InterfaceKey, String> {
    let mut names = HashMap::new();
    for configuration in device.configurations() {
        let config = configuration.configuration_value();
        for alt_setting in configuration.interface_alt_settings() {
            if alt_setting.class() != DFU_CLASS
                || alt_setting.subclass() != DFU_SUBCLASS
            {
                continue;
            }
            let Some(idx) = alt_setting.string_index() else {
                continue;
            };
            let key = (
                config,
                alt_setting.interface_number(),
                alt_setting.alternate_setting(),
            );
            match get_string_descriptor(device, idx, DEFAULT_TIMEOUT).await {
                Some(name) => {
                    names.insert(key, name);
                }
                None => debug!("No string descriptor for {key:?}"),
            }
        }
    }
    names
}

async fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .await
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .await
        .ok()
}
