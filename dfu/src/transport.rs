use std::future::Future;

use futures_lite::StreamExt;
use log::{debug, warn};
use nusb::{
    hotplug::HotplugEvent,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::{DEFAULT_TIMEOUT, DfuError, Liveness};

/// Class-specific control requests addressed to the claimed DFU interface.
///
/// [NusbTransport] talks to real hardware; the `mock` feature adds a
/// scripted transport for tests.
pub trait DfuTransport {
    fn control_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> impl Future<Output = Result<Vec<u8>, DfuError>> + Send;

    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> impl Future<Output = Result<(), DfuError>> + Send;
}

pub struct NusbTransport {
    interface: nusb::Interface,
}

impl NusbTransport {
    pub(crate) fn new(interface: nusb::Interface) -> Self {
        NusbTransport { interface }
    }
}

impl DfuTransport for NusbTransport {
    async fn control_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .await?)
    }

    async fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .await?)
    }
}

/// Invalidate `liveness` as soon as the device identified by `device_id`
/// is unplugged.
///
/// Fails with [DfuError::NoRuntime] outside a tokio runtime. Aborting the
/// returned handle stops watching.
pub fn watch_disconnect(
    device_id: nusb::DeviceId,
    liveness: Liveness,
) -> Result<tokio::task::JoinHandle<()>, DfuError> {
    let runtime = current_runtime()?;
    let mut watch = nusb::watch_devices()?;
    Ok(runtime.spawn(async move {
        while let Some(event) = watch.next().await {
            if let HotplugEvent::Disconnected(id) = event {
                if id == device_id {
                    warn!("Device disconnected");
                    liveness.invalidate();
                    break;
                }
                debug!("Ignoring disconnect of another device");
            }
        }
    }))
}

pub(crate) fn current_runtime() -> Result<tokio::runtime::Handle, DfuError> {
    tokio::runtime::Handle::try_current().map_err(|_| DfuError::NoRuntime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_runtime() {
        assert!(matches!(current_runtime(), Err(DfuError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_runtime() {
        assert!(current_runtime().is_ok());
    }
}
