//! USB Device Firmware Upgrade (DFU) implementation based on [`nusb`]
//!
//! Provides a portable, async implementation of the DFU download path with
//! STM32 extensions (aka "DfuSe"): descriptor and memory layout parsing,
//! device discovery, a session over a claimed interface and a download
//! orchestrator that erases, writes and manifests a raw image.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! The following example shows how to obtain a `Vec` of [DfuDevice]:
//! ```no_run
//! use dfu::find_dfu_devices;
//!
//! # async fn example() {
//! match find_dfu_devices(None, None).await {
//!     Ok(devices) => {
//!         if devices.is_empty() {
//!             println!("No DFU devices found");
//!         } else {
//!             println!("Found {} DFU devices", devices.len());
//!         }
//!     }
//!     Err(e) => println!("Error: {e}"),
//! }
//! # }
//! ```
//!
//! Flashing goes through [discover] and [DfuConnection::download_firmware]:
//! ```no_run
//! use dfu::{CancelToken, DfuFilter, DownloadOptions, Selection, discover};
//!
//! # async fn example(image: Vec<u8>) -> Result<(), dfu::DfuError> {
//! let filter = DfuFilter::default().with_vendor_id(0x0483);
//! if let Selection::Found(target) = discover(&filter).await? {
//!     let mut connection = target.connect().await?;
//!     connection.clear_error_state().await;
//!     connection
//!         .download_firmware(
//!             &image,
//!             &DownloadOptions::default(),
//!             &CancelToken::new(),
//!             |done, total| println!("{done}/{total}"),
//!         )
//!         .await?;
//!     connection.close();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;
/// Upper bound for a device to leave a busy state, on top of its own
/// `bwPollTimeout`
pub(crate) const POLL_DEADLINE: Duration = Duration::from_millis(10000u64);

mod connection;
mod descriptor;
mod device;
mod download;
mod error;
mod interface;
mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod signal;
mod status;
mod transport;

use std::time::Duration;

// Re-exports
pub use connection::{
    DFU_PROTOCOL_DFU, DFU_PROTOCOL_RUNTIME, DfuConnection, DfuVariant,
};
pub use descriptor::{
    ConfigurationDescriptor, DFUSE_VERSION_NUMBER, DescriptorRecord,
    DfuDescriptor, find_functional_descriptor, parse_configuration_descriptor,
};
pub use device::{
    Candidate, DeviceIdentity, DfuDevice, DfuFilter, DfuTarget, Selection,
    discover, find_dfu_devices,
};
pub use download::DownloadOptions;
pub use error::{DfuError, ParseError};
pub use interface::{DfuInterface, InterfaceKey, backfill_names};
pub use memory::{DfuMemSegment, DfuMemory, parse_memory_layout};
pub use signal::{CancelToken, Liveness};
pub use status::{DFU_STATUS_OK, DfuState, DfuStatus, status_description};
pub use transport::{DfuTransport, NusbTransport, watch_disconnect};
