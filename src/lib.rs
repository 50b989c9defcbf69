//! Flash a raw firmware image onto a DFU / DfuSe device in one call.
//!
//! The image is supplied by the caller; fetching it is not this crate's
//! concern.

use log::{info, warn};

use dfu::{
    CancelToken, DfuConnection, DfuError, DfuFilter, DfuTarget, DfuTransport,
    DownloadOptions, Selection, discover,
};

/// STMicroelectronics
pub const DEFAULT_VENDOR_ID: u16 = 0x0483;

#[derive(Clone, Debug)]
pub struct FlashOptions {
    pub filter: DfuFilter,
    pub download: DownloadOptions,
}

impl Default for FlashOptions {
    fn default() -> Self {
        FlashOptions {
            filter: DfuFilter::default().with_vendor_id(DEFAULT_VENDOR_ID),
            download: DownloadOptions::default(),
        }
    }
}

#[derive(Debug)]
pub enum FlashOutcome {
    /// Nothing matched the filter; poll again later
    NoDevice,
    /// More than one interface matched, narrow down the filter
    Ambiguous(Vec<DfuTarget>),
    Flashed { bytes: usize },
}

/// Discover a single target, connect and flash `data`.
///
/// The session is closed before returning, whatever the outcome.
pub async fn flash_firmware(
    data: &[u8],
    options: &FlashOptions,
    cancel: &CancelToken,
    progress: impl FnMut(usize, usize),
) -> Result<FlashOutcome, DfuError> {
    let target = match discover(&options.filter).await? {
        Selection::NotFound => return Ok(FlashOutcome::NoDevice),
        Selection::Ambiguous(targets) => {
            return Ok(FlashOutcome::Ambiguous(targets));
        }
        Selection::Found(target) => target,
    };

    let mut connection = target.connect().await?;
    let result =
        flash_connection(&connection, data, &options.download, cancel, progress)
            .await;
    connection.close();
    result?;
    Ok(FlashOutcome::Flashed { bytes: data.len() })
}

/// Clear a leftover error state, then download `data` over an open session
pub async fn flash_connection<T: DfuTransport>(
    connection: &DfuConnection<T>,
    data: &[u8],
    options: &DownloadOptions,
    cancel: &CancelToken,
    progress: impl FnMut(usize, usize),
) -> Result<(), DfuError> {
    connection.clear_error_state().await;
    match connection
        .download_firmware(data, options, cancel, progress)
        .await
    {
        Ok(()) => {
            info!("Flashed {} bytes", data.len());
            Ok(())
        }
        Err(err) => {
            warn!("Download failed: {err}");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfu::{
        DFU_PROTOCOL_DFU, DeviceIdentity, DfuDescriptor, DfuInterface, DfuState,
        Liveness, find_functional_descriptor, mock::MockTransport,
    };

    const DFU_CMD_DOWNLOAD: u8 = 1;
    const DFU_CMD_GETSTATUS: u8 = 3;
    const DFU_CMD_CLRSTATUS: u8 = 4;

    const FLASH_LAYOUT: &str =
        "@Internal Flash  /0x08000000/16*01Kg/0x1FFF0000/32*01Ka";

    fn dfuse_descriptor() -> DfuDescriptor {
        let data: &[u8] = &[
            // configuration
            9, 0x02, 27, 0, 1, 1, 0, 0xC0, 50,
            // interface, DFU mode
            9, 0x04, 0, 0, 0, 0xFE, 0x01, 0x02, 4,
            // functional, bcdDFUVersion 0x011a
            9, 0x21, 0x0B, 0xFF, 0x00, 0x00, 0x08, 0x1A, 0x01,
        ];
        find_functional_descriptor(data, 1).unwrap().unwrap()
    }

    fn connection(
        transport: &MockTransport,
        layout: &str,
    ) -> DfuConnection<MockTransport> {
        let interface =
            DfuInterface::new(1, 0, 0, DFU_PROTOCOL_DFU, Some(layout.into()));
        let identity = DeviceIdentity {
            vendor_id: 0x0483,
            product_id: 0xdf11,
            ..Default::default()
        };
        DfuConnection::new(
            transport.clone(),
            identity,
            interface,
            Some(dfuse_descriptor()),
            Liveness::new(),
        )
    }

    #[test]
    fn test_default_options() {
        let options = FlashOptions::default();
        assert_eq!(options.filter.vendor_id, Some(DEFAULT_VENDOR_ID));
        assert_eq!(options.download.block_size, 2048);
        assert!(options.download.manifest);
    }

    #[test]
    fn test_start_address() {
        let connection = connection(&MockTransport::new(), FLASH_LAYOUT);
        let memory = connection.memory().unwrap();
        assert_eq!(
            memory.first_writable_segment().map(|s| s.start_addr()),
            Some(0x08000000)
        );
        assert_eq!(connection.start_address(), Some(0x08000000));
    }

    #[tokio::test]
    async fn test_clear_status_before_first_chunk() {
        let transport = MockTransport::new();
        transport.queue_status(DfuState::Error, 0x0a, 0);
        let connection = connection(&transport, FLASH_LAYOUT);
        let mut reports = Vec::new();

        flash_connection(
            &connection,
            &[0x55; 5000],
            &DownloadOptions::default(),
            &CancelToken::new(),
            |done, total| reports.push((done, total)),
        )
        .await
        .unwrap();

        let requests: Vec<u8> =
            transport.requests().iter().map(|r| r.request).collect();
        assert_eq!(
            &requests[..3],
            &[DFU_CMD_GETSTATUS, DFU_CMD_CLRSTATUS, DFU_CMD_DOWNLOAD]
        );
        let first_chunk = transport
            .requests()
            .iter()
            .position(|r| r.request == DFU_CMD_DOWNLOAD && r.value >= 2)
            .unwrap();
        assert!(first_chunk > 2);
        assert_eq!(transport.count(DFU_CMD_CLRSTATUS), 1);
        assert_eq!(reports, vec![(2048, 5000), (4096, 5000), (5000, 5000)]);
    }

    #[tokio::test]
    async fn test_clear_failure_does_not_block_download() {
        let transport = MockTransport::new();
        transport.queue_status(DfuState::Error, 0x0a, 0);
        transport.fail_request(DFU_CMD_CLRSTATUS);
        let connection = connection(&transport, FLASH_LAYOUT);

        flash_connection(
            &connection,
            &[0xAA; 100],
            &DownloadOptions::default(),
            &CancelToken::new(),
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(transport.downloads().concat(), vec![0xAA; 100]);
    }

    #[tokio::test]
    async fn test_no_writable_region_is_reported() {
        let transport = MockTransport::new();
        let connection =
            connection(&transport, "@Option Bytes  /0x1FFFC000/01*016 a");
        let result = flash_connection(
            &connection,
            &[0; 16],
            &DownloadOptions::default(),
            &CancelToken::new(),
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(DfuError::NoWritableRegion)));
        assert!(transport.downloads().is_empty());
    }
}
