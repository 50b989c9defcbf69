use log::{debug, info, warn};

use crate::{
    CancelToken, DfuConnection, DfuError, DfuMemory, DfuState,
    transport::DfuTransport,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Bytes per `DFU_DNLOAD` request
    pub block_size: usize,
    /// Run the manifestation phase after the last block
    pub manifest: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            block_size: crate::DEFAULT_TRANSFER_SIZE as usize,
            manifest: true,
        }
    }
}

impl<T: DfuTransport> DfuConnection<T> {
    /// Flash `data` to the start of the first writable segment.
    ///
    /// `progress` is called with `(bytes_done, bytes_total)` after every
    /// acknowledged block. `cancel` is checked between blocks; a block in
    /// flight always runs to completion.
    ///
    /// Status polling sleeps on the tokio timer, so this must run inside a
    /// tokio runtime with the time driver enabled.
    pub async fn download_firmware(
        &self,
        data: &[u8],
        options: &DownloadOptions,
        cancel: &CancelToken,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), DfuError> {
        if options.block_size == 0 {
            return Err(DfuError::InvalidBlockSize);
        }
        let memory = self.memory().ok_or(DfuError::NoWritableRegion)?;
        let start_address = memory
            .first_writable_segment()
            .ok_or(DfuError::NoWritableRegion)?
            .start_addr();
        let total = data.len();
        if total as u64 > memory.max_writable_run(start_address) as u64 {
            return Err(DfuError::OutOfRange {
                address: start_address,
                length: total,
            });
        }

        self.erase(memory, start_address, total as u32).await?;

        info!("Copying {total} bytes to 0x{start_address:08x}");
        let mut address = start_address;
        let mut bytes_sent: usize = 0;
        for (block_nr, chunk) in data.chunks(options.block_size).enumerate() {
            self.liveness().check()?;
            if cancel.is_cancelled() {
                warn!("Download cancelled after {bytes_sent} bytes");
                if let Err(err) = self.abort().await {
                    warn!("Failed to abort: {err}");
                }
                return Err(DfuError::Cancelled);
            }

            debug!(
                "Block {}: {} bytes @ 0x{:08x}",
                block_nr,
                chunk.len(),
                address
            );
            self.download(address, chunk).await?;
            address += chunk.len() as u32;
            bytes_sent += chunk.len();
            progress(bytes_sent, total);
        }
        info!("Wrote {bytes_sent} bytes");

        if options.manifest {
            self.manifest(start_address).await?;
        }
        Ok(())
    }

    async fn erase(
        &self,
        memory: &DfuMemory,
        start_address: u32,
        length: u32,
    ) -> Result<(), DfuError> {
        let pages = memory.erase_pages(start_address, length);
        if pages.is_empty() {
            return Ok(());
        }
        info!("Erasing {} pages", pages.len());
        for (n, page_addr) in pages.iter().enumerate() {
            debug!(
                "Erasing page {:2} of {:2} @ 0x{:08x}",
                n + 1,
                pages.len(),
                page_addr
            );
            self.dfuse_page_erase(*page_addr).await?;
        }
        Ok(())
    }

    /// Devices that are not manifestation tolerant may reset once the
    /// zero-length download is sent. Losing them from that point on counts
    /// as success.
    async fn manifest(&self, start_address: u32) -> Result<(), DfuError> {
        info!("Manifesting new firmware");
        let tolerant = self
            .descriptor()
            .is_some_and(|desc| desc.manifestation_tolerant());

        self.dfuse_set_address(start_address).await?;
        match self.dfu_dnload_final(0).await {
            Ok(()) => {}
            Err(DfuError::Disconnected) if !tolerant => {
                info!("Device reset during manifestation");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let result = self
            .poll_until(|state| {
                matches!(state, DfuState::DfuIdle | DfuState::ManifestWaitReset)
            })
            .await;
        match result {
            Ok(st) => st.ok(),
            Err(err @ (DfuError::Disconnected | DfuError::Transfer(_)))
                if !tolerant =>
            {
                info!("Device reset during manifestation ({err})");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DfuDescriptor, DfuInterface, Liveness,
        connection::{
            DFU_CMD_ABORT, DFU_CMD_DOWNLOAD, DFU_CMD_GETSTATUS,
            DFU_PROTOCOL_DFU, DFUSE_CMD_ADDR, DFUSE_CMD_ERASE,
            tests::{FLASH_LAYOUT, dfuse_connection, identity},
        },
        descriptor::{
            find_functional_descriptor,
            tests::{DFU_INTERFACE, config_bytes},
        },
        mock::MockTransport,
    };

    const SRAM_LAYOUT: &str = "@SRAM /0x20000000/16*01Kd";

    fn firmware(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn mock(connection: &DfuConnection<MockTransport>) -> &MockTransport {
        connection.transport_ref()
    }

    fn tolerant_descriptor() -> DfuDescriptor {
        let functional = [9, 0x21, 0x0F, 0xFF, 0x00, 0x00, 0x08, 0x1A, 0x01];
        let data = config_bytes(1, &[&DFU_INTERFACE, &functional]);
        find_functional_descriptor(&data, 1).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_download_chunks_and_progress() {
        let connection = dfuse_connection(FLASH_LAYOUT, MockTransport::new());
        let data = firmware(5000);
        let mut reports = Vec::new();

        connection
            .download_firmware(
                &data,
                &DownloadOptions::default(),
                &CancelToken::new(),
                |done, total| reports.push((done, total)),
            )
            .await
            .unwrap();

        let blocks = mock(&connection).downloads();
        let sizes: Vec<usize> = blocks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2048, 2048, 904]);
        assert_eq!(blocks.concat(), data);
        assert_eq!(reports, vec![(2048, 5000), (4096, 5000), (5000, 5000)]);
    }

    #[tokio::test]
    async fn test_download_sequence() {
        let connection = dfuse_connection(FLASH_LAYOUT, MockTransport::new());
        connection
            .download_firmware(
                &firmware(3000),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await
            .unwrap();

        let commands: Vec<Vec<u8>> = mock(&connection)
            .requests()
            .into_iter()
            .filter(|r| r.request == DFU_CMD_DOWNLOAD && r.value == 0)
            .map(|r| r.data)
            .collect();
        let erase = |addr: u32| {
            let mut cmd = vec![DFUSE_CMD_ERASE];
            cmd.extend_from_slice(&addr.to_le_bytes());
            cmd
        };
        let set_address = |addr: u32| {
            let mut cmd = vec![DFUSE_CMD_ADDR];
            cmd.extend_from_slice(&addr.to_le_bytes());
            cmd
        };
        assert_eq!(
            commands,
            vec![
                erase(0x08000000),
                erase(0x08000400),
                erase(0x08000800),
                set_address(0x08000000),
                set_address(0x08000800),
                // manifestation
                set_address(0x08000000),
                vec![],
            ]
        );
    }

    #[tokio::test]
    async fn test_block_sizes() {
        let cases = [(0, 1), (1, 1), (17, 4), (1024, 1024), (1025, 1024)];
        for (len, block_size) in cases {
            let connection =
                dfuse_connection(SRAM_LAYOUT, MockTransport::new());
            let data = firmware(len);
            let options = DownloadOptions {
                block_size,
                manifest: false,
            };
            let cancel = CancelToken::new();
            connection
                .download_firmware(&data, &options, &cancel, |_, _| {})
                .await
                .unwrap();

            let blocks = mock(&connection).downloads();
            assert_eq!(blocks.len(), len.div_ceil(block_size));
            assert!(blocks.iter().all(|b| b.len() <= block_size));
            assert_eq!(blocks.concat(), data);
        }
    }

    #[tokio::test]
    async fn test_empty_firmware() {
        let connection = dfuse_connection(FLASH_LAYOUT, MockTransport::new());
        let mut calls = 0;
        let options = DownloadOptions {
            manifest: false,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        connection
            .download_firmware(&[], &options, &cancel, |_, _| calls += 1)
            .await
            .unwrap();
        assert_eq!(calls, 0);
        assert!(mock(&connection).requests().is_empty());
    }

    #[tokio::test]
    async fn test_error_stops_download() {
        let transport = MockTransport::new();
        // first block: set address + data
        transport.queue_status(DfuState::DnloadIdle, 0, 0);
        transport.queue_status(DfuState::DnloadIdle, 0, 0);
        // second block fails
        transport.queue_status(DfuState::DnloadIdle, 0, 0);
        transport.queue_status(DfuState::Error, 0x03, 0);
        let connection = dfuse_connection(SRAM_LAYOUT, transport);
        let mut reports = Vec::new();

        let result = connection
            .download_firmware(
                &firmware(5000),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |done, total| reports.push((done, total)),
            )
            .await;

        assert!(matches!(result, Err(DfuError::Download { status: 0x03 })));
        assert_eq!(reports, vec![(2048, 5000)]);
        assert_eq!(mock(&connection).downloads().len(), 2);
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn test_no_writable_region() {
        let connection = dfuse_connection(
            "@System /0x1FFF0000/32*01Ka",
            MockTransport::new(),
        );
        let result = connection
            .download_firmware(
                &firmware(16),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(DfuError::NoWritableRegion)));
        assert!(mock(&connection).requests().is_empty());

        // plain DFU never has a memory map
        let interface = DfuInterface::new(1, 0, 0, DFU_PROTOCOL_DFU, None);
        let connection = DfuConnection::new(
            MockTransport::new(),
            identity(),
            interface,
            None,
            Liveness::new(),
        );
        let result = connection
            .download_firmware(
                &firmware(16),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(DfuError::NoWritableRegion)));
    }

    #[tokio::test]
    async fn test_image_too_large() {
        let connection = dfuse_connection(FLASH_LAYOUT, MockTransport::new());
        let result = connection
            .download_firmware(
                &firmware(16 * 1024 + 1),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await;
        assert!(matches!(
            result,
            Err(DfuError::OutOfRange {
                address: 0x08000000,
                length: 16385
            })
        ));
    }

    #[tokio::test]
    async fn test_invalid_block_size() {
        let connection = dfuse_connection(FLASH_LAYOUT, MockTransport::new());
        let options = DownloadOptions {
            block_size: 0,
            manifest: true,
        };
        let cancel = CancelToken::new();
        let result = connection
            .download_firmware(&firmware(16), &options, &cancel, |_, _| {})
            .await;
        assert!(matches!(result, Err(DfuError::InvalidBlockSize)));
    }

    #[tokio::test]
    async fn test_cancel_between_blocks() {
        let connection = dfuse_connection(SRAM_LAYOUT, MockTransport::new());
        let cancel = CancelToken::new();

        let result = connection
            .download_firmware(
                &firmware(5000),
                &DownloadOptions::default(),
                &cancel,
                |_, _| cancel.cancel(),
            )
            .await;

        assert!(matches!(result, Err(DfuError::Cancelled)));
        assert_eq!(mock(&connection).downloads().len(), 1);
        assert_eq!(mock(&connection).count(DFU_CMD_ABORT), 1);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_download() {
        let connection = dfuse_connection(SRAM_LAYOUT, MockTransport::new());
        let liveness = connection.liveness().clone();

        let result = connection
            .download_firmware(
                &firmware(5000),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| liveness.invalidate(),
            )
            .await;

        assert!(matches!(result, Err(DfuError::Disconnected)));
        assert_eq!(mock(&connection).downloads().len(), 1);
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn test_reset_during_manifestation() {
        let transport = MockTransport::new();
        transport.disconnect_on_manifest();
        let connection = dfuse_connection(FLASH_LAYOUT, transport);

        connection
            .download_firmware(
                &firmware(100),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await
            .unwrap();
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn test_tolerant_device_must_not_disconnect() {
        let transport = MockTransport::new();
        transport.disconnect_on_manifest();
        let connection = tolerant_connection(transport);

        let result = connection
            .download_firmware(
                &firmware(100),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(DfuError::Disconnected)));
    }

    #[tokio::test]
    async fn test_manifestation_error() {
        let transport = MockTransport::new();
        let connection = dfuse_connection(SRAM_LAYOUT, transport);
        let options = DownloadOptions {
            block_size: 64,
            manifest: false,
        };
        let cancel = CancelToken::new();
        connection
            .download_firmware(&firmware(64), &options, &cancel, |_, _| {})
            .await
            .unwrap();

        // set address, then manifestation polling
        let transport = mock(&connection);
        transport.queue_status(DfuState::DnloadIdle, 0, 0);
        transport.queue_status(DfuState::ManifestSync, 0, 0);
        transport.queue_status(DfuState::Manifest, 0, 1);
        transport.queue_status(DfuState::Error, 0x0a, 0);
        let result = connection.manifest(0x20000000).await;
        assert!(matches!(result, Err(DfuError::Download { status: 0x0a })));
    }

    fn tolerant_connection(
        transport: MockTransport,
    ) -> DfuConnection<MockTransport> {
        let interface = DfuInterface::new(
            1,
            0,
            0,
            DFU_PROTOCOL_DFU,
            Some(FLASH_LAYOUT.into()),
        );
        DfuConnection::new(
            transport,
            identity(),
            interface,
            Some(tolerant_descriptor()),
            Liveness::new(),
        )
    }

    fn zero_length_downloads(transport: &MockTransport) -> usize {
        transport
            .requests()
            .iter()
            .filter(|r| r.request == DFU_CMD_DOWNLOAD && r.data.is_empty())
            .count()
    }

    #[tokio::test]
    async fn test_manifestation_states() {
        let transport = MockTransport::new();
        // set address
        transport.queue_status(DfuState::DnloadIdle, 0, 0);
        transport.queue_status(DfuState::ManifestSync, 0, 0);
        transport.queue_status(DfuState::Manifest, 0, 1);
        transport.queue_status(DfuState::DfuIdle, 0, 0);
        let connection = dfuse_connection(SRAM_LAYOUT, transport.clone());

        connection.manifest(0x20000000).await.unwrap();
        let requests: Vec<u8> =
            transport.requests().iter().map(|r| r.request).collect();
        assert_eq!(
            requests,
            vec![
                DFU_CMD_DOWNLOAD,
                DFU_CMD_GETSTATUS,
                DFU_CMD_DOWNLOAD,
                DFU_CMD_GETSTATUS,
                DFU_CMD_GETSTATUS,
                DFU_CMD_GETSTATUS,
            ]
        );
        assert_eq!(zero_length_downloads(&transport), 1);
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn test_manifest_wait_reset() {
        let transport = MockTransport::new();
        transport.queue_status(DfuState::DnloadIdle, 0, 0);
        transport.queue_status(DfuState::ManifestSync, 0, 0);
        transport.queue_status(DfuState::ManifestWaitReset, 0, 0);
        // never reached
        transport.queue_status(DfuState::Error, 0x0e, 0);
        let connection = tolerant_connection(transport.clone());

        connection.manifest(0x08000000).await.unwrap();
        assert_eq!(transport.count(DFU_CMD_GETSTATUS), 3);
    }

    #[tokio::test]
    async fn test_disconnect_before_manifestation_fails() {
        let transport = MockTransport::new();
        let connection = dfuse_connection(SRAM_LAYOUT, transport.clone());

        // device gone after the last block, before the zero-length download
        let result = connection
            .download_firmware(
                &firmware(100),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |done, total| {
                    if done == total {
                        transport.disconnect();
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(DfuError::Disconnected)));
        assert_eq!(zero_length_downloads(&transport), 0);
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn test_reset_reported_as_transfer_error() {
        let transport = MockTransport::new();
        transport.fault_on_manifest();
        let connection = dfuse_connection(FLASH_LAYOUT, transport.clone());

        connection
            .download_firmware(
                &firmware(100),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await
            .unwrap();
        assert_eq!(zero_length_downloads(&transport), 1);
    }

    #[tokio::test]
    async fn test_tolerant_device_transfer_error() {
        let transport = MockTransport::new();
        transport.fault_on_manifest();
        let connection = tolerant_connection(transport);

        let result = connection
            .download_firmware(
                &firmware(100),
                &DownloadOptions::default(),
                &CancelToken::new(),
                |_, _| {},
            )
            .await;
        assert!(matches!(
            result,
            Err(DfuError::Transfer(
                nusb::transfer::TransferError::Fault
            ))
        ));
    }
}
