use log::{debug, info, warn};
use tokio::time::Instant;

use crate::{
    DfuDescriptor, DfuError, DfuInterface, DfuMemory, Liveness, POLL_DEADLINE,
    device::DeviceIdentity,
    memory::parse_memory_layout,
    status::{DFU_STATUS_LEN, DfuState, DfuStatus},
    transport::{DfuTransport, NusbTransport},
};

// pub(crate) const DFU_CMD_DETACH: u8 = 0;
pub(crate) const DFU_CMD_DOWNLOAD: u8 = 1;
// pub(crate) const DFU_CMD_UPLOAD: u8 = 2;
pub(crate) const DFU_CMD_GETSTATUS: u8 = 3;
pub(crate) const DFU_CMD_CLRSTATUS: u8 = 4;
// pub(crate) const DFU_CMD_GETSTATE: u8 = 5;
pub(crate) const DFU_CMD_ABORT: u8 = 6;

pub(crate) const DFUSE_CMD_ADDR: u8 = 0x21;
pub(crate) const DFUSE_CMD_ERASE: u8 = 0x41;

/// `wBlockNum` of the first data block in a DfuSe download
pub(crate) const DFUSE_FIRST_BLOCK: u16 = 2;

pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_PROTOCOL_DFU: u8 = 0x02;

/// Protocol flavour, decided once when the connection is established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DfuVariant {
    /// Plain DFU 1.1, no memory map
    Standard,
    /// ST DfuSe extensions. The memory map is `None` when the alternate
    /// setting name is missing or not a valid layout string.
    Extended(Option<DfuMemory>),
}

/// Open DFU session on a single interface / alternate setting.
///
/// Obtained from [DfuDevice::connect](crate::DfuDevice::connect) for real
/// devices, or built over any [DfuTransport] with [DfuConnection::new].
pub struct DfuConnection<T = NusbTransport> {
    transport: Option<T>,
    liveness: Liveness,
    watcher: Option<tokio::task::JoinHandle<()>>,
    identity: DeviceIdentity,
    interface: DfuInterface,
    descriptor: Option<DfuDescriptor>,
    variant: DfuVariant,
    start_address: Option<u32>,
    max_read_size: u32,
}

impl<T: DfuTransport> DfuConnection<T> {
    pub fn new(
        transport: T,
        identity: DeviceIdentity,
        interface: DfuInterface,
        descriptor: Option<DfuDescriptor>,
        liveness: Liveness,
    ) -> Self {
        let variant = select_variant(&interface, descriptor.as_ref());
        let (start_address, max_read_size) = match &variant {
            DfuVariant::Extended(Some(memory)) => {
                match memory.first_writable_segment() {
                    Some(segment) => (
                        Some(segment.start_addr()),
                        memory.max_readable_run(segment.start_addr()),
                    ),
                    None => (None, 0),
                }
            }
            _ => (None, 0),
        };

        let connection = DfuConnection {
            transport: Some(transport),
            liveness,
            watcher: None,
            identity,
            interface,
            descriptor,
            variant,
            start_address,
            max_read_size,
        };
        connection.log_summary();
        connection
    }

    pub(crate) fn with_watcher(
        mut self,
        watcher: tokio::task::JoinHandle<()>,
    ) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn interface(&self) -> &DfuInterface {
        &self.interface
    }

    /// `None` if the configuration has no DFU functional descriptor
    pub fn descriptor(&self) -> Option<&DfuDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn variant(&self) -> &DfuVariant {
        &self.variant
    }

    pub fn is_dfuse(&self) -> bool {
        matches!(self.variant, DfuVariant::Extended(_))
    }

    pub fn memory(&self) -> Option<&DfuMemory> {
        match &self.variant {
            DfuVariant::Extended(memory) => memory.as_ref(),
            DfuVariant::Standard => None,
        }
    }

    /// Start of the first writable segment
    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    /// Readable bytes from [Self::start_address]
    pub fn max_read_size(&self) -> u32 {
        self.max_read_size
    }

    pub fn transfer_size(&self) -> u16 {
        match &self.descriptor {
            Some(desc) if desc.transfer_size() > 0 => desc.transfer_size(),
            _ => crate::DEFAULT_TRANSFER_SIZE,
        }
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_some() && self.liveness.is_alive()
    }

    /// dfu-util style one-line description
    pub fn summary(&self) -> String {
        let mode = match self.interface.protocol() {
            DFU_PROTOCOL_RUNTIME => "Runtime",
            DFU_PROTOCOL_DFU => "DFU",
            _ => "Unknown",
        };
        format!(
            "{}: [{:04x}:{:04x}] cfg={}, intf={}, alt={}, name=\"{}\" serial=\"{}\"",
            mode,
            self.identity.vendor_id,
            self.identity.product_id,
            self.interface.config(),
            self.interface.interface(),
            self.interface.alt_setting(),
            self.identity.product_string.as_deref().unwrap_or(""),
            self.identity.serial_number.as_deref().unwrap_or(""),
        )
    }

    fn log_summary(&self) {
        info!("{}", self.summary());
        if let Some(desc) = &self.descriptor {
            info!("{desc}");
        }
        match &self.variant {
            DfuVariant::Extended(Some(memory)) => info!("{memory}"),
            DfuVariant::Extended(None) => {
                warn!("DfuSe device without a usable memory layout")
            }
            DfuVariant::Standard => {}
        }
    }

    /// Release the interface. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if self.transport.take().is_some() {
            debug!("Released interface {}", self.interface.interface());
        }
    }

    pub async fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self
            .dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)
            .await?;
        DfuStatus::from_raw(&data)
    }

    /// Only meaningful in `dfuERROR`
    pub async fn clear_status(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[]).await
    }

    pub async fn abort(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[]).await
    }

    /// Leave `dfuERROR` if a previous session left the device there.
    ///
    /// Best effort: failures are logged, the next command may still succeed.
    pub async fn clear_error_state(&self) {
        match self.get_status().await {
            Ok(st) if st.state() == DfuState::Error => {
                debug!("Clearing error state ({st})");
                if let Err(err) = self.clear_status().await {
                    warn!("Failed to clear status: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => warn!("Failed to clear status: {err}"),
        }
    }

    /// Write `data` at `addr` (DfuSe)
    pub async fn download(
        &self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), DfuError> {
        self.dfuse_set_address(addr).await?;
        self.dfu_dnload(DFUSE_FIRST_BLOCK, data).await
    }

    pub async fn dfuse_page_erase(&self, addr: u32) -> Result<(), DfuError> {
        self.dfuse_command(DFUSE_CMD_ERASE, addr).await
    }

    pub async fn dfuse_set_address(&self, addr: u32) -> Result<(), DfuError> {
        self.dfuse_command(DFUSE_CMD_ADDR, addr).await
    }

    async fn dfuse_command(&self, cmd: u8, addr: u32) -> Result<(), DfuError> {
        let mut payload = vec![cmd];
        payload.extend_from_slice(&addr.to_le_bytes());
        self.dfu_dnload(0, &payload).await
    }

    async fn dfu_dnload(
        &self,
        transaction: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, transaction, data).await?;
        let st = self
            .poll_until(|state| {
                !matches!(state, DfuState::DnloadSync | DfuState::DnBusy)
            })
            .await?;
        st.ok()?;
        if st.state() != DfuState::DnloadIdle {
            return Err(DfuError::UnexpectedState(st.state()));
        }
        Ok(())
    }

    /// Send the zero-length download that ends a transfer
    pub(crate) async fn dfu_dnload_final(
        &self,
        transaction: u16,
    ) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, transaction, &[]).await
    }

    /// Poll `DFU_GETSTATUS` until `done` accepts the state or the device
    /// reports `dfuERROR`, sleeping `bwPollTimeout` between requests.
    ///
    /// Sleeps on the tokio timer, so it must run inside a tokio runtime.
    pub(crate) async fn poll_until(
        &self,
        done: impl Fn(DfuState) -> bool,
    ) -> Result<DfuStatus, DfuError> {
        let start = Instant::now();
        let mut st = self.get_status().await?;
        while !done(st.state()) && st.state() != DfuState::Error {
            if start.elapsed() >= POLL_DEADLINE + st.poll_timeout() {
                return Err(DfuError::Timeout);
            }
            tokio::time::sleep(st.poll_timeout()).await;
            st = self.get_status().await?;
        }
        Ok(st)
    }

    #[cfg(test)]
    pub(crate) fn transport_ref(&self) -> &T {
        self.transport.as_ref().unwrap()
    }

    fn transport(&self) -> Result<&T, DfuError> {
        let transport = self.transport.as_ref().ok_or(DfuError::Closed)?;
        self.liveness.check()?;
        Ok(transport)
    }

    /// The device may have gone while the transfer was in flight
    fn settle<R>(&self, result: Result<R, DfuError>) -> Result<R, DfuError> {
        if let Err(DfuError::Disconnected) = result {
            self.liveness.invalidate();
        }
        self.liveness.check()?;
        result
    }

    async fn dfu_cmd_out(
        &self,
        req: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let result = self.transport()?.control_out(req, value, data).await;
        self.settle(result)
    }

    async fn dfu_cmd_in(
        &self,
        req: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let result = self.transport()?.control_in(req, value, length).await;
        self.settle(result)
    }
}

impl<T> Drop for DfuConnection<T> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// DfuSe requires both the DFU mode protocol and `bcdDFUVersion` 0x011a
fn select_variant(
    interface: &DfuInterface,
    descriptor: Option<&DfuDescriptor>,
) -> DfuVariant {
    let dfuse = interface.protocol() == DFU_PROTOCOL_DFU
        && descriptor.is_some_and(DfuDescriptor::is_dfuse);
    if !dfuse {
        return DfuVariant::Standard;
    }

    let memory = match interface.name() {
        Some(name) => match parse_memory_layout(name) {
            Ok(memory) => Some(memory),
            Err(err) => {
                warn!("Unable to parse memory layout: {err}");
                None
            }
        },
        None => None,
    };
    DfuVariant::Extended(memory)
}
