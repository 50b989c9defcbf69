//! Scripted transport for exercising the DFU state machine without hardware.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use nusb::transfer::TransferError;

use crate::{
    DfuError, DfuState, DfuStatus, Liveness,
    connection::{
        DFU_CMD_ABORT, DFU_CMD_CLRSTATUS, DFU_CMD_DOWNLOAD, DFU_CMD_GETSTATUS,
    },
    transport::DfuTransport,
};

/// A control request seen by the mock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockRequest {
    pub request: u8,
    pub value: u16,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    /// Replies returned by `DFU_GETSTATUS` before falling back to the
    /// simulated state.
    status_queue: VecDeque<DfuStatus>,
    state: Option<DfuState>,
    requests: Vec<MockRequest>,
    failing: Vec<u8>,
    poll_timeout: u32,
    connected: bool,
    disconnect_on_manifest: bool,
    fault_on_manifest: bool,
    faulting: bool,
    liveness: Option<Liveness>,
}

/// Mock DFU interface.
///
/// Without queued replies it behaves like a well-mannered DfuSe device:
/// every download ends in `dfuDNLOAD-IDLE`, a zero-length download
/// manifests straight back to `dfuIDLE`.
///
/// Clones share the same state, so a test can keep one to inspect the
/// requests after handing the other to a connection.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                state: Some(DfuState::DfuIdle),
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Queue a `DFU_GETSTATUS` reply
    pub fn queue_status(&self, state: DfuState, status: u8, poll_timeout: u32) {
        self.inner
            .lock()
            .unwrap()
            .status_queue
            .push_back(DfuStatus::new(status, poll_timeout, state));
    }

    /// Set the state reported once the queue is empty
    pub fn set_state(&self, state: DfuState) {
        self.inner.lock().unwrap().state = Some(state);
    }

    /// `bwPollTimeout` reported once the queue is empty
    pub fn set_poll_timeout(&self, poll_timeout: u32) {
        self.inner.lock().unwrap().poll_timeout = poll_timeout;
    }

    /// Make every request with code `request` stall
    pub fn fail_request(&self, request: u8) {
        self.inner.lock().unwrap().failing.push(request);
    }

    /// Drop off the bus once a zero-length download is received
    pub fn disconnect_on_manifest(&self) {
        self.inner.lock().unwrap().disconnect_on_manifest = true;
    }

    /// Fail every status request with a transfer fault once a zero-length
    /// download is received, the way some host stacks report a device
    /// resetting under them
    pub fn fault_on_manifest(&self) {
        self.inner.lock().unwrap().fault_on_manifest = true;
    }

    /// Invalidate `liveness` when the mock disconnects, the way the hotplug
    /// watcher does for real devices
    pub fn attach(&self, liveness: Liveness) {
        self.inner.lock().unwrap().liveness = Some(liveness);
    }

    /// Simulate device disconnect
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disconnect();
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Payloads of the data-carrying downloads (`wBlockNum` >= 2)
    pub fn downloads(&self) -> Vec<Vec<u8>> {
        self.requests()
            .into_iter()
            .filter(|r| r.request == DFU_CMD_DOWNLOAD && r.value >= 2)
            .map(|r| r.data)
            .collect()
    }

    pub fn count(&self, request: u8) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.request == request)
            .count()
    }

    fn handle(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<Vec<u8>, DfuError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(DfuError::Disconnected);
        }
        inner.requests.push(MockRequest {
            request,
            value,
            data: data.to_vec(),
        });
        if inner.failing.contains(&request) {
            return Err(DfuError::Transfer(TransferError::Stall));
        }

        match request {
            DFU_CMD_GETSTATUS if inner.faulting => {
                Err(DfuError::Transfer(TransferError::Fault))
            }
            DFU_CMD_GETSTATUS => {
                let status = match inner.status_queue.pop_front() {
                    Some(status) => status,
                    None => DfuStatus::new(
                        0,
                        inner.poll_timeout,
                        inner.state.unwrap_or(DfuState::DfuIdle),
                    ),
                };
                Ok(status.to_raw().to_vec())
            }
            DFU_CMD_DOWNLOAD if data.is_empty() => {
                if inner.disconnect_on_manifest {
                    inner.disconnect();
                } else if inner.fault_on_manifest {
                    inner.faulting = true;
                } else {
                    inner.state = Some(DfuState::DfuIdle);
                }
                Ok(Vec::new())
            }
            DFU_CMD_DOWNLOAD => {
                inner.state = Some(DfuState::DnloadIdle);
                Ok(Vec::new())
            }
            DFU_CMD_CLRSTATUS | DFU_CMD_ABORT => {
                inner.state = Some(DfuState::DfuIdle);
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

impl MockState {
    fn disconnect(&mut self) {
        self.connected = false;
        if let Some(liveness) = &self.liveness {
            liveness.invalidate();
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for MockTransport {
    async fn control_in(
        &self,
        request: u8,
        value: u16,
        _length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        self.handle(request, value, &[])
    }

    async fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        self.handle(request, value, data).map(|_| ())
    }
}
