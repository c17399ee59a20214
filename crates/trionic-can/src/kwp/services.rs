//! KWP service layer for diagnostic communication

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{positive_response, tester_present_mode, NegativeResponseCode, ServiceIds};
use crate::codec::MAX_PAYLOAD_LEN;
use crate::error::{ProtocolError, TimeoutError};
use crate::transport::Channel;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_millis(30000);

/// Service id + 32-bit address + 16-bit length
pub const BLOCK_HEADER_LEN: usize = 7;
/// Trailing CRC-32 on block acknowledgements and read responses
pub const BLOCK_CHECKSUM_LEN: usize = 4;
/// Largest block that fits one segmented message
pub const MAX_BLOCK_LEN: usize = MAX_PAYLOAD_LEN - BLOCK_HEADER_LEN;

/// KWP service layer on top of a [`Channel`]
#[derive(Clone)]
pub struct KwpService {
    channel: Arc<Channel>,
    timeout: Duration,
    pending_timeout: Duration,
    /// Service IDs to use (may include ECU-family overrides)
    svc: ServiceIds,
}

impl KwpService {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self::with_service_ids(channel, ServiceIds::default())
    }

    pub fn with_service_ids(channel: Arc<Channel>, service_ids: ServiceIds) -> Self {
        Self {
            channel,
            timeout: DEFAULT_TIMEOUT,
            pending_timeout: RESPONSE_PENDING_TIMEOUT,
            svc: service_ids,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }

    pub fn service_ids(&self) -> &ServiceIds {
        &self.svc
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request with the default timeout
    pub async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.send_request_with_timeout(request, self.timeout).await
    }

    /// Send a request and wait for its positive response
    ///
    /// A "response pending" negative response keeps the bus locked and waits
    /// for the final answer without resending the request.
    pub async fn send_request_with_timeout(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let Some(&service) = request.first() else {
            return Err(ProtocolError::InvalidState("empty request".to_string()));
        };

        let mut guard = self.channel.lock().await;
        guard.send_message(request).await?;

        let started = Instant::now();
        let mut wait = timeout;
        let mut pending = false;
        loop {
            let response = match guard.receive_message(wait).await {
                Err(ProtocolError::Timeout(_)) if pending => {
                    return Err(self.pending_expired(service));
                }
                other => other?,
            };

            match response.first() {
                Some(&id) if id == self.svc.negative_response => {
                    if response.len() < 3 {
                        return Err(ProtocolError::InvalidResponse(
                            "Negative response too short".to_string(),
                        ));
                    }
                    if response[1] != service {
                        return Err(ProtocolError::InvalidResponse(format!(
                            "Negative response for service 0x{:02X} to request 0x{:02X}",
                            response[1], service
                        )));
                    }

                    let nrc = NegativeResponseCode::from(response[2]);
                    if nrc == NegativeResponseCode::ResponsePending {
                        // The final answer may take up to the pending budget,
                        // counted from the original send
                        wait = self.pending_timeout.saturating_sub(started.elapsed());
                        if wait.is_zero() {
                            return Err(self.pending_expired(service));
                        }
                        pending = true;
                        debug!(service = format!("0x{:02X}", service), "Response pending");
                        continue;
                    }

                    return Err(ProtocolError::NegativeResponse { service, nrc });
                }
                Some(&id) if id == positive_response(service) => return Ok(response),
                Some(&id) => {
                    return Err(ProtocolError::InvalidResponse(format!(
                        "Unexpected response 0x{:02X} to service 0x{:02X}",
                        id, service
                    )))
                }
                None => {
                    return Err(ProtocolError::InvalidResponse(
                        "Empty response".to_string(),
                    ))
                }
            }
        }
    }

    fn pending_expired(&self, service: u8) -> ProtocolError {
        TimeoutError::new(
            format!("pending response to service 0x{:02X}", service),
            self.pending_timeout,
        )
        .into()
    }

    /// StartDiagnosticSession (0x10)
    pub async fn start_diagnostic_session(&self, mode: u8) -> Result<(), ProtocolError> {
        let request = [self.svc.start_diagnostic_session, mode];
        self.send_request(&request).await?;
        Ok(())
    }

    /// TesterPresent (0x3E) with response required
    pub async fn tester_present(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let request = [self.svc.tester_present, tester_present_mode::RESPONSE_REQUIRED];
        self.send_request_with_timeout(&request, timeout).await?;
        Ok(())
    }

    /// SecurityAccess (0x27) - request seed for an odd access mode
    pub async fn request_seed(&self, access_mode: u8) -> Result<Vec<u8>, ProtocolError> {
        let request = [self.svc.security_access, access_mode];
        let response = self.send_request(&request).await?;

        // Response: 0x67 [access_mode] [seed...]
        if response.len() < 2 || response[1] != access_mode {
            return Err(ProtocolError::InvalidResponse(format!(
                "Seed response does not echo access mode 0x{:02X}",
                access_mode
            )));
        }

        Ok(response[2..].to_vec())
    }

    /// SecurityAccess (0x27) - send key for the mode following the seed mode
    pub async fn send_key(&self, access_mode: u8, key: &[u8]) -> Result<(), ProtocolError> {
        let mut request = vec![self.svc.security_access, access_mode.wrapping_add(1)];
        request.extend_from_slice(key);

        self.send_request(&request).await?;
        Ok(())
    }

    /// TransferData (0x36) - write one block, returns the ECU's CRC-32 of what it stored
    pub async fn transfer_data(
        &self,
        address: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<u32, ProtocolError> {
        let length = block_length(data.len())?;
        let mut request = Vec::with_capacity(BLOCK_HEADER_LEN + data.len());
        request.push(self.svc.transfer_data);
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&length.to_be_bytes());
        request.extend_from_slice(data);

        let response = self.send_request_with_timeout(&request, timeout).await?;

        // Response: 0x76 [crc32]
        if response.len() != 1 + BLOCK_CHECKSUM_LEN {
            return Err(ProtocolError::InvalidResponse(format!(
                "TransferData acknowledgement has {} bytes",
                response.len()
            )));
        }
        Ok(read_u32(&response[1..]))
    }

    /// ReadMemoryByAddress (0x23) - returns the data and the ECU's CRC-32 over it
    pub async fn read_memory(
        &self,
        address: u32,
        length: usize,
        timeout: Duration,
    ) -> Result<(Vec<u8>, u32), ProtocolError> {
        let wire_len = block_length(length)?;
        let mut request = Vec::with_capacity(BLOCK_HEADER_LEN);
        request.push(self.svc.read_memory_by_address);
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&wire_len.to_be_bytes());

        let response = self.send_request_with_timeout(&request, timeout).await?;

        // Response: 0x63 [data...] [crc32]
        if response.len() != 1 + length + BLOCK_CHECKSUM_LEN {
            return Err(ProtocolError::InvalidResponse(format!(
                "ReadMemoryByAddress returned {} bytes for a {} byte block",
                response.len(),
                length
            )));
        }
        let data = response[1..1 + length].to_vec();
        let checksum = read_u32(&response[1 + length..]);
        Ok((data, checksum))
    }

    /// StartRoutineByLocalIdentifier (0x31) - erase a flash range
    pub async fn erase(&self, routine_id: u8, address: u32, length: u32) -> Result<(), ProtocolError> {
        let mut request = vec![self.svc.start_routine_by_local_id, routine_id];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&length.to_be_bytes());

        self.send_request(&request).await?;
        Ok(())
    }

    /// RequestTransferExit (0x37) - returns the ECU's CRC-32 over the range
    pub async fn request_transfer_exit(&self, address: u32, length: u32) -> Result<u32, ProtocolError> {
        let mut request = vec![self.svc.request_transfer_exit];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&length.to_be_bytes());

        let response = self.send_request(&request).await?;

        if response.len() != 1 + BLOCK_CHECKSUM_LEN {
            return Err(ProtocolError::InvalidResponse(format!(
                "RequestTransferExit response has {} bytes",
                response.len()
            )));
        }
        Ok(read_u32(&response[1..]))
    }

    /// ECUReset (0x11)
    pub async fn ecu_reset(&self, mode: u8) -> Result<(), ProtocolError> {
        let request = [self.svc.ecu_reset, mode];
        self.send_request(&request).await?;
        Ok(())
    }

    /// ReadDataByLocalIdentifier (0x21) - returns the record after the echoed id
    pub async fn read_local_identifier(
        &self,
        local_id: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let request = [self.svc.read_data_by_local_id, local_id];
        let response = self.send_request_with_timeout(&request, timeout).await?;

        if response.len() < 2 || response[1] != local_id {
            return Err(ProtocolError::InvalidResponse(format!(
                "Response does not echo local identifier 0x{:02X}",
                local_id
            )));
        }
        Ok(response[2..].to_vec())
    }
}

fn block_length(len: usize) -> Result<u16, ProtocolError> {
    if len > MAX_BLOCK_LEN {
        return Err(ProtocolError::InvalidState(format!(
            "Block of {} bytes exceeds the {} byte limit",
            len, MAX_BLOCK_LEN
        )));
    }
    Ok(len as u16)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
