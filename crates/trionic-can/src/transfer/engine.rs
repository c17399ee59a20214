//! Chunked memory read/write with checksum and bounded retry

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{block_checksum, Direction, MemoryRegion, TransferJob};
use crate::error::{ProtocolError, TransferError};
use crate::events::{Activity, Severity, WriteProgress};
use crate::kwp::MAX_BLOCK_LEN;
use crate::session::{SecurityLevel, SessionManager, SessionState};

/// Outcome of one block exchange
enum Attempt<T> {
    Done(T),
    Retry(String),
    Fatal(ProtocolError),
}

/// Moves single blocks between tester and ECU
///
/// Preconditions are checked before anything goes on the bus. A block whose
/// checksum does not match, or whose response never arrives, is sent again
/// up to `transfer.block_attempts` times in total.
#[derive(Clone)]
pub struct BlockTransferEngine {
    session: Arc<SessionManager>,
}

impl BlockTransferEngine {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Read one block as a job of its own
    pub async fn read_block(&self, region: &MemoryRegion) -> Result<Vec<u8>, TransferError> {
        let result = self.read_single(region).await;
        if let Err(e) = &result {
            self.report_failure(Direction::Read, region, e);
        }
        result
    }

    /// Write one block as a job of its own
    pub async fn write_block(&self, region: &MemoryRegion, data: &[u8]) -> Result<(), TransferError> {
        let result = self.write_single(region, data).await;
        if let Err(e) = &result {
            self.report_failure(Direction::Write, region, e);
        }
        result
    }

    async fn read_single(&self, region: &MemoryRegion) -> Result<Vec<u8>, TransferError> {
        let _job_slot = self.session.begin_job()?;
        let mut job = TransferJob::new(*region, Direction::Read);
        self.read_block_in(&mut job, region).await
    }

    async fn write_single(&self, region: &MemoryRegion, data: &[u8]) -> Result<(), TransferError> {
        let _job_slot = self.session.begin_job()?;
        let mut job = TransferJob::new(*region, Direction::Write);
        self.write_block_in(&mut job, region, data).await
    }

    fn report_failure(&self, direction: Direction, region: &MemoryRegion, err: &TransferError) {
        let activity = match direction {
            Direction::Read => Activity::Reading,
            Direction::Write => Activity::Writing,
        };
        error!(
            %direction,
            address = format!("0x{:08X}", region.start),
            error = %err,
            "Block transfer failed"
        );
        self.session.events().on_info(
            &format!("Block at 0x{:08X} failed: {}", region.start, err),
            Severity::Error,
            activity,
        );
    }

    /// Read one block of a larger job, updating its progress
    ///
    /// The caller holds the session's job slot and reports failures.
    pub async fn read_block_in(
        &self,
        job: &mut TransferJob,
        region: &MemoryRegion,
    ) -> Result<Vec<u8>, TransferError> {
        self.check_preconditions(region, region.length, SecurityLevel::Read)?;

        let kwp = self.session.kwp();
        let timeout = self.session.config().transfer.frame_timeout();
        let index = job.begin_block();

        let data = self
            .with_retry(job, index, region, |job| {
                self.session.events().on_read_progress(job.percentage());
                async move {
                    match kwp.read_memory(region.start, region.length, timeout).await {
                        Ok((data, ecu_checksum)) => {
                            let actual = block_checksum(&data);
                            if actual == ecu_checksum {
                                Attempt::Done(data)
                            } else {
                                Attempt::Retry(format!(
                                    "checksum mismatch: received 0x{:08X}, ECU reported 0x{:08X}",
                                    actual, ecu_checksum
                                ))
                            }
                        }
                        Err(e) => classify(e),
                    }
                }
            })
            .await?;

        job.complete_block(region.length);
        self.session.events().on_read_progress(job.percentage());
        Ok(data)
    }

    /// Write one block of a larger job, updating its progress
    ///
    /// The caller holds the session's job slot and reports failures.
    pub async fn write_block_in(
        &self,
        job: &mut TransferJob,
        region: &MemoryRegion,
        data: &[u8],
    ) -> Result<(), TransferError> {
        self.check_preconditions(region, data.len(), SecurityLevel::Write)?;

        let kwp = self.session.kwp();
        let timeout = self.session.config().transfer.frame_timeout();
        let expected = block_checksum(data);
        let index = job.begin_block();

        self.with_retry(job, index, region, |job| {
            self.session
                .events()
                .on_write_progress(WriteProgress::new(job.bytes_done, job.total_bytes));
            async move {
                match kwp.transfer_data(region.start, data, timeout).await {
                    Ok(ecu_checksum) if ecu_checksum == expected => Attempt::Done(()),
                    Ok(ecu_checksum) => Attempt::Retry(format!(
                        "checksum mismatch: sent 0x{:08X}, ECU computed 0x{:08X}",
                        expected, ecu_checksum
                    )),
                    Err(e) => classify(e),
                }
            }
        })
        .await?;

        job.complete_block(data.len());
        self.session
            .events()
            .on_write_progress(WriteProgress::new(job.bytes_done, job.total_bytes));
        Ok(())
    }

    fn check_preconditions(
        &self,
        region: &MemoryRegion,
        data_len: usize,
        required: SecurityLevel,
    ) -> Result<(), TransferError> {
        let state = self.session.state();
        if state != SessionState::Open {
            return Err(TransferError::SessionNotOpen(state));
        }

        self.session.security().require(required)?;

        region.validate()?;
        if region.length != data_len {
            return Err(TransferError::InvalidRegion(format!(
                "block at 0x{:08X} is {} bytes but {} bytes were supplied",
                region.start, region.length, data_len
            )));
        }
        if region.length > MAX_BLOCK_LEN {
            return Err(TransferError::InvalidRegion(format!(
                "block of {} bytes exceeds the {} byte limit",
                region.length, MAX_BLOCK_LEN
            )));
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(
        &self,
        job: &mut TransferJob,
        index: usize,
        region: &MemoryRegion,
        mut exchange: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut(&TransferJob) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let config = &self.session.config().transfer;
        let max_attempts = config.block_attempts;

        loop {
            let attempt = job.record_attempt(index);
            debug!(
                direction = %job.direction,
                index,
                address = format!("0x{:08X}", region.start),
                attempt,
                "Block transfer"
            );

            match exchange(&*job).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => {
                    if e.is_link_fault() {
                        self.session.mark_faulted(&e.to_string());
                    }
                    return Err(TransferError::Protocol(e));
                }
                Attempt::Retry(reason) if attempt < max_attempts => {
                    warn!(
                        index,
                        attempt,
                        max_attempts,
                        reason = %reason,
                        "Block failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay()).await;
                }
                Attempt::Retry(reason) => {
                    return Err(TransferError::BlockFailed {
                        direction: job.direction,
                        index,
                        address: region.start,
                        attempts: attempt,
                        blocks_written: job.blocks_completed,
                        reason,
                    });
                }
            }
        }
    }
}

fn classify<T>(err: ProtocolError) -> Attempt<T> {
    if err.is_retryable() {
        Attempt::Retry(err.to_string())
    } else {
        Attempt::Fatal(err)
    }
}
