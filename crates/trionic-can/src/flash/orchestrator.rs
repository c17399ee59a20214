//! Full firmware read/write sequencing

use std::sync::Arc;

use tracing::{error, info, warn};

use super::{LiveChannel, VerifyMode};
use crate::error::{ProtocolError, TransferError};
use crate::events::{Activity, EventSink, Severity};
use crate::kwp::reset_mode;
use crate::session::{JobGuard, SecurityLevel, SessionManager, SessionState};
use crate::transfer::{
    block_checksum, BlockTransferEngine, CancelToken, Direction, MemoryRegion, TransferJob,
};

const HALF_FLASHED_WARNING: &str =
    "The ECU may be unflashed or half-flashed. Do not power-cycle it before re-flashing";

/// Sequences whole-image reads and writes on an open session
///
/// Only one transfer runs per session at a time; a second concurrent
/// request, from this or any other orchestrator on the same session, fails
/// with [`TransferError::Busy`] without touching the bus.
pub struct FlashOrchestrator {
    session: Arc<SessionManager>,
    engine: BlockTransferEngine,
    cancel: CancelToken,
}

impl FlashOrchestrator {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            engine: BlockTransferEngine::new(session.clone()),
            session,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally created cancellation token
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation of the running job at the next block boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_job_active()
    }

    /// Write `image` to `region`
    ///
    /// Unlocks write access, selects programming mode, optionally erases,
    /// writes every block in address order, verifies and optionally resets
    /// the ECU.
    pub async fn write_flash(&self, region: MemoryRegion, image: &[u8]) -> Result<(), TransferError> {
        let _guard = self.admit()?;

        let mut touched = false;
        let result = self.run_write(&region, image, &mut touched).await;

        match &result {
            Ok(()) => {
                info!(
                    start = format!("0x{:08X}", region.start),
                    bytes = image.len(),
                    "Flash written"
                );
                self.events()
                    .on_info("Flash written and verified", Severity::Info, Activity::Idle);
            }
            Err(e) => {
                self.report_failure(e, Activity::Writing);
                if touched || e.requires_full_rewrite() {
                    warn!("{}", HALF_FLASHED_WARNING);
                    self.events()
                        .on_info(HALF_FLASHED_WARNING, Severity::Warning, Activity::Writing);
                }
            }
        }

        result
    }

    /// Read `region` into memory
    pub async fn read_flash(&self, region: MemoryRegion) -> Result<Vec<u8>, TransferError> {
        let _guard = self.admit()?;

        let result = self.run_read(&region).await;

        match &result {
            Ok(image) => {
                info!(
                    start = format!("0x{:08X}", region.start),
                    bytes = image.len(),
                    "Flash read"
                );
                self.events()
                    .on_info("Flash read complete", Severity::Info, Activity::Idle);
            }
            Err(e) => self.report_failure(e, Activity::Reading),
        }

        result
    }

    /// Read and scale one live measurement
    pub async fn read_live_value(&self, channel: LiveChannel) -> Result<f32, TransferError> {
        let result = self.run_live_read(channel).await;
        if let Err(e) = &result {
            self.report_failure(e, Activity::Reading);
        }
        result
    }

    fn admit(&self) -> Result<JobGuard<'_>, TransferError> {
        let guard = self.session.begin_job()?;
        self.cancel.reset();
        Ok(guard)
    }

    fn events(&self) -> &Arc<dyn EventSink> {
        self.session.events()
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        match self.session.state() {
            SessionState::Open => Ok(()),
            state => Err(TransferError::SessionNotOpen(state)),
        }
    }

    async fn run_write(
        &self,
        region: &MemoryRegion,
        image: &[u8],
        touched: &mut bool,
    ) -> Result<(), TransferError> {
        if region.access != Direction::Write {
            return Err(TransferError::InvalidRegion(format!(
                "region at 0x{:08X} is not writable",
                region.start
            )));
        }
        if region.length != image.len() {
            return Err(TransferError::InvalidRegion(format!(
                "region is {} bytes but the image is {} bytes",
                region.length,
                image.len()
            )));
        }
        region.validate()?;
        self.ensure_open()?;

        let config = self.session.config();
        let kwp = self.session.kwp();

        self.session
            .security()
            .request_access(SecurityLevel::Write)
            .await?;

        kwp.start_diagnostic_session(config.flash.programming_mode)
            .await
            .map_err(|e| self.protocol_fault(e))?;

        let mut job = TransferJob::new(*region, Direction::Write);

        if config.flash.erase_before_write {
            self.events().on_info(
                &format!(
                    "Erasing 0x{:08X}..0x{:08X}",
                    region.start,
                    region.end()
                ),
                Severity::Info,
                Activity::Erasing,
            );
            *touched = true;
            kwp.erase(config.flash.erase_routine_id, region.start, region.length as u32)
                .await
                .map_err(|e| self.aborted(&job, self.protocol_fault(e)))?;
        }

        self.events()
            .on_info("Writing flash", Severity::Info, Activity::Writing);

        for block in region.blocks(config.transfer.block_size) {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled {
                    blocks_completed: job.blocks_completed,
                });
            }

            let data = &image[region.offset_of(&block)];
            let result = self.engine.write_block_in(&mut job, &block, data).await;
            *touched = true;
            match result {
                Ok(()) => {}
                Err(e @ TransferError::BlockFailed { .. }) => return Err(e),
                Err(e) if job.blocks_completed > 0 || config.flash.erase_before_write => {
                    return Err(self.aborted(&job, e));
                }
                Err(e) => return Err(e),
            }
        }

        self.events()
            .on_info("Verifying flash", Severity::Info, Activity::Verifying);
        self.verify(region, image)
            .await
            .map_err(|e| match e {
                TransferError::ChecksumMismatch { .. } => e,
                other => self.aborted(&job, other),
            })?;

        if config.flash.reset_after_write {
            self.events()
                .on_info("Resetting ECU", Severity::Info, Activity::Resetting);
            kwp.ecu_reset(reset_mode::POWER_ON)
                .await
                .map_err(|e| self.protocol_fault(e))?;
            self.session.notify_ecu_reset();
        }

        Ok(())
    }

    async fn verify(
        &self,
        region: &MemoryRegion,
        image: &[u8],
    ) -> Result<(), TransferError> {
        let config = self.session.config();
        let ecu_checksum = self
            .session
            .kwp()
            .request_transfer_exit(region.start, region.length as u32)
            .await
            .map_err(|e| self.protocol_fault(e))?;

        match config.flash.verify {
            VerifyMode::Checksum => {
                let expected = block_checksum(image);
                if ecu_checksum != expected {
                    return Err(TransferError::ChecksumMismatch {
                        expected,
                        actual: ecu_checksum,
                    });
                }
            }
            VerifyMode::ReadBack => {
                let mut readback = TransferJob::new(*region, Direction::Read);
                for block in region.blocks(config.transfer.block_size) {
                    let expected = &image[region.offset_of(&block)];
                    let actual = self.engine.read_block_in(&mut readback, &block).await?;
                    if actual != expected {
                        return Err(TransferError::ChecksumMismatch {
                            expected: block_checksum(expected),
                            actual: block_checksum(&actual),
                        });
                    }
                }
            }
        }

        info!(checksum = format!("0x{:08X}", ecu_checksum), "Flash verified");
        Ok(())
    }

    async fn run_read(&self, region: &MemoryRegion) -> Result<Vec<u8>, TransferError> {
        region.validate()?;
        self.ensure_open()?;

        self.session
            .security()
            .request_access(SecurityLevel::Read)
            .await?;

        self.events()
            .on_info("Reading flash", Severity::Info, Activity::Reading);

        let block_size = self.session.config().transfer.block_size;
        let mut job = TransferJob::new(*region, Direction::Read);
        let mut image = Vec::with_capacity(region.length);

        for block in region.blocks(block_size) {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled {
                    blocks_completed: job.blocks_completed,
                });
            }
            let block = MemoryRegion::read(block.start, block.length);
            let data = self.engine.read_block_in(&mut job, &block).await?;
            image.extend_from_slice(&data);
        }

        Ok(image)
    }

    async fn run_live_read(&self, channel: LiveChannel) -> Result<f32, TransferError> {
        self.ensure_open()?;

        let live = &self.session.config().live_values;
        let (local_id, scale, offset) = match channel {
            LiveChannel::Adc(n) => (
                live.adc_base_id.wrapping_add(n),
                live.adc_scale,
                live.adc_offset,
            ),
            LiveChannel::Thermo => (live.thermo_id, live.thermo_scale, live.thermo_offset),
        };

        let record = self
            .session
            .kwp()
            .read_local_identifier(local_id, live.timeout())
            .await
            .map_err(|e| self.protocol_fault(e))?;

        let [hi, lo, ..] = record.as_slice() else {
            return Err(TransferError::Protocol(ProtocolError::InvalidResponse(format!(
                "live value 0x{:02X} has {} bytes",
                local_id,
                record.len()
            ))));
        };
        let raw = u16::from_be_bytes([*hi, *lo]);
        Ok(raw as f32 * scale + offset)
    }

    /// Wrap a request failure, faulting the session on link errors
    fn protocol_fault(&self, err: ProtocolError) -> TransferError {
        if err.is_link_fault() {
            self.session.mark_faulted(&err.to_string());
        }
        TransferError::Protocol(err)
    }

    fn aborted(&self, job: &TransferJob, err: TransferError) -> TransferError {
        TransferError::AbortedMidWrite {
            blocks_written: job.blocks_completed,
            reason: err.to_string(),
        }
    }

    fn report_failure(&self, err: &TransferError, activity: Activity) {
        error!(error = %err, %activity, "Transfer failed");
        self.events()
            .on_info(&format!("{} failed: {}", capitalize(activity), err), Severity::Error, activity);
    }
}

fn capitalize(activity: Activity) -> String {
    let text = activity.to_string();
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => text,
    }
}
