//! Whole-image flashing and live values against the simulated ECU

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use trionic_can::kwp::{service_id, ServiceIds};
use trionic_can::{
    block_checksum, Activity, BlockTransferEngine, CancelToken, FlashOrchestrator, LinkError,
    LiveChannel, MemoryRegion, NegativeResponseCode, ProtocolError, SecurityLevel, SessionState,
    Severity, SimulatedEcu, TransferError, VerifyMode,
};

use common::{image, manager, manager_with_sink, open_session, test_config, RecordingSink};

const HALF_FLASHED: &str =
    "The ECU may be unflashed or half-flashed. Do not power-cycle it before re-flashing";

// =============================================================================
// Write
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_write_flash_two_blocks() {
    let ecu = SimulatedEcu::new().with_seed(vec![0x12, 0x34]);
    let (manager, sink) = open_session(&ecu, test_config(), false).await;
    let flasher = FlashOrchestrator::new(manager.clone());
    let data = image(256);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 256), &data)
        .await
        .unwrap();

    assert_eq!(ecu.memory(0x8000, 256), data);
    assert_eq!(ecu.write_addresses(), vec![0x8000, 0x8080]);
    assert_eq!(
        ecu.requests_for(service_id::SECURITY_ACCESS),
        vec![vec![0x27, 0x01], vec![0x27, 0x02, 0xED, 0xCB]]
    );
    assert_eq!(ecu.erase_count(), 1);
    assert_eq!(ecu.reset_count(), 1);

    let progress = sink.write_progress();
    let last = progress.last().copied().unwrap();
    assert_eq!(last.percentage, 100);
    assert_eq!(last.bytes_done, 256);
    assert_eq!(last.bytes_total, 256);

    // Reset drops security but keeps the session
    assert_eq!(manager.state(), SessionState::Open);
    assert_eq!(manager.security_level(), SecurityLevel::None);
    assert!(sink.infos(Severity::Error).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_request_order() {
    let ecu = SimulatedEcu::new();
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x100), &image(0x100))
        .await
        .unwrap();

    let services: Vec<u8> = ecu.requests().iter().map(|r| r[0]).collect();
    assert_eq!(
        services,
        vec![
            service_id::START_DIAGNOSTIC_SESSION,
            service_id::START_ROUTINE_BY_LOCAL_ID,
            service_id::TRANSFER_DATA,
            service_id::TRANSFER_DATA,
            service_id::REQUEST_TRANSFER_EXIT,
            service_id::ECU_RESET,
        ]
    );
    assert_eq!(ecu.diagnostic_mode(), None);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic() {
    let ecu = SimulatedEcu::new();
    ecu.corrupt_write_ack_at(0x8080, 1);
    let (manager, sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x1A0), &image(0x1A0))
        .await
        .unwrap();

    let progress = sink.write_progress();
    assert!(progress.len() >= 4);
    for pair in progress.windows(2) {
        assert!(pair[0].bytes_done <= pair[1].bytes_done);
        assert!(pair[0].percentage <= pair[1].percentage);
    }
    assert_eq!(progress.last().map(|p| p.percentage), Some(100));
}

#[tokio::test(start_paused = true)]
async fn test_partial_last_block() {
    let ecu = SimulatedEcu::new();
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);
    let data = image(0x90);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x90), &data)
        .await
        .unwrap();

    assert_eq!(ecu.write_addresses(), vec![0x8000, 0x8080]);
    assert_eq!(ecu.memory(0x8000, 0x90), data);
}

#[tokio::test(start_paused = true)]
async fn test_write_without_erase_or_reset() {
    let ecu = SimulatedEcu::new();
    let mut config = test_config();
    config.flash.erase_before_write = false;
    config.flash.reset_after_write = false;
    let (manager, _sink) = open_session(&ecu, config, true).await;
    let flasher = FlashOrchestrator::new(manager.clone());

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x80), &image(0x80))
        .await
        .unwrap();

    assert_eq!(ecu.erase_count(), 0);
    assert_eq!(ecu.reset_count(), 0);
    assert_eq!(ecu.diagnostic_mode(), Some(0x85));
    assert_eq!(manager.security_level(), SecurityLevel::Write);
}

#[tokio::test(start_paused = true)]
async fn test_erase_waits_through_response_pending() {
    let ecu = SimulatedEcu::new();
    ecu.pending_responses_before_erase(3);
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x80), &image(0x80))
        .await
        .unwrap();

    assert_eq!(
        ecu.requests_for(service_id::START_ROUTINE_BY_LOCAL_ID).len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_back_verification() {
    let ecu = SimulatedEcu::new();
    let mut config = test_config();
    config.flash.verify = VerifyMode::ReadBack;
    let (manager, _sink) = open_session(&ecu, config, true).await;
    let flasher = FlashOrchestrator::new(manager);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x100), &image(0x100))
        .await
        .unwrap();

    assert_eq!(
        ecu.requests_for(service_id::READ_MEMORY_BY_ADDRESS).len(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_overridden_service_ids() {
    let mut config = test_config();
    config.service_overrides.transfer_data = Some(0x3B);
    let ecu =
        SimulatedEcu::new().with_service_ids(ServiceIds::from_overrides(&config.service_overrides));
    let (manager, _sink) = open_session(&ecu, config, true).await;
    let flasher = FlashOrchestrator::new(manager);
    let data = image(0x80);

    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x80), &data)
        .await
        .unwrap();

    assert_eq!(ecu.requests_for(0x3B).len(), 1);
    assert!(ecu.requests_for(service_id::TRANSFER_DATA).is_empty());
    assert_eq!(ecu.memory(0x8000, 0x80), data);
}

// =============================================================================
// Write failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_block_stops_the_write() {
    let ecu = SimulatedEcu::new();
    ecu.corrupt_write_ack_at(0x8080, 10);
    let (manager, sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x180), &image(0x180))
        .await
        .unwrap_err();

    match &err {
        TransferError::BlockFailed {
            index,
            address,
            attempts,
            blocks_written,
            ..
        } => {
            assert_eq!(*index, 1);
            assert_eq!(*address, 0x8080);
            assert_eq!(*attempts, 3);
            assert_eq!(*blocks_written, 1);
        }
        other => panic!("expected BlockFailed, got {:?}", other),
    }
    assert!(err.requires_full_rewrite());

    assert_eq!(ecu.write_addresses(), vec![0x8000, 0x8080, 0x8080, 0x8080]);
    assert_eq!(ecu.write_requests_at(0x8100), 0);
    assert!(ecu
        .requests_for(service_id::REQUEST_TRANSFER_EXIT)
        .is_empty());
    assert_eq!(ecu.reset_count(), 0);

    let errors = sink.infos(Severity::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.starts_with("Writing failed"), "{}", errors[0].0);
    assert_eq!(
        sink.infos(Severity::Warning),
        vec![(HALF_FLASHED.to_string(), Activity::Writing)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_blocks() {
    let ecu = SimulatedEcu::new();
    let token = CancelToken::new();
    let hook_token = token.clone();
    let sink = Arc::new(RecordingSink::with_hook(move |progress| {
        if progress.bytes_done >= 0x80 {
            hook_token.cancel();
        }
    }));
    let manager = manager_with_sink(&ecu, test_config(), sink.clone());
    manager.open(true).await.unwrap();
    let flasher = FlashOrchestrator::new(manager).with_cancel_token(token);

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x100), &image(0x100))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::Cancelled {
            blocks_completed: 1
        }
    ));
    assert_eq!(ecu.write_addresses(), vec![0x8000]);
    assert!(!flasher.is_busy());
    assert!(sink
        .infos(Severity::Warning)
        .iter()
        .any(|(message, _)| message == HALF_FLASHED));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_is_discarded() {
    let ecu = SimulatedEcu::new();
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);

    flasher.cancel();
    flasher
        .write_flash(MemoryRegion::write(0x8000, 0x80), &image(0x80))
        .await
        .unwrap();

    assert_eq!(ecu.write_addresses(), vec![0x8000]);
}

#[tokio::test(start_paused = true)]
async fn test_verify_mismatch() {
    let ecu = SimulatedEcu::new();
    ecu.set_corrupt_exit_checksum(true);
    let (manager, sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);
    let data = image(0x100);

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x100), &data)
        .await
        .unwrap_err();

    let expected = block_checksum(&data);
    match err {
        TransferError::ChecksumMismatch {
            expected: e,
            actual,
        } => {
            assert_eq!(e, expected);
            assert_eq!(actual, !expected);
        }
        other => panic!("expected ChecksumMismatch, got {:?}", other),
    }
    assert_eq!(ecu.reset_count(), 0);
    assert_eq!(sink.infos(Severity::Warning).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_mid_write_aborts() {
    let ecu = SimulatedEcu::new();
    let hook_ecu = ecu.clone();
    let sink = Arc::new(RecordingSink::with_hook(move |progress| {
        if progress.bytes_done >= 0x80 {
            hook_ecu.set_fail_sends(true);
        }
    }));
    let manager = manager_with_sink(&ecu, test_config(), sink);
    manager.open(true).await.unwrap();
    let flasher = FlashOrchestrator::new(manager.clone());

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x100), &image(0x100))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::AbortedMidWrite {
            blocks_written: 1,
            ..
        }
    ));
    assert!(err.requires_full_rewrite());
    assert_eq!(manager.state(), SessionState::Faulted);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_before_erase() {
    let ecu = SimulatedEcu::new();
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager.clone());
    ecu.set_fail_sends(true);

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x80), &image(0x80))
        .await
        .unwrap_err();

    // Programming mode selection fails first, before anything is erased
    assert!(matches!(
        err,
        TransferError::Protocol(ProtocolError::Link(LinkError::SendFailed(_)))
    ));
    assert_eq!(manager.state(), SessionState::Faulted);
}

#[tokio::test(start_paused = true)]
async fn test_write_requires_open_session() {
    let ecu = SimulatedEcu::new();
    let (manager, _sink) = manager(&ecu, test_config());
    let flasher = FlashOrchestrator::new(manager);

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x80), &image(0x80))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::SessionNotOpen(SessionState::Closed)
    ));
    assert!(ecu.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_image_must_fill_region() {
    let ecu = SimulatedEcu::new();
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);

    let err = flasher
        .write_flash(MemoryRegion::write(0x8000, 0x100), &image(0x80))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidRegion(_)));

    let err = flasher
        .write_flash(MemoryRegion::read(0x8000, 0x80), &image(0x80))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidRegion(_)));

    assert!(ecu.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_job_is_busy() {
    let ecu = SimulatedEcu::new();
    ecu.silence_write_at(0x8000, 1);
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager);
    let data = image(0x80);
    let region = MemoryRegion::write(0x8000, 0x80);

    let (first, second) = tokio::join!(
        flasher.write_flash(region, &data),
        flasher.write_flash(region, &data)
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(TransferError::Busy)));
    assert!(!flasher.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_orchestrators_sharing_a_session_are_serialised() {
    let ecu = SimulatedEcu::new();
    ecu.silence_write_at(0x8000, 1);
    let (manager, _sink) = open_session(&ecu, test_config(), true).await;
    let first_flasher = FlashOrchestrator::new(manager.clone());
    let second_flasher = FlashOrchestrator::new(manager.clone());
    let data = image(0x80);
    let region = MemoryRegion::write(0x8000, 0x80);

    let (first, second) = tokio::join!(
        first_flasher.write_flash(region, &data),
        second_flasher.write_flash(region, &data)
    );

    assert!(first.is_ok(), "{:?}", first);
    assert!(matches!(second, Err(TransferError::Busy)));
    assert_eq!(ecu.erase_count(), 1);
    assert_eq!(ecu.reset_count(), 1);
    assert!(!manager.is_job_active());
}

#[tokio::test(start_paused = true)]
async fn test_engine_waits_for_running_job() {
    let ecu = SimulatedEcu::new();
    ecu.silence_write_at(0x8000, 1);
    let (manager, sink) = open_session(&ecu, test_config(), true).await;
    let flasher = FlashOrchestrator::new(manager.clone());
    let engine = BlockTransferEngine::new(manager.clone());
    let data = image(0x80);

    let single_region = MemoryRegion::write(0x9000, 0x10);
    let single_data = image(0x10);
    let (flashed, single) = tokio::join!(
        flasher.write_flash(MemoryRegion::write(0x8000, 0x80), &data),
        engine.write_block(&single_region, &single_data)
    );

    assert!(flashed.is_ok(), "{:?}", flashed);
    assert!(matches!(single, Err(TransferError::Busy)));
    assert_eq!(ecu.write_requests_at(0x9000), 0);
    assert_eq!(sink.infos(Severity::Error).len(), 1);
}

// =============================================================================
// Read
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_flash_unlocks_read_access() {
    let data = image(0x120);
    let ecu = SimulatedEcu::new().with_memory(0x10000, &data);
    let (manager, sink) = open_session(&ecu, test_config(), false).await;
    let flasher = FlashOrchestrator::new(manager.clone());

    let read = flasher
        .read_flash(MemoryRegion::read(0x10000, 0x120))
        .await
        .unwrap();

    assert_eq!(read, data);
    assert_eq!(
        ecu.requests_for(service_id::SECURITY_ACCESS)[0],
        vec![0x27, 0x03]
    );
    assert_eq!(manager.security_level(), SecurityLevel::Read);
    assert_eq!(
        ecu.requests_for(service_id::READ_MEMORY_BY_ADDRESS).len(),
        3
    );
    assert_eq!(sink.read_progress().last().copied(), Some(100));
}

// =============================================================================
// Live values
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_live_values_are_scaled() {
    let ecu = SimulatedEcu::new()
        .with_live_value(0x82, 1023)
        .with_live_value(0x90, 650);
    let (manager, _sink) = open_session(&ecu, test_config(), false).await;
    let flasher = FlashOrchestrator::new(manager);

    let adc = flasher.read_live_value(LiveChannel::Adc(2)).await.unwrap();
    let thermo = flasher.read_live_value(LiveChannel::Thermo).await.unwrap();

    assert!((adc - 5000.0).abs() < 0.01, "{}", adc);
    assert!((thermo - 25.0).abs() < 0.01, "{}", thermo);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_live_value() {
    let ecu = SimulatedEcu::new();
    let (manager, sink) = open_session(&ecu, test_config(), false).await;
    let flasher = FlashOrchestrator::new(manager);

    let err = flasher
        .read_live_value(LiveChannel::Adc(7))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::Protocol(ProtocolError::NegativeResponse {
            service: service_id::READ_DATA_BY_LOCAL_ID,
            nrc: NegativeResponseCode::RequestOutOfRange,
        })
    ));
    assert_eq!(sink.infos(Severity::Error).len(), 1);
}
