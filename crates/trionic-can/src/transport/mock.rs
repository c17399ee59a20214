//! Simulated ECU for testing
//!
//! [`SimulatedEcu`] implements [`CanTransport`] by decoding every request
//! the tester sends and queueing the frames of the ECU's answer. Clones
//! share state, so a test keeps one handle for fault injection and
//! inspection while the session owns another.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Addressing, CanFrame, CanTransport, LinkError};
use crate::codec::{self, Frame, Reassembler};
use crate::config::SecurityConfig;
use crate::kwp::{positive_response, NegativeResponseCode, ServiceIds};
use crate::session::{KeyAlgorithm, SecurityLevel, XorKeyAlgorithm};
use crate::transfer::block_checksum;

/// Value of erased or never written flash
pub const ERASED_BYTE: u8 = 0xFF;

/// In-memory ECU behind a CAN transport
#[derive(Clone)]
pub struct SimulatedEcu {
    inner: Arc<Mutex<EcuState>>,
}

struct EcuState {
    open: bool,
    baud_rate: Option<u32>,
    open_calls: Vec<(Option<String>, Option<u32>)>,
    addressing: Addressing,
    svc: ServiceIds,
    reassembler: Reassembler,
    outbox: VecDeque<CanFrame>,
    /// Frames that reach the bus at a later instant
    delayed: VecDeque<(Instant, CanFrame)>,
    requests: Vec<Vec<u8>>,
    memory: BTreeMap<u32, u8>,
    live_values: HashMap<u8, u16>,
    security: SecuritySim,
    faults: Faults,
    diagnostic_mode: Option<u8>,
    erase_count: usize,
    reset_count: usize,
}

struct SecuritySim {
    read_mode: u8,
    write_mode: u8,
    seed: Vec<u8>,
    algorithm: Arc<dyn KeyAlgorithm>,
    pending: Option<(u8, SecurityLevel)>,
    granted: SecurityLevel,
}

#[derive(Default)]
struct Faults {
    /// Only answer on this bitrate
    bus_baud: Option<u32>,
    fail_open: Option<LinkError>,
    fail_sends: bool,
    tester_present_silent: bool,
    already_unlocked: bool,
    reject_keys: u32,
    lock_out_keys: bool,
    /// Remaining corrupted acknowledgements per block address
    corrupt_write_ack: HashMap<u32, u32>,
    /// Remaining unanswered writes per block address
    silent_write: HashMap<u32, u32>,
    corrupt_read: HashMap<u32, u32>,
    pending_before_erase: u32,
    erase_completion_delay: Option<Duration>,
    /// Service id to name in the next negative response
    misattributed_nrc: Option<u8>,
    corrupt_exit_checksum: bool,
    /// Frame from another node sent ahead of every answer
    chatter: Option<CanFrame>,
}

impl Default for SimulatedEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEcu {
    /// ECU on the default addressing with seed `12 34` and an XOR `FF FF` key
    pub fn new() -> Self {
        let security = SecurityConfig::default();
        Self {
            inner: Arc::new(Mutex::new(EcuState {
                open: false,
                baud_rate: None,
                open_calls: Vec::new(),
                addressing: Addressing {
                    tx_id: 0x7E0,
                    rx_id: 0x7E8,
                },
                svc: ServiceIds::default(),
                reassembler: Reassembler::new(),
                outbox: VecDeque::new(),
                delayed: VecDeque::new(),
                requests: Vec::new(),
                memory: BTreeMap::new(),
                live_values: HashMap::new(),
                security: SecuritySim {
                    read_mode: security.read_access_mode,
                    write_mode: security.write_access_mode,
                    seed: vec![0x12, 0x34],
                    algorithm: Arc::new(XorKeyAlgorithm::new(vec![0xFF, 0xFF])),
                    pending: None,
                    granted: SecurityLevel::None,
                },
                faults: Faults::default(),
                diagnostic_mode: None,
                erase_count: 0,
                reset_count: 0,
            })),
        }
    }

    pub fn with_seed(self, seed: impl Into<Vec<u8>>) -> Self {
        self.inner.lock().security.seed = seed.into();
        self
    }

    pub fn with_key_algorithm(self, algorithm: Arc<dyn KeyAlgorithm>) -> Self {
        self.inner.lock().security.algorithm = algorithm;
        self
    }

    pub fn with_addressing(self, tx_id: u32, rx_id: u32) -> Self {
        self.inner.lock().addressing = Addressing { tx_id, rx_id };
        self
    }

    pub fn with_service_ids(self, svc: ServiceIds) -> Self {
        self.inner.lock().svc = svc;
        self
    }

    /// Only answer when opened at `baud_rate`
    pub fn with_bus_baud(self, baud_rate: u32) -> Self {
        self.inner.lock().faults.bus_baud = Some(baud_rate);
        self
    }

    pub fn with_memory(self, address: u32, data: &[u8]) -> Self {
        {
            let mut state = self.inner.lock();
            for (offset, byte) in data.iter().enumerate() {
                state.memory.insert(address.wrapping_add(offset as u32), *byte);
            }
        }
        self
    }

    pub fn with_live_value(self, local_id: u8, raw: u16) -> Self {
        self.inner.lock().live_values.insert(local_id, raw);
        self
    }

    // ---- fault injection ----------------------------------------------------

    /// Fail the next `open` with `error`
    pub fn fail_next_open(&self, error: LinkError) {
        self.inner.lock().faults.fail_open = Some(error);
    }

    /// Make every send fail as if the adapter was unplugged
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.lock().faults.fail_sends = fail;
    }

    pub fn set_tester_present_silent(&self, silent: bool) {
        self.inner.lock().faults.tester_present_silent = silent;
    }

    /// Answer seed requests with an all-zero seed
    pub fn set_already_unlocked(&self, unlocked: bool) {
        self.inner.lock().faults.already_unlocked = unlocked;
    }

    /// Reject the next `count` keys regardless of their value
    pub fn reject_next_keys(&self, count: u32) {
        self.inner.lock().faults.reject_keys = count;
    }

    /// Answer every key with ExceededNumberOfAttempts
    pub fn set_keys_locked_out(&self, locked_out: bool) {
        self.inner.lock().faults.lock_out_keys = locked_out;
    }

    /// Acknowledge the next `times` writes at `address` with a wrong checksum
    pub fn corrupt_write_ack_at(&self, address: u32, times: u32) {
        self.inner
            .lock()
            .faults
            .corrupt_write_ack
            .insert(address, times);
    }

    /// Leave the next `times` writes at `address` unanswered
    pub fn silence_write_at(&self, address: u32, times: u32) {
        self.inner.lock().faults.silent_write.insert(address, times);
    }

    /// Report a wrong checksum for the next `times` reads at `address`
    pub fn corrupt_read_at(&self, address: u32, times: u32) {
        self.inner.lock().faults.corrupt_read.insert(address, times);
    }

    /// Answer the erase routine with `count` "response pending" messages first
    pub fn pending_responses_before_erase(&self, count: u32) {
        self.inner.lock().faults.pending_before_erase = count;
    }

    /// Hold back the final answer to the erase routine for `delay`
    pub fn delay_erase_completion(&self, delay: Duration) {
        self.inner.lock().faults.erase_completion_delay = Some(delay);
    }

    /// Name `service` instead of the request in the next negative response
    pub fn misattribute_next_negative(&self, service: u8) {
        self.inner.lock().faults.misattributed_nrc = Some(service);
    }

    pub fn set_corrupt_exit_checksum(&self, corrupt: bool) {
        self.inner.lock().faults.corrupt_exit_checksum = corrupt;
    }

    /// Put `frame` on the bus ahead of every answer
    pub fn set_bus_chatter(&self, frame: Option<CanFrame>) {
        self.inner.lock().faults.chatter = frame;
    }

    /// Queue a raw frame as if it had arrived from the bus
    pub fn inject_frame(&self, frame: CanFrame) {
        self.inner.lock().outbox.push_back(frame);
    }

    // ---- inspection ---------------------------------------------------------

    /// Every complete request received, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.inner.lock().requests.clone()
    }

    pub fn requests_for(&self, service: u8) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|r| r.first() == Some(&service))
            .cloned()
            .collect()
    }

    /// Block addresses of every TransferData request, in order
    pub fn write_addresses(&self) -> Vec<u32> {
        let state = self.inner.lock();
        state
            .requests
            .iter()
            .filter(|r| r.first() == Some(&state.svc.transfer_data) && r.len() >= 5)
            .map(|r| read_u32(&r[1..5]))
            .collect()
    }

    pub fn write_requests_at(&self, address: u32) -> usize {
        self.write_addresses()
            .into_iter()
            .filter(|a| *a == address)
            .count()
    }

    pub fn memory(&self, address: u32, length: usize) -> Vec<u8> {
        self.inner.lock().read_memory(address, length)
    }

    pub fn open_calls(&self) -> Vec<(Option<String>, Option<u32>)> {
        self.inner.lock().open_calls.clone()
    }

    pub fn granted_level(&self) -> SecurityLevel {
        self.inner.lock().security.granted
    }

    pub fn diagnostic_mode(&self) -> Option<u8> {
        self.inner.lock().diagnostic_mode
    }

    pub fn erase_count(&self) -> usize {
        self.inner.lock().erase_count
    }

    pub fn reset_count(&self) -> usize {
        self.inner.lock().reset_count
    }

    pub fn clear_requests(&self) {
        self.inner.lock().requests.clear();
    }
}

#[async_trait]
impl CanTransport for SimulatedEcu {
    async fn open(&mut self, comport: Option<&str>, baud: Option<u32>) -> Result<(), LinkError> {
        let mut state = self.inner.lock();
        state
            .open_calls
            .push((comport.map(str::to_string), baud));
        if let Some(error) = state.faults.fail_open.take() {
            return Err(error);
        }
        state.open = true;
        state.baud_rate = baud;
        state.reassembler.reset();
        state.outbox.clear();
        state.delayed.clear();
        debug!(?comport, ?baud, "Simulated ECU: opened");
        Ok(())
    }

    async fn send(&mut self, frame: &CanFrame) -> Result<(), LinkError> {
        let mut state = self.inner.lock();
        if !state.open {
            return Err(LinkError::NotOpen);
        }
        if state.faults.fail_sends {
            return Err(LinkError::SendFailed("adapter disconnected".to_string()));
        }
        state.accept(frame);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, LinkError> {
        let next_due = {
            let mut state = self.inner.lock();
            if !state.open {
                return Err(LinkError::NotOpen);
            }
            state.release_due();
            if let Some(frame) = state.outbox.pop_front() {
                return Ok(Some(frame));
            }
            state
                .delayed
                .front()
                .map(|(due, _)| due.saturating_duration_since(Instant::now()))
        };

        // Apart from delayed frames, answers are queued as soon as a request
        // completes, so an empty outbox stays empty until the next send.
        match next_due {
            Some(until_due) if until_due < timeout => {
                tokio::time::sleep(until_due).await;
                let mut state = self.inner.lock();
                state.release_due();
                Ok(state.outbox.pop_front())
            }
            _ => {
                if !timeout.is_zero() {
                    tokio::time::sleep(timeout).await;
                }
                Ok(None)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    async fn close(&mut self) {
        let mut state = self.inner.lock();
        if state.open {
            debug!("Simulated ECU: closed");
        }
        state.open = false;
        state.outbox.clear();
        state.delayed.clear();
        state.reassembler.reset();
        state.security.pending = None;
        state.security.granted = SecurityLevel::None;
    }
}

impl EcuState {
    fn accept(&mut self, raw: &CanFrame) {
        if raw.id != self.addressing.tx_id {
            return;
        }
        let frame = match Frame::from_bytes(&raw.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Simulated ECU: dropped malformed frame");
                return;
            }
        };
        let request = match self.reassembler.push(&frame) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Simulated ECU: dropped message");
                return;
            }
        };

        self.requests.push(request.clone());

        if let Some(bus_baud) = self.faults.bus_baud {
            if self.baud_rate != Some(bus_baud) {
                return;
            }
        }

        let mut responses = self.handle(&request);
        if let (Some(chatter), false) = (&self.faults.chatter, responses.is_empty()) {
            self.outbox.push_back(chatter.clone());
        }

        let negative_response = self.svc.negative_response;
        if let Some(service) = self.faults.misattributed_nrc {
            if let Some(response) = responses
                .iter_mut()
                .find(|r| r.len() >= 2 && r[0] == negative_response)
            {
                response[1] = service;
                self.faults.misattributed_nrc = None;
            }
        }

        // A held-back answer follows everything else
        let held = match self.faults.erase_completion_delay.take() {
            Some(delay) if request[0] == self.svc.start_routine_by_local_id => {
                responses.pop().map(|last| (Instant::now() + delay, last))
            }
            other => {
                self.faults.erase_completion_delay = other;
                None
            }
        };

        for response in responses {
            let frames = self.frames_for(&response);
            self.outbox.extend(frames);
        }
        if let Some((due, response)) = held {
            let frames = self.frames_for(&response);
            self.delayed.extend(frames.into_iter().map(|frame| (due, frame)));
        }
    }

    fn frames_for(&self, response: &[u8]) -> Vec<CanFrame> {
        match codec::encode(response) {
            Ok(frames) => frames
                .iter()
                .map(|f| CanFrame::new(self.addressing.rx_id, f.as_bytes().to_vec()))
                .collect(),
            Err(e) => {
                debug!(error = %e, "Simulated ECU: response too large");
                Vec::new()
            }
        }
    }

    fn release_due(&mut self) {
        let now = Instant::now();
        while let Some((due, _)) = self.delayed.front() {
            if *due > now {
                break;
            }
            if let Some((_, frame)) = self.delayed.pop_front() {
                self.outbox.push_back(frame);
            }
        }
    }

    fn handle(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = request[0];
        let svc = self.svc;

        let response = if sid == svc.tester_present {
            self.tester_present(request)
        } else if sid == svc.start_diagnostic_session {
            self.start_diagnostic_session(request)
        } else if sid == svc.security_access {
            self.security_access(request)
        } else if sid == svc.transfer_data {
            self.transfer_data(request)
        } else if sid == svc.read_memory_by_address {
            self.read_memory_by_address(request)
        } else if sid == svc.start_routine_by_local_id {
            return self.start_routine(request);
        } else if sid == svc.request_transfer_exit {
            self.request_transfer_exit(request)
        } else if sid == svc.ecu_reset {
            self.ecu_reset(request)
        } else if sid == svc.read_data_by_local_id {
            self.read_local_identifier(request)
        } else {
            Some(self.negative(sid, NegativeResponseCode::ServiceNotSupported))
        };

        response.into_iter().collect()
    }

    fn negative(&self, sid: u8, nrc: NegativeResponseCode) -> Vec<u8> {
        vec![self.svc.negative_response, sid, nrc.into()]
    }

    fn positive(&self, sid: u8, body: &[u8]) -> Vec<u8> {
        let mut response = vec![positive_response(sid)];
        response.extend_from_slice(body);
        response
    }

    fn tester_present(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if self.faults.tester_present_silent {
            return None;
        }
        match request.get(1) {
            Some(&0x02) => None,
            _ => Some(self.positive(request[0], &[])),
        }
    }

    fn start_diagnostic_session(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let Some(&mode) = request.get(1) else {
            return Some(self.negative(request[0], NegativeResponseCode::SubFunctionNotSupported));
        };
        self.diagnostic_mode = Some(mode);
        Some(self.positive(request[0], &[mode]))
    }

    fn security_access(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = request[0];
        let Some(&mode) = request.get(1) else {
            return Some(self.negative(sid, NegativeResponseCode::SubFunctionNotSupported));
        };

        if mode % 2 == 1 {
            let level = if mode == self.security.write_mode {
                SecurityLevel::Write
            } else if mode == self.security.read_mode {
                SecurityLevel::Read
            } else {
                return Some(self.negative(sid, NegativeResponseCode::SubFunctionNotSupported));
            };

            if self.faults.already_unlocked || self.security.granted >= level {
                self.security.granted = self.security.granted.max(level);
                let zero_seed = vec![0u8; self.security.seed.len().max(1)];
                let mut body = vec![mode];
                body.extend_from_slice(&zero_seed);
                return Some(self.positive(sid, &body));
            }

            self.security.pending = Some((mode, level));
            let mut body = vec![mode];
            body.extend_from_slice(&self.security.seed);
            return Some(self.positive(sid, &body));
        }

        let Some((seed_mode, level)) = self.security.pending.take() else {
            return Some(self.negative(sid, NegativeResponseCode::RequestSequenceError));
        };
        if mode != seed_mode.wrapping_add(1) {
            return Some(self.negative(sid, NegativeResponseCode::RequestSequenceError));
        }
        if self.faults.lock_out_keys {
            return Some(self.negative(sid, NegativeResponseCode::ExceededNumberOfAttempts));
        }
        if self.faults.reject_keys > 0 {
            self.faults.reject_keys -= 1;
            return Some(self.negative(sid, NegativeResponseCode::InvalidKey));
        }

        let expected = self
            .security
            .algorithm
            .compute_key(&self.security.seed, level);
        if request[2..] != expected[..] {
            return Some(self.negative(sid, NegativeResponseCode::InvalidKey));
        }

        self.security.granted = self.security.granted.max(level);
        Some(self.positive(sid, &[mode]))
    }

    fn transfer_data(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = request[0];
        if self.security.granted < SecurityLevel::Write {
            return Some(self.negative(sid, NegativeResponseCode::SecurityAccessDenied));
        }
        let Some((address, length)) = parse_block_header(request) else {
            return Some(self.negative(sid, NegativeResponseCode::IllegalByteCountInBlockTransfer));
        };
        let data = &request[7..];
        if data.len() != length {
            return Some(self.negative(sid, NegativeResponseCode::IllegalByteCountInBlockTransfer));
        }

        if take_fault(&mut self.faults.silent_write, address) {
            return None;
        }

        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u32), *byte);
        }

        let mut checksum = block_checksum(data);
        if take_fault(&mut self.faults.corrupt_write_ack, address) {
            checksum = !checksum;
        }
        Some(self.positive(sid, &checksum.to_be_bytes()))
    }

    fn read_memory_by_address(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = request[0];
        if self.security.granted < SecurityLevel::Read {
            return Some(self.negative(sid, NegativeResponseCode::SecurityAccessDenied));
        }
        let Some((address, length)) = parse_block_header(request) else {
            return Some(self.negative(sid, NegativeResponseCode::RequestOutOfRange));
        };

        let data = self.read_memory(address, length);
        let mut checksum = block_checksum(&data);
        if take_fault(&mut self.faults.corrupt_read, address) {
            checksum = !checksum;
        }

        let mut body = data;
        body.extend_from_slice(&checksum.to_be_bytes());
        Some(self.positive(sid, &body))
    }

    fn start_routine(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = request[0];
        if self.security.granted < SecurityLevel::Write {
            return vec![self.negative(sid, NegativeResponseCode::SecurityAccessDenied)];
        }
        let Some((routine_id, address, length)) = parse_range(request, 2)
            .and_then(|(address, length)| request.get(1).map(|id| (*id, address, length)))
        else {
            return vec![self.negative(sid, NegativeResponseCode::RequestOutOfRange)];
        };

        let end = address as u64 + length as u64;
        self.memory
            .retain(|addr, _| (*addr as u64) < address as u64 || (*addr as u64) >= end);
        self.erase_count += 1;

        let mut responses: Vec<Vec<u8>> = (0..self.faults.pending_before_erase)
            .map(|_| self.negative(sid, NegativeResponseCode::ResponsePending))
            .collect();
        self.faults.pending_before_erase = 0;
        responses.push(self.positive(sid, &[routine_id]));
        responses
    }

    fn request_transfer_exit(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = request[0];
        let Some((address, length)) = parse_range(request, 1) else {
            return Some(self.negative(sid, NegativeResponseCode::RequestOutOfRange));
        };
        let data = self.read_memory(address, length as usize);
        let mut checksum = block_checksum(&data);
        if self.faults.corrupt_exit_checksum {
            checksum = !checksum;
        }
        Some(self.positive(sid, &checksum.to_be_bytes()))
    }

    fn ecu_reset(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let mode = request.get(1).copied().unwrap_or(0x01);
        self.reset_count += 1;
        self.security.granted = SecurityLevel::None;
        self.security.pending = None;
        self.diagnostic_mode = None;
        Some(self.positive(request[0], &[mode]))
    }

    fn read_local_identifier(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = request[0];
        let value = request
            .get(1)
            .and_then(|id| self.live_values.get(id).map(|raw| (*id, *raw)));
        match value {
            Some((id, raw)) => {
                let [hi, lo] = raw.to_be_bytes();
                Some(self.positive(sid, &[id, hi, lo]))
            }
            None => Some(self.negative(sid, NegativeResponseCode::RequestOutOfRange)),
        }
    }

    fn read_memory(&self, address: u32, length: usize) -> Vec<u8> {
        (0..length)
            .map(|offset| {
                self.memory
                    .get(&address.wrapping_add(offset as u32))
                    .copied()
                    .unwrap_or(ERASED_BYTE)
            })
            .collect()
    }
}

/// Consume one pending occurrence of a per-address fault
fn take_fault(faults: &mut HashMap<u32, u32>, address: u32) -> bool {
    match faults.get_mut(&address) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// `[sid, addr(4), len(2), ...]`
fn parse_block_header(request: &[u8]) -> Option<(u32, usize)> {
    if request.len() < 7 {
        return None;
    }
    let address = read_u32(&request[1..5]);
    let length = u16::from_be_bytes([request[5], request[6]]) as usize;
    Some((address, length))
}

/// `addr(4), len(4)` starting at `offset`
fn parse_range(request: &[u8], offset: usize) -> Option<(u32, u32)> {
    let bytes = request.get(offset..offset + 8)?;
    Some((read_u32(&bytes[..4]), read_u32(&bytes[4..])))
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
