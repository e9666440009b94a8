//! Protocol state machine.
//!
//! One [`Session`] per bootloader lifetime. The only accepted walk is
//! handshake → prepare → data → verify; everything else is rejected
//! without touching flash. Validation failures leave the state alone so
//! the client can retry; flash failures are fatal for the session.

use heapless::Vec;

use crate::flash::{FlashControl, Staging, PAGE_SIZE};

use super::messages::{
    crc32, Ack, DataPacket, FlashResult, Handshake, HandshakeAck, Prepare, Request, RequestKind,
    Response, ResponseKind, ResultCode, MAX_DATA,
};

/// Reported in the handshake acknowledgement.
pub const BOOTLOADER_VERSION: &str = "4.7.0";

/// Capability set this host implements.
pub const CAPABILITIES: &str = "flash_program,verify,error_recovery";

/// Capability a client must request.
const REQUIRED_CAPABILITY: &str = "flash_program";

/// Verify-phase attempts before the cycle is abandoned.
const VERIFY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Idle,
    HandshakeComplete,
    ReadyForData,
    DataReceived,
    ProgrammingComplete,
    Error,
}

/// Per-session diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionStats {
    pub requests: u32,
    pub accepted: u32,
    pub invalid_state: u32,
    pub crc_failures: u32,
    pub flash_errors: u32,
    pub verify_retries: u32,
}

enum Reject {
    InvalidState,
    PayloadTooLarge,
    Unsupported,
    CrcMismatch,
    Flash,
}

impl Reject {
    fn result(&self) -> ResultCode {
        match self {
            Reject::CrcMismatch => ResultCode::ErrorDataCorruption,
            Reject::Flash => ResultCode::ErrorFlashOperation,
            _ => ResultCode::ErrorInvalidRequest,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Reject::InvalidState => "request not valid in current state",
            Reject::PayloadTooLarge => "length exceeds limit",
            Reject::Unsupported => "missing required capability",
            Reject::CrcMismatch => "data integrity check failed",
            Reject::Flash => "flash operation failed",
        }
    }
}

/// Protocol session: state, staging context and the retained data image
/// used by verify-phase recovery.
pub struct Session {
    state: State,
    staging: Staging,
    target: u32,
    expected_length: u32,
    actual_length: u32,
    data: Vec<u8, MAX_DATA>,
    stats: SessionStats,
}

impl Session {
    /// `target` is the page the active bank starts at.
    pub fn new(target: u32) -> Self {
        Self {
            state: State::Idle,
            staging: Staging::new(),
            target,
            expected_length: 0,
            actual_length: 0,
            data: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Soft reset: back to `Idle` with staging and the retained image
    /// cleared. Statistics survive.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.staging = Staging::new();
        self.expected_length = 0;
        self.actual_length = 0;
        self.data.clear();
    }

    /// Process one request and produce the mirrored response.
    pub fn handle<F: FlashControl>(&mut self, flash: &mut F, request: &Request) -> Response {
        self.stats.requests += 1;
        let sequence_id = request.sequence_id;

        let outcome = match &request.kind {
            RequestKind::Handshake(h) => self.on_handshake(h),
            RequestKind::Prepare(p) => self.on_prepare(flash, p),
            RequestKind::Data(d) => self.on_data(flash, d),
            RequestKind::Verify(_) => self.on_verify(flash),
        };

        match outcome {
            Ok(kind) => {
                self.stats.accepted += 1;
                Response {
                    sequence_id,
                    result: ResultCode::Success,
                    kind,
                }
            }
            Err(reject) => {
                match reject {
                    Reject::InvalidState => self.stats.invalid_state += 1,
                    Reject::CrcMismatch => self.stats.crc_failures += 1,
                    Reject::Flash => self.stats.flash_errors += 1,
                    _ => {}
                }
                debug!("request {} rejected: {}", sequence_id, reject.message());
                Response {
                    sequence_id,
                    result: reject.result(),
                    kind: ResponseKind::Ack(Ack {
                        success: false,
                        message: reject.message().try_into().unwrap_or_default(),
                    }),
                }
            }
        }
    }

    fn on_handshake(&mut self, handshake: &Handshake) -> Result<ResponseKind, Reject> {
        if self.state != State::Idle {
            return Err(Reject::InvalidState);
        }
        if !handshake
            .capabilities
            .split(',')
            .any(|cap| cap == REQUIRED_CAPABILITY)
        {
            return Err(Reject::Unsupported);
        }
        if handshake.max_packet_size > MAX_DATA as u32 {
            return Err(Reject::PayloadTooLarge);
        }

        info!("handshake accepted, target {=u32:#x}", self.target);
        self.state = State::HandshakeComplete;
        Ok(ResponseKind::HandshakeAck(HandshakeAck {
            bootloader_version: BOOTLOADER_VERSION.try_into().unwrap_or_default(),
            supported_capabilities: CAPABILITIES.try_into().unwrap_or_default(),
            flash_page_size: PAGE_SIZE as u32,
            target_flash_address: self.target,
        }))
    }

    fn on_prepare<F: FlashControl>(
        &mut self,
        flash: &mut F,
        prepare: &Prepare,
    ) -> Result<ResponseKind, Reject> {
        if self.state != State::HandshakeComplete {
            return Err(Reject::InvalidState);
        }
        if prepare.total_data_length == 0 || prepare.total_data_length > MAX_DATA as u32 {
            return Err(Reject::PayloadTooLarge);
        }

        self.staging.begin(self.target);
        if self.staging.erase(flash).is_err() {
            self.state = State::Error;
            return Err(Reject::Flash);
        }

        self.expected_length = prepare.total_data_length;
        self.actual_length = 0;
        self.data.clear();
        self.state = State::ReadyForData;
        Ok(ResponseKind::Ack(Ack {
            success: true,
            message: heapless::String::new(),
        }))
    }

    fn on_data<F: FlashControl>(
        &mut self,
        flash: &mut F,
        packet: &DataPacket,
    ) -> Result<ResponseKind, Reject> {
        if self.state != State::ReadyForData {
            return Err(Reject::InvalidState);
        }
        // Single-packet transfer: the whole image arrives at offset 0.
        if packet.offset != 0 || packet.data.len() != self.expected_length as usize {
            return Err(Reject::InvalidState);
        }
        if crc32(&packet.data) != packet.data_crc32 {
            return Err(Reject::CrcMismatch);
        }

        if self.staging.stage(flash, &packet.data).is_err() {
            self.state = State::Error;
            return Err(Reject::Flash);
        }

        self.data.clear();
        let _ = self.data.extend_from_slice(&packet.data);
        self.actual_length = packet.data.len() as u32;
        self.state = State::DataReceived;
        Ok(ResponseKind::Ack(Ack {
            success: true,
            message: heapless::String::new(),
        }))
    }

    fn on_verify<F: FlashControl>(&mut self, flash: &mut F) -> Result<ResponseKind, Reject> {
        if self.state != State::DataReceived {
            return Err(Reject::InvalidState);
        }

        for attempt in 1..=VERIFY_ATTEMPTS {
            match self.commit(flash) {
                Ok(()) => {
                    self.state = State::ProgrammingComplete;
                    let hash = self.region_hash(flash)?;
                    info!("programming verified after {} attempt(s)", attempt);
                    return Ok(ResponseKind::FlashResult(FlashResult {
                        bytes_programmed: self.staging.bytes_programmed(),
                        actual_data_length: self.actual_length,
                        verification_hash: hash,
                    }));
                }
                Err(_) if attempt < VERIFY_ATTEMPTS => {
                    self.stats.verify_retries += 1;
                    warn!("verify attempt {} failed, re-erasing", attempt);
                    // Re-erase and restage from the retained image; a
                    // failure here simply burns the next attempt.
                    self.staging.begin(self.target);
                    let _ = self.staging.stage(flash, &self.data);
                }
                Err(_) => {
                    self.stats.flash_errors += 1;
                    self.state = State::Error;
                    return Err(Reject::Flash);
                }
            }
        }
        unreachable!()
    }

    /// Flush the staging window, then prove the image really is in
    /// flash: no silently-skipped doubleword, contents equal to the
    /// retained data.
    fn commit<F: FlashControl>(&mut self, flash: &mut F) -> Result<(), crate::flash::Error> {
        self.staging.flush(flash)?;
        self.staging.integrity_check(flash)?;
        self.staging.verify(flash, self.target, &self.data)
    }

    /// CRC-32 over the programmed region, as the response hash bytes
    /// (big-endian).
    fn region_hash<F: FlashControl>(&self, flash: &F) -> Result<[u8; 4], Reject> {
        let mut hasher = crc32fast::Hasher::new();
        let mut chunk = [0u8; 64];
        let mut remaining = self.actual_length as usize;
        let mut addr = self.target;
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            flash
                .read(addr, &mut chunk[..take])
                .map_err(|_| Reject::Flash)?;
            hasher.update(&chunk[..take]);
            addr += take as u32;
            remaining -= take;
        }
        Ok(hasher.finalize().to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::BANK_A_ADDR;
    use crate::sim::SimFlash;

    fn session() -> (Session, SimFlash) {
        (Session::new(BANK_A_ADDR), SimFlash::new())
    }

    fn handshake(session: &mut Session, flash: &mut SimFlash) {
        let resp = session.handle(flash, &Request::handshake(1, "flash_program", 256));
        assert_eq!(resp.result, ResultCode::Success);
    }

    #[test]
    fn handshake_reports_geometry() {
        let (mut session, mut flash) = session();
        let resp = session.handle(&mut flash, &Request::handshake(1, "flash_program", 256));
        assert_eq!(resp.sequence_id, 1);
        assert_eq!(resp.result, ResultCode::Success);
        match resp.kind {
            ResponseKind::HandshakeAck(ack) => {
                assert_eq!(ack.flash_page_size, PAGE_SIZE as u32);
                assert_eq!(ack.target_flash_address, BANK_A_ADDR);
                assert_eq!(ack.bootloader_version.as_str(), BOOTLOADER_VERSION);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(session.state(), State::HandshakeComplete);
    }

    #[test]
    fn handshake_requires_capability_and_size() {
        let (mut session, mut flash) = session();
        let resp = session.handle(&mut flash, &Request::handshake(1, "telemetry", 256));
        assert_eq!(resp.result, ResultCode::ErrorInvalidRequest);
        assert_eq!(session.state(), State::Idle);

        let resp = session.handle(&mut flash, &Request::handshake(2, "flash_program", 4096));
        assert_eq!(resp.result, ResultCode::ErrorInvalidRequest);
        assert_eq!(session.state(), State::Idle);
    }

    #[test]
    fn prepare_out_of_order_is_rejected() {
        let (mut session, mut flash) = session();
        let resp = session.handle(&mut flash, &Request::prepare(1, 16));
        assert_eq!(resp.result, ResultCode::ErrorInvalidRequest);
        assert_eq!(session.state(), State::Idle);
        assert_eq!(session.stats().invalid_state, 1);
    }

    #[test]
    fn prepare_erases_the_target_page() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        let resp = session.handle(&mut flash, &Request::prepare(2, 16));
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(session.state(), State::ReadyForData);
        assert_eq!(flash.erase_count(BANK_A_ADDR), 1);
    }

    #[test]
    fn data_with_bad_crc_leaves_state_and_staging() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        session.handle(&mut flash, &Request::prepare(2, 4));

        let mut request = Request::data(3, 0, &[1, 2, 3, 4]);
        if let RequestKind::Data(d) = &mut request.kind {
            d.data_crc32 ^= 1;
        }
        let resp = session.handle(&mut flash, &request);
        assert_eq!(resp.result, ResultCode::ErrorDataCorruption);
        assert_eq!(session.state(), State::ReadyForData);
        assert_eq!(session.staging.bytes_programmed(), 0);
        assert_eq!(session.stats().crc_failures, 1);

        // The correct packet still goes through.
        let resp = session.handle(&mut flash, &Request::data(4, 0, &[1, 2, 3, 4]));
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(session.state(), State::DataReceived);
    }

    #[test]
    fn data_length_must_match_prepare() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        session.handle(&mut flash, &Request::prepare(2, 8));

        let resp = session.handle(&mut flash, &Request::data(3, 0, &[0; 4]));
        assert_eq!(resp.result, ResultCode::ErrorInvalidRequest);
        assert_eq!(session.state(), State::ReadyForData);
    }

    #[test]
    fn full_cycle_reports_flash_hash() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        session.handle(&mut flash, &Request::prepare(2, 16));

        let data: [u8; 16] = core::array::from_fn(|i| i as u8);
        let resp = session.handle(&mut flash, &Request::data(3, 0, &data));
        assert_eq!(resp.result, ResultCode::Success);
        // 16 bytes = two whole doublewords, already committed.
        assert_eq!(session.staging.bytes_programmed(), 16);

        let resp = session.handle(&mut flash, &Request::verify(4));
        assert_eq!(resp.result, ResultCode::Success);
        match resp.kind {
            ResponseKind::FlashResult(r) => {
                assert_eq!(r.bytes_programmed, 16);
                assert_eq!(r.actual_data_length, 16);
                assert_eq!(r.verification_hash, crc32(&data).to_be_bytes());
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(session.state(), State::ProgrammingComplete);
        assert_eq!(flash.region(BANK_A_ADDR, 16), &data);
    }

    #[test]
    fn verify_retries_after_transient_corruption() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        session.handle(&mut flash, &Request::prepare(2, 16));
        let data: [u8; 16] = core::array::from_fn(|i| (i as u8) | 0x40);
        session.handle(&mut flash, &Request::data(3, 0, &data));

        // Wipe the programmed words behind the engine's back; the first
        // verify attempt sees erased flash and recovers by restaging.
        flash.patch(BANK_A_ADDR, &[0xFF; 16]);
        let resp = session.handle(&mut flash, &Request::verify(4));
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(session.stats().verify_retries, 1);
        assert_eq!(flash.region(BANK_A_ADDR, 16), &data);
    }

    #[test]
    fn verify_gives_up_after_bounded_attempts() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        session.handle(&mut flash, &Request::prepare(2, 8));
        session.handle(&mut flash, &Request::data(3, 0, &[0x5A; 8]));

        // Every subsequent program silently fails.
        flash.patch(BANK_A_ADDR, &[0xFF; 8]);
        flash.drop_programs(true);
        let resp = session.handle(&mut flash, &Request::verify(4));
        assert_eq!(resp.result, ResultCode::ErrorFlashOperation);
        assert_eq!(session.state(), State::Error);
        assert_eq!(session.stats().verify_retries, VERIFY_ATTEMPTS - 1);
    }

    #[test]
    fn reset_returns_to_idle_and_requires_new_handshake() {
        let (mut session, mut flash) = session();
        handshake(&mut session, &mut flash);
        session.reset();
        assert_eq!(session.state(), State::Idle);

        let resp = session.handle(&mut flash, &Request::prepare(5, 16));
        assert_eq!(resp.result, ResultCode::ErrorInvalidRequest);

        handshake(&mut session, &mut flash);
        assert_eq!(session.state(), State::HandshakeComplete);
    }
}
