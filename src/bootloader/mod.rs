//! Bootloader protocol engine.
//!
//! Owns the foreground receive path: bytes arrive in the SPSC queue
//! (pushed by the receive ISR or by [`pump_transport`] in polled
//! setups), flow through the frame decoder into the message handler, and
//! replies go back out framed over the transport.
//!
//! Two timers run against the platform tick: an idle session falls back
//! to `Idle` after the session timeout without dropping the transport,
//! and a frame left half-received past the frame timeout resets only the
//! decoder. Emergency shutdown is the one terminal transition.

use crate::flash::{self, Bank, FlashControl};
use crate::frame::{self, FrameDecoder};
use crate::platform::HostIo;
use crate::queue::{Consumer, Producer, RX_QUEUE_DEPTH};
use crate::time::{elapsed, Clock};

pub mod handler;
pub mod messages;
pub mod wire;

pub use handler::{Session, SessionStats, State, BOOTLOADER_VERSION, CAPABILITIES};
pub use messages::{Request, Response, ResultCode};

/// Session timeout: inactivity after which the protocol resets to idle.
pub const DEFAULT_SESSION_TIMEOUT_MS: u32 = 30_000;

/// Frame timeout: a partial frame older than this is abandoned.
pub const DEFAULT_FRAME_TIMEOUT_MS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub session_timeout_ms: u32,
    pub frame_timeout_ms: u32,
    /// Bank preferred at entry; the health probe may override it.
    pub preferred_bank: Bank,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            preferred_bank: Bank::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The transport failed to accept a reply.
    Transport,
    /// A response did not fit the wire limits.
    Encode,
}

/// What one `poll` iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Active,
}

/// Engine-level diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    pub frames_received: u32,
    pub responses_sent: u32,
    pub decode_failures: u32,
    pub encode_failures: u32,
    pub frame_timeouts: u32,
    pub session_timeouts: u32,
}

// - MARK: Transport

/// Byte transport capability set.
///
/// The engine is generic over anything that can move bytes; provided
/// methods make the optional capabilities free to skip.
pub trait Transport {
    type Error;

    fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Queue `bytes` for transmission, blocking until accepted.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Non-blocking single-byte receive.
    fn receive(&mut self) -> nb::Result<u8, Self::Error>;

    /// True when `receive` would yield a byte.
    fn available(&mut self) -> bool;

    /// Drain any transmit buffering.
    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportStats {
    pub bytes_sent: u32,
    pub bytes_received: u32,
}

/// [`Transport`] over any embedded-io byte stream.
pub struct SerialTransport<T> {
    inner: T,
    stats: TransportStats,
}

impl<T> SerialTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            stats: TransportStats::default(),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Transport for SerialTransport<T>
where
    T: embedded_io::Read + embedded_io::Write + embedded_io::ReadReady,
{
    type Error = T::Error;

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.inner.write_all(bytes)?;
        self.stats.bytes_sent += bytes.len() as u32;
        Ok(())
    }

    fn receive(&mut self) -> nb::Result<u8, Self::Error> {
        if !self.inner.read_ready().map_err(nb::Error::Other)? {
            return Err(nb::Error::WouldBlock);
        }
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte).map_err(nb::Error::Other)? {
            0 => Err(nb::Error::WouldBlock),
            _ => {
                self.stats.bytes_received += 1;
                Ok(byte[0])
            }
        }
    }

    fn available(&mut self) -> bool {
        self.inner.read_ready().unwrap_or(false)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.inner.flush()
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

/// Move every available transport byte into the receive queue.
///
/// Polled alternative to a receive interrupt; returns how many bytes
/// moved.
pub fn pump_transport<T: Transport, const N: usize>(
    transport: &mut T,
    rx: &mut Producer<'_, N>,
) -> usize {
    let mut moved = 0;
    loop {
        match transport.receive() {
            Ok(byte) => {
                if !rx.push(byte) {
                    break;
                }
                moved += 1;
            }
            Err(_) => break,
        }
    }
    moved
}

// - MARK: Engine

/// The protocol engine. Owns the consumer half of the byte queue, the
/// frame decoder and the session; borrows platform resources per poll.
pub struct Bootloader<'q, const N: usize = RX_QUEUE_DEPTH> {
    rx: Consumer<'q, N>,
    decoder: FrameDecoder,
    session: Session,
    config: Config,
    last_activity: u32,
    last_byte: u32,
    stopped: bool,
    stats: Stats,
}

impl<'q, const N: usize> Bootloader<'q, N> {
    /// Bootloader entry: runs the dual-bank health check and arms a
    /// fresh session against the surviving bank.
    pub fn new<F: FlashControl, C: Clock>(
        rx: Consumer<'q, N>,
        flash: &F,
        clock: &C,
        config: Config,
    ) -> Self {
        let bank = flash::select_bank(flash, config.preferred_bank);
        info!("bootloader entry, active bank {=u32:#x}", bank.address());
        let now = clock.tick_ms();
        Self {
            rx,
            decoder: FrameDecoder::new(),
            session: Session::new(bank.address()),
            config,
            last_activity: now,
            last_byte: now,
            stopped: false,
            stats: Stats::default(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn decode_errors(&self) -> u32 {
        self.decoder.decode_errors()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// One cooperative iteration: timeouts, queue drain, frame handling
    /// and reply transmission.
    pub fn poll<F, C, T>(
        &mut self,
        flash: &mut F,
        clock: &C,
        transport: &mut T,
    ) -> Result<Activity, Error>
    where
        F: FlashControl,
        C: Clock,
        T: Transport,
    {
        if self.stopped {
            return Ok(Activity::Idle);
        }
        let now = clock.tick_ms();

        if self.decoder.in_frame()
            && elapsed(self.last_byte, now) >= self.config.frame_timeout_ms
        {
            debug!("frame timeout, resetting decoder");
            self.decoder.reset();
            self.stats.frame_timeouts += 1;
        }
        if self.session.state() != State::Idle
            && elapsed(self.last_activity, now) >= self.config.session_timeout_ms
        {
            info!("session timeout, back to idle");
            self.soft_reset(now);
            self.stats.session_timeouts += 1;
        }

        if self.rx.take_overflow() {
            warn!("rx queue overflow, bytes were dropped");
        }

        let mut activity = Activity::Idle;
        while let Some(byte) = self.rx.pop() {
            activity = Activity::Active;
            self.last_byte = now;
            self.last_activity = now;

            // Decode errors are counted by the decoder itself;
            // resynchronization is its job.
            let completed = matches!(self.decoder.push(byte), Ok(Some(_)));
            if completed {
                self.stats.frames_received += 1;
                self.dispatch_frame(flash, transport)?;
                if self.session.state() == State::ProgrammingComplete {
                    info!("programming cycle complete");
                    self.session.reset();
                }
            }
        }
        Ok(activity)
    }

    /// Decode the just-completed frame from the decoder and answer it.
    fn dispatch_frame<F: FlashControl, T: Transport>(
        &mut self,
        flash: &mut F,
        transport: &mut T,
    ) -> Result<(), Error> {
        let Self {
            decoder,
            session,
            stats,
            ..
        } = self;
        let payload = decoder.last_frame();

        match Request::decode(payload) {
            Ok(request) => {
                let response = session.handle(flash, &request);
                Self::send_response(stats, transport, &response)
            }
            Err((Some(sequence_id), _)) => {
                stats.decode_failures += 1;
                let response = Response::invalid_request(sequence_id);
                Self::send_response(stats, transport, &response)
            }
            Err((None, _)) => {
                // Not even a sequence id; the client's frame timeout
                // covers this.
                stats.decode_failures += 1;
                Ok(())
            }
        }
    }

    fn send_response<T: Transport>(
        stats: &mut Stats,
        transport: &mut T,
        response: &Response,
    ) -> Result<(), Error> {
        let mut payload = [0u8; frame::MAX_PAYLOAD];
        let payload_len = match response.encode(&mut payload) {
            Ok(n) => n,
            Err(_) => {
                stats.encode_failures += 1;
                return Err(Error::Encode);
            }
        };

        let mut framed = [0u8; frame::MAX_FRAME];
        let framed_len = match frame::encode(&payload[..payload_len], &mut framed) {
            Ok(n) => n,
            Err(_) => {
                stats.encode_failures += 1;
                return Err(Error::Encode);
            }
        };

        transport
            .send(&framed[..framed_len])
            .map_err(|_| Error::Transport)?;
        transport.flush().map_err(|_| Error::Transport)?;
        stats.responses_sent += 1;
        Ok(())
    }

    /// Soft reset: protocol and staging state only, transport untouched.
    pub fn reset_session<C: Clock>(&mut self, clock: &C) {
        self.soft_reset(clock.tick_ms());
    }

    fn soft_reset(&mut self, now: u32) {
        self.session.reset();
        self.decoder.reset();
        self.last_activity = now;
    }

    /// Emergency shutdown: peripherals to a safe state, flash locked,
    /// engine stopped for good.
    pub fn shutdown<IO: HostIo, F: FlashControl>(&mut self, io: &mut IO, flash: &mut F) {
        warn!("emergency shutdown");
        io.safe_state();
        flash.lock();
        self.stopped = true;
    }
}
