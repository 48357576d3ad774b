//! # Modbus RTU Transport Layer
//!
//! This module drives one request/response exchange at a time over a
//! half-duplex serial channel.
//!
//! ## Exchange Contract
//!
//! 1. Drain and discard whatever is pending in the receive buffer, so bytes
//!    from an earlier (possibly timed-out) exchange cannot corrupt framing.
//! 2. Write the request frame and wait for the flush to complete.
//! 3. Read the response with exact-count reads under a single deadline.
//! 4. Validate the frame with the [codec](crate::codec).
//!
//! ## Read Strategies
//!
//! Two read shapes are supported and converge on the same result for the same
//! wire bytes:
//!
//! - [`ReadStrategy::StagedPrefix`] reads a 5-byte prefix, which is a complete
//!   exception frame or the start of a data frame, then the remaining
//!   `byte_count` bytes.
//! - [`ReadStrategy::FullFrame`] reads the full expected frame in one go. A
//!   short read is inspected for a complete exception frame before it is
//!   reported as [`ModbusError::IncompleteFrame`]. Exception replies only
//!   surface once the deadline passes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use epsolar_modbus::config::SerialConfig;
//! use epsolar_modbus::protocol::ReadInputRegistersRequest;
//! use epsolar_modbus::transport::{ModbusTransport, RtuTransport, StreamChannel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let channel = StreamChannel::open_serial(&SerialConfig::default())?;
//!     let mut transport = RtuTransport::new(channel);
//!
//!     let request = ReadInputRegistersRequest::new(1, 0x3100, 1)?;
//!     let response = transport.request(&request, Duration::from_millis(500)).await?;
//!     println!("PV voltage raw: {:?}", response.registers());
//!     Ok(())
//! }
//! ```

use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

use crate::codec::{decode_response, encode_request, is_exception_frame};
use crate::config::SerialConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::PacketLogger;
use crate::protocol::{
    ModbusResponse, ReadInputRegistersRequest, CRC_LENGTH, EXCEPTION_FRAME_LENGTH,
    RESPONSE_HEADER_LENGTH,
};

/// Upper bound on stale bytes drained before a request
const MAX_DISCARD_BYTES: usize = 4096;

/// Result of an exact-count read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Exactly the requested number of bytes
    Complete(Vec<u8>),
    /// Deadline passed before any byte arrived
    Timeout,
    /// The channel stopped short: deadline passed mid-frame or end of stream
    Incomplete { partial: Vec<u8>, expected: usize },
}

/// Serial channel collaborator
///
/// Implementations never return a short read as `Complete`.
#[async_trait]
pub trait SerialChannel: Send {
    /// Drop bytes already waiting in the receive buffer, returning how many
    async fn discard_input(&mut self) -> ModbusResult<usize>;

    /// Write the whole frame and wait until it has been flushed
    async fn write_frame(&mut self, frame: &[u8]) -> ModbusResult<()>;

    /// Read exactly `len` bytes or report why not before `deadline`
    async fn read_exact(&mut self, len: usize, deadline: Instant) -> ModbusResult<ReadOutcome>;
}

/// [`SerialChannel`] over any tokio byte stream
pub struct StreamChannel<S> {
    stream: S,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamChannel<tokio_serial::SerialStream> {
    /// Open the serial port described by `config`
    pub fn open_serial(config: &SerialConfig) -> ModbusResult<Self> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits()?)
            .stop_bits(config.stop_bits()?)
            .parity(config.parity.into());

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!("Failed to open serial port {}: {}", config.port, e))
        })?;

        Ok(Self::new(port))
    }
}

#[async_trait]
impl<S> SerialChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn discard_input(&mut self) -> ModbusResult<usize> {
        let mut scratch = [0u8; 64];
        let mut discarded = 0;

        while discarded < MAX_DISCARD_BYTES {
            match timeout(Duration::ZERO, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(ModbusError::io(format!("Serial read error: {}", e))),
            }
        }
        Ok(discarded)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| ModbusError::io(format!("Failed to send RTU frame: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ModbusError::io(format!("Failed to flush RTU frame: {}", e)))
    }

    async fn read_exact(&mut self, len: usize, deadline: Instant) -> ModbusResult<ReadOutcome> {
        let mut buffer = Vec::with_capacity(len);
        let mut chunk = vec![0u8; len];

        while buffer.len() < len {
            let want = len - buffer.len();
            match timeout_at(deadline, self.stream.read(&mut chunk[..want])).await {
                Ok(Ok(0)) => {
                    return Ok(ReadOutcome::Incomplete { partial: buffer, expected: len });
                }
                Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(ModbusError::io(format!("Serial read error: {}", e))),
                Err(_) if buffer.is_empty() => return Ok(ReadOutcome::Timeout),
                Err(_) => {
                    return Ok(ReadOutcome::Incomplete { partial: buffer, expected: len });
                }
            }
        }
        Ok(ReadOutcome::Complete(buffer))
    }
}

/// How the transport reads a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategy {
    /// 5-byte prefix, then the remaining payload
    #[default]
    StagedPrefix,
    /// Whole expected frame at once, salvaging exception frames from short reads
    FullFrame,
}

/// Transport layer abstraction used by the poller
#[async_trait]
pub trait ModbusTransport: Send {
    /// Perform one read input registers exchange within `timeout`
    ///
    /// # Errors
    ///
    /// - `ModbusError::Timeout` - nothing arrived before the deadline
    /// - `ModbusError::CrcMismatch` / `AddressMismatch` / `Frame` /
    ///   `IncompleteFrame` - the response was malformed
    /// - `ModbusError::Exception` - the device rejected the request
    /// - `ModbusError::Io` - the channel failed
    async fn request(
        &mut self,
        request: &ReadInputRegistersRequest,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse>;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_discarded: u64,
}

/// Modbus RTU transport implementation
pub struct RtuTransport<C> {
    channel: C,
    strategy: ReadStrategy,
    stats: TransportStats,
    packet_logger: PacketLogger,
}

impl<C: SerialChannel> RtuTransport<C> {
    /// Create a new RTU transport with the default read strategy
    pub fn new(channel: C) -> Self {
        Self::with_strategy(channel, ReadStrategy::default())
    }

    pub fn with_strategy(channel: C, strategy: ReadStrategy) -> Self {
        Self {
            channel,
            strategy,
            stats: TransportStats::default(),
            packet_logger: PacketLogger::disabled(),
        }
    }

    /// Enable or replace packet logging
    pub fn set_packet_logger(&mut self, logger: PacketLogger) {
        self.packet_logger = logger;
    }

    pub fn strategy(&self) -> ReadStrategy {
        self.strategy
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Read a response frame using the configured strategy
    async fn read_frame(
        &mut self,
        request: &ReadInputRegistersRequest,
        deadline: Instant,
        timeout_ms: u64,
    ) -> ModbusResult<Vec<u8>> {
        match self.strategy {
            ReadStrategy::StagedPrefix => self.read_staged(deadline, timeout_ms).await,
            ReadStrategy::FullFrame => {
                let expected = request.expected_response_len();
                match self.channel.read_exact(expected, deadline).await? {
                    ReadOutcome::Complete(frame) => Ok(frame),
                    ReadOutcome::Timeout => {
                        Err(ModbusError::timeout("read response", timeout_ms))
                    }
                    ReadOutcome::Incomplete { partial, expected } => salvage_partial(partial, expected),
                }
            }
        }
    }

    async fn read_staged(&mut self, deadline: Instant, timeout_ms: u64) -> ModbusResult<Vec<u8>> {
        let mut frame = match self.channel.read_exact(EXCEPTION_FRAME_LENGTH, deadline).await? {
            ReadOutcome::Complete(prefix) => prefix,
            ReadOutcome::Timeout => return Err(ModbusError::timeout("read response", timeout_ms)),
            ReadOutcome::Incomplete { partial, expected } => {
                return salvage_partial(partial, expected);
            }
        };

        if is_exception_frame(&frame) {
            return Ok(frame);
        }

        let total = RESPONSE_HEADER_LENGTH + frame[2] as usize + CRC_LENGTH;
        let remaining = total.saturating_sub(EXCEPTION_FRAME_LENGTH);
        if remaining == 0 {
            return Ok(frame);
        }

        match self.channel.read_exact(remaining, deadline).await? {
            ReadOutcome::Complete(rest) => {
                frame.extend_from_slice(&rest);
                Ok(frame)
            }
            ReadOutcome::Timeout => Err(ModbusError::incomplete_frame(frame.len(), total)),
            ReadOutcome::Incomplete { partial, .. } => {
                Err(ModbusError::incomplete_frame(frame.len() + partial.len(), total))
            }
        }
    }
}

/// Recover a complete exception frame from a short read, or report it short
fn salvage_partial(partial: Vec<u8>, expected: usize) -> ModbusResult<Vec<u8>> {
    if is_exception_frame(&partial) && partial.len() >= EXCEPTION_FRAME_LENGTH {
        return Ok(partial[..EXCEPTION_FRAME_LENGTH].to_vec());
    }
    Err(ModbusError::incomplete_frame(partial.len(), expected))
}

#[async_trait]
impl<C: SerialChannel> ModbusTransport for RtuTransport<C> {
    async fn request(
        &mut self,
        request: &ReadInputRegistersRequest,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        let deadline = Instant::now() + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let discarded = self.channel.discard_input().await?;
        if discarded > 0 {
            debug!("Discarded {} stale bytes before request", discarded);
            self.stats.bytes_discarded += discarded as u64;
        }

        let frame = encode_request(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        self.packet_logger.log_request(request, &frame);

        match timeout_at(deadline, self.channel.write_frame(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(e);
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(ModbusError::timeout("send request", timeout_ms));
            }
        }

        let response_frame = match self.read_frame(request, deadline, timeout_ms).await {
            Ok(frame) => frame,
            Err(e) => {
                if matches!(e, ModbusError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                self.stats.errors += 1;
                return Err(e);
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_frame.len() as u64;
        self.packet_logger.log_response(request.slave_id, &response_frame);

        decode_response(&response_frame, request).map_err(|e| {
            self.stats.errors += 1;
            e
        })
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use crate::codec::{encode_exception, encode_response};
    use crate::protocol::ModbusFunction;

    /// Channel whose replies are scripted per request frame
    #[derive(Default)]
    struct ScriptedChannel {
        replies: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
        pending: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
    }

    impl ScriptedChannel {
        fn reply(mut self, request: Vec<u8>, response: Vec<u8>) -> Self {
            self.replies.entry(request).or_default().push_back(response);
            self
        }

        fn stale(mut self, bytes: &[u8]) -> Self {
            self.pending.extend(bytes);
            self
        }
    }

    #[async_trait]
    impl SerialChannel for ScriptedChannel {
        async fn discard_input(&mut self) -> ModbusResult<usize> {
            let n = self.pending.len();
            self.pending.clear();
            Ok(n)
        }

        async fn write_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
            self.writes.push(frame.to_vec());
            if let Some(reply) = self.replies.get_mut(frame).and_then(|q| q.pop_front()) {
                self.pending.extend(reply);
            }
            Ok(())
        }

        async fn read_exact(&mut self, len: usize, _deadline: Instant) -> ModbusResult<ReadOutcome> {
            if self.pending.len() >= len {
                return Ok(ReadOutcome::Complete(self.pending.drain(..len).collect()));
            }
            if self.pending.is_empty() {
                return Ok(ReadOutcome::Timeout);
            }
            Ok(ReadOutcome::Incomplete {
                partial: self.pending.drain(..).collect(),
                expected: len,
            })
        }
    }

    fn request(address: u16, quantity: u16) -> ReadInputRegistersRequest {
        ReadInputRegistersRequest::new(1, address, quantity).unwrap()
    }

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn exchange(
        strategy: ReadStrategy,
        req: ReadInputRegistersRequest,
        reply: Vec<u8>,
    ) -> ModbusResult<ModbusResponse> {
        let channel = ScriptedChannel::default().reply(encode_request(&req), reply);
        let mut transport = RtuTransport::with_strategy(channel, strategy);
        transport.request(&req, TIMEOUT).await
    }

    #[tokio::test]
    async fn test_strategies_converge_on_normal_frames() {
        for quantity in [1u16, 2, 10] {
            let req = request(0x3100, quantity);
            let registers: Vec<u16> = (0..quantity).map(|i| 0x0100 + i).collect();
            let reply = encode_response(1, &registers);

            let staged = exchange(ReadStrategy::StagedPrefix, req, reply.clone()).await.unwrap();
            let full = exchange(ReadStrategy::FullFrame, req, reply).await.unwrap();
            assert_eq!(staged, full);
            assert_eq!(staged.registers(), registers);
        }
    }

    #[tokio::test]
    async fn test_strategies_converge_on_exception_frames() {
        let req = request(0x3100, 2);
        let reply = encode_exception(1, ModbusFunction::ReadInputRegisters, 0x02);

        let staged = exchange(ReadStrategy::StagedPrefix, req, reply.clone()).await.unwrap_err();
        let full = exchange(ReadStrategy::FullFrame, req, reply).await.unwrap_err();
        assert_eq!(staged, full);
        assert_eq!(staged.exception_code(), Some(0x02));
    }

    #[tokio::test]
    async fn test_strategies_converge_on_truncated_frames() {
        let req = request(0x3102, 2);
        let mut reply = encode_response(1, &[0x0001, 0x0002]);
        reply.truncate(6);

        let staged = exchange(ReadStrategy::StagedPrefix, req, reply.clone()).await.unwrap_err();
        let full = exchange(ReadStrategy::FullFrame, req, reply).await.unwrap_err();
        assert_eq!(staged, ModbusError::incomplete_frame(6, 9));
        assert_eq!(full, ModbusError::incomplete_frame(6, 9));
    }

    #[tokio::test]
    async fn test_silence_is_a_timeout() {
        let req = request(0x3100, 1);
        let mut transport = RtuTransport::new(ScriptedChannel::default());
        let err = transport.request(&req, TIMEOUT).await.unwrap_err();
        assert_eq!(err, ModbusError::timeout("read response", 500));

        let stats = transport.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.responses_received, 0);
    }

    #[tokio::test]
    async fn test_stale_input_is_discarded_before_request() {
        let req = request(0x3100, 1);
        let channel = ScriptedChannel::default()
            .stale(&[0x01, 0x04, 0x02, 0xFF])
            .reply(encode_request(&req), encode_response(1, &[1234]));
        let mut transport = RtuTransport::new(channel);

        let response = transport.request(&req, TIMEOUT).await.unwrap();
        assert_eq!(response.registers(), vec![1234]);
        assert_eq!(transport.get_stats().bytes_discarded, 4);
    }

    #[tokio::test]
    async fn test_crc_error_is_counted() {
        let req = request(0x3100, 1);
        let mut reply = encode_response(1, &[1234]);
        reply[3] ^= 0x01;
        let channel = ScriptedChannel::default().reply(encode_request(&req), reply);
        let mut transport = RtuTransport::new(channel);

        let err = transport.request(&req, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
        assert_eq!(transport.get_stats().errors, 1);
        assert_eq!(transport.get_stats().responses_received, 1);
    }

    #[tokio::test]
    async fn test_request_is_encoded_on_the_wire() {
        let req = request(0x3100, 1);
        let mut transport = RtuTransport::new(ScriptedChannel::default());
        let _ = transport.request(&req, TIMEOUT).await;
        assert_eq!(
            transport.channel().writes,
            vec![vec![0x01, 0x04, 0x31, 0x00, 0x00, 0x01, 0x3F, 0x36]]
        );
    }

    #[tokio::test]
    async fn test_stream_channel_exchange() {
        let req = request(0x3100, 1);
        let stream = tokio_test::io::Builder::new()
            .write(&encode_request(&req))
            .read(&[0x01, 0x04, 0x02])
            .read(&[0x04, 0xD2, 0x3B, 0xAD])
            .build();
        let mut transport = RtuTransport::new(StreamChannel::new(stream));

        let response = transport.request(&req, TIMEOUT).await.unwrap();
        assert_eq!(response.payload, vec![0x04, 0xD2]);
    }

    #[tokio::test]
    async fn test_stream_channel_discards_stale_bytes() {
        let stream = tokio_test::io::Builder::new()
            .read(&[0xAA, 0xBB, 0xCC])
            .write(&[0x01])
            .build();
        let mut channel = StreamChannel::new(stream);

        assert_eq!(channel.discard_input().await.unwrap(), 3);
        channel.write_frame(&[0x01]).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_channel_short_read_at_end_of_stream() {
        let stream = tokio_test::io::Builder::new().read(&[0x01, 0x84]).build();
        let mut channel = StreamChannel::new(stream);
        let deadline = Instant::now() + TIMEOUT;

        let outcome = channel.read_exact(5, deadline).await.unwrap();
        assert_eq!(
            outcome,
            ReadOutcome::Incomplete { partial: vec![0x01, 0x84], expected: 5 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_channel_deadline() {
        let (client, _server) = tokio::io::duplex(64);
        let mut channel = StreamChannel::new(client);
        let deadline = Instant::now() + TIMEOUT;

        assert_eq!(channel.read_exact(7, deadline).await.unwrap(), ReadOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_channel_partial_before_deadline() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0x01, 0x04, 0x02]).await.unwrap();
        let mut channel = StreamChannel::new(client);
        let deadline = Instant::now() + TIMEOUT;

        assert_eq!(
            channel.read_exact(7, deadline).await.unwrap(),
            ReadOutcome::Incomplete { partial: vec![0x01, 0x04, 0x02], expected: 7 }
        );
    }

    #[test]
    fn test_salvage_partial() {
        let exception = encode_exception(1, ModbusFunction::ReadInputRegisters, 0x04);
        assert_eq!(salvage_partial(exception.clone(), 9).unwrap(), exception);
        assert_eq!(
            salvage_partial(vec![0x01, 0x84, 0x04], 9).unwrap_err(),
            ModbusError::incomplete_frame(3, 9)
        );
        assert_eq!(
            salvage_partial(vec![0x01, 0x04, 0x04, 0x00, 0x01], 9).unwrap_err(),
            ModbusError::incomplete_frame(5, 9)
        );
    }
}
