use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::cache::SignalIndexCache;
use super::message::{compact_flags, data_packet_flags, ServerCommand, ServerResponse};
use crate::core::{Error, Measurement, Result, Ticks, TICKS_PER_MILLISECOND};

/// Upper bound on a frame payload; anything larger indicates stream desync
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Fixed part of a compact measurement record: flags, index, value
const COMPACT_FIXED_LENGTH: usize = 7;

/// A command frame sent to the publisher: code byte, payload length,
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: ServerCommand,
    pub payload: Bytes,
}

impl CommandFrame {
    /// Creates a command frame with the given payload
    pub fn new(command: ServerCommand, payload: impl Into<Bytes>) -> Self {
        CommandFrame {
            command,
            payload: payload.into(),
        }
    }
}

/// A response frame received from the publisher: response code, code of the
/// command it answers, payload length, payload.
///
/// The codes are kept raw so an unknown value can be skipped as a single
/// bad frame instead of poisoning the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub code: u8,
    pub in_response_to: u8,
    pub payload: Bytes,
}

impl ResponseFrame {
    /// Interprets the response code
    pub fn response(&self) -> Result<ServerResponse> {
        ServerResponse::try_from(self.code)
    }

    /// Interprets the code of the command this response answers
    pub fn command(&self) -> Result<ServerCommand> {
        ServerCommand::try_from(self.in_response_to)
    }
}

/// Codec for the publisher-to-subscriber response stream.
///
/// Decoding is exact-length: a short read leaves the partial frame buffered
/// and returns `Ok(None)` until the full frame arrives. A clean stream
/// closure with a partial frame still buffered is reported as
/// [`Error::ChannelClosed`], distinct from closure at a frame boundary.
#[derive(Clone, Default)]
pub struct ResponseCodec;

impl ResponseCodec {
    /// Creates a new response codec
    pub fn new() -> Self {
        ResponseCodec
    }
}

impl Decoder for ResponseCodec {
    type Item = ResponseFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 6 {
            // Need more data to read the frame header
            return Ok(None);
        }

        let payload_length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        if payload_length > MAX_PAYLOAD_SIZE {
            // Cannot resynchronize once the length field is implausible
            return Err(Error::channel_closed(format!(
                "response payload length {} exceeds limit",
                payload_length
            )));
        }

        if src.len() < 6 + payload_length {
            // Need more data to read the full frame
            return Ok(None);
        }

        let code = src[0];
        let in_response_to = src[1];
        src.advance(6);
        let payload = src.split_to(payload_length).freeze();

        Ok(Some(ResponseFrame {
            code,
            in_response_to,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::channel_closed(format!(
                "stream closed with {} bytes of a partial frame outstanding",
                src.len()
            ))),
        }
    }
}

impl Encoder<ResponseFrame> for ResponseCodec {
    type Error = Error;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(item.code);
        dst.put_u8(item.in_response_to);
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Codec for the subscriber-to-publisher command stream
#[derive(Clone, Default)]
pub struct CommandCodec;

impl CommandCodec {
    /// Creates a new command codec
    pub fn new() -> Self {
        CommandCodec
    }
}

impl Encoder<CommandFrame> for CommandCodec {
    type Error = Error;

    fn encode(&mut self, item: CommandFrame, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(item.command as u8);
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for CommandCodec {
    type Item = CommandFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 5 {
            return Ok(None);
        }

        let payload_length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(Error::channel_closed(format!(
                "command payload length {} exceeds limit",
                payload_length
            )));
        }

        if src.len() < 5 + payload_length {
            return Ok(None);
        }

        let command = ServerCommand::try_from(src[0])?;
        src.advance(5);
        let payload = src.split_to(payload_length).freeze();

        Ok(Some(CommandFrame { command, payload }))
    }
}

/// Base time offsets against which compact time offsets are resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseTimes {
    /// Even and odd base time offsets in ticks
    pub offsets: [i64; 2],
    /// Index the publisher currently encodes against
    pub active_index: usize,
}

impl BaseTimes {
    /// Parses an `UpdateBaseTimes` payload: active index plus two offsets
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;

        if buf.remaining() < 20 {
            return Err(Error::framing("base time payload too short"));
        }

        let active_index = (buf.get_u32() & 1) as usize;
        let offsets = [buf.get_i64(), buf.get_i64()];

        Ok(BaseTimes {
            offsets,
            active_index,
        })
    }

    /// Builds an `UpdateBaseTimes` payload
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = BytesMut::with_capacity(20);
        payload.put_u32(self.active_index as u32);
        payload.put_i64(self.offsets[0]);
        payload.put_i64(self.offsets[1]);
        payload.to_vec()
    }
}

/// Shared state a data packet decode observes for its whole duration
pub struct DecodeContext<'a> {
    pub cache: &'a SignalIndexCache,
    pub base_times: BaseTimes,
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
}

/// A decoded data packet: the measurement batch plus any per-record errors
/// (stale or unknown signal indices) that were skipped over.
#[derive(Debug, Default)]
pub struct DataPacket {
    pub flags: u8,
    pub frame_timestamp: Option<Ticks>,
    pub measurements: Vec<Measurement>,
    pub record_errors: Vec<Error>,
}

/// Decodes an unencrypted data packet payload (flags byte included)
pub fn decode_data_packet(payload: &[u8], ctx: &DecodeContext<'_>) -> Result<DataPacket> {
    if payload.is_empty() {
        return Err(Error::framing("empty data packet"));
    }

    decode_packet_body(payload[0], &payload[1..], ctx)
}

/// Decodes the body of a data packet whose flags byte has been read and
/// whose payload has already been decrypted when applicable.
///
/// A record referencing a signal index outside the current cache generation
/// is skipped and reported in `record_errors`; a structurally truncated
/// packet fails as a whole with [`Error::Framing`].
pub fn decode_packet_body(flags: u8, body: &[u8], ctx: &DecodeContext<'_>) -> Result<DataPacket> {
    if flags & data_packet_flags::COMPACT == 0 {
        return Err(Error::framing(
            "full-fidelity measurement packets are not supported",
        ));
    }

    let mut buf = body;
    let mut packet = DataPacket {
        flags,
        ..Default::default()
    };

    if flags & data_packet_flags::SYNCHRONIZED != 0 {
        if buf.remaining() < 8 {
            return Err(Error::framing("truncated frame timestamp"));
        }
        packet.frame_timestamp = Some(Ticks(buf.get_i64()));
    }

    if buf.remaining() < 4 {
        return Err(Error::framing("truncated measurement count"));
    }

    let count = buf.get_u32();

    for _ in 0..count {
        match decode_compact_measurement(&mut buf, ctx) {
            Ok(mut measurement) => {
                if !ctx.include_time {
                    if let Some(frame_time) = packet.frame_timestamp {
                        measurement.timestamp = frame_time;
                    }
                }
                packet.measurements.push(measurement);
            }
            Err(err @ Error::UnknownSignalIndex(_)) => packet.record_errors.push(err),
            Err(err) => return Err(err),
        }
    }

    if buf.has_remaining() {
        return Err(Error::framing(format!(
            "{} trailing bytes after measurement records",
            buf.remaining()
        )));
    }

    Ok(packet)
}

/// Decodes one compact record, advancing the buffer past it even when the
/// signal index is unknown so the remaining records stay parseable.
fn decode_compact_measurement(
    buf: &mut &[u8],
    ctx: &DecodeContext<'_>,
) -> Result<Measurement> {
    if buf.remaining() < COMPACT_FIXED_LENGTH {
        return Err(Error::framing("truncated compact measurement"));
    }

    let flags = buf.get_u8();
    let index = buf.get_u16();
    let value = buf.get_f32();

    let timestamp = if ctx.include_time {
        if flags & compact_flags::BASE_TIME_OFFSET != 0 {
            let time_index = usize::from(flags & compact_flags::TIME_INDEX != 0);
            let base = ctx.base_times.offsets[time_index];

            if ctx.use_millisecond_resolution {
                if buf.remaining() < 2 {
                    return Err(Error::framing("truncated millisecond time offset"));
                }
                Ticks(base + buf.get_u16() as i64 * TICKS_PER_MILLISECOND)
            } else {
                if buf.remaining() < 4 {
                    return Err(Error::framing("truncated tick time offset"));
                }
                Ticks(base + buf.get_u32() as i64)
            }
        } else {
            if buf.remaining() < 8 {
                return Err(Error::framing("truncated full timestamp"));
            }
            Ticks(buf.get_i64())
        }
    } else {
        Ticks(0)
    };

    let key = ctx
        .cache
        .key_for(index)
        .ok_or(Error::UnknownSignalIndex(index))?;

    let state = (flags & compact_flags::QUALITY_MASK) as u32;
    Ok(Measurement::new(key, value as f64, timestamp, state))
}

/// State used when encoding a measurement batch, primarily for tests and
/// publisher mocks
pub struct EncodeContext<'a> {
    pub cache: &'a SignalIndexCache,
    pub base_times: BaseTimes,
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
}

/// Encodes a batch of measurements as an unencrypted, unsynchronized compact
/// data packet (flags byte included)
pub fn encode_data_packet(
    measurements: &[Measurement],
    ctx: &EncodeContext<'_>,
) -> Result<Vec<u8>> {
    let mut dst = BytesMut::new();
    dst.put_u8(data_packet_flags::COMPACT);
    dst.put_u32(measurements.len() as u32);

    for measurement in measurements {
        encode_compact_measurement(measurement, ctx, &mut dst)?;
    }

    Ok(dst.to_vec())
}

fn encode_compact_measurement(
    measurement: &Measurement,
    ctx: &EncodeContext<'_>,
    dst: &mut BytesMut,
) -> Result<()> {
    let index = ctx
        .cache
        .index_of(measurement.signal_id)
        .ok_or_else(|| Error::framing(format!("signal {} not in cache", measurement.signal_id)))?;

    let mut flags = (measurement.flags as u8) & compact_flags::QUALITY_MASK;
    let base = ctx.base_times.offsets[ctx.base_times.active_index];
    let difference = measurement.timestamp.0 - base;

    let use_base_offset = ctx.include_time
        && base > 0
        && difference >= 0
        && if ctx.use_millisecond_resolution {
            difference / TICKS_PER_MILLISECOND <= u16::MAX as i64
        } else {
            difference <= u32::MAX as i64
        };

    if use_base_offset {
        flags |= compact_flags::BASE_TIME_OFFSET;

        if ctx.base_times.active_index == 1 {
            flags |= compact_flags::TIME_INDEX;
        }
    }

    dst.put_u8(flags);
    dst.put_u16(index);
    dst.put_f32(measurement.adjusted_value() as f32);

    if ctx.include_time {
        if use_base_offset {
            if ctx.use_millisecond_resolution {
                dst.put_u16((difference / TICKS_PER_MILLISECOND) as u16);
            } else {
                dst.put_u32(difference as u32);
            }
        } else {
            dst.put_i64(measurement.timestamp.0);
        }
    }

    Ok(())
}
