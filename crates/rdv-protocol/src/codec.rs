//! Envelope codec
//!
//! [`EnvelopeCodec`] frames envelopes on the control channel stream.
//! [`encode_datagram`] / [`decode_datagram`] handle the signaling channel,
//! where one datagram carries exactly one frame.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Codec for encoding/decoding framed envelopes on a byte stream
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl EnvelopeCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        check_size(payload_len)?;

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let body = src.split_to(payload_len).freeze();
        decode_body(&header, &body).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&envelope, dst)
    }
}

/// Encode one envelope as a self-contained datagram
pub fn encode_datagram(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    write_frame(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a datagram that must hold exactly one frame
pub fn decode_datagram(datagram: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut src = BytesMut::from(datagram);
    let header = FrameHeader::decode(&mut src)?.ok_or(ProtocolError::IncompleteFrame {
        expected: HEADER_SIZE,
        actual: datagram.len(),
    })?;

    let payload_len = header.payload_length as usize;
    check_size(payload_len)?;

    if src.len() < payload_len {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE + payload_len,
            actual: datagram.len(),
        });
    }
    if src.len() > payload_len {
        return Err(ProtocolError::TrailingBytes(src.len() - payload_len));
    }

    decode_body(&header, &src)
}

/// Size of the frame `envelope` would encode to, without encoding it
pub fn encoded_len(envelope: &Envelope) -> Result<usize, ProtocolError> {
    let body = bincode::serialized_size(envelope)? as usize;
    Ok(HEADER_SIZE + body)
}

/// Whether `envelope` can be sent as a single datagram
pub fn fits_datagram(envelope: &Envelope) -> Result<bool, ProtocolError> {
    Ok(encoded_len(envelope)? <= HEADER_SIZE + MAX_PAYLOAD_SIZE)
}

fn write_frame(envelope: &Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = bincode::serialize(envelope)?;
    check_size(payload.len())?;

    let header = FrameHeader::new(envelope.message_type, payload.len() as u32);
    header.encode(dst);
    dst.extend_from_slice(&payload);

    Ok(())
}

fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = bincode::deserialize(body)?;
    if envelope.message_type != header.message_type {
        return Err(ProtocolError::TypeMismatch {
            header: header.message_type,
            body: envelope.message_type,
        });
    }
    Ok(envelope)
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}
