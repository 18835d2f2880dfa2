//! Reading messages off a stream and stitching segmented ones together.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use pva_core::wire::{segment, MessageHeader, HEADER_SIZE};
use pva_core::WireError;

use crate::error::TransportError;

/// Read one message. `Ok(None)` on a clean end of stream between messages.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<(MessageHeader, Bytes)>, TransportError> {
    let mut head = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = MessageHeader::parse(&head)?;

    // Control messages carry their data in the size field.
    if header.is_control() {
        return Ok(Some((header, Bytes::new())));
    }

    let size = header.payload_size() as usize;
    if size > max_payload {
        return Err(WireError::PayloadTooLarge(size).into());
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, Bytes::from(payload))))
}

/// Joins FIRST / MIDDLE / LAST segments into one message.
pub struct Reassembler {
    max_payload: usize,
    pending: Option<(MessageHeader, BytesMut)>,
}

impl Reassembler {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload, pending: None }
    }

    /// Feed one received message. Returns the complete message once the
    /// last segment arrives; unsegmented messages pass straight through.
    pub fn push(
        &mut self,
        header: MessageHeader,
        payload: Bytes,
    ) -> Result<Option<(MessageHeader, Bytes)>, WireError> {
        let flags = header.segment();
        match flags {
            segment::NONE if self.pending.is_none() => Ok(Some((header, payload))),
            segment::FIRST if self.pending.is_none() => {
                self.pending = Some((header, BytesMut::from(&payload[..])));
                Ok(None)
            }
            segment::MIDDLE | segment::LAST => {
                let Some((first, mut joined)) = self.pending.take() else {
                    return Err(WireError::SegmentOutOfOrder(flags));
                };
                if first.command != header.command {
                    return Err(WireError::UnexpectedCommand(header.command));
                }
                if joined.len() + payload.len() > self.max_payload {
                    return Err(WireError::PayloadTooLarge(joined.len() + payload.len()));
                }
                joined.extend_from_slice(&payload);

                if flags == segment::MIDDLE {
                    self.pending = Some((first, joined));
                    return Ok(None);
                }
                let mut whole = first;
                whole.flags &= !segment::MASK;
                whole.set_payload_size(joined.len() as u32);
                Ok(Some((whole, joined.freeze())))
            }
            other => Err(WireError::SegmentOutOfOrder(other)),
        }
    }
}
