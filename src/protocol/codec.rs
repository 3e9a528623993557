use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::{FRAME_START, MAX_FRAME_SIZE, MIN_FRAME_SIZE};

/// Bytes discarded while searching for the next start delimiter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResyncEvent {
    pub skipped: usize,
}

/// One unit of reassembler output: a candidate frame, or a diagnostic
/// for bytes that had to be skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RxEvent {
    /// A length-complete candidate frame. CRC and end-byte validation is
    /// the decoder's job, not the reassembler's.
    Frame(Bytes),
    Resync(ResyncEvent),
}

/// Resynchronising frame reassembler.
///
/// Consumes an append-only byte buffer fed in arbitrary chunks and cuts
/// it into candidate frames: scan to the next `0x32`, read the declared
/// length, wait for the full frame, extract. A declared length outside
/// [16, 1500] is treated as a stray start byte and skipped by one.
/// Every call consumes zero or more bytes and never revisits them, so
/// any chunk partition of the same stream yields the same frames.
#[derive(Default)]
pub struct NasaCodec;

impl NasaCodec {
    pub fn new() -> Self {
        NasaCodec
    }
}

impl Decoder for NasaCodec {
    type Item = RxEvent;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != FRAME_START {
            let skipped = match src.iter().position(|&b| b == FRAME_START) {
                Some(offset) => {
                    src.advance(offset);
                    offset
                }
                None => {
                    let all = src.len();
                    src.advance(all);
                    all
                }
            };
            return Ok(Some(RxEvent::Resync(ResyncEvent { skipped })));
        }

        if src.len() < 3 {
            return Ok(None);
        }

        let declared = (((src[1] as usize) << 8) | src[2] as usize) + 2;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&declared) {
            // spurious start byte, likely 0x32 inside an earlier frame
            src.advance(1);
            return Ok(Some(RxEvent::Resync(ResyncEvent { skipped: 1 })));
        }

        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None);
        }

        let frame = src.split_to(declared).freeze();
        Ok(Some(RxEvent::Frame(frame)))
    }
}

/// Drain every event currently extractable from `buffer`.
///
/// The capture loop owns the buffer itself (rather than handing it to a
/// `Framed`) so reassembly state survives transport reconnects.
pub fn drain_events(codec: &mut NasaCodec, buffer: &mut BytesMut) -> Vec<RxEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = codec.decode(buffer) {
        events.push(event);
    }
    events
}
