use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use tokio_util::codec::Decoder;
use tracing::{info, warn};

use crate::config::Port;
use crate::protocol::codec::{NasaCodec, RxEvent};
use crate::protocol::packet::Packet;
use crate::session::{LiveSession, SessionError, SessionState};
use url::Url;

const READ_CHUNK: usize = 4096;

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub reconnect_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Drive the capture loop: read chunks from the port, reassemble, decode,
/// publish into the session.
///
/// The reassembly buffer is owned here and survives transport reconnects,
/// so a mid-frame disconnect surfaces as a resync once the stream resumes
/// rather than as a decoder error. The initial connect failure is returned
/// to the caller; later failures trigger the reconnect delay.
pub async fn run(url: Url, session: Arc<LiveSession>, config: CaptureConfig) -> Result<()> {
    let mut codec = NasaCodec::new();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut first_attempt = true;

    'reconnect: while session.state() == SessionState::Running {
        let mut port = match Port::open(&url).await {
            Ok(port) => {
                info!(%url, "connected");
                port
            }
            Err(err) if first_attempt => return Err(err),
            Err(err) => {
                warn!(%err, delay = ?config.reconnect_delay, "reconnecting");
                if !pause(&session, config.reconnect_delay).await {
                    break;
                }
                continue;
            }
        };
        first_attempt = false;

        loop {
            tokio::select! {
                read = port.read_buf(&mut buffer) => match read {
                    Ok(0) => {
                        warn!(%url, delay = ?config.reconnect_delay, "disconnected, reconnecting");
                        if !pause(&session, config.reconnect_delay).await {
                            break 'reconnect;
                        }
                        continue 'reconnect;
                    }
                    Ok(_) => {
                        if !drain(&mut codec, &mut buffer, &session) {
                            break 'reconnect;
                        }
                    }
                    Err(err) => {
                        warn!(%err, delay = ?config.reconnect_delay, "read failed, reconnecting");
                        if !pause(&session, config.reconnect_delay).await {
                            break 'reconnect;
                        }
                        continue 'reconnect;
                    }
                },
                _ = session.closed() => break 'reconnect,
            }
        }
    }

    Ok(())
}

/// Sleep out the reconnect delay unless the session closes first.
async fn pause(session: &LiveSession, delay: Duration) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        _ = session.closed() => false,
    }
}

/// Decode and publish everything currently in the buffer. Returns false
/// once the session stops accepting packets.
fn drain(codec: &mut NasaCodec, buffer: &mut BytesMut, session: &LiveSession) -> bool {
    while let Ok(Some(event)) = codec.decode(buffer) {
        match event {
            RxEvent::Frame(frame) => match Packet::decode(&frame) {
                Ok(packet) => match session.publish(packet) {
                    Ok(()) => {}
                    Err(SessionError::NotRunning | SessionError::ShuttingDown) => return false,
                    Err(SessionError::ViewMode) => return false,
                },
                Err(error) => session.report_error(error, &frame),
            },
            RxEvent::Resync(event) => session.report_resync(event),
        }
    }
    true
}
