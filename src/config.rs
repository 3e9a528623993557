use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::FramedRead;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use crate::protocol::codec::NasaCodec;

/// Line settings of the NASA bus.
const BAUD_RATE: u32 = 9600;

/// A bus attachment. The sniffer only ever reads.
#[derive(Debug)]
pub enum Port {
    Serial(SerialStream),
    TcpRaw(TcpStream),
}

impl Port {
    /// Open a port from its URL.
    ///
    /// `serial:///device/path` or `tcp+raw://host:port`; anything else
    /// is a startup error.
    pub async fn open(url: &Url) -> Result<Self> {
        match url.scheme() {
            "serial" => {
                let path = url.path();

                let port = tokio_serial::new(path, BAUD_RATE)
                    .stop_bits(tokio_serial::StopBits::One)
                    .parity(tokio_serial::Parity::Even)
                    .open_native_async()
                    .with_context(|| format!("failed to open serial port {path}"))?;

                Ok(Self::Serial(port))
            }
            "tcp+raw" => {
                let host = url
                    .host_str()
                    .with_context(|| format!("tcp+raw requires a host in the url: {url}"))?;

                let port = url
                    .port()
                    .with_context(|| format!("tcp+raw requires a port number in the url: {url}"))?;

                let stream = TcpStream::connect((host, port))
                    .await
                    .with_context(|| format!("failed to open tcp+raw connection to: {url}"))?;

                stream.set_nodelay(true)?;

                Ok(Self::TcpRaw(stream))
            }
            other => {
                bail!("url scheme {other} not supported");
            }
        }
    }

    /// Wrap the port in the frame reassembler.
    pub fn framed(self) -> FramedRead<Port, NasaCodec> {
        FramedRead::new(self, NasaCodec::new())
    }
}

impl AsyncRead for Port {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Port::Serial(port) => Pin::new(port).poll_read(cx, buf),
            Port::TcpRaw(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

/// Route `tracing` output to stderr, filterable via `RUST_LOG`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let url: Url = "ftp://example.com:21".parse().unwrap();
        let err = Port::open(&url).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn tcp_raw_requires_a_port_number() {
        let url: Url = "tcp+raw://localhost".parse().unwrap();
        let err = Port::open(&url).await.unwrap_err();
        assert!(err.to_string().contains("port number"));
    }

    #[tokio::test]
    async fn tcp_raw_round_trip() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let url: Url = format!("tcp+raw://{}:{}", addr.ip(), addr.port())
            .parse()
            .unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
        });

        let mut port = Port::open(&url).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 3];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03]);

        accept.await.unwrap();
    }
}
