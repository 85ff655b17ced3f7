//! Byte-stream links (TCP client, serial port, in-memory pipes)

use crate::transport::traits::{Link, LinkReader, LinkWriter};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// Connect timeout for TCP client links
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct StreamReader<S> {
    inner: ReadHalf<S>,
}

struct StreamWriter<S> {
    inner: WriteHalf<S>,
}

#[async_trait]
impl<S> LinkReader for StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}

#[async_trait]
impl<S> LinkWriter for StreamWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }
}

/// Wrap any duplex byte stream as a link
pub fn stream_link<S>(stream: S, name: impl Into<String>) -> Link
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    Link {
        reader: Box::new(StreamReader { inner: rd }),
        writer: Box::new(StreamWriter { inner: wr }),
        name: name.into(),
    }
}

/// Dial a TCP server (e.g. SITL on 127.0.0.1:5760)
pub async fn connect_tcp(address: &str) -> io::Result<Link> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", address)))??;
    stream.set_nodelay(true)?;
    Ok(stream_link(stream, format!("tcp:{}", address)))
}

/// Open a serial port at the given baud rate
pub fn open_serial(device: &str, baud: u32) -> io::Result<Link> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(device, baud)
        .open_native_async()
        .map_err(io::Error::from)?;
    Ok(stream_link(port, format!("serial:{}:{}", device, baud)))
}
