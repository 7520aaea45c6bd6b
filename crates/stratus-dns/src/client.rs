//! Minimal DNS exchange helper for outgoing requests.
//!
//! Used by the NOTIFY sender and the SOA fetcher; one request, one
//! response, deadline-bounded.

use std::net::SocketAddr;
use std::time::Duration;

use domain::base::iana::Rcode;
use domain::base::message::Message;
use domain::base::opt::ExtendedError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use stratus_common::{Error, Result};

/// Sends one framed request over TCP and reads one response message.
///
/// `frame` must carry the two-octet length prefix (stream format); the
/// returned buffer is the bare response message.
pub async fn exchange_tcp(
    addr: SocketAddr,
    frame: &[u8],
    deadline: Duration,
) -> Result<Vec<u8>> {
    timeout(deadline, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transient(format!("connect {addr}: {e}")))?;
        stream
            .write_all(frame)
            .await
            .map_err(|e| Error::transient(format!("write request: {e}")))?;

        let mut len = [0u8; 2];
        stream
            .read_exact(&mut len)
            .await
            .map_err(|e| Error::transient(format!("read response size: {e}")))?;
        let size = usize::from(u16::from_be_bytes(len));
        let mut buf = vec![0u8; size];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| Error::transient(format!("read response: {e}")))?;
        Ok(buf)
    })
    .await
    .map_err(|_| Error::transient(format!("dns exchange with {addr} timed out")))?
}

/// Sends one datagram over UDP and reads one response datagram.
pub async fn exchange_udp(
    addr: SocketAddr,
    dgram: &[u8],
    deadline: Duration,
) -> Result<Vec<u8>> {
    timeout(deadline, async {
        let local: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid literal")
        } else {
            "[::]:0".parse().expect("valid literal")
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::transient(format!("bind udp: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::transient(format!("connect {addr}: {e}")))?;
        socket
            .send(dgram)
            .await
            .map_err(|e| Error::transient(format!("send request: {e}")))?;
        let mut buf = vec![0u8; 64 * 1024];
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(|e| Error::transient(format!("receive response: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    })
    .await
    .map_err(|_| Error::transient(format!("dns exchange with {addr} timed out")))?
}

/// Turns a non-NOERROR response into an error, including any extended
/// DNS error text the responder attached.
pub fn response_error(msg: &Message<Vec<u8>>) -> Result<()> {
    let rcode = msg.header().rcode();
    if rcode == Rcode::NoError {
        return Ok(());
    }
    let mut detail = format!("dns response error code {rcode}");
    if let Some(opt) = msg.opt() {
        for ede in opt.opt().iter::<ExtendedError<_>>().flatten() {
            detail.push_str(&format!(
                ": {} ({})",
                ede.code(),
                ede.text_slice()
                    .map(|t| String::from_utf8_lossy(t).into_owned())
                    .unwrap_or_default()
            ));
        }
    }
    Err(Error::Protocol(detail))
}
