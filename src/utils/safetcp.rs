//! Raw TCP helpers implementing the single-JSON-object-per-write wire
//! contract of spec §4.5: no length prefix, one `write` per outbound
//! object, and on the receive side one `read` is decoded as one JSON
//! value. This is deliberately not a framing protocol; see spec §9 for
//! why a future revision might add one.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::utils::RelayError;
use crate::{logged_err, pf_warn};

/// Maximum size of a single client TCP command, matching spec §4.5's
/// stated 4 KiB receive buffer maximum.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Binds a TCP listener, retrying a few times on `AddrInUse` (a bound
/// but not-yet-released socket from a just-restarted peer in the same
/// test run is the common case). Any other bind failure, or exhausting
/// the retries, is fatal per spec §7(4).
pub async fn tcp_bind_with_retry(
    addr: std::net::SocketAddr,
) -> Result<TcpListener, RelayError> {
    let mut attempts = 0;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempts < 5 && e.kind() == std::io::ErrorKind::AddrInUse => {
                attempts += 1;
                pf_warn!("bind {} in use, retrying ({}/5)", addr, attempts);
                sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                return logged_err!("failed to bind {}: {}", addr, e);
            }
        }
    }
}

/// Writes exactly one JSON-encoded value to the stream as a single
/// `write_all` call, matching the "one outbound JSON object per write"
/// contract.
pub async fn safe_tcp_write<T: Serialize>(
    stream: &mut TcpStream,
    value: &T,
) -> Result<(), RelayError> {
    let bytes = serde_json::to_vec(value)?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Reads up to [`MAX_FRAME_SIZE`] bytes in a single `read` call and
/// attempts to decode them as one JSON value of type `T`. Returns
/// `Ok(None)` on a clean EOF (peer closed before sending anything this
/// round), and an error on a decode failure — per spec §4.5 the
/// connection is considered broken if the buffer doesn't parse as one
/// JSON object.
pub async fn safe_tcp_read<T: DeserializeOwned>(
    stream: &mut TcpStream,
) -> Result<Option<T>, RelayError> {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let value = serde_json::from_slice(&buf[..n])?;
    Ok(Some(value))
}
