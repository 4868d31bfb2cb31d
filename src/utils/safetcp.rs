//! Safe TCP bind/connect/read/write helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::MaekawaError;

/// Largest frame body accepted from a peer, in bytes.
const MAX_FRAME_LEN: u64 = 1 << 20;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Frames are an 8-byte
/// big-endian length followed by a MessagePack body. Returns:
///   - `Ok(obj)` if successful; upon returning, bytes of this object are
///     removed from the read buffer
///   - `Err(err)` if any unexpected error occurs, including EOF
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and that those two methods are not cancellation-safe. Instead, in the case
/// of being cancelled midway before receiving the entire object (note that
/// such cancellation can only happen at `.await` points), bytes already read
/// are stored in the read buffer and will continue to be appended by future
/// invocations until successful returning.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, MaekawaError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        // obj_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(MaekawaError::transport("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = u64::from_be_bytes(len_bytes);
    if obj_len > MAX_FRAME_LEN {
        return Err(MaekawaError::transport(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(MaekawaError::transport(
                "connection closed by peer mid-frame",
            ));
        }
    }
    let obj = rmp_serde::from_slice(&read_buf[8..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    let _ = read_buf.split_to(obj_end);

    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`,
/// length-prefixed. Not cancellation-safe; only await it from within a
/// `tokio::select!` branch body, never as the branch future itself.
pub(crate) async fn tcp_write_obj<T, Conn>(
    obj: &T,
    conn_write: &mut Conn,
) -> Result<(), MaekawaError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = rmp_serde::to_vec(obj)?;
    if obj_bytes.len() as u64 > MAX_FRAME_LEN {
        return Err(MaekawaError::transport(format!(
            "frame length {} exceeds limit {}",
            obj_bytes.len(),
            MAX_FRAME_LEN
        )));
    }
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, MaekawaError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bound = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, MaekawaError> {
    loop {
        let socket = if conn_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
