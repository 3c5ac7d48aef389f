//! Application protocols spoken over the multiplexed stream.
//!
//! Each protocol is a `request_response` codec. The byte formats are fixed
//! by peers already deployed on the network, so requests are single
//! newline-terminated lines and responses run until the writer closes.

pub mod file_transfer;
pub mod metadata_query;
pub mod peer_exchange;

use futures::io::{AsyncRead, AsyncReadExt};
use std::io;

pub use file_transfer::{
    FileTransferCodec, FileTransferRequest, FileTransferResponse, FILE_TRANSFER_PROTOCOL,
};
pub use metadata_query::{
    MetadataQueryCodec, MetadataQueryRequest, MetadataQueryResponse, METADATA_QUERY_PROTOCOL,
};
pub use peer_exchange::{KnownPeer, PeerExchangeCodec, PeerExchangeMessage, PEER_EXCHANGE_PROTOCOL};

/// Upper bound for a single request line.
pub(crate) const MAX_LINE_LEN: usize = 64 * 1024;

pub(crate) fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Read up to and excluding the next `\n`, or to end of stream.
///
/// Reads byte by byte so nothing past the newline is consumed. Empty input
/// is an `UnexpectedEof`.
pub(crate) async fn read_line<T>(io: &mut T, max_len: usize) -> io::Result<String>
where
    T: AsyncRead + Unpin + Send,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    let mut saw_any = false;

    loop {
        let n = io.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        saw_any = true;
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= max_len {
            return Err(invalid_data(format!("line exceeds {max_len} bytes")));
        }
        line.push(byte[0]);
    }

    if !saw_any {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before a request line",
        ));
    }

    let text = String::from_utf8(line).map_err(invalid_data)?;
    Ok(text.trim_end_matches('\r').to_string())
}

/// Read until the writer closes, failing once more than `limit` bytes arrive.
pub(crate) async fn read_to_end_limited<T>(io: &mut T, limit: u64) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    io.take(limit.saturating_add(1)).read_to_end(&mut buf).await?;
    if buf.len() as u64 > limit {
        return Err(invalid_data(format!("payload exceeds {limit} bytes")));
    }
    Ok(buf)
}
