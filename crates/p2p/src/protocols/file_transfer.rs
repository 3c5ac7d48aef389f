//! File transfer (`/senddata/p2p`).
//!
//! Request: `<requester-peer-id>,<cid>\n`. Response: one status byte, then
//! for [`STATUS_OK`] the raw file bytes until the responder closes.

use super::{invalid_data, read_line, read_to_end_limited, MAX_LINE_LEN};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use libp2p::StreamProtocol;
use orcanet_files::ContentId;
use std::io;

pub const FILE_TRANSFER_PROTOCOL: StreamProtocol = StreamProtocol::new("/senddata/p2p");

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_NOT_FOUND: u8 = 0x01;
pub const STATUS_ERROR: u8 = 0x02;

/// Default cap on a single transferred file.
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferRequest {
    /// Textual peer id of the requester, as sent on the wire.
    pub requester: String,
    pub cid: ContentId,
}

impl FileTransferRequest {
    fn parse(line: &str) -> io::Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [requester, cid] = fields.as_slice() else {
            return Err(invalid_data(format!(
                "expected 2 comma separated fields, got {}",
                fields.len()
            )));
        };
        let cid = cid.parse::<ContentId>().map_err(invalid_data)?;
        Ok(Self {
            requester: requester.to_string(),
            cid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTransferResponse {
    Found(Vec<u8>),
    NotFound,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FileTransferCodec {
    max_bytes: u64,
}

impl FileTransferCodec {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl Default for FileTransferCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSFER_BYTES)
    }
}

#[async_trait]
impl request_response::Codec for FileTransferCodec {
    type Protocol = StreamProtocol;
    type Request = FileTransferRequest;
    type Response = FileTransferResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let line = read_line(io, MAX_LINE_LEN).await?;
        FileTransferRequest::parse(&line)
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut status = [0u8; 1];
        io.read_exact(&mut status).await?;
        match status[0] {
            STATUS_OK => Ok(FileTransferResponse::Found(
                read_to_end_limited(io, self.max_bytes).await?,
            )),
            STATUS_NOT_FOUND => Ok(FileTransferResponse::NotFound),
            STATUS_ERROR => Ok(FileTransferResponse::Failed),
            other => Err(invalid_data(format!("unknown transfer status {other:#04x}"))),
        }
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let line = format!("{},{}\n", request.requester, request.cid);
        io.write_all(line.as_bytes()).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        match response {
            FileTransferResponse::Found(bytes) => {
                io.write_all(&[STATUS_OK]).await?;
                io.write_all(&bytes).await?;
            }
            FileTransferResponse::NotFound => io.write_all(&[STATUS_NOT_FOUND]).await?,
            FileTransferResponse::Failed => io.write_all(&[STATUS_ERROR]).await?,
        }
        io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use libp2p::request_response::Codec;

    fn cid() -> ContentId {
        ContentId::from_data(b"transfer").unwrap()
    }

    #[tokio::test]
    async fn request_round_trips_through_the_line_format() {
        let request = FileTransferRequest {
            requester: "12D3KooWRequester".into(),
            cid: cid(),
        };
        let mut codec = FileTransferCodec::default();
        let mut io = Cursor::new(Vec::new());
        codec
            .write_request(&FILE_TRANSFER_PROTOCOL, &mut io, request.clone())
            .await
            .unwrap();
        assert_eq!(
            io.get_ref().as_slice(),
            format!("12D3KooWRequester,{}\n", cid()).as_bytes()
        );

        let decoded = codec
            .read_request(&FILE_TRANSFER_PROTOCOL, &mut Cursor::new(io.into_inner()))
            .await
            .unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn request_needs_exactly_two_fields() {
        let mut codec = FileTransferCodec::default();
        for raw in [
            format!("{}\n", cid()),
            format!("a,b,{}\n", cid()),
            "peer,not-a-cid\n".to_string(),
        ] {
            let result = codec
                .read_request(&FILE_TRANSFER_PROTOCOL, &mut Cursor::new(raw.clone().into_bytes()))
                .await;
            assert!(result.is_err(), "accepted {raw:?}");
        }
    }

    #[tokio::test]
    async fn status_byte_precedes_payload() {
        let mut codec = FileTransferCodec::default();
        for (response, expected) in [
            (FileTransferResponse::Found(b"abc".to_vec()), b"\x00abc".to_vec()),
            (FileTransferResponse::Found(Vec::new()), vec![STATUS_OK]),
            (FileTransferResponse::NotFound, vec![STATUS_NOT_FOUND]),
            (FileTransferResponse::Failed, vec![STATUS_ERROR]),
        ] {
            let mut io = Cursor::new(Vec::new());
            codec
                .write_response(&FILE_TRANSFER_PROTOCOL, &mut io, response.clone())
                .await
                .unwrap();
            assert_eq!(io.get_ref(), &expected);

            let decoded = codec
                .read_response(&FILE_TRANSFER_PROTOCOL, &mut Cursor::new(expected))
                .await
                .unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[tokio::test]
    async fn closed_without_data_is_an_error() {
        let mut codec = FileTransferCodec::default();
        let err = codec
            .read_response(&FILE_TRANSFER_PROTOCOL, &mut Cursor::new(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let mut codec = FileTransferCodec::new(4);
        let err = codec
            .read_response(&FILE_TRANSFER_PROTOCOL, &mut Cursor::new(b"\x0012345".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
