//! Client connector used by the end-to-end scenarios

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use codec::{encode_request, extract_stage_type, BufferPool, ClientFrameDecoder, ClientResponse};
use prost::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use types::{msg_ids, AuthenticateRes, ErrorCode};

const MAX_FRAME_SIZE: usize = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of an authenticate round trip
#[derive(Debug)]
pub struct AuthReply {
    pub error_code: u16,
    pub stage_id: String,
    /// Stage type read with the connector-side tag scanner
    pub stage_type: Option<String>,
    /// Fully decoded reply, present on success
    pub res: Option<AuthenticateRes>,
}

impl AuthReply {
    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success.as_u16()
    }
}

pub struct TestClient {
    stream: TcpStream,
    read_buf: BytesMut,
    decoder: ClientFrameDecoder,
    next_seq: u16,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            decoder: ClientFrameDecoder::new(MAX_FRAME_SIZE, BufferPool::global()),
            next_seq: 1,
        })
    }

    /// Send a request and return the sequence number it was sent with
    pub async fn send(&mut self, msg_id: &str, stage_id: &str, payload: &[u8]) -> Result<u16> {
        let msg_seq = self.next_seq;
        self.next_seq = self.next_seq.checked_add(1).unwrap_or(1);
        self.send_with_seq(msg_id, msg_seq, stage_id, payload).await?;
        Ok(msg_seq)
    }

    /// Send a frame with an explicit sequence; 0 marks a push without reply
    pub async fn send_with_seq(&mut self, msg_id: &str, msg_seq: u16, stage_id: &str, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::new();
        encode_request(&mut frame, msg_id, msg_seq, stage_id, payload)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Next response frame; `None` once the server closed the connection
    pub async fn recv(&mut self) -> Result<Option<ClientResponse>> {
        loop {
            if let Some(response) = self.decoder.decode_response(&mut self.read_buf)? {
                return Ok(Some(response));
            }
            let read = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.read_buf))
                .await
                .context("Timed out waiting for a response")??;
            if read == 0 {
                if !self.read_buf.is_empty() {
                    bail!("Connection closed with {} bytes of a partial frame", self.read_buf.len());
                }
                return Ok(None);
            }
        }
    }

    /// Send a request and wait for the response carrying the same sequence
    pub async fn request(&mut self, msg_id: &str, stage_id: &str, payload: &[u8]) -> Result<ClientResponse> {
        let msg_seq = self.send(msg_id, stage_id, payload).await?;
        loop {
            match self.recv().await? {
                Some(response) if response.msg_seq == msg_seq => return Ok(response),
                Some(_) => continue,
                None => bail!("Connection closed before the reply to {msg_id}"),
            }
        }
    }

    pub async fn authenticate(&mut self, auth_msg_id: &str, payload: &[u8]) -> Result<AuthReply> {
        let response = self.request(auth_msg_id, "", payload).await?;
        if response.msg_id != msg_ids::AUTHENTICATE_RES {
            bail!("Unexpected authentication reply {}", response.msg_id);
        }

        let body = response.payload.as_slice();
        let res = if response.error_code == ErrorCode::Success.as_u16() {
            Some(AuthenticateRes::decode(body).context("Malformed AuthenticateRes")?)
        } else {
            None
        };
        Ok(AuthReply {
            error_code: response.error_code,
            stage_id: response.stage_id,
            stage_type: extract_stage_type(body),
            res,
        })
    }

    /// Whether the server has closed the connection
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match self.recv().await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}
