//! Coordinator link: the envelope protocol between world servers and
//! the routing coordinator.
//!
//! Envelopes ride a separate TCP connection from client traffic and use
//! their own framing: a little-endian u16 length prefix covering the
//! 12-byte header plus payload. The header mirrors the client frame
//! header but carries a client id instead of a flag word, so a relayed
//! client frame can be wrapped and unwrapped without copying fields
//! around.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::servers::world::{AccountRecord, WorldState};

/// Envelope header length: client_id u32 + command u16 + three u16 params.
pub const ENVELOPE_HEADER_LEN: usize = 12;
pub const MAX_ENVELOPE_LEN: usize = 8192;

/// Coordinator-side command codes.
pub const IS_KEEPALIVE: u16 = 0x3000;
pub const IS_PLAYER_ENTER: u16 = 0x3001;
pub const IS_PLAYER_ENTER_ACK: u16 = 0x3002;

/// Fixed size of the player handoff record carried by `IS_PLAYER_ENTER`.
pub const HANDOFF_RECORD_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope length {0} exceeds maximum {MAX_ENVELOPE_LEN}")]
    TooLong(usize),

    #[error("envelope shorter than its header")]
    HeaderTruncated,

    #[error("handoff record has {0} bytes, expected {HANDOFF_RECORD_LEN}")]
    BadRecordLen(usize),
}

/// One decoded coordinator envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub client_id: u32,
    pub command: u16,
    pub param1: u16,
    pub param2: u16,
    pub param3: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(command: u16) -> Self {
        Self {
            client_id: 0,
            command,
            param1: 0,
            param2: 0,
            param3: 0,
            payload: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize with the u16 length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let body_len = ENVELOPE_HEADER_LEN + self.payload.len();
        if body_len > MAX_ENVELOPE_LEN {
            return Err(EnvelopeError::TooLong(body_len));
        }
        let mut out = Vec::with_capacity(2 + body_len);
        out.extend_from_slice(&(body_len as u16).to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.param1.to_le_bytes());
        out.extend_from_slice(&self.param2.to_le_bytes());
        out.extend_from_slice(&self.param3.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode one length-stripped envelope body.
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        if body.len() < ENVELOPE_HEADER_LEN {
            return Err(EnvelopeError::HeaderTruncated);
        }
        Ok(Self {
            client_id: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            command: u16::from_le_bytes([body[4], body[5]]),
            param1: u16::from_le_bytes([body[6], body[7]]),
            param2: u16::from_le_bytes([body[8], body[9]]),
            param3: u16::from_le_bytes([body[10], body[11]]),
            payload: body[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }
}

/// Accumulates stream bytes and yields complete envelopes.
#[derive(Default)]
pub struct EnvelopeScanner {
    buf: BytesMut,
}

impl EnvelopeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, EnvelopeError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let body_len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if body_len > MAX_ENVELOPE_LEN {
            return Err(EnvelopeError::TooLong(body_len));
        }
        if self.buf.len() < 2 + body_len {
            return Ok(None);
        }
        self.buf.advance(2);
        let body = self.buf.split_to(body_len);
        Envelope::decode(&body).map(Some)
    }
}

/// Fixed-layout handoff record inside `IS_PLAYER_ENTER`:
/// account nul-padded at 0..16, character at 16..32, login_id u32 LE at
/// 32..36, char_id u32 LE at 36..40, server_id u16 LE at 40..42, the
/// rest reserved zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerHandoff {
    pub account: String,
    pub character: String,
    pub login_id: u32,
    pub char_id: u32,
    pub server_id: u16,
}

impl PlayerHandoff {
    pub fn encode(&self) -> [u8; HANDOFF_RECORD_LEN] {
        let mut out = [0u8; HANDOFF_RECORD_LEN];
        write_padded(&mut out[0..16], &self.account);
        write_padded(&mut out[16..32], &self.character);
        out[32..36].copy_from_slice(&self.login_id.to_le_bytes());
        out[36..40].copy_from_slice(&self.char_id.to_le_bytes());
        out[40..42].copy_from_slice(&self.server_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != HANDOFF_RECORD_LEN {
            return Err(EnvelopeError::BadRecordLen(bytes.len()));
        }
        Ok(Self {
            account: read_padded(&bytes[0..16]),
            character: read_padded(&bytes[16..32]),
            login_id: u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]),
            char_id: u32::from_le_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]),
            server_id: u16::from_le_bytes([bytes[40], bytes[41]]),
        })
    }
}

fn write_padded(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn read_padded(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).to_string()
}

/// Maintain the connection to the coordinator, retrying with a flat
/// backoff. Never returns while the process runs.
pub async fn run_coordinator_link(state: Arc<WorldState>) {
    let addr = format!(
        "{}:{}",
        state.config.coordinator_ip, state.config.coordinator_port
    );
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                tracing::info!("[world] [coord] connected to {}", addr);
                if let Err(e) = serve_link(&state, stream).await {
                    tracing::warn!("[world] [coord] link lost: {}", e);
                }
            }
            Err(e) => {
                tracing::debug!("[world] [coord] connect to {} failed: {}", addr, e);
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn serve_link(state: &Arc<WorldState>, mut stream: TcpStream) -> anyhow::Result<()> {
    let mut scanner = EnvelopeScanner::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("coordinator closed the connection");
        }
        scanner.push(&buf[..n]);
        while let Some(env) = scanner.next_envelope()? {
            if let Some(reply) = handle_envelope(state, env).await {
                stream.write_all(&reply.encode()?).await?;
            }
        }
    }
}

/// Process one coordinator envelope; `Some` means a reply goes back.
pub async fn handle_envelope(state: &Arc<WorldState>, env: Envelope) -> Option<Envelope> {
    match env.command {
        IS_KEEPALIVE => {
            let mut echo = Envelope::new(IS_KEEPALIVE);
            echo.client_id = env.client_id;
            Some(echo)
        }
        IS_PLAYER_ENTER => {
            let mut record = match PlayerHandoff::decode(&env.payload) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[world] [coord] bad handoff record: {}", e);
                    return None;
                }
            };
            // The receiving side is authoritative for its own id.
            record.server_id = state.config.server_id;
            tracing::info!(
                "[world] [coord] handoff for '{}' (char {})",
                record.character,
                record.char_id
            );
            state
                .insert_handoff(AccountRecord {
                    account: record.account.clone(),
                    character: record.character.clone(),
                    login_id: record.login_id,
                    char_id: record.char_id,
                })
                .await;

            let mut ack = Envelope::new(IS_PLAYER_ENTER_ACK);
            ack.client_id = env.client_id;
            ack.param1 = record.server_id;
            Some(ack.payload(record.encode().to_vec()))
        }
        other => {
            tracing::debug!("[world] [coord] unrecognized envelope cmd={:04X}", other);
            None
        }
    }
}
