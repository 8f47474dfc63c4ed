//! Wire packets and length framing.
//!
//! Every packet travels as one frame: a `u32` little-endian body length
//! followed by the rkyv-archived [`Packet`]. Bodies are validated with
//! `check_bytes` before being deserialized, so a corrupt peer produces a
//! [`RemoteObjectsError::Codec`] instead of undefined behaviour.

use crate::error::{RemoteObjectsError, Result};
use crate::types::{IndexPath, NodeId, SourceLocation, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub enum HandshakeStatus {
    Ok,
    /// Carries the source's signature for the diagnostic.
    Mismatch { expected: String },
    NoSuchSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub enum InvokeKind {
    Method,
    /// Setter for `ReadWrite` properties and push slot for `ReadPush`.
    WriteProperty,
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub enum CallOutcome {
    Ok(Value),
    Err(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub enum StructKind {
    Insert,
    Remove,
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub struct RoleName {
    pub role: i32,
    pub name: String,
}

/// One cell to fetch and the roles wanted for it.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub struct FetchItem {
    pub path: IndexPath,
    pub roles: Vec<i32>,
}

/// Answer for the [`FetchItem`] at the same position of the request.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub struct FetchResult {
    /// One value per requested role, `None` when the index does not exist.
    pub values: Option<Vec<Value>>,
    pub has_children: bool,
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub struct CellValue {
    pub row: u32,
    pub column: u32,
    pub role: i32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
pub enum Packet {
    // Connection management
    /// First packet on every channel, repeated when the exported set changes.
    Hello {
        node: NodeId,
        /// Listening endpoint of the sender.
        endpoint: String,
        sources: Vec<String>,
    },
    HeartBeat,
    HeartBeatAck,

    // Object binding
    Handshake {
        name: String,
        type_name: String,
        signature: String,
    },
    HandshakeAck {
        name: String,
        status: HandshakeStatus,
    },
    InitialState {
        name: String,
        values: Vec<Value>,
    },
    PropertyChanged {
        name: String,
        index: u32,
        value: Value,
    },
    Signal {
        name: String,
        index: u32,
        args: Vec<Value>,
    },
    Invoke {
        name: String,
        kind: InvokeKind,
        index: u32,
        args: Vec<Value>,
        call_id: Option<u64>,
    },
    Reply {
        name: String,
        call_id: u64,
        outcome: CallOutcome,
    },
    Release {
        name: String,
    },

    // Registry
    RegistryAdd {
        location: SourceLocation,
    },
    RegistryRemove {
        location: SourceLocation,
    },

    // Model replication
    ModelInitialState {
        name: String,
        generation: u64,
        rows: u32,
        columns: u32,
        role_names: Vec<RoleName>,
        available_roles: Vec<i32>,
        headers: Vec<Value>,
    },
    ModelFetchRequest {
        name: String,
        request_id: u64,
        generation: u64,
        items: Vec<FetchItem>,
    },
    ModelFetchReply {
        name: String,
        request_id: u64,
        stale: bool,
        results: Vec<FetchResult>,
    },
    ModelSizeRequest {
        name: String,
        request_id: u64,
        generation: u64,
        path: IndexPath,
    },
    ModelSizeReply {
        name: String,
        request_id: u64,
        stale: bool,
        rows: u32,
        columns: u32,
    },
    ModelStructChanged {
        name: String,
        parent: IndexPath,
        kind: StructKind,
        first: u32,
        last: u32,
    },
    ModelDataChanged {
        name: String,
        parent: IndexPath,
        top: u32,
        left: u32,
        bottom: u32,
        right: u32,
        roles: Vec<i32>,
        values: Vec<CellValue>,
    },
    ModelReset {
        name: String,
        rows: u32,
        columns: u32,
    },
    ModelSetData {
        name: String,
        generation: u64,
        path: IndexPath,
        role: i32,
        value: Value,
    },
}

impl Packet {
    /// Name of the binding the packet is addressed to, if any.
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            Packet::Hello { .. } | Packet::HeartBeat | Packet::HeartBeatAck => None,
            Packet::RegistryAdd { .. } | Packet::RegistryRemove { .. } => {
                Some(crate::registry::REGISTRY_NAME)
            }
            Packet::Handshake { name, .. }
            | Packet::HandshakeAck { name, .. }
            | Packet::InitialState { name, .. }
            | Packet::PropertyChanged { name, .. }
            | Packet::Signal { name, .. }
            | Packet::Invoke { name, .. }
            | Packet::Reply { name, .. }
            | Packet::Release { name }
            | Packet::ModelInitialState { name, .. }
            | Packet::ModelFetchRequest { name, .. }
            | Packet::ModelFetchReply { name, .. }
            | Packet::ModelSizeRequest { name, .. }
            | Packet::ModelSizeReply { name, .. }
            | Packet::ModelStructChanged { name, .. }
            | Packet::ModelDataChanged { name, .. }
            | Packet::ModelReset { name, .. }
            | Packet::ModelSetData { name, .. } => Some(name),
        }
    }
}

/// Serializes the packet body (without the length header).
pub fn encode_body(packet: &Packet) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<_, 1024>(packet)
        .map_err(|e| RemoteObjectsError::Codec(format!("serialize: {e:?}")))?;
    Ok(bytes.to_vec())
}

/// Validates and deserializes a packet body.
pub fn decode_body(body: &[u8]) -> Result<Packet> {
    // Archived data must be read from an aligned buffer.
    let mut aligned = rkyv::AlignedVec::with_capacity(body.len());
    aligned.extend_from_slice(body);
    rkyv::from_bytes::<Packet>(&aligned)
        .map_err(|e| RemoteObjectsError::Codec(format!("deserialize: {e:?}")))
}

/// Length header plus body, ready to be written to a byte stream.
pub fn encode_frame(packet: &Packet, max_frame_bytes: usize) -> Result<Vec<u8>> {
    let body = encode_body(packet)?;
    if body.len() > max_frame_bytes {
        return Err(RemoteObjectsError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: body.len(),
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental decoder for frames arriving in arbitrary chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete packet, or `None` if more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        check_length(length, self.max_frame_bytes)?;
        if self.buffer.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..FRAME_HEADER_LEN + length).collect();
        decode_body(&frame[FRAME_HEADER_LEN..]).map(Some)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn check_length(length: usize, max_frame_bytes: usize) -> Result<()> {
    if length == 0 {
        return Err(RemoteObjectsError::Codec(
            "frame length cannot be zero".to_string(),
        ));
    }
    if length > max_frame_bytes {
        return Err(RemoteObjectsError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: length,
        });
    }
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_packet<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes(header) as usize;
    check_length(length, max_frame_bytes)?;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    let packet = decode_body(&body)?;
    trace!(target: "remote_objects::io", bytes = length, "frame received");
    Ok(Some(packet))
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet, max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet, max_frame_bytes)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(target: "remote_objects::io", bytes = frame.len(), "frame sent");
    Ok(())
}
