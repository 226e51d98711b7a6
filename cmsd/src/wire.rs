use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::id::NodeId;

#[cfg(test)]
#[path = "wire.test.rs"]
mod tests;

/// Protocol version for wire format
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Size of the fixed request/response header.
pub const HEADER_LEN: usize = 8;

/// Error types for wire format operations
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] bincode::error::DecodeError),

    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unknown request code {0}")]
    UnknownCode(u8),

    /// A whole frame with an unknown code was read and skipped; the stream
    /// is still in step.
    #[error("Unsupported request code {code} on stream {stream_id}")]
    Unsupported { stream_id: u32, code: u8 },

    #[error("Body of {0} bytes does not fit in a frame")]
    BodyTooLarge(usize),

    #[error("Unexpected {0:?} frame")]
    Unexpected(RRCode),

    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request codes carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RRCode {
    Login = 0,
    Load = 1,
    AvKb = 2,
    Space = 3,
    Disk = 4,
    Have = 5,
    Locate = 6,
    Select = 7,
    Ping = 8,
    Pong = 9,
    State = 10,
    Status = 11,
    Update = 12,
    Disc = 13,
    Gone = 14,
    PrepAdd = 15,
    PrepDel = 16,
    Usage = 17,
    Stage = 18,
    Data = 19,
    Error = 20,
}

impl TryFrom<u8> for RRCode {
    type Error = WireError;

    fn try_from(code: u8) -> Result<Self, WireError> {
        use RRCode::*;
        const CODES: [RRCode; 21] = [
            Login, Load, AvKb, Space, Disk, Have, Locate, Select, Ping, Pong, State, Status,
            Update, Disc, Gone, PrepAdd, PrepDel, Usage, Stage, Data, Error,
        ];
        CODES
            .get(code as usize)
            .copied()
            .ok_or(WireError::UnknownCode(code))
    }
}

/// Modifier bits of a status frame. A frame may carry one suspend bit and
/// one staging bit at the same time.
pub mod modifier {
    pub const SUSPEND: u8 = 0x01;
    pub const RESUME: u8 = 0x02;
    pub const NO_STAGE: u8 = 0x04;
    pub const STAGE: u8 = 0x08;
}

/// Fixed size frame header.
///
/// ```text
/// +-----------+------+----------+--------+
/// | stream_id | code | modifier |  dlen  |
/// |  u32 BE   |  u8  |    u8    | u16 BE |
/// +-----------+------+----------+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Correlates a response with its request.
    pub stream_id: u32,
    pub code: RRCode,
    pub modifier: u8,
    /// Length of the body following the header.
    pub dlen: u16,
}

impl Header {
    pub fn new(stream_id: u32, code: RRCode, modifier: u8) -> Self {
        Header {
            stream_id,
            code,
            modifier,
            dlen: 0,
        }
    }

    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.stream_id);
        buf.put_u8(self.code as u8);
        buf.put_u8(self.modifier);
        buf.put_u16(self.dlen);
    }

    pub fn parse(mut data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::InsufficientData {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let stream_id = data.get_u32();
        let code = RRCode::try_from(data.get_u8())?;
        let modifier = data.get_u8();
        let dlen = data.get_u16();
        Ok(Header {
            stream_id,
            code,
            modifier,
            dlen,
        })
    }
}

/// A header plus its (possibly empty) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    /// Create a frame without a body
    pub fn empty(stream_id: u32, code: RRCode, modifier: u8) -> Self {
        Frame {
            header: Header::new(stream_id, code, modifier),
            body: Bytes::new(),
        }
    }

    /// Create a frame whose body is the bincode encoding of `value`
    pub fn with_body<T: Serialize>(
        stream_id: u32,
        code: RRCode,
        value: &T,
    ) -> Result<Self, WireError> {
        let body = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        let dlen = u16::try_from(body.len()).map_err(|_| WireError::BodyTooLarge(body.len()))?;
        let mut header = Header::new(stream_id, code, 0);
        header.dlen = dlen;
        Ok(Frame {
            header,
            body: Bytes::from(body),
        })
    }

    /// Decode the body of this frame
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        let (value, _) = bincode::serde::decode_from_slice(&self.body, bincode::config::standard())?;
        Ok(value)
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.header.put(&mut buffer);
        buffer.extend_from_slice(&self.body);
        buffer.freeze()
    }

    /// Decode a single complete frame
    pub fn decode(mut bytes: Bytes) -> Result<Self, WireError> {
        let header = Header::parse(&bytes)?;
        bytes.advance(HEADER_LEN);
        if bytes.len() < header.dlen as usize {
            return Err(WireError::InsufficientData {
                expected: header.dlen as usize,
                actual: bytes.len(),
            });
        }
        let body = bytes.split_to(header.dlen as usize);
        Ok(Frame { header, body })
    }
}

/// An exported path prefix announced at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub prefix: String,
    pub writable: bool,
}

/// Login/identify handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub protocol_version: u16,
    /// `server`, `supervisor`, `manager`, `peer` or `proxy`.
    pub role: String,
    pub host: String,
    pub port: u16,
    /// Session id used to recognise a reconnecting node.
    pub session_id: Option<String>,
    /// Placement level, lower is closer.
    pub level: u8,
    pub config_id: u32,
    pub exports: Vec<Export>,
    pub suspended: bool,
    pub no_stage: bool,
    pub disk: DiskReport,
    /// Opaque credentials handed to the authenticator.
    pub credentials: Vec<u8>,
}

/// Load report, every component is a percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub cpu: u8,
    pub net: u8,
    pub xeq: u8,
    pub mem: u8,
    pub pag: u8,
    pub disk_util: u8,
    /// Largest free space in KB.
    pub disk_free: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceReport {
    pub disk_free: u64,
    pub disk_util: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskReport {
    pub disk_free: u64,
    pub disk_util: u8,
    pub disk_nums: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathQuery {
    pub path: String,
    /// The caller intends to write.
    pub write: bool,
    /// The file may be staged in when no node has it.
    pub stage: bool,
}

/// Aggregate state announced by a subordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub suspended: bool,
    pub no_stage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepAdd {
    pub reqid: String,
    pub ident: String,
    pub notify: String,
    pub priority: u8,
    pub mode: String,
    pub options: u32,
    pub path: String,
    pub opaque: Option<String>,
    pub coloc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepDel {
    pub reqid: String,
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login(Box<Login>),
    Load(LoadReport),
    AvKb,
    Space(SpaceReport),
    Disk(DiskReport),
    Have(String),
    Locate(PathQuery),
    Select(PathQuery),
    Ping,
    Pong,
    State(StateReport),
    Status(u8),
    Update,
    Disc(Option<String>),
    Gone,
    PrepAdd(PrepAdd),
    PrepDel(PrepDel),
    Usage,
}

impl Request {
    pub fn code(&self) -> RRCode {
        match self {
            Request::Login(_) => RRCode::Login,
            Request::Load(_) => RRCode::Load,
            Request::AvKb => RRCode::AvKb,
            Request::Space(_) => RRCode::Space,
            Request::Disk(_) => RRCode::Disk,
            Request::Have(_) => RRCode::Have,
            Request::Locate(_) => RRCode::Locate,
            Request::Select(_) => RRCode::Select,
            Request::Ping => RRCode::Ping,
            Request::Pong => RRCode::Pong,
            Request::State(_) => RRCode::State,
            Request::Status(_) => RRCode::Status,
            Request::Update => RRCode::Update,
            Request::Disc(_) => RRCode::Disc,
            Request::Gone => RRCode::Gone,
            Request::PrepAdd(_) => RRCode::PrepAdd,
            Request::PrepDel(_) => RRCode::PrepDel,
            Request::Usage => RRCode::Usage,
        }
    }

    pub fn to_frame(&self, stream_id: u32) -> Result<Frame, WireError> {
        let code = self.code();
        match self {
            Request::Login(login) => Frame::with_body(stream_id, code, login.as_ref()),
            Request::Load(load) => Frame::with_body(stream_id, code, load),
            Request::Space(space) => Frame::with_body(stream_id, code, space),
            Request::Disk(disk) => Frame::with_body(stream_id, code, disk),
            Request::Have(path) => Frame::with_body(stream_id, code, path),
            Request::Locate(query) | Request::Select(query) => {
                Frame::with_body(stream_id, code, query)
            }
            Request::State(state) => Frame::with_body(stream_id, code, state),
            Request::Status(bits) => Ok(Frame::empty(stream_id, code, *bits)),
            Request::Disc(reason) => Frame::with_body(stream_id, code, reason),
            Request::PrepAdd(prep) => Frame::with_body(stream_id, code, prep),
            Request::PrepDel(prep) => Frame::with_body(stream_id, code, prep),
            Request::AvKb | Request::Ping | Request::Pong | Request::Update | Request::Gone
            | Request::Usage => Ok(Frame::empty(stream_id, code, 0)),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        let request = match frame.header.code {
            RRCode::Login => Request::Login(Box::new(frame.decode_body()?)),
            RRCode::Load => Request::Load(frame.decode_body()?),
            RRCode::AvKb => Request::AvKb,
            RRCode::Space => Request::Space(frame.decode_body()?),
            RRCode::Disk => Request::Disk(frame.decode_body()?),
            RRCode::Have => Request::Have(frame.decode_body()?),
            RRCode::Locate => Request::Locate(frame.decode_body()?),
            RRCode::Select => Request::Select(frame.decode_body()?),
            RRCode::Ping => Request::Ping,
            RRCode::Pong => Request::Pong,
            RRCode::State => Request::State(frame.decode_body()?),
            RRCode::Status => Request::Status(frame.header.modifier),
            RRCode::Update => Request::Update,
            RRCode::Disc => Request::Disc(if frame.body.is_empty() {
                None
            } else {
                frame.decode_body()?
            }),
            RRCode::Gone => Request::Gone,
            RRCode::PrepAdd => Request::PrepAdd(frame.decode_body()?),
            RRCode::PrepDel => Request::PrepDel(frame.decode_body()?),
            RRCode::Usage => Request::Usage,
            code @ (RRCode::Stage | RRCode::Data | RRCode::Error) => {
                return Err(WireError::Unexpected(code));
            }
        };
        Ok(request)
    }
}

/// Where a file can be found or placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub node: NodeId,
    pub host: String,
    pub port: u16,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed or out of protocol command.
    Invalid,
    /// No node can currently serve the request.
    Unavailable,
    NotAuthorized,
    /// The connection is being dropped.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

/// Replies sent back on the stream id of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Locate(Vec<Location>),
    Select(Location),
    Space(SpaceReport),
    Usage(LoadReport),
    Pong,
    Error(ErrorReply),
}

impl Response {
    pub fn to_frame(&self, stream_id: u32) -> Result<Frame, WireError> {
        match self {
            Response::Pong => Ok(Frame::empty(stream_id, RRCode::Pong, 0)),
            Response::Error(reply) => Frame::with_body(stream_id, RRCode::Error, reply),
            data => Frame::with_body(stream_id, RRCode::Data, data),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        match frame.header.code {
            RRCode::Pong => Ok(Response::Pong),
            RRCode::Error => Ok(Response::Error(frame.decode_body()?)),
            RRCode::Data => frame.decode_body(),
            code => Err(WireError::Unexpected(code)),
        }
    }
}

/// Frame reader for processing incoming data
pub struct FrameParser {
    state: ReaderState,
    buffer: BytesMut,
}

enum ReaderState {
    ReadingHeader,
    ReadingBody(Header),
    Skipping { stream_id: u32, code: u8, dlen: usize },
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            state: ReaderState::ReadingHeader,
            buffer: BytesMut::new(),
        }
    }

    /// Add data to the reader buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to parse a complete frame from the buffer. A frame with an
    /// unknown code is consumed whole and reported as
    /// [`WireError::Unsupported`]; parsing can carry on after it.
    pub fn parse(&mut self) -> Result<Option<Frame>, WireError> {
        loop {
            match &self.state {
                ReaderState::ReadingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    self.state = match Header::parse(&self.buffer[..HEADER_LEN]) {
                        Ok(header) => ReaderState::ReadingBody(header),
                        Err(WireError::UnknownCode(code)) => {
                            let mut raw = &self.buffer[..HEADER_LEN];
                            let stream_id = raw.get_u32();
                            raw.advance(2);
                            ReaderState::Skipping {
                                stream_id,
                                code,
                                dlen: raw.get_u16() as usize,
                            }
                        }
                        Err(err) => return Err(err),
                    };
                    self.buffer.advance(HEADER_LEN);
                }
                &ReaderState::Skipping {
                    stream_id,
                    code,
                    dlen,
                } => {
                    if self.buffer.len() < dlen {
                        return Ok(None);
                    }
                    self.buffer.advance(dlen);
                    self.state = ReaderState::ReadingHeader;
                    return Err(WireError::Unsupported { stream_id, code });
                }
                ReaderState::ReadingBody(header) => {
                    let length = header.dlen as usize;
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let frame = Frame {
                        header: *header,
                        body: self.buffer.split_to(length).freeze(),
                    };
                    self.state = ReaderState::ReadingHeader;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// A stream for reading frames
pub struct FrameReader<R> {
    inner: R,
    parser: FrameParser,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            parser: FrameParser::new(),
        }
    }

    /// Read the next frame from the stream, `None` at end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        if let Some(frame) = self.parser.parse()? {
            return Ok(Some(frame));
        }

        let mut buffer = [0u8; 1024];
        loop {
            let n = self.inner.read(&mut buffer).await?;
            if n == 0 {
                return Ok(None);
            }
            self.parser.extend(&buffer[..n]);
            if let Some(frame) = self.parser.parse()? {
                return Ok(Some(frame));
            }
        }
    }
}
