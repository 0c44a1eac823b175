//! Sans-IO transport framing.
//!
//! [`TransportKind`] produces the init header and per-packet framing for the
//! [MTProto Abridged] and [MTProto Intermediate] transports. [`Decoder`]
//! accumulates raw stream bytes and yields complete packets, so any async
//! byte stream can sit underneath.
//!
//! [MTProto Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
//! [MTProto Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate

/// Which length-prefix framing to use on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// `0xef` once, then `[len/4 as 1 or 4 bytes][payload]`.
    #[default]
    Abridged,
    /// `0xeeeeeeee` once, then `[4-byte LE length][payload]`.
    Intermediate,
}

impl TransportKind {
    /// Bytes sent once right after the TCP connection opens.
    pub fn init_bytes(self) -> &'static [u8] {
        match self {
            Self::Abridged     => &[0xef],
            Self::Intermediate => &[0xee, 0xee, 0xee, 0xee],
        }
    }

    /// Frame one packet. `data.len()` must be a multiple of four.
    pub fn frame(self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 4);
        match self {
            Self::Abridged => {
                let words = data.len() / 4;
                if words < 127 {
                    out.push(words as u8);
                } else {
                    out.extend([
                        0x7f,
                        (words & 0xff) as u8,
                        ((words >> 8) & 0xff) as u8,
                        ((words >> 16) & 0xff) as u8,
                    ]);
                }
            }
            Self::Intermediate => out.extend((data.len() as u32).to_le_bytes()),
        }
        out.extend_from_slice(data);
        out
    }
}

/// Errors surfaced while decoding frames.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    /// The server sent a bare 4-byte negative code instead of a packet
    /// (e.g. `-404` for an unknown auth key).
    TransportCode(i32),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportCode(code) => write!(f, "transport error code {code}"),
        }
    }
}
impl std::error::Error for FrameError {}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    kind: TransportKind,
    buf:  Vec<u8>,
}

impl Decoder {
    pub fn new(kind: TransportKind) -> Self {
        Self { kind, buf: Vec::new() }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete packet, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let (header, len) = match self.kind {
            TransportKind::Abridged => {
                let Some(&first) = self.buf.first() else { return Ok(None) };
                if first < 0x7f {
                    (1, first as usize * 4)
                } else {
                    if self.buf.len() < 4 { return Ok(None); }
                    let words = self.buf[1] as usize
                        | (self.buf[2] as usize) << 8
                        | (self.buf[3] as usize) << 16;
                    (4, words * 4)
                }
            }
            TransportKind::Intermediate => {
                if self.buf.len() < 4 { return Ok(None); }
                let mut b = [0u8; 4];
                b.copy_from_slice(&self.buf[..4]);
                (4, u32::from_le_bytes(b) as usize)
            }
        };

        if self.buf.len() < header + len {
            return Ok(None);
        }
        let packet: Vec<u8> = self.buf.drain(..header + len).skip(header).collect();

        if packet.len() == 4 {
            let code = i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
            if code < 0 {
                return Err(FrameError::TransportCode(code));
            }
        }
        Ok(Some(packet))
    }
}
