//! Control-channel frame schema.
//!
//! A frame is the unit exchanged between broker and agent: a type tag, a
//! session id, and an opaque payload. Session ids are broker-assigned and
//! positive; [`CONTROL_SESSION`] is reserved for peer-scoped signals (the
//! port handshake and whole-channel teardown).

use serde::{Deserialize, Serialize};

/// Session id reserved for peer-scoped control signals.
pub const CONTROL_SESSION: i32 = -1;

/// Numeric frame type tags, fixed on the wire; both peers must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    /// Broker → agent: a new user session (or, on `CONTROL_SESSION`, the
    /// handshake announcing the public port).
    Open = 1,
    /// Forwarded user/service bytes, either direction.
    Data = 2,
    /// Session teardown, either direction; on `CONTROL_SESSION` from the
    /// agent it tears down the whole control channel.
    Close = 3,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Open),
            2 => Ok(Self::Data),
            3 => Ok(Self::Close),
            other => Err(format!("unknown frame type: 0x{other:02x}")),
        }
    }
}

/// A single message on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_type: FrameType,
    pub session: i32,
    /// Opaque bytes; encoded as a CBOR byte string, not an integer array.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    /// Announce a new user session to the agent.
    pub fn open(session: i32) -> Self {
        Self {
            frame_type: FrameType::Open,
            session,
            payload: Vec::new(),
        }
    }

    /// Forward a chunk of user or service bytes.
    pub fn data(session: i32, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            session,
            payload,
        }
    }

    /// Tear down one session, or the whole channel on `CONTROL_SESSION`.
    /// The payload is always empty; receivers ignore its content.
    pub fn close(session: i32) -> Self {
        Self {
            frame_type: FrameType::Close,
            session,
            payload: Vec::new(),
        }
    }

    /// The handshake frame sent by the broker immediately after accepting
    /// a control connection: carries the allocated public port as ASCII
    /// decimal.
    pub fn handshake(public_port: u16) -> Self {
        Self {
            frame_type: FrameType::Open,
            session: CONTROL_SESSION,
            payload: public_port.to_string().into_bytes(),
        }
    }

    /// Parse this frame as a handshake, returning the announced public
    /// port. `None` if the frame is not a well-formed handshake.
    pub fn handshake_port(&self) -> Option<u16> {
        if self.frame_type != FrameType::Open || self.session != CONTROL_SESSION {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()?.parse().ok()
    }
}

// ── Helper for bytes serde ───────────────────────────────────────────

mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.into_vec())
    }

    #[derive(Debug)]
    pub struct ByteBuf(Vec<u8>);

    impl ByteBuf {
        pub fn into_vec(self) -> Vec<u8> {
            self.0
        }
    }

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}
