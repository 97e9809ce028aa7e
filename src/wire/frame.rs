use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_bytes, try_get_bytes};
use crate::wire::rpc_id::RpcId;


#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Heartbeat = 0,
    Request = 1,
    Reply = 2,
    Acknowledge = 3,
    Shutdown = 4,
}

/// One UDP datagram's worth of protocol traffic.
///
/// REQUEST and REPLY carry a payload that is opaque at this layer - the connection layer decides
///  what goes in it (ciphertext for application traffic, plaintext for the session handshake).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// keeps NAT mappings alive and drives the peer's liveness tracking; no payload
    Heartbeat,
    Request {
        id: RpcId,
        payload: Bytes,
    },
    Reply {
        id: RpcId,
        payload: Bytes,
    },
    /// confirms receipt of a REPLY so the peer can stop retransmitting it
    Acknowledge {
        id: RpcId,
    },
    /// the peer is going away for good; all state for it can be dropped
    Shutdown,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Heartbeat => FrameKind::Heartbeat,
            Frame::Request { .. } => FrameKind::Request,
            Frame::Reply { .. } => FrameKind::Reply,
            Frame::Acknowledge { .. } => FrameKind::Acknowledge,
            Frame::Shutdown => FrameKind::Shutdown,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            Frame::Heartbeat => {}
            Frame::Request { id, payload } => {
                id.ser(buf);
                put_bytes(buf, payload);
            }
            Frame::Reply { id, payload } => {
                id.ser(buf);
                put_bytes(buf, payload);
            }
            Frame::Acknowledge { id } => {
                id.ser(buf);
            }
            Frame::Shutdown => {}
        }
    }

    /// convenience for the send path: a frame serialized into a fresh, frozen buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let tag = buf.try_get_u8()?;
        let kind = FrameKind::try_from(tag)
            .map_err(|_| anyhow!("unknown frame kind tag {}", tag))?;

        let frame = match kind {
            FrameKind::Heartbeat => Frame::Heartbeat,
            FrameKind::Request => Frame::Request {
                id: RpcId::try_deser(buf)?,
                payload: Bytes::from(try_get_bytes(buf)?),
            },
            FrameKind::Reply => Frame::Reply {
                id: RpcId::try_deser(buf)?,
                payload: Bytes::from(try_get_bytes(buf)?),
            },
            FrameKind::Acknowledge => Frame::Acknowledge {
                id: RpcId::try_deser(buf)?,
            },
            FrameKind::Shutdown => Frame::Shutdown,
        };
        Ok(frame)
    }
}
