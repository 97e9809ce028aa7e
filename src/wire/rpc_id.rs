use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};


/// Identifies one outstanding RPC operation, unique per direction of a connection.
///
/// The `barrier` part groups requests into ordering epochs: requests of a later barrier are never
///  put on the wire before every request of an earlier barrier is satisfied. Within a barrier,
///  `id` disambiguates requests, and there is no ordering guarantee. Ordering and equality are
///  by `(barrier, id)`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RpcId {
    pub barrier: u64,
    pub id: u64,
}

impl Debug for RpcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.barrier, self.id)
    }
}

impl RpcId {
    /// The reserved id of the session key handshake, the very first request sent in each
    ///  direction of a connection.
    pub const HANDSHAKE: RpcId = RpcId { barrier: 0, id: 1 };

    pub const SERIALIZED_LEN: usize = 2 * size_of::<u64>();

    pub const fn new(barrier: u64, id: u64) -> RpcId {
        RpcId { barrier, id }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.barrier);
        buf.put_u64(self.id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RpcId> {
        let barrier = buf.try_get_u64()?;
        let id = buf.try_get_u64()?;
        Ok(RpcId { barrier, id })
    }
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::zero(RpcId::new(0, 0), b"\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0")]
    #[case::handshake(RpcId::HANDSHAKE, b"\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x01")]
    #[case::big(RpcId::new(0x0102030405060708, 0x1112131415161718),
        b"\x01\x02\x03\x04\x05\x06\x07\x08\x11\x12\x13\x14\x15\x16\x17\x18")]
    fn test_ser_deser(#[case] id: RpcId, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        id.ser(&mut buf);
        assert_eq!(&buf, expected);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(RpcId::try_deser(&mut read_buf).unwrap(), id);
        assert!(read_buf.is_empty());
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::half(b"\0\0\0\0\0\0\0\x01\0\0")]
    fn test_deser_underflow(#[case] mut buf: &[u8]) {
        assert!(RpcId::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_ordering_by_barrier_then_id() {
        assert!(RpcId::new(1, 9) < RpcId::new(2, 1));
        assert!(RpcId::new(2, 1) < RpcId::new(2, 2));
        assert_eq!(RpcId::new(3, 4), RpcId::new(3, 4));
    }
}
