//! The wire protocol: one [frame::Frame] per UDP datagram.
//!
//! Frame layout (all numbers big endian; payloads are encrypted by the connection layer where
//!  applicable, the frame header is always plaintext):
//! ```ascii
//! 0:  message kind tag (u8):
//!     * 0 HEARTBEAT
//!     * 1 REQUEST
//!     * 2 REPLY
//!     * 3 ACKNOWLEDGE
//!     * 4 SHUTDOWN
//! 1:  rpc id (two u64: barrier, id) - present for REQUEST / REPLY / ACKNOWLEDGE
//! 17: payload (varint length prefix + bytes) - present for REQUEST / REPLY
//! ```
//!
//! HEARTBEAT and SHUTDOWN consist of the tag only.

pub mod frame;
pub mod rpc_id;
