//! Socket-free building blocks of the interceptor: frame codec, field layouts,
//! the RC4 keystream and its blind recovery, the message catalog and the
//! per-direction dispatch registry.

pub mod catalog;
pub mod cipher;
pub mod dispatch;
pub mod fields;
pub mod packet;
pub mod recovery;

pub use catalog::{Direction, MessageCatalog, MessageInfo};
pub use cipher::{CandidateTable, CipherError, StreamCipher};
pub use dispatch::{
    DispatchOutcome, DispatchRegistry, HandlerFuture, HandlerId, PacketHandler, PacketMatcher,
    WaitError, WaitFor,
};
pub use fields::{FieldError, FieldKind, FieldValue};
pub use packet::{FRAME_PREFIX_LEN, FrameError, MAX_PAYLOAD_LENGTH, Packet, ParsedFrames, WireValue};
pub use recovery::{Recovered, RecoveryError, recover, recover_with_limit};
