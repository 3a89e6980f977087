//! ttycast-core: Shared protocol library for the ttycast session broker.
//!
//! Provides the client/server JSON envelopes, the worker control-channel
//! messages and datagram reassembly, the transcript record format, and the
//! batched/deflated outbound codec.

pub mod codec;
pub mod control;
pub mod error;
pub mod messages;
pub mod transcript;

// Re-export commonly used items at crate root.
pub use codec::{encode_batch, Deflater};
pub use control::{ControlMessage, DatagramReassembler, InboundControl, WorkerCommand};
pub use error::{CastError, CastResult};
pub use messages::{ClientMessage, EndReason, LobbyEntry, ServerMessage, WhereInfo};
pub use transcript::{RecordHeader, TranscriptDecoder, TranscriptRecord};
