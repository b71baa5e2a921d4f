// Wire-level building blocks shared by every relay transport:
// JSON-RPC 2.0 envelopes, the error taxonomy, line framing and reply normalization.

pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod normalize;

pub use error::{RelayError, RelayResult};
pub use framing::{parse_message, Frame, MessageCodec, MAX_MESSAGE_BYTES};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ResponsePayload};
