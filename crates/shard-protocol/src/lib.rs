//! Wire types shared by every rendershard routine.
//!
//! This crate owns:
//! - Routine payloads and their version-checked decoding
//! - Durable records written to the object store (job, chunk, error, post-render)
//! - Response bodies returned to callers
//! - Framing for the ordered streaming channel used by `renderer` and `still`

pub mod error;
pub mod payload;
pub mod records;
pub mod response;
pub mod stream;
pub mod types;

pub use error::ProtocolError;
pub use payload::{
    CompositionsPayload, InfoPayload, LaunchPayload, RendererPayload, Routine, RoutinePayload,
    StartPayload, StatusPayload, StillPayload, decode_payload, encode_payload,
};
pub use records::{
    ChunkRecord, ChunkStatus, ChunkTimings, CombineProgress, ErrorRecord, ErrorSource, JobRecord,
    JobType, LaunchRecord, PostRenderData, RetryRecord,
};
pub use response::{
    CompositionsResponse, CostsInfo, EncodingStatus, EnhancedErrorInfo, ErrorEnvelope, InfoResponse,
    LaunchResponse, OrError, ReceivedArtifact, RenderProgress, StartResponse, StillRenderedPayload,
    SuccessTag,
};
pub use stream::{
    StreamFrame, StreamFrameCodec, StreamMessageType, StreamStatus, StreamingMessage,
    StreamingPayload, is_stream_frame, make_stream_payload,
};
pub use types::{
    AudioCodec, Codec, CompositionInfo, DeleteAfter, Dimensions, FrameRange, ImageFormat, LogLevel,
    OutName, Privacy, WebhookOption,
};

/// Version string every payload must carry to be accepted by a worker of this build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Documentation pointer attached to version mismatch errors.
pub const UPGRADE_URL: &str = "https://rendershard.dev/docs/upgrading";
