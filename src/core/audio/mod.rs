//! Per-session audio plumbing: frames, duplex queues and the binary wire
//! codec.

mod bus;
mod codec;
mod frame;

pub use bus::{FrameBus, FrameQueue, DEFAULT_QUEUE_CAPACITY};
pub use codec::{decode_frame, encode_frame, CodecError, FrameHeader, HEADER_LEN, KIND_AUDIO,
    PROTOCOL_VERSION};
pub use frame::{
    pcm_from_samples, AudioFrame, FRAME_BYTES, FRAME_DURATION_MS, FRAME_SAMPLES, SAMPLE_RATE_HZ,
};
