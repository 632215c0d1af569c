//! Encoder proxy seam and the process-backed encoder

pub mod process;
pub mod proxy;

pub use process::{
    build_encoder_args, parse_progress_line, ProcessEncoderFactory, ProcessEncoderProxy,
    ProgressLine,
};
pub use proxy::{
    EncodeError, EncodeProgress, EncodeRequest, EncoderEvent, EncoderProxy, EncoderProxyFactory,
    EventSink, PreviewRequest,
};
