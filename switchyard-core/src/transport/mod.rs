//! Wire boundary: how requests travel over HTTP and how streamed messages
//! are framed.

mod framing;
mod http;

pub use framing::{encode_frame, write_frames, FrameDecoder, FrameError, MAX_FRAME_BYTES};
pub use http::{
    from_http, respond, to_http, to_http_upload, HttpCall, HttpResponse, Method, WireCall,
    WireError, DISPATCH_PARAM, PATH_PREFIX, QUERY_PARAM,
};
