mod http_transport;
mod retry_policy;

pub use http_transport::{byte_stream, read_body, ByteStream, HttpTransport};
pub use retry_policy::RetryPolicy;
