//! HTTP/1.1 framing as tokio-util codecs.
//!
//! Four codecs cover both roles on the wire:
//!
//! - [`RequestDecoder`] / [`ResponseEncoder`]: the server side
//! - [`RequestEncoder`] / [`ResponseDecoder`]: the client side
//!
//! All four are two-phase state machines: a head frame first, then the
//! payload frames the head announced, with [`head`] parsing/encoding the
//! heads and [`payload`] framing the bodies (Content-Length, chunked,
//! until-close, or none).

pub mod head;
pub mod payload;

mod request;
mod response;

pub use request::RequestDecoder;
pub use request::RequestEncoder;
pub use response::ResponseDecoder;
pub use response::ResponseEncoder;
