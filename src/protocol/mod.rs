//! Protocol-level vocabulary shared by the codec, client and server.
//!
//! The framing layer speaks in [`Message`]s: a decoded or to-be-encoded head
//! followed by a sequence of [`PayloadItem`]s. [`RequestHead`] and
//! [`ResponseHead`] wrap the `http` crate types so headers keep their
//! ordered, case-insensitive, repeatable-name semantics throughout.

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHead;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
