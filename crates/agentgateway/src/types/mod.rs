pub mod backend;
pub mod message;
pub mod request;
pub mod response;
pub mod stream;

pub use backend::{Backend, Protocol, RouteCandidate, RouteKind};
pub use message::Message;
pub use request::Request;
pub use response::{Choice, Response, Usage};
pub use stream::StreamChunk;
