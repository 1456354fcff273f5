//! Credit-based streaming transport library.

pub mod codec;
pub mod config;
pub mod disrupt;
pub mod error;
pub mod message;
pub mod observability;
pub mod stream;
pub mod transport;
pub mod tunnel;

pub use config::TransportConfig;
pub use error::Error;
pub use message::{RequestContext, RestRequest, RestResponse, StreamRequest, StreamResponse};
pub use stream::{EntityStream, Observer, ReadHandle, Reader, WriteHandle, Writer};
pub use transport::{Client, Connection, ConnectionFactory, ServerDispatcher, StreamHandler};
