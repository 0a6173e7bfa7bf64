//! A yamux-style stream multiplexer: many independent, ordered,
//! flow-controlled byte streams over one reliable byte pipe.
//!
//! ```rust,no_run
//! use yamux_rs::{Config, Session};
//!
//! #[tokio::main]
//! async fn main() -> yamux_rs::Result<()> {
//!     let socket = tokio::net::TcpStream::connect("127.0.0.1:4000").await?;
//!     let session = Session::client(socket, Config::new());
//!
//!     let stream = session.open_stream().await?;
//!     stream.write(b"hello").await?;
//!     stream.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod semaphore;
pub mod session;
pub mod stream;
mod timer;

pub use config::Config;
pub use error::{Error, Result};
pub use frame::{Flags, FrameType, GoAwayCode, Header};
pub use semaphore::Semaphore;
pub use session::Session;
pub use stream::{Stream, StreamState};
