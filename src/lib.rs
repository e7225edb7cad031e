pub mod command;
pub mod connection;
pub mod frame;
pub mod server;
pub mod store;


// Re-export the protocol types for direct access
pub use command::{Command, ProtocolError, Response, StoreRequest};
pub use connection::Connection;
pub use frame::Frame;

// Re-export the main server API for easy access
pub use server::{DEFAULT_HOST, DEFAULT_PORT, ServerConfig, bind, run};
pub use store::{Item, SharedStore, Store, StoreMode, StoreOutcome};

/// Error returned by most functions.
///
/// Almost every failure in this crate is terminal for exactly one
/// connection: a malformed record, a client that timed out or went away,
/// an I/O fault on its socket. Nothing upstream inspects the cause beyond
/// logging it at the point where the connection closes, so a boxed
/// `std::error::Error` carries enough information and saves the crate a
/// catch-all error enum.
///
/// The exception is record extraction. A partially buffered record shows
/// up on nearly every socket read and is not a failure at all, just a
/// signal to read more bytes, so `frame::Error` keeps `Incomplete` as a
/// plain enum variant and only converts into the boxed type once a record
/// is genuinely malformed.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for cache server operations.
///
/// This is defined as a convenience.
///
/// # Examples
///
/// Running a server until Ctrl-C:
///
/// ```rust,no_run
/// use mcached::server::{self, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> mcached::Result<()> {
///     let listener = server::bind(server::DEFAULT_HOST, server::DEFAULT_PORT)?;
///     server::run(listener, ServerConfig::default(), tokio::signal::ctrl_c()).await
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
