//! A multi-threaded actor runtime hosting large populations of lightweight
//! message-driven services on a small pool of OS threads.
//!
//! Each service owns a private mailbox and is advanced by dispatching one
//! message at a time through its handler. Mailboxes that hold work are
//! multiplexed fairly across worker threads via a single global
//! ready-queue, a dedicated reactor thread translates socket readiness
//! into messages, and a watchdog thread flags handlers that never return.
//!
//! ```no_run
//! use apiary::{Config, MessageKind, Payload, Runtime, Session};
//!
//! let runtime = Runtime::new(Config::default())?;
//! let node = runtime.node();
//!
//! let echo = runtime.spawn(|ctx: &apiary::ServiceContext, msg: apiary::Message| {
//!     if msg.kind == MessageKind::Text {
//!         let _ = ctx.send(msg.source, MessageKind::Response, Session::Id(msg.session), msg.payload);
//!     }
//! })?;
//!
//! node.send(echo, MessageKind::Text, Session::None, Payload::from("hello"))?;
//! runtime.run()?;
//! # Ok::<(), apiary::Error>(())
//! ```

#[cfg(not(unix))]
compile_error!("the socket server needs a unix host (epoll or kqueue)");

mod config;
mod error;
mod handle;
mod mailbox;
mod message;
mod monitor;
mod runtime;
mod service;
mod socket;

pub use config::Config;
pub use error::{Error, HandleError, SocketError};
pub use handle::Handle;
pub use message::{Message, MessageKind, Payload, Session};
pub use runtime::{Node, Runtime};
pub use service::{current_handle, Service, ServiceContext, ServiceStat};
pub use socket::{SocketEvent, SocketId, SocketMessage, UdpAddress};
