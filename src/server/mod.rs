//! MySQL wire protocol front end.
//!
//! Built on `opensrv-mysql`: the library handles the handshake (accepting any
//! credentials) and packet framing, [`ProxyShim`] turns commands into pipeline
//! queries and [`MysqlProxyServer`] runs the accept loop.

mod listener;
mod shim;
pub mod values;

pub use listener::MysqlProxyServer;
pub use shim::{PreparedStatement, ProxyShim, error_kind};
