//! wabridge core library: lifecycle status, audit log, responder gateway, message
//! dispatch, transports and the HTTP gateway used by the CLI.

pub mod audit;
pub mod bridge;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod init;
pub mod persist;
pub mod responder;
pub mod status;
