//! # bitprobe-gdb
//!
//! The GDB Remote Serial Protocol server of the bitprobe stack: packet
//! framing with ack/noack handling, nom-based payload parsing, the command
//! dispatcher over a [`bitprobe::Session`], the `vCont` wait loop with
//! Ctrl-C preemption, and the `qRcmd` monitor CLI.
//!
//! The server is written against the [`connection::Connection`] trait; a
//! TCP implementation ships for host use and firmware supplies its CDC-ACM
//! endpoint.

pub mod connection;
pub mod desc;
pub mod monitor;
pub mod packet;
pub mod parser;
pub mod server;

pub use connection::{Connection, TcpConnection};
pub use server::{GdbServer, ServerError};
