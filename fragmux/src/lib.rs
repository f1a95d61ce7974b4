//! Lock-free multi-input frag archiver.
//!
//! Producers publish fragments ("frags") into shared-memory rings. The
//! [`archive::ArchiveTile`] drains any number of those rings on one busy
//! polling thread and writes every frag it reads intact to a pcapng
//! capture, without ever blocking a producer.
//!
//! - [`ipc`] - Shared-memory and heap regions the messaging objects live in
//! - [`tango`] - Messaging objects: frag ring, payload store, flow control, cnc
//! - [`tempo`] - Tick source and housekeeping interval math
//! - [`archive`] - The archive tile
//! - [`pcapng`] - Capture writer and reader
//! - [`producer`] - Frag publisher for load generation and tests

pub mod archive;
pub mod ipc;
pub mod pcapng;
pub mod producer;
pub mod tango;
pub mod tempo;

mod trace;

pub use trace::init_tracing;
