//! Matter bulk data exchange (BDX) transfer library - responder side.
//!
//! This library implements the BDX file/log transfer protocol as an event
//! driven state machine plus the asynchronous glue needed to run it over a
//! message exchange. Library uses asynchronous Rust and depends on Tokio.
//! Following are main parts of api:
//! - [TransferSession](session::TransferSession) - Pure protocol state machine for one transfer.
//!                       Consumes received messages, produces a queue of output events
//!                       (messages to send, blocks received, acknowledgements, ...) and never
//!                       performs I/O itself.
//! - [AsyncResponder](facilitator::AsyncResponder) - Binds a [TransferSession](session::TransferSession)
//!                      to an [Exchange](exchange::Exchange), waits for the peer's init
//!                      message and pumps output events into an application supplied
//!                      [TransferEventHandler](facilitator::TransferEventHandler).
//! - [DiagnosticLogsTransferHandler](diagnostic_logs::DiagnosticLogsTransferHandler) - Concrete
//!                      handler streaming diagnostic log chunks from a
//!                      [LogProvider](diagnostic_logs::LogProvider) to the requesting peer.
//! - [exchange](exchange) - The narrow transport boundary the transfer machinery sends and
//!                      receives through, with an in-process channel implementation and a
//!                      task driver for responders.
//! - [messages](messages) - Encoders and decoders for the transfer message family.
//!
//! Example driving the state machine directly as an initiating sender:
//! ```no_run
//! # use matbdx::session::{OutputEvent, TransferInitData, TransferRole, TransferSession};
//! # use matbdx::messages;
//! # use std::time::Duration;
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! let mut session = TransferSession::new();
//! session.start_transfer(
//!     TransferRole::Sender,
//!     TransferInitData {
//!         control_flags: messages::CONTROL_SENDER_DRIVE,
//!         max_block_size: 512,
//!         start_offset: 0,
//!         max_length: 0,
//!         file_designator: b"test.txt".to_vec(),
//!         metadata: vec![],
//!     },
//!     Duration::from_secs(60),
//! )?;
//! // hand every pending message to the transport
//! while let OutputEvent::MsgToSend { msg, payload } = session.get_next_action(Duration::ZERO) {
//!     println!("send type {:#04x} ({} bytes)", msg.message_type, payload.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The demos directory contains a complete loopback example wiring a
//! diagnostic log responder to an initiator over an in-process exchange.
//!
//!
#![doc = include_str!("../readme.md")]

pub mod diagnostic_logs;
pub mod exchange;
pub mod facilitator;
pub mod messages;
pub mod session;
