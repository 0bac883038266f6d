//! Exchange abstraction the transfer machinery sends and receives through.
//!
//! The facilitator only needs a narrow surface: send a tagged message, arm
//! a response timeout, release the exchange. [ChannelExchange] is an
//! in-process implementation over tokio channels used to connect a
//! responder to an initiator, and [run_responder] drives a responder from
//! its incoming message stream on the event loop.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::facilitator::AsyncResponder;
use crate::messages::MessageTypeData;

/// One message crossing an exchange.
#[derive(Debug)]
pub struct TransferMessage {
    pub msg: MessageTypeData,
    pub payload: Vec<u8>,
}

/// Reliable message channel a transfer runs on. The exchange may be closed
/// by the transport at any time; senders have to cope with that.
pub trait Exchange: Send {
    fn id(&self) -> u16;

    fn send_message(
        &mut self,
        msg: MessageTypeData,
        payload: Vec<u8>,
        expect_response: bool,
    ) -> Result<()>;

    fn set_response_timeout(&mut self, timeout: Duration);

    /// Release the exchange. Nothing can be sent afterwards.
    fn close(&mut self);
}

/// In-process exchange endpoint backed by an unbounded channel to the peer.
pub struct ChannelExchange {
    id: u16,
    peer: Option<mpsc::UnboundedSender<TransferMessage>>,
    response_timeout: Arc<Mutex<Option<Duration>>>,
}

impl ChannelExchange {
    /// Shared view of the armed response timeout, read by [run_responder].
    pub fn timeout_handle(&self) -> Arc<Mutex<Option<Duration>>> {
        self.response_timeout.clone()
    }
}

impl Exchange for ChannelExchange {
    fn id(&self) -> u16 {
        self.id
    }

    fn send_message(
        &mut self,
        msg: MessageTypeData,
        payload: Vec<u8>,
        _expect_response: bool,
    ) -> Result<()> {
        let peer = self.peer.as_ref().context("exchange already closed")?;
        peer.send(TransferMessage { msg, payload })
            .map_err(|_| anyhow::anyhow!("peer end of the exchange is gone"))
    }

    fn set_response_timeout(&mut self, timeout: Duration) {
        *self.response_timeout.lock().unwrap() = Some(timeout);
    }

    fn close(&mut self) {
        self.peer = None;
    }
}

/// One side of an in-process exchange: the sending half plus the stream of
/// messages the peer sends here.
pub struct ExchangeEnd {
    pub exchange: ChannelExchange,
    pub incoming: mpsc::UnboundedReceiver<TransferMessage>,
}

/// Create both ends of an in-process exchange sharing one exchange id.
pub fn exchange_pair(id: u16) -> (ExchangeEnd, ExchangeEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let timeout_a = Arc::new(Mutex::new(None));
    let timeout_b = Arc::new(Mutex::new(None));
    (
        ExchangeEnd {
            exchange: ChannelExchange {
                id,
                peer: Some(b_tx),
                response_timeout: timeout_a,
            },
            incoming: a_rx,
        },
        ExchangeEnd {
            exchange: ChannelExchange {
                id,
                peer: Some(a_tx),
                response_timeout: timeout_b,
            },
            incoming: b_rx,
        },
    )
}

/// Drive a responder from its incoming message stream until the transfer
/// ends. A quiet period longer than the armed response timeout is turned
/// into [AsyncResponder::on_response_timeout]; a vanished peer tears the
/// transfer down the same way. While no response timeout is armed (nothing
/// was sent yet) the task waits for the init until cancelled.
pub async fn run_responder(
    mut responder: AsyncResponder,
    exchange_id: u16,
    mut incoming: mpsc::UnboundedReceiver<TransferMessage>,
    response_timeout: Arc<Mutex<Option<Duration>>>,
    cancel: CancellationToken,
) {
    let epoch = Instant::now();
    while !responder.is_destroyed() {
        // a received message answers the pending response; sending the
        // reaction re-arms the window
        let window = response_timeout.lock().unwrap().take();
        let received = match window {
            Some(window) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = tokio::time::timeout(window, incoming.recv()) => match received {
                        Ok(received) => received,
                        Err(_) => {
                            responder.on_response_timeout();
                            continue;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = incoming.recv() => received,
                }
            }
        };
        match received {
            Some(message) => {
                if let Err(e) = responder.on_message_received(
                    exchange_id,
                    message.msg,
                    &message.payload,
                    epoch.elapsed(),
                ) {
                    log::debug!("responder rejected message: {:?}", e);
                }
            }
            None => {
                log::debug!("exchange torn down by the peer");
                responder.on_response_timeout();
                break;
            }
        }
    }
}
