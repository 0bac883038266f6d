//! Glue between a [TransferSession] and an exchange.
//!
//! [AsyncTransferFacilitator] pumps the session's output events: messages go
//! straight to the exchange, everything else is handed to the application's
//! [TransferEventHandler]. The handler finishes each event - immediately or
//! later from the same event loop - with exactly one `notify_event_handled`
//! call. A transfer ends in exactly one of two ways: the terminal
//! acknowledgement event, or an error/timeout/abort; every one of those
//! paths converges on a single teardown that releases the exchange and
//! invokes the handler's `destroy_self` hook once.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::exchange::Exchange;
use crate::messages::{MessageTypeData, StatusCode};
use crate::session::{
    OutputEvent, SessionError, TransferAcceptData, TransferRole, TransferSession,
};

/// Application side of a transfer. Implementations receive every
/// non-message output event and own whatever data source or sink the
/// transfer moves bytes for.
pub trait TransferEventHandler: Send {
    /// Handle one output event. Must complete the event with exactly one
    /// `notify_event_handled` - either on `control` before returning, or
    /// later through [AsyncResponder::notify_event_handled] if the work
    /// finishes asynchronously.
    fn handle_transfer_session_output(
        &mut self,
        control: &mut ResponderControl<'_>,
        event: OutputEvent,
    );

    /// Release application resources held for the transfer. Called exactly
    /// once, whatever ended the transfer.
    fn destroy_self(&mut self);
}

/// View of the transfer handed to the application while it handles an
/// output event (and, for deferred completions, on demand via
/// [AsyncResponder::control]).
pub struct ResponderControl<'a> {
    transfer: &'a mut TransferSession,
    destroy_after_processing: &'a mut bool,
}

impl ResponderControl<'_> {
    pub fn accept_transfer(&mut self, accept: TransferAcceptData) -> Result<(), SessionError> {
        self.transfer.accept_transfer(accept)
    }

    pub fn prepare_block(&mut self, data: Vec<u8>, is_eof: bool) -> Result<(), SessionError> {
        self.transfer.prepare_block(data, is_eof)
    }

    pub fn prepare_block_ack(&mut self) -> Result<(), SessionError> {
        self.transfer.prepare_block_ack()
    }

    pub fn abort_transfer(&mut self, code: StatusCode) {
        self.transfer.abort_transfer(code)
    }

    pub fn max_block_size(&self) -> u16 {
        self.transfer.max_block_size()
    }

    pub fn file_designator(&self) -> &[u8] {
        self.transfer.file_designator()
    }

    /// Complete one output event. Terminal events arm the deferred
    /// teardown; an error status aborts the transfer so the peer gets a
    /// status report instead of silence. The surrounding event pump picks
    /// up anything this queues.
    pub fn notify_event_handled(&mut self, event: &OutputEvent, status: Result<()>) {
        apply_event_handled(self.transfer, self.destroy_after_processing, event, status);
    }
}

fn apply_event_handled(
    transfer: &mut TransferSession,
    destroy_after_processing: &mut bool,
    event: &OutputEvent,
    status: Result<()>,
) {
    if event.kind().is_terminal() {
        *destroy_after_processing = true;
    }
    if let Err(e) = status {
        log::debug!(
            "application could not handle {:?}: {:?}",
            event.kind(),
            e
        );
        transfer.abort_transfer(status_code_for_error(&e));
    }
}

/// Map an application/engine error onto the status code reported to the peer.
pub fn status_code_for_error(error: &anyhow::Error) -> StatusCode {
    match error.downcast_ref::<SessionError>() {
        Some(session_error) => session_error.status_code(),
        None => StatusCode::Unknown,
    }
}

/// Owns one exchange and one [TransferSession] and keeps them in step for
/// the lifetime of a single transfer.
pub struct AsyncTransferFacilitator {
    transfer: TransferSession,
    exchange: Option<Box<dyn Exchange>>,
    handler: Option<Box<dyn TransferEventHandler>>,
    timeout: Duration,
    processing_output_events: bool,
    destroy_after_processing: bool,
    destroyed: bool,
}

impl AsyncTransferFacilitator {
    pub fn new(handler: Box<dyn TransferEventHandler>) -> Self {
        Self {
            transfer: TransferSession::new(),
            exchange: None,
            handler: Some(handler),
            timeout: Duration::ZERO,
            processing_output_events: false,
            destroy_after_processing: false,
            destroyed: false,
        }
    }

    /// Take ownership of the exchange the transfer runs on.
    pub fn init(&mut self, exchange: Box<dyn Exchange>, timeout: Duration) -> Result<()> {
        if self.exchange.is_some() || self.destroyed {
            anyhow::bail!("transfer facilitator already initialized");
        }
        self.exchange = Some(exchange);
        self.timeout = timeout;
        Ok(())
    }

    /// Feed a message delivered on `exchange_id`. A session error is turned
    /// into an abort carrying the matching status code; the output events -
    /// including that abort's status report - are always drained before
    /// returning.
    pub fn on_message_received(
        &mut self,
        exchange_id: u16,
        msg: MessageTypeData,
        payload: &[u8],
        now: Duration,
    ) -> Result<()> {
        let own_id = match &self.exchange {
            Some(exchange) => exchange.id(),
            None => anyhow::bail!("no exchange grabbed"),
        };
        if own_id != exchange_id {
            anyhow::bail!(
                "message from exchange {} does not belong here (own exchange {})",
                exchange_id,
                own_id
            );
        }
        let result = self.transfer.handle_message_received(msg, payload, now);
        if let Err(e) = &result {
            log::warn!("transfer engine rejected message: {:?}", e);
            self.transfer.abort_transfer(e.status_code());
        }
        self.process_output_events(now);
        result.map_err(Into::into)
    }

    /// The peer went silent. Nothing can be sent any more - local teardown
    /// only.
    pub fn on_response_timeout(&mut self) {
        log::debug!("no response from peer within {:?}", self.timeout);
        self.destroy_self();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn transfer(&self) -> &TransferSession {
        &self.transfer
    }

    /// Drain the session's output events. Re-entrant calls return
    /// immediately; the active drain picks up newly queued events itself.
    pub(crate) fn process_output_events(&mut self, now: Duration) {
        if self.processing_output_events || self.destroyed {
            return;
        }
        self.processing_output_events = true;
        loop {
            let event = self.transfer.get_next_action(now);
            match event {
                OutputEvent::None => break,
                OutputEvent::MsgToSend { msg, payload } => {
                    let status_report = msg.is_status_report();
                    if let Err(e) = self.send_message(msg, payload) {
                        log::debug!("can't send transfer message: {:?}", e);
                        self.destroy_self();
                        return;
                    }
                    if status_report {
                        // nothing more will happen on this exchange
                        self.destroy_self();
                        return;
                    }
                }
                event => {
                    log::trace!("dispatching {:?}", event.kind());
                    let mut handler = match self.handler.take() {
                        Some(handler) => handler,
                        None => break,
                    };
                    let mut control = ResponderControl {
                        transfer: &mut self.transfer,
                        destroy_after_processing: &mut self.destroy_after_processing,
                    };
                    handler.handle_transfer_session_output(&mut control, event);
                    self.handler = Some(handler);
                }
            }
        }
        self.processing_output_events = false;
        if self.destroy_after_processing {
            self.destroy_self();
        }
    }

    fn send_message(&mut self, msg: MessageTypeData, payload: Vec<u8>) -> Result<()> {
        let exchange = self.exchange.as_mut().context("exchange is gone")?;
        exchange.set_response_timeout(self.timeout);
        // every transfer message except a status report expects an answer
        exchange.send_message(msg, payload, !msg.is_status_report())
    }

    fn destroy_self(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(mut exchange) = self.exchange.take() {
            exchange.close();
        }
        if let Some(mut handler) = self.handler.take() {
            handler.destroy_self();
        }
    }
}

/// Facilitator configured to wait for the peer's init message, plus the
/// completion surface handlers use to finish events they deferred.
pub struct AsyncResponder {
    facilitator: AsyncTransferFacilitator,
}

impl AsyncResponder {
    pub fn new(handler: Box<dyn TransferEventHandler>) -> Self {
        Self {
            facilitator: AsyncTransferFacilitator::new(handler),
        }
    }

    pub fn init(
        &mut self,
        exchange: Box<dyn Exchange>,
        role: TransferRole,
        control_flags: u8,
        max_block_size: u16,
        timeout: Duration,
    ) -> Result<()> {
        self.facilitator.init(exchange, timeout)?;
        self.facilitator
            .transfer
            .wait_for_transfer(role, control_flags, max_block_size, timeout)?;
        Ok(())
    }

    pub fn on_message_received(
        &mut self,
        exchange_id: u16,
        msg: MessageTypeData,
        payload: &[u8],
        now: Duration,
    ) -> Result<()> {
        self.facilitator
            .on_message_received(exchange_id, msg, payload, now)
    }

    pub fn on_response_timeout(&mut self) {
        self.facilitator.on_response_timeout()
    }

    /// Session access for completions that happen outside an event
    /// dispatch, e.g. staging a block once a data source became ready.
    pub fn control(&mut self) -> ResponderControl<'_> {
        ResponderControl {
            transfer: &mut self.facilitator.transfer,
            destroy_after_processing: &mut self.facilitator.destroy_after_processing,
        }
    }

    /// Deferred counterpart of [ResponderControl::notify_event_handled]:
    /// applies the completion and resumes the event pump.
    pub fn notify_event_handled(
        &mut self,
        event: &OutputEvent,
        status: Result<()>,
        now: Duration,
    ) {
        apply_event_handled(
            &mut self.facilitator.transfer,
            &mut self.facilitator.destroy_after_processing,
            event,
            status,
        );
        self.facilitator.process_output_events(now);
    }

    pub fn is_destroyed(&self) -> bool {
        self.facilitator.is_destroyed()
    }

    pub fn transfer(&self) -> &TransferSession {
        self.facilitator.transfer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        Block, CounterMessage, StatusCode, StatusReportInfo, TransferInit, CONTROL_SENDER_DRIVE,
        PROTOCOL_VERSION,
    };
    use crate::session::ControlMode;
    use std::sync::{Arc, Mutex};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const EXCHANGE_ID: u16 = 0x1234;

    fn now() -> Duration {
        Duration::from_millis(50)
    }

    #[derive(Default)]
    struct ExchangeLog {
        sent: Vec<(MessageTypeData, Vec<u8>)>,
        closed: u32,
    }

    struct ScriptedExchange {
        id: u16,
        log: Arc<Mutex<ExchangeLog>>,
        fail_sends: bool,
    }

    impl ScriptedExchange {
        fn new(id: u16) -> (Self, Arc<Mutex<ExchangeLog>>) {
            let log = Arc::new(Mutex::new(ExchangeLog::default()));
            (
                Self {
                    id,
                    log: log.clone(),
                    fail_sends: false,
                },
                log,
            )
        }
    }

    impl Exchange for ScriptedExchange {
        fn id(&self) -> u16 {
            self.id
        }

        fn send_message(
            &mut self,
            msg: MessageTypeData,
            payload: Vec<u8>,
            _expect_response: bool,
        ) -> Result<()> {
            if self.fail_sends {
                anyhow::bail!("link is down");
            }
            self.log.lock().unwrap().sent.push((msg, payload));
            Ok(())
        }

        fn set_response_timeout(&mut self, _timeout: Duration) {}

        fn close(&mut self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    #[derive(Default)]
    struct HandlerLog {
        events: Vec<crate::session::OutputEventKind>,
        received: Vec<u8>,
        destroyed: u32,
        parked: Option<OutputEvent>,
    }

    /// Receiving-side handler: accepts the init, acknowledges each block.
    struct ReceiveHandler {
        log: Arc<Mutex<HandlerLog>>,
        fail_on_block: Option<u32>,
        park_eof_block: bool,
    }

    impl ReceiveHandler {
        fn new() -> (Self, Arc<Mutex<HandlerLog>>) {
            let log = Arc::new(Mutex::new(HandlerLog::default()));
            (
                Self {
                    log: log.clone(),
                    fail_on_block: None,
                    park_eof_block: false,
                },
                log,
            )
        }
    }

    impl TransferEventHandler for ReceiveHandler {
        fn handle_transfer_session_output(
            &mut self,
            control: &mut ResponderControl<'_>,
            event: OutputEvent,
        ) {
            self.log.lock().unwrap().events.push(event.kind());
            match &event {
                OutputEvent::InitReceived(_) => {
                    let max_block_size = control.max_block_size();
                    control
                        .accept_transfer(TransferAcceptData {
                            control_mode: ControlMode::SenderDrive,
                            max_block_size,
                            length: 0,
                            metadata: vec![],
                        })
                        .unwrap();
                    control.notify_event_handled(&event, Ok(()));
                }
                OutputEvent::BlockReceived(block) => {
                    if self.fail_on_block == Some(block.block_counter) {
                        control
                            .notify_event_handled(&event, Err(SessionError::IncorrectState.into()));
                        return;
                    }
                    self.log.lock().unwrap().received.extend(&block.data);
                    if block.is_eof && self.park_eof_block {
                        // completion happens later from the event loop
                        self.park_eof_block = false;
                        self.log.lock().unwrap().parked = Some(event);
                        return;
                    }
                    control.prepare_block_ack().unwrap();
                    control.notify_event_handled(&event, Ok(()));
                }
                _ => control.notify_event_handled(&event, Ok(())),
            }
        }

        fn destroy_self(&mut self) {
            self.log.lock().unwrap().destroyed += 1;
        }
    }

    fn waiting_responder(
        handler: ReceiveHandler,
        exchange: ScriptedExchange,
    ) -> AsyncResponder {
        let mut responder = AsyncResponder::new(Box::new(handler));
        responder
            .init(
                Box::new(exchange),
                TransferRole::Receiver,
                CONTROL_SENDER_DRIVE,
                512,
                TIMEOUT,
            )
            .unwrap();
        responder
    }

    fn send_init() -> Vec<u8> {
        TransferInit {
            proposed_control: PROTOCOL_VERSION | CONTROL_SENDER_DRIVE,
            max_block_size: 512,
            start_offset: 0,
            max_length: 0,
            file_designator: b"test.txt".to_vec(),
            metadata: vec![],
        }
        .encode()
        .unwrap()
    }

    fn block(counter: u32, data: &[u8]) -> Vec<u8> {
        Block {
            block_counter: counter,
            data: data.to_vec(),
        }
        .encode()
        .unwrap()
    }

    fn feed(responder: &mut AsyncResponder, message_type: u8, payload: &[u8]) -> Result<()> {
        responder.on_message_received(
            EXCHANGE_ID,
            MessageTypeData::bdx(message_type),
            payload,
            now(),
        )
    }

    #[test]
    fn test_happy_path_destroys_once() {
        let (handler, handler_log) = ReceiveHandler::new();
        let (exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        let mut responder = waiting_responder(handler, exchange);

        feed(&mut responder, MessageTypeData::MSG_TYPE_SEND_INIT, &send_init()).unwrap();
        feed(&mut responder, MessageTypeData::MSG_TYPE_BLOCK, &block(0, &[1, 2, 3, 4, 5])).unwrap();
        feed(&mut responder, MessageTypeData::MSG_TYPE_BLOCK_EOF, &block(1, &[6, 7])).unwrap();

        let exchange_log = exchange_log.lock().unwrap();
        let types: Vec<u8> = exchange_log.sent.iter().map(|(m, _)| m.message_type).collect();
        assert_eq!(
            types,
            vec![
                MessageTypeData::MSG_TYPE_SEND_ACCEPT,
                MessageTypeData::MSG_TYPE_BLOCK_ACK,
                MessageTypeData::MSG_TYPE_BLOCK_ACK_EOF,
            ]
        );
        assert_eq!(exchange_log.closed, 1);

        let handler_log = handler_log.lock().unwrap();
        assert_eq!(handler_log.received, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(handler_log.destroyed, 1);
        assert!(responder.is_destroyed());
    }

    #[test]
    fn test_bad_counter_aborts_with_status_report() {
        let (handler, handler_log) = ReceiveHandler::new();
        let (exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        let mut responder = waiting_responder(handler, exchange);

        feed(&mut responder, MessageTypeData::MSG_TYPE_SEND_INIT, &send_init()).unwrap();
        let err = feed(&mut responder, MessageTypeData::MSG_TYPE_BLOCK, &block(10, &[1]));
        assert!(err.is_err());

        let exchange_log = exchange_log.lock().unwrap();
        let (last_msg, last_payload) = exchange_log.sent.last().unwrap();
        assert!(last_msg.is_status_report());
        let report = StatusReportInfo::decode(last_payload).unwrap();
        assert_eq!(report.status_code(), StatusCode::BadBlockCounter);
        assert_eq!(handler_log.lock().unwrap().destroyed, 1);
        assert!(responder.is_destroyed());
    }

    #[test]
    fn test_handler_failure_aborts_without_ack() {
        let (mut handler, _handler_log) = ReceiveHandler::new();
        handler.fail_on_block = Some(0);
        let (exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        let mut responder = waiting_responder(handler, exchange);

        feed(&mut responder, MessageTypeData::MSG_TYPE_SEND_INIT, &send_init()).unwrap();
        feed(&mut responder, MessageTypeData::MSG_TYPE_BLOCK, &block(0, &[1])).unwrap();

        let exchange_log = exchange_log.lock().unwrap();
        let types: Vec<u8> = exchange_log.sent.iter().map(|(m, _)| m.message_type).collect();
        assert_eq!(
            types,
            vec![
                MessageTypeData::MSG_TYPE_SEND_ACCEPT,
                MessageTypeData::MSG_TYPE_STATUS_REPORT,
            ]
        );
        let report = StatusReportInfo::decode(&exchange_log.sent.last().unwrap().1).unwrap();
        assert_eq!(report.status_code(), StatusCode::UnexpectedMessage);
        assert!(responder.is_destroyed());
    }

    #[test]
    fn test_foreign_exchange_rejected() {
        let (handler, handler_log) = ReceiveHandler::new();
        let (exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        let mut responder = waiting_responder(handler, exchange);

        let err = responder.on_message_received(
            EXCHANGE_ID + 1,
            MessageTypeData::bdx(MessageTypeData::MSG_TYPE_SEND_INIT),
            &send_init(),
            now(),
        );
        assert!(err.is_err());
        assert!(exchange_log.lock().unwrap().sent.is_empty());
        assert_eq!(handler_log.lock().unwrap().destroyed, 0);
        assert!(!responder.is_destroyed());
    }

    #[test]
    fn test_send_failure_destroys() {
        let (handler, handler_log) = ReceiveHandler::new();
        let (mut exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        exchange.fail_sends = true;
        let mut responder = waiting_responder(handler, exchange);

        feed(&mut responder, MessageTypeData::MSG_TYPE_SEND_INIT, &send_init()).unwrap();
        assert!(responder.is_destroyed());
        assert_eq!(handler_log.lock().unwrap().destroyed, 1);
        assert!(exchange_log.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_response_timeout_destroys_once() {
        let (handler, handler_log) = ReceiveHandler::new();
        let (exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        let mut responder = waiting_responder(handler, exchange);

        responder.on_response_timeout();
        responder.on_response_timeout();
        assert_eq!(handler_log.lock().unwrap().destroyed, 1);
        assert_eq!(exchange_log.lock().unwrap().closed, 1);
        assert!(responder.is_destroyed());
    }

    #[test]
    fn test_deferred_completion() {
        let (mut handler, handler_log) = ReceiveHandler::new();
        handler.park_eof_block = true;
        let (exchange, exchange_log) = ScriptedExchange::new(EXCHANGE_ID);
        let mut responder = waiting_responder(handler, exchange);

        feed(&mut responder, MessageTypeData::MSG_TYPE_SEND_INIT, &send_init()).unwrap();
        feed(&mut responder, MessageTypeData::MSG_TYPE_BLOCK_EOF, &block(0, &[42])).unwrap();
        // event parked in the handler - transfer still alive
        assert!(!responder.is_destroyed());

        let parked = handler_log.lock().unwrap().parked.take().unwrap();
        responder.control().prepare_block_ack().unwrap();
        responder.notify_event_handled(&parked, Ok(()), now());

        let exchange_log = exchange_log.lock().unwrap();
        assert_eq!(
            exchange_log.sent.last().unwrap().0.message_type,
            MessageTypeData::MSG_TYPE_BLOCK_ACK_EOF
        );
        assert_eq!(
            CounterMessage::decode(&exchange_log.sent.last().unwrap().1)
                .unwrap()
                .block_counter,
            0
        );
        assert_eq!(handler_log.lock().unwrap().destroyed, 1);
        assert!(responder.is_destroyed());
    }
}
