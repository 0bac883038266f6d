//! Responder that streams diagnostic log chunks to a peer.
//!
//! The device side of a log retrieval: the triggering cluster command
//! created an exchange and a [CommandResponder] for its reply, the peer
//! then pulls the named log over that exchange with a ReceiveInit. This
//! handler bridges the transfer events to a [LogProvider] - open the log
//! source when the init arrives, push one chunk per acknowledgement, close
//! the source at EOF - and guarantees the triggering command is answered
//! exactly once whatever happens to the transfer.

use anyhow::{Context, Result};

use crate::facilitator::{ResponderControl, TransferEventHandler};
use crate::session::{ControlMode, OutputEvent, SessionError, TransferAcceptData};

pub type LogSessionHandle = u32;

/// Which log the peer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogIntent {
    EndUserSupport = 0,
    NetworkDiagnostics = 1,
    CrashLogs = 2,
}

/// Reply code for the command that triggered the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Success = 0,
    Exhausted = 1,
    NoLogs = 2,
    Busy = 3,
    Denied = 4,
}

/// One chunk pulled from a log source. `is_eof` accompanies the final chunk.
pub struct LogChunk {
    pub data: Vec<u8>,
    pub is_eof: bool,
}

/// Source of log bytes, chunked to fit transfer blocks.
pub trait LogProvider: Send {
    fn start_log_collection(&mut self, intent: LogIntent) -> Result<LogSessionHandle>;

    fn next_chunk(&mut self, session: LogSessionHandle, max_size: usize) -> Result<LogChunk>;

    fn end_log_collection(&mut self, session: LogSessionHandle);
}

/// Reply channel of the command that triggered the transfer.
pub trait CommandResponder: Send {
    fn respond(&mut self, status: LogStatus);
}

/// Transfer event handler wiring a [LogProvider] to an accepted transfer in
/// the sending role.
pub struct DiagnosticLogsTransferHandler {
    provider: Box<dyn LogProvider>,
    command: Option<Box<dyn CommandResponder>>,
    intent: LogIntent,
    log_session: Option<LogSessionHandle>,
}

impl DiagnosticLogsTransferHandler {
    pub fn new(
        provider: Box<dyn LogProvider>,
        command: Box<dyn CommandResponder>,
        intent: LogIntent,
    ) -> Self {
        Self {
            provider,
            command: Some(command),
            intent,
            log_session: None,
        }
    }

    fn respond_once(&mut self, status: LogStatus) {
        if let Some(mut command) = self.command.take() {
            log::debug!("answering log request with {:?}", status);
            command.respond(status);
        }
    }

    fn end_collection(&mut self) {
        if let Some(handle) = self.log_session.take() {
            self.provider.end_log_collection(handle);
        }
    }

    fn handle_init(&mut self, control: &mut ResponderControl<'_>) -> Result<()> {
        let handle = match self.provider.start_log_collection(self.intent) {
            Ok(handle) => handle,
            Err(e) => {
                log::debug!("log source not available: {:?}", e);
                self.respond_once(LogStatus::NoLogs);
                return Err(SessionError::IncorrectState.into());
            }
        };
        self.log_session = Some(handle);
        let max_block_size = control.max_block_size();
        control.accept_transfer(TransferAcceptData {
            control_mode: ControlMode::SenderDrive,
            max_block_size,
            length: 0,
            metadata: vec![],
        })?;
        self.respond_once(LogStatus::Success);
        // sender drive - the first chunk goes out right behind the accept
        self.stage_next_chunk(control)
    }

    fn stage_next_chunk(&mut self, control: &mut ResponderControl<'_>) -> Result<()> {
        let handle = self.log_session.context("no open log session")?;
        let chunk = self
            .provider
            .next_chunk(handle, control.max_block_size() as usize)?;
        if chunk.is_eof {
            self.end_collection();
        }
        control.prepare_block(chunk.data, chunk.is_eof)?;
        Ok(())
    }
}

impl TransferEventHandler for DiagnosticLogsTransferHandler {
    fn handle_transfer_session_output(
        &mut self,
        control: &mut ResponderControl<'_>,
        event: OutputEvent,
    ) {
        let status = match &event {
            OutputEvent::InitReceived(init) => {
                log::debug!(
                    "log transfer requested for {:?}",
                    String::from_utf8_lossy(&init.file_designator)
                );
                self.handle_init(control)
            }
            OutputEvent::AckReceived => self.stage_next_chunk(control),
            OutputEvent::AckEofReceived => {
                log::debug!("log transfer complete");
                Ok(())
            }
            OutputEvent::StatusReceived(code) => {
                log::debug!("peer ended log transfer: {}", code);
                self.end_collection();
                Ok(())
            }
            OutputEvent::TransferTimeout => {
                self.end_collection();
                Ok(())
            }
            OutputEvent::InternalError(e) => {
                log::warn!("transfer engine failed: {:?}", e);
                self.end_collection();
                Ok(())
            }
            // a log responder never receives blocks or accepts
            _ => Err(SessionError::IncorrectState.into()),
        };
        control.notify_event_handled(&event, status);
    }

    fn destroy_self(&mut self) {
        self.end_collection();
        // a transfer torn down before it got going still owes the
        // triggering command an answer
        self.respond_once(LogStatus::Denied);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::facilitator::AsyncResponder;
    use crate::messages::{MessageTypeData, StatusCode, CONTROL_SENDER_DRIVE};
    use crate::session::{TransferInitData, TransferRole, TransferSession};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const EXCHANGE_ID: u16 = 21;

    fn now() -> Duration {
        Duration::from_millis(10)
    }

    #[derive(Default)]
    struct ProviderLog {
        started: u32,
        ended: u32,
    }

    struct ChunkedLogProvider {
        chunks: Vec<Vec<u8>>,
        position: usize,
        fail_start: bool,
        fail_after: Option<usize>,
        log: Arc<Mutex<ProviderLog>>,
    }

    impl ChunkedLogProvider {
        fn new(chunks: Vec<Vec<u8>>) -> (Self, Arc<Mutex<ProviderLog>>) {
            let log = Arc::new(Mutex::new(ProviderLog::default()));
            (
                Self {
                    chunks,
                    position: 0,
                    fail_start: false,
                    fail_after: None,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl LogProvider for ChunkedLogProvider {
        fn start_log_collection(&mut self, _intent: LogIntent) -> Result<LogSessionHandle> {
            if self.fail_start {
                anyhow::bail!("no logs recorded");
            }
            self.log.lock().unwrap().started += 1;
            Ok(1)
        }

        fn next_chunk(&mut self, _session: LogSessionHandle, max_size: usize) -> Result<LogChunk> {
            if self.fail_after == Some(self.position) {
                anyhow::bail!("log storage went away");
            }
            let data = self.chunks.get(self.position).cloned().unwrap_or_default();
            assert!(data.len() <= max_size);
            self.position += 1;
            Ok(LogChunk {
                is_eof: self.position >= self.chunks.len(),
                data,
            })
        }

        fn end_log_collection(&mut self, _session: LogSessionHandle) {
            self.log.lock().unwrap().ended += 1;
        }
    }

    struct RecordingCommand {
        responses: Arc<Mutex<Vec<LogStatus>>>,
    }

    impl CommandResponder for RecordingCommand {
        fn respond(&mut self, status: LogStatus) {
            self.responses.lock().unwrap().push(status);
        }
    }

    struct CapturingExchange {
        outbox: Arc<Mutex<Vec<(MessageTypeData, Vec<u8>)>>>,
    }

    impl Exchange for CapturingExchange {
        fn id(&self) -> u16 {
            EXCHANGE_ID
        }

        fn send_message(
            &mut self,
            msg: MessageTypeData,
            payload: Vec<u8>,
            _expect_response: bool,
        ) -> Result<()> {
            self.outbox.lock().unwrap().push((msg, payload));
            Ok(())
        }

        fn set_response_timeout(&mut self, _timeout: Duration) {}

        fn close(&mut self) {}
    }

    struct Loopback {
        responder: AsyncResponder,
        initiator: TransferSession,
        outbox: Arc<Mutex<Vec<(MessageTypeData, Vec<u8>)>>>,
        responses: Arc<Mutex<Vec<LogStatus>>>,
        received: Vec<u8>,
        initiator_outcome: Option<StatusCode>,
        initiator_complete: bool,
    }

    impl Loopback {
        fn new(provider: ChunkedLogProvider) -> Self {
            let responses = Arc::new(Mutex::new(Vec::new()));
            let handler = DiagnosticLogsTransferHandler::new(
                Box::new(provider),
                Box::new(RecordingCommand {
                    responses: responses.clone(),
                }),
                LogIntent::EndUserSupport,
            );
            let outbox = Arc::new(Mutex::new(Vec::new()));
            let mut responder = AsyncResponder::new(Box::new(handler));
            responder
                .init(
                    Box::new(CapturingExchange {
                        outbox: outbox.clone(),
                    }),
                    TransferRole::Sender,
                    CONTROL_SENDER_DRIVE,
                    512,
                    TIMEOUT,
                )
                .unwrap();

            let mut initiator = TransferSession::new();
            initiator
                .start_transfer(
                    TransferRole::Receiver,
                    TransferInitData {
                        control_flags: CONTROL_SENDER_DRIVE,
                        max_block_size: 512,
                        start_offset: 0,
                        max_length: 0,
                        file_designator: b"end_user_support".to_vec(),
                        metadata: vec![],
                    },
                    TIMEOUT,
                )
                .unwrap();

            Self {
                responder,
                initiator,
                outbox,
                responses,
                received: Vec::new(),
                initiator_outcome: None,
                initiator_complete: false,
            }
        }

        /// Shuttle messages between both sides until neither has anything
        /// left to say.
        fn run(&mut self) {
            loop {
                let mut progressed = false;
                loop {
                    match self.initiator.get_next_action(now()) {
                        crate::session::OutputEvent::None => break,
                        crate::session::OutputEvent::MsgToSend { msg, payload } => {
                            progressed = true;
                            let _ = self.responder.on_message_received(
                                EXCHANGE_ID,
                                msg,
                                &payload,
                                now(),
                            );
                        }
                        crate::session::OutputEvent::BlockReceived(block) => {
                            self.received.extend(&block.data);
                            self.initiator.prepare_block_ack().unwrap();
                        }
                        crate::session::OutputEvent::StatusReceived(code) => {
                            self.initiator_outcome = Some(code);
                        }
                        crate::session::OutputEvent::AckEofReceived => {
                            self.initiator_complete = true;
                        }
                        _ => {}
                    }
                }
                let pending: Vec<_> = self.outbox.lock().unwrap().drain(..).collect();
                for (msg, payload) in pending {
                    progressed = true;
                    self.initiator
                        .handle_message_received(msg, &payload, now())
                        .unwrap();
                }
                if !progressed {
                    break;
                }
            }
        }
    }

    #[test]
    fn test_log_transfer_happy_path() {
        let (provider, provider_log) =
            ChunkedLogProvider::new(vec![vec![1, 2, 3], vec![4, 5], vec![6]]);
        let mut loopback = Loopback::new(provider);
        loopback.run();

        assert_eq!(loopback.received, vec![1, 2, 3, 4, 5, 6]);
        assert!(loopback.initiator_complete);
        assert_eq!(loopback.initiator_outcome, None);
        assert_eq!(
            loopback.responses.lock().unwrap().as_slice(),
            &[LogStatus::Success]
        );
        let provider_log = provider_log.lock().unwrap();
        assert_eq!(provider_log.started, 1);
        assert_eq!(provider_log.ended, 1);
        assert!(loopback.responder.is_destroyed());
    }

    #[test]
    fn test_log_transfer_without_logs_rejected() {
        let (mut provider, provider_log) = ChunkedLogProvider::new(vec![]);
        provider.fail_start = true;
        let mut loopback = Loopback::new(provider);
        loopback.run();

        assert!(loopback.received.is_empty());
        assert_eq!(
            loopback.initiator_outcome,
            Some(StatusCode::UnexpectedMessage)
        );
        assert_eq!(
            loopback.responses.lock().unwrap().as_slice(),
            &[LogStatus::NoLogs]
        );
        assert_eq!(provider_log.lock().unwrap().ended, 0);
        assert!(loopback.responder.is_destroyed());
    }

    #[test]
    fn test_log_source_failure_mid_transfer() {
        let (mut provider, provider_log) =
            ChunkedLogProvider::new(vec![vec![1, 2], vec![3, 4], vec![5]]);
        provider.fail_after = Some(1);
        let mut loopback = Loopback::new(provider);
        loopback.run();

        // first chunk made it, then the source died and the peer was told
        assert_eq!(loopback.received, vec![1, 2]);
        assert_eq!(loopback.initiator_outcome, Some(StatusCode::Unknown));
        assert!(!loopback.initiator_complete);
        // the command was answered exactly once, on the accept
        assert_eq!(
            loopback.responses.lock().unwrap().as_slice(),
            &[LogStatus::Success]
        );
        let provider_log = provider_log.lock().unwrap();
        assert_eq!(provider_log.started, 1);
        assert_eq!(provider_log.ended, 1);
        assert!(loopback.responder.is_destroyed());
    }

    #[test]
    fn test_teardown_before_init_answers_command() {
        let (provider, _provider_log) = ChunkedLogProvider::new(vec![vec![1]]);
        let mut loopback = Loopback::new(provider);
        loopback.responder.on_response_timeout();

        assert_eq!(
            loopback.responses.lock().unwrap().as_slice(),
            &[LogStatus::Denied]
        );
        assert!(loopback.responder.is_destroyed());
    }
}
