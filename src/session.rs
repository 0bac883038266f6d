//! Transfer session state machine.
//!
//! [TransferSession] encodes the bulk data exchange protocol independent of
//! any transport. Incoming protocol messages are fed in through
//! [TransferSession::handle_message_received]; everything the session wants
//! to happen in response is exposed as a queue of [OutputEvent]s drained one
//! at a time with [TransferSession::get_next_action]. The session never
//! performs I/O and never reads a clock - callers thread a monotonic
//! timestamp through the time sensitive entry points, which keeps every
//! timeout decision deterministic and testable.

use std::collections::VecDeque;
use std::time::Duration;

use crate::messages::{self, MessageTypeData, StatusCode};

/// Which side of the transfer this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

/// Negotiated drive mode - which side initiates Block transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    SenderDrive,
    ReceiverDrive,
}

impl ControlMode {
    fn control_bit(&self) -> u8 {
        match self {
            ControlMode::SenderDrive => messages::CONTROL_SENDER_DRIVE,
            ControlMode::ReceiverDrive => messages::CONTROL_RECEIVER_DRIVE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Uninitialized,
    AwaitingInitMsg,
    AwaitingAccept,
    NegotiatingParams,
    TransferInProgress,
    AwaitingEofAck,
    ReceivedEof,
    TransferDone,
    Failed,
}

/// Classified failures of the transfer engine. The facilitator converts
/// these into status report codes for the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("operation not valid in the current transfer state")]
    IncorrectState,
    #[error("malformed message payload")]
    BadMessageContents,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("block counter out of sequence")]
    BadBlockCounter,
    #[error("no transfer control method in common with the peer")]
    TransferMethodNotSupported,
    #[error("peer requires an unsupported protocol version")]
    VersionNotSupported,
    #[error("message type {1:#04x} of protocol {0:#06x} does not belong to a transfer")]
    UnknownMessage(u16, u8),
    #[error("internal transfer engine failure")]
    Internal,
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::IncorrectState => StatusCode::UnexpectedMessage,
            SessionError::BadMessageContents
            | SessionError::InvalidArgument
            | SessionError::UnknownMessage(..) => StatusCode::BadMessageContents,
            SessionError::BadBlockCounter => StatusCode::BadBlockCounter,
            SessionError::TransferMethodNotSupported => StatusCode::TransferMethodNotSupported,
            SessionError::VersionNotSupported => StatusCode::VersionNotSupported,
            SessionError::Internal => StatusCode::Unknown,
        }
    }
}

/// Parameters of an init message, both for starting a transfer actively and
/// for inspecting a received init.
#[derive(Debug, Clone)]
pub struct TransferInitData {
    pub control_flags: u8,
    pub max_block_size: u16,
    pub start_offset: u64,
    pub max_length: u64,
    pub file_designator: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// Parameters of an accept message.
#[derive(Debug, Clone)]
pub struct TransferAcceptData {
    pub control_mode: ControlMode,
    pub max_block_size: u16,
    pub length: u64,
    pub metadata: Vec<u8>,
}

/// One received data block handed to the application.
#[derive(Clone)]
pub struct BlockData {
    pub data: Vec<u8>,
    pub is_eof: bool,
    pub block_counter: u32,
}

impl core::fmt::Debug for BlockData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockData")
            .field("data", &hex::encode(&self.data))
            .field("is_eof", &self.is_eof)
            .field("block_counter", &self.block_counter)
            .finish()
    }
}

/// Pending action produced by the state machine. `None` ends a drain loop;
/// it does not mean the transfer is over.
#[derive(Debug)]
pub enum OutputEvent {
    None,
    MsgToSend {
        msg: MessageTypeData,
        payload: Vec<u8>,
    },
    InitReceived(TransferInitData),
    AcceptReceived(TransferAcceptData),
    BlockReceived(BlockData),
    AckReceived,
    AckEofReceived,
    StatusReceived(StatusCode),
    InternalError(SessionError),
    TransferTimeout,
}

/// Payload-free mirror of [OutputEvent] used for logging and for deciding
/// which events end a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEventKind {
    None,
    MsgToSend,
    InitReceived,
    AcceptReceived,
    BlockReceived,
    AckReceived,
    AckEofReceived,
    StatusReceived,
    InternalError,
    TransferTimeout,
}

impl OutputEvent {
    pub fn kind(&self) -> OutputEventKind {
        match self {
            OutputEvent::None => OutputEventKind::None,
            OutputEvent::MsgToSend { .. } => OutputEventKind::MsgToSend,
            OutputEvent::InitReceived(_) => OutputEventKind::InitReceived,
            OutputEvent::AcceptReceived(_) => OutputEventKind::AcceptReceived,
            OutputEvent::BlockReceived(_) => OutputEventKind::BlockReceived,
            OutputEvent::AckReceived => OutputEventKind::AckReceived,
            OutputEvent::AckEofReceived => OutputEventKind::AckEofReceived,
            OutputEvent::StatusReceived(_) => OutputEventKind::StatusReceived,
            OutputEvent::InternalError(_) => OutputEventKind::InternalError,
            OutputEvent::TransferTimeout => OutputEventKind::TransferTimeout,
        }
    }
}

impl OutputEventKind {
    /// Events after which no further protocol progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputEventKind::AckEofReceived
                | OutputEventKind::StatusReceived
                | OutputEventKind::InternalError
                | OutputEventKind::TransferTimeout
        )
    }
}

/// State machine for exactly one transfer. Reusable for another transfer
/// only after an explicit [TransferSession::reset].
pub struct TransferSession {
    state: TransferState,
    role: TransferRole,
    pending_output: VecDeque<OutputEvent>,
    configured_control_flags: u8,
    control_mode: Option<ControlMode>,
    version: u8,
    max_block_size: u16,
    timeout: Option<Duration>,
    last_activity: Option<Duration>,
    timeout_reported: bool,
    file_designator: Vec<u8>,
    metadata: Vec<u8>,
    bytes_processed: u64,
    /// Receiver: counter expected on the next incoming block.
    /// Sender: counter assigned to the next outgoing block.
    next_block_counter: u32,
    last_block_counter: u32,
    last_block_eof: bool,
    outcome: Option<StatusCode>,
    status_report_sent: bool,
}

impl TransferSession {
    pub fn new() -> Self {
        Self {
            state: TransferState::Uninitialized,
            role: TransferRole::Receiver,
            pending_output: VecDeque::new(),
            configured_control_flags: 0,
            control_mode: None,
            version: messages::PROTOCOL_VERSION,
            max_block_size: 0,
            timeout: None,
            last_activity: None,
            timeout_reported: false,
            file_designator: Vec::new(),
            metadata: Vec::new(),
            bytes_processed: 0,
            next_block_counter: 0,
            last_block_counter: 0,
            last_block_eof: false,
            outcome: None,
            status_report_sent: false,
        }
    }

    /// Configure the session to expect an init from the peer - a SendInit
    /// when playing [TransferRole::Receiver], a ReceiveInit when playing
    /// [TransferRole::Sender].
    pub fn wait_for_transfer(
        &mut self,
        role: TransferRole,
        control_flags: u8,
        max_block_size: u16,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.state != TransferState::Uninitialized {
            return Err(SessionError::IncorrectState);
        }
        if max_block_size == 0 {
            return Err(SessionError::InvalidArgument);
        }
        self.role = role;
        self.configured_control_flags = control_flags;
        self.max_block_size = max_block_size;
        self.timeout = Some(timeout);
        self.state = TransferState::AwaitingInitMsg;
        Ok(())
    }

    /// Actively begin a transfer as the initiating side by queueing a
    /// SendInit ([TransferRole::Sender]) or ReceiveInit
    /// ([TransferRole::Receiver]) for transmission.
    pub fn start_transfer(
        &mut self,
        role: TransferRole,
        init: TransferInitData,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.state != TransferState::Uninitialized {
            return Err(SessionError::IncorrectState);
        }
        if init.max_block_size == 0 {
            return Err(SessionError::InvalidArgument);
        }
        self.role = role;
        self.timeout = Some(timeout);
        self.max_block_size = init.max_block_size;
        self.configured_control_flags = init.control_flags;
        self.file_designator = init.file_designator.clone();
        self.metadata = init.metadata.clone();
        let message_type = match role {
            TransferRole::Sender => MessageTypeData::MSG_TYPE_SEND_INIT,
            TransferRole::Receiver => MessageTypeData::MSG_TYPE_RECEIVE_INIT,
        };
        let wire = messages::TransferInit {
            proposed_control: (init.control_flags & !messages::CONTROL_VERSION_MASK)
                | messages::PROTOCOL_VERSION,
            max_block_size: init.max_block_size,
            start_offset: init.start_offset,
            max_length: init.max_length,
            file_designator: init.file_designator,
            metadata: init.metadata,
        };
        let encoded = wire.encode();
        self.queue_message(MessageTypeData::bdx(message_type), encoded);
        self.state = TransferState::AwaitingAccept;
        Ok(())
    }

    /// Feed one received protocol message into the state machine.
    pub fn handle_message_received(
        &mut self,
        msg: MessageTypeData,
        payload: &[u8],
        now: Duration,
    ) -> Result<(), SessionError> {
        self.last_activity = Some(now);
        log::trace!(
            "transfer message protocol:{:#06x} type:{:#04x} len:{}",
            msg.protocol_id,
            msg.message_type,
            payload.len()
        );
        if msg.is_status_report() {
            return self.handle_status_report(payload);
        }
        if msg.protocol_id != MessageTypeData::PROTOCOL_ID_BDX {
            return Err(SessionError::UnknownMessage(msg.protocol_id, msg.message_type));
        }
        match msg.message_type {
            MessageTypeData::MSG_TYPE_SEND_INIT => self.handle_init(TransferRole::Receiver, payload),
            MessageTypeData::MSG_TYPE_RECEIVE_INIT => self.handle_init(TransferRole::Sender, payload),
            MessageTypeData::MSG_TYPE_SEND_ACCEPT => self.handle_send_accept(payload),
            MessageTypeData::MSG_TYPE_RECEIVE_ACCEPT => self.handle_receive_accept(payload),
            MessageTypeData::MSG_TYPE_BLOCK => self.handle_block(payload, false),
            MessageTypeData::MSG_TYPE_BLOCK_EOF => self.handle_block(payload, true),
            MessageTypeData::MSG_TYPE_BLOCK_QUERY => self.handle_block_query(payload),
            MessageTypeData::MSG_TYPE_BLOCK_ACK => self.handle_block_ack(payload, false),
            MessageTypeData::MSG_TYPE_BLOCK_ACK_EOF => self.handle_block_ack(payload, true),
            other => Err(SessionError::UnknownMessage(msg.protocol_id, other)),
        }
    }

    /// Produce the next pending output event. Also the single place where
    /// the per-transfer idle timeout is turned into a one-shot
    /// [OutputEvent::TransferTimeout].
    pub fn get_next_action(&mut self, now: Duration) -> OutputEvent {
        if let Some(event) = self.pending_output.pop_front() {
            return event;
        }
        if let Some(timeout) = self.timeout {
            if !self.timeout_reported && self.can_time_out() {
                match self.last_activity {
                    Some(last) if now >= last + timeout => {
                        self.timeout_reported = true;
                        self.state = TransferState::Failed;
                        return OutputEvent::TransferTimeout;
                    }
                    // clock starts ticking the first time anyone polls
                    None => self.last_activity = Some(now),
                    _ => {}
                }
            }
        }
        OutputEvent::None
    }

    /// Accept a previously received init. Queues the SendAccept or
    /// ReceiveAccept message matching this session's role.
    pub fn accept_transfer(&mut self, accept: TransferAcceptData) -> Result<(), SessionError> {
        if self.state != TransferState::NegotiatingParams {
            return Err(SessionError::IncorrectState);
        }
        if accept.max_block_size == 0 || accept.max_block_size > self.max_block_size {
            return Err(SessionError::InvalidArgument);
        }
        let control = self.version | accept.control_mode.control_bit();
        let encoded = match self.role {
            TransferRole::Receiver => messages::SendAccept {
                transfer_control: control,
                max_block_size: accept.max_block_size,
                metadata: accept.metadata,
            }
            .encode()
            .map(|payload| (MessageTypeData::MSG_TYPE_SEND_ACCEPT, payload)),
            TransferRole::Sender => messages::ReceiveAccept {
                transfer_control: control,
                max_block_size: accept.max_block_size,
                length: accept.length,
                metadata: accept.metadata,
            }
            .encode()
            .map(|payload| (MessageTypeData::MSG_TYPE_RECEIVE_ACCEPT, payload)),
        };
        self.control_mode = Some(accept.control_mode);
        self.max_block_size = accept.max_block_size;
        match encoded {
            Ok((message_type, payload)) => {
                self.queue_message(MessageTypeData::bdx(message_type), Ok(payload))
            }
            Err(e) => self.queue_message(MessageTypeData::bdx(0), Err(e)),
        }
        self.state = TransferState::TransferInProgress;
        Ok(())
    }

    /// Stage the next outgoing data block. The block counter is assigned
    /// internally and increases monotonically from zero.
    pub fn prepare_block(&mut self, data: Vec<u8>, is_eof: bool) -> Result<(), SessionError> {
        if self.role != TransferRole::Sender || self.state != TransferState::TransferInProgress {
            return Err(SessionError::IncorrectState);
        }
        if data.len() > self.max_block_size as usize {
            return Err(SessionError::InvalidArgument);
        }
        let block_counter = self.next_block_counter;
        self.next_block_counter = self.next_block_counter.wrapping_add(1);
        self.last_block_counter = block_counter;
        self.last_block_eof = is_eof;
        self.bytes_processed += data.len() as u64;
        let message_type = if is_eof {
            MessageTypeData::MSG_TYPE_BLOCK_EOF
        } else {
            MessageTypeData::MSG_TYPE_BLOCK
        };
        let encoded = messages::Block {
            block_counter,
            data,
        }
        .encode();
        self.queue_message(MessageTypeData::bdx(message_type), encoded);
        if is_eof {
            self.state = TransferState::AwaitingEofAck;
        }
        Ok(())
    }

    /// Acknowledge the most recently received block. For an EOF block this
    /// queues the closing BlockAckEOF and, once that acknowledgement is on
    /// its way, the terminal [OutputEvent::AckEofReceived].
    pub fn prepare_block_ack(&mut self) -> Result<(), SessionError> {
        if self.role != TransferRole::Receiver {
            return Err(SessionError::IncorrectState);
        }
        match self.state {
            TransferState::TransferInProgress if self.next_block_counter > 0 => {}
            TransferState::ReceivedEof => {}
            _ => return Err(SessionError::IncorrectState),
        }
        let encoded = messages::CounterMessage {
            block_counter: self.last_block_counter,
        }
        .encode();
        if self.last_block_eof {
            self.queue_message(
                MessageTypeData::bdx(MessageTypeData::MSG_TYPE_BLOCK_ACK_EOF),
                encoded,
            );
            self.pending_output.push_back(OutputEvent::AckEofReceived);
            self.state = TransferState::TransferDone;
        } else {
            self.queue_message(
                MessageTypeData::bdx(MessageTypeData::MSG_TYPE_BLOCK_ACK),
                encoded,
            );
        }
        Ok(())
    }

    /// Force-terminate the transfer. Queues at most one status report no
    /// matter how many times it is called.
    pub fn abort_transfer(&mut self, code: StatusCode) {
        if self.status_report_sent
            || self.state == TransferState::Uninitialized
            || self.state == TransferState::TransferDone
        {
            return;
        }
        log::warn!("aborting transfer with status {}", code);
        self.status_report_sent = true;
        self.outcome = Some(code);
        self.state = TransferState::Failed;
        let encoded = messages::StatusReportInfo::failure(code).encode();
        self.queue_message(MessageTypeData::status_report(), encoded);
    }

    /// Clear all per-transfer state so the object can be configured again.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn max_block_size(&self) -> u16 {
        self.max_block_size
    }

    pub fn file_designator(&self) -> &[u8] {
        &self.file_designator
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Status the transfer ended with, if it was aborted by either side.
    pub fn outcome(&self) -> Option<StatusCode> {
        self.outcome
    }

    fn can_time_out(&self) -> bool {
        !matches!(
            self.state,
            TransferState::Uninitialized | TransferState::TransferDone | TransferState::Failed
        )
    }

    fn queue_message(&mut self, msg: MessageTypeData, encoded: anyhow::Result<Vec<u8>>) {
        match encoded {
            Ok(payload) => self
                .pending_output
                .push_back(OutputEvent::MsgToSend { msg, payload }),
            Err(e) => {
                log::error!("can't encode outgoing transfer message: {:?}", e);
                self.pending_output
                    .push_back(OutputEvent::InternalError(SessionError::Internal));
                self.state = TransferState::Failed;
            }
        }
    }

    fn handle_init(
        &mut self,
        required_role: TransferRole,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        if self.state != TransferState::AwaitingInitMsg || self.role != required_role {
            return Err(SessionError::IncorrectState);
        }
        let init = messages::TransferInit::decode(payload).map_err(|e| {
            log::debug!("can't decode transfer init: {:?}", e);
            SessionError::BadMessageContents
        })?;
        if init.max_block_size == 0 {
            return Err(SessionError::BadMessageContents);
        }
        let proposed_version = init.proposed_control & messages::CONTROL_VERSION_MASK;
        self.version = proposed_version.min(messages::PROTOCOL_VERSION);
        self.control_mode = Some(resolve_control_mode(
            init.proposed_control,
            self.configured_control_flags,
        )?);
        self.max_block_size = self.max_block_size.min(init.max_block_size);
        self.file_designator = init.file_designator.clone();
        self.metadata = init.metadata.clone();
        self.pending_output
            .push_back(OutputEvent::InitReceived(TransferInitData {
                control_flags: init.proposed_control,
                max_block_size: init.max_block_size,
                start_offset: init.start_offset,
                max_length: init.max_length,
                file_designator: init.file_designator,
                metadata: init.metadata,
            }));
        self.state = TransferState::NegotiatingParams;
        Ok(())
    }

    fn handle_send_accept(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if self.state != TransferState::AwaitingAccept || self.role != TransferRole::Sender {
            return Err(SessionError::IncorrectState);
        }
        let accept = messages::SendAccept::decode(payload).map_err(|e| {
            log::debug!("can't decode send accept: {:?}", e);
            SessionError::BadMessageContents
        })?;
        let control_mode = self.accept_params(
            accept.transfer_control,
            accept.max_block_size,
        )?;
        self.pending_output
            .push_back(OutputEvent::AcceptReceived(TransferAcceptData {
                control_mode,
                max_block_size: accept.max_block_size,
                length: 0,
                metadata: accept.metadata,
            }));
        self.state = TransferState::TransferInProgress;
        Ok(())
    }

    fn handle_receive_accept(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if self.state != TransferState::AwaitingAccept || self.role != TransferRole::Receiver {
            return Err(SessionError::IncorrectState);
        }
        let accept = messages::ReceiveAccept::decode(payload).map_err(|e| {
            log::debug!("can't decode receive accept: {:?}", e);
            SessionError::BadMessageContents
        })?;
        let control_mode = self.accept_params(
            accept.transfer_control,
            accept.max_block_size,
        )?;
        self.pending_output
            .push_back(OutputEvent::AcceptReceived(TransferAcceptData {
                control_mode,
                max_block_size: accept.max_block_size,
                length: accept.length,
                metadata: accept.metadata,
            }));
        self.state = TransferState::TransferInProgress;
        Ok(())
    }

    /// Validate the accept parameters chosen by the responder against what
    /// this side proposed in its init.
    fn accept_params(
        &mut self,
        transfer_control: u8,
        max_block_size: u16,
    ) -> Result<ControlMode, SessionError> {
        let version = transfer_control & messages::CONTROL_VERSION_MASK;
        if version > messages::PROTOCOL_VERSION {
            return Err(SessionError::VersionNotSupported);
        }
        self.version = version;
        let control_mode = if (transfer_control & messages::CONTROL_SENDER_DRIVE) != 0 {
            ControlMode::SenderDrive
        } else if (transfer_control & messages::CONTROL_RECEIVER_DRIVE) != 0 {
            ControlMode::ReceiverDrive
        } else {
            return Err(SessionError::BadMessageContents);
        };
        if max_block_size == 0 || max_block_size > self.max_block_size {
            return Err(SessionError::BadMessageContents);
        }
        self.control_mode = Some(control_mode);
        self.max_block_size = max_block_size;
        Ok(control_mode)
    }

    fn handle_block(&mut self, payload: &[u8], is_eof: bool) -> Result<(), SessionError> {
        if self.role != TransferRole::Receiver || self.state != TransferState::TransferInProgress {
            return Err(SessionError::IncorrectState);
        }
        let block = messages::Block::decode(payload).map_err(|e| {
            log::debug!("can't decode block: {:?}", e);
            SessionError::BadMessageContents
        })?;
        if block.block_counter != self.next_block_counter {
            log::debug!(
                "block counter mismatch. expected:{} got:{}",
                self.next_block_counter,
                block.block_counter
            );
            return Err(SessionError::BadBlockCounter);
        }
        if block.data.len() > self.max_block_size as usize {
            return Err(SessionError::BadMessageContents);
        }
        self.next_block_counter = self.next_block_counter.wrapping_add(1);
        self.last_block_counter = block.block_counter;
        self.last_block_eof = is_eof;
        self.bytes_processed += block.data.len() as u64;
        self.pending_output
            .push_back(OutputEvent::BlockReceived(BlockData {
                data: block.data,
                is_eof,
                block_counter: block.block_counter,
            }));
        if is_eof {
            self.state = TransferState::ReceivedEof;
        }
        Ok(())
    }

    fn handle_block_query(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if self.role != TransferRole::Sender
            || self.state != TransferState::TransferInProgress
            || self.control_mode != Some(ControlMode::ReceiverDrive)
        {
            return Err(SessionError::IncorrectState);
        }
        let query = messages::CounterMessage::decode(payload)
            .map_err(|_| SessionError::BadMessageContents)?;
        if query.block_counter != self.next_block_counter {
            return Err(SessionError::BadBlockCounter);
        }
        // peer is ready for the next block
        self.pending_output.push_back(OutputEvent::AckReceived);
        Ok(())
    }

    fn handle_block_ack(&mut self, payload: &[u8], is_eof_ack: bool) -> Result<(), SessionError> {
        if self.role != TransferRole::Sender {
            return Err(SessionError::IncorrectState);
        }
        let expected_state = if is_eof_ack {
            TransferState::AwaitingEofAck
        } else {
            TransferState::TransferInProgress
        };
        if self.state != expected_state || self.next_block_counter == 0 {
            return Err(SessionError::IncorrectState);
        }
        let ack = messages::CounterMessage::decode(payload)
            .map_err(|_| SessionError::BadMessageContents)?;
        if ack.block_counter != self.last_block_counter {
            log::debug!(
                "ack counter mismatch. expected:{} got:{}",
                self.last_block_counter,
                ack.block_counter
            );
            return Err(SessionError::BadBlockCounter);
        }
        if is_eof_ack {
            self.pending_output.push_back(OutputEvent::AckEofReceived);
            self.state = TransferState::TransferDone;
        } else {
            self.pending_output.push_back(OutputEvent::AckReceived);
        }
        Ok(())
    }

    fn handle_status_report(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if self.state == TransferState::Uninitialized {
            return Err(SessionError::IncorrectState);
        }
        let report = messages::StatusReportInfo::decode(payload)
            .map_err(|_| SessionError::BadMessageContents)?;
        log::debug!("peer ended transfer: {}", report);
        let code = report.status_code();
        self.outcome = Some(code);
        self.state = TransferState::Failed;
        self.pending_output
            .push_back(OutputEvent::StatusReceived(code));
        Ok(())
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_control_mode(proposed: u8, configured: u8) -> Result<ControlMode, SessionError> {
    let common = proposed & configured;
    if (common & messages::CONTROL_SENDER_DRIVE) != 0 {
        Ok(ControlMode::SenderDrive)
    } else if (common & messages::CONTROL_RECEIVER_DRIVE) != 0 {
        Ok(ControlMode::ReceiverDrive)
    } else {
        // async drive negotiation is not supported
        Err(SessionError::TransferMethodNotSupported)
    }
}
