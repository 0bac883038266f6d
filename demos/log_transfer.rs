//! Loopback demo: a diagnostic log responder and an initiator pulling the
//! log, connected by an in-process exchange.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use matbdx::diagnostic_logs::{
    CommandResponder, DiagnosticLogsTransferHandler, LogChunk, LogIntent, LogProvider,
    LogSessionHandle, LogStatus,
};
use matbdx::exchange::{exchange_pair, run_responder, Exchange};
use matbdx::facilitator::AsyncResponder;
use matbdx::messages::CONTROL_SENDER_DRIVE;
use matbdx::session::{OutputEvent, TransferInitData, TransferRole, TransferSession};

struct DemoLogProvider {
    chunks: Vec<Vec<u8>>,
    position: usize,
}

impl LogProvider for DemoLogProvider {
    fn start_log_collection(&mut self, intent: LogIntent) -> Result<LogSessionHandle> {
        log::info!("opening log collection for {:?}", intent);
        Ok(1)
    }

    fn next_chunk(&mut self, _session: LogSessionHandle, max_size: usize) -> Result<LogChunk> {
        let data = self.chunks.get(self.position).cloned().unwrap_or_default();
        anyhow::ensure!(data.len() <= max_size, "chunk does not fit a block");
        self.position += 1;
        Ok(LogChunk {
            is_eof: self.position >= self.chunks.len(),
            data,
        })
    }

    fn end_log_collection(&mut self, _session: LogSessionHandle) {
        log::info!("log collection finished");
    }
}

struct DemoCommand;

impl CommandResponder for DemoCommand {
    fn respond(&mut self, status: LogStatus) {
        println!("log request answered with {:?}", status);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let exchange_id: u16 = rand::random();
    let (mut initiator_end, responder_end) = exchange_pair(exchange_id);

    let provider = DemoLogProvider {
        chunks: vec![
            b"2026-08-08 10:00:01 boot complete\n".to_vec(),
            b"2026-08-08 10:00:05 network up\n".to_vec(),
            b"2026-08-08 10:02:11 commissioning window closed\n".to_vec(),
        ],
        position: 0,
    };
    let handler = DiagnosticLogsTransferHandler::new(
        Box::new(provider),
        Box::new(DemoCommand),
        LogIntent::EndUserSupport,
    );
    let timeout_handle = responder_end.exchange.timeout_handle();
    let mut responder = AsyncResponder::new(Box::new(handler));
    responder.init(
        Box::new(responder_end.exchange),
        TransferRole::Sender,
        CONTROL_SENDER_DRIVE,
        512,
        Duration::from_secs(5),
    )?;
    let cancel = CancellationToken::new();
    let responder_task = tokio::spawn(run_responder(
        responder,
        exchange_id,
        responder_end.incoming,
        timeout_handle,
        cancel.clone(),
    ));

    // initiator: pull the log with a plain transfer session
    let mut session = TransferSession::new();
    session.start_transfer(
        TransferRole::Receiver,
        TransferInitData {
            control_flags: CONTROL_SENDER_DRIVE,
            max_block_size: 512,
            start_offset: 0,
            max_length: 0,
            file_designator: b"end_user_support".to_vec(),
            metadata: vec![],
        },
        Duration::from_secs(5),
    )?;

    let epoch = Instant::now();
    let mut collected = Vec::new();
    'transfer: loop {
        loop {
            match session.get_next_action(epoch.elapsed()) {
                OutputEvent::None => break,
                OutputEvent::MsgToSend { msg, payload } => {
                    initiator_end.exchange.send_message(msg, payload, true)?
                }
                OutputEvent::BlockReceived(block) => {
                    collected.extend(&block.data);
                    session.prepare_block_ack()?;
                }
                OutputEvent::AckEofReceived => break 'transfer,
                OutputEvent::StatusReceived(code) => {
                    anyhow::bail!("transfer ended with status {}", code)
                }
                other => log::debug!("initiator event {:?}", other.kind()),
            }
        }
        let message = tokio::time::timeout(Duration::from_secs(5), initiator_end.incoming.recv())
            .await
            .context("timed out waiting for the responder")?
            .context("responder went away")?;
        session.handle_message_received(message.msg, &message.payload, epoch.elapsed())?;
    }

    responder_task.await?;
    println!("received {} bytes of log data:", collected.len());
    print!("{}", String::from_utf8_lossy(&collected));
    Ok(())
}
