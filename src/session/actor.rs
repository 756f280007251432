use super::{Session, SessionInput};
use crate::error::CallError;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Запускает цикл сессии. Входы обрабатываются строго по одному.
/// `shutdown` прерывает даже незавершённую обработку, после чего сессия
/// выходит из комнаты, а оставшиеся команды получают `CallError::Closed`.
pub fn spawn_session(
    mut session: Session,
    mut rx: mpsc::UnboundedReceiver<SessionInput>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    debug!("Shutdown requested for {}", session.local_id());
                    break;
                }
                input = rx.recv() => {
                    let Some(input) = input else { break };
                    let interrupted = tokio::select! {
                        biased;
                        _ = shutdown.notified() => true,
                        _ = session.handle(input) => false,
                    };
                    if interrupted {
                        debug!("Shutdown interrupted an input in flight");
                        break;
                    }
                }
            }
        }

        session.cleanup().await;
        rx.close();
        while let Ok(input) = rx.try_recv() {
            if let SessionInput::Command(command) = input {
                command.reject(|| CallError::Closed);
            }
        }
        info!("Session {} finished", session.local_id());
    })
}
