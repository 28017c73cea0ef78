use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ConnectionState, TunnelError};

/// State machine shared by every tunnel implementation.
///
/// The token is cancelled exactly once, when the connection starts closing
/// or a connect attempt fails; every in-flight operation races against it.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Idle as u8),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Idle → Connecting.
    pub(crate) fn begin_connect(&self) -> Result<(), TunnelError> {
        self.state
            .compare_exchange(
                ConnectionState::Idle as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| TunnelError::InvalidState(ConnectionState::from_u8(current)))
    }

    /// Connecting → Connected on success, → Closed on failure. A close that
    /// raced with the handshake wins.
    pub(crate) fn finish_connect<T>(&self, result: Result<T, TunnelError>) -> Result<T, TunnelError> {
        match result {
            Ok(value) => {
                let promoted = self.state.compare_exchange(
                    ConnectionState::Connecting as u8,
                    ConnectionState::Connected as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                match promoted {
                    Ok(_) => Ok(value),
                    Err(_) => Err(TunnelError::Closed),
                }
            }
            Err(err) => {
                self.state.store(ConnectionState::Closed as u8, Ordering::Release);
                self.shutdown.cancel();
                Err(err)
            }
        }
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), TunnelError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(TunnelError::Closed),
            other => Err(TunnelError::InvalidState(other)),
        }
    }

    /// Moves to Closing and cancels the token. Returns `false` when the
    /// connection was already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == ConnectionState::Closing as u8 || current == ConnectionState::Closed as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.shutdown.cancel();
        true
    }

    pub(crate) fn finish_close(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        debug!("tunnel closed");
    }

    /// Runs `fut` unless the connection shuts down first.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Closed),
            res = fut => res,
        }
    }

    /// Like [`Lifecycle::guard`], with a deadline.
    pub(crate) async fn guard_timeout<T, F>(
        &self,
        limit: Duration,
        what: &'static str,
        fut: F,
    ) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        match tokio::time::timeout(limit, self.guard(fut)).await {
            Ok(res) => res,
            Err(_) => Err(TunnelError::Timeout(what)),
        }
    }
}
