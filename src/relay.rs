use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::copy::CopyMode;
use crate::session::{SessionStater, StreamKey};
use crate::stream::FlowStream;

type CloseAction = Box<dyn FnOnce() + Send>;

/// Close action that runs at most once
///
/// Concurrent callers serialize on the mutex; the first runs the action and
/// the rest return once it has completed.
pub struct CloseOnce {
    action: Mutex<Option<CloseAction>>,
}

impl CloseOnce {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Run the close action if nobody has yet
    ///
    /// Returns `true` for the call that actually ran it.
    pub fn close(&self) -> bool {
        let mut action = self.action.lock().unwrap_or_else(PoisonError::into_inner);
        match action.take() {
            Some(close) => {
                close();
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for CloseOnce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseOnce")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Which way bytes move through a relay direction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// local -> remote
    Uplink,
    /// remote -> local
    Downlink,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Uplink => Direction::Downlink,
            Direction::Downlink => Direction::Uplink,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => f.write_str("uplink"),
            Direction::Downlink => f.write_str("downlink"),
        }
    }
}

/// Relay bytes between `local` and `remote` until either direction ends
///
/// Each direction runs in its own task, reading one stream and writing the
/// other. A half-open flow where only one peer stopped sending is torn down
/// rather than waited on.
///
/// On return both streams have been closed and the session registered under
/// `key`, if any, has been removed. Returns the direction that finished first.
pub async fn relay<L, R>(
    local: L,
    remote: R,
    key: StreamKey,
    sessions: Option<Arc<dyn SessionStater>>,
    copier: CopyMode,
) -> Direction
where
    L: FlowStream,
    R: FlowStream,
{
    let (local_rd, local_wr) = tokio::io::split(local);
    let (remote_rd, remote_wr) = tokio::io::split(remote);

    let shutdown = CancellationToken::new();
    let close = Arc::new(CloseOnce::new({
        let shutdown = shutdown.clone();
        move || {
            trace!("Flow {} closing both ends", key);
            shutdown.cancel();
        }
    }));

    let mut uplink = tokio::spawn(run_direction(
        Direction::Uplink,
        key,
        local_rd,
        remote_wr,
        copier,
        shutdown.clone(),
        Arc::clone(&close),
    ));
    let mut downlink = tokio::spawn(run_direction(
        Direction::Downlink,
        key,
        remote_rd,
        local_wr,
        copier,
        shutdown.clone(),
        Arc::clone(&close),
    ));

    let first = tokio::select! {
        res = &mut uplink => { log_join(key, Direction::Uplink, res); Direction::Uplink }
        res = &mut downlink => { log_join(key, Direction::Downlink, res); Direction::Downlink }
    };

    // The first direction may have ended cleanly without closing
    close.close();

    let remaining = match first {
        Direction::Uplink => downlink,
        Direction::Downlink => uplink,
    };
    // Cancelled directions exit at once, dropping their stream halves
    log_join(key, first.opposite(), remaining.await);

    if let Some(sessions) = sessions {
        sessions.remove_session(key);
    }

    first
}

fn log_join(key: StreamKey, direction: Direction, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        warn!("Flow {} {} task failed: {}", key, direction, e);
    }
}

async fn run_direction<L, R>(
    direction: Direction,
    key: StreamKey,
    mut src: ReadHalf<L>,
    mut dst: WriteHalf<R>,
    copier: CopyMode,
    shutdown: CancellationToken,
    close: Arc<CloseOnce>,
)
where
    L: FlowStream,
    R: FlowStream,
{
    let outcome = tokio::select! {
        _ = shutdown.cancelled() => None,
        res = copier.copy(&mut src, &mut dst, &shutdown) => Some(res),
    };

    match outcome {
        None => trace!("Flow {} {} stopped by shutdown", key, direction),
        Some((n, Ok(()))) => {
            debug!("Flow {} {} finished after {} bytes", key, direction, n);
        }
        Some((n, Err(e))) => {
            debug!("Flow {} {} failed after {} bytes: {}", key, direction, n, e);
            if e.is_fatal() {
                close.close();
            }
        }
    }
}
