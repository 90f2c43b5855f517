//! Messages exchanged between a [`WorkerEngine`](crate::worker::WorkerEngine) and its worker thread.
//!
//! Commands travel on a plain mpsc channel. Results are split in two paths: `Ready` and
//! `MatchResult` are guaranteed and ordered, while frames go through a single latest-wins slot so
//! a slow reader never makes the worker queue up stale frames.

use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, TryRecvError},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::match_runner::{MatchConfig, MatchResult};
use crate::simulation::{FrameState, Move, Side};

#[derive(Debug, Clone)]
pub enum Command {
    Move { side: Side, direction: Move },
    PlayMatch { config: MatchConfig },
    Stop,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Ready,
    Frame(FrameState),
    MatchResult(Box<MatchResult>),
}

type FrameSlot = Arc<Mutex<Option<FrameState>>>;

/// Worker side of the result path.
#[derive(Clone)]
pub struct ResultSender {
    guaranteed: mpsc::Sender<WorkerEvent>,
    latest_frame: FrameSlot,
}

/// Engine side of the result path.
pub struct ResultReceiver {
    guaranteed: mpsc::Receiver<WorkerEvent>,
    latest_frame: FrameSlot,
}

pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::channel();
    let slot = FrameSlot::default();
    (
        ResultSender {
            guaranteed: tx,
            latest_frame: slot.clone(),
        },
        ResultReceiver {
            guaranteed: rx,
            latest_frame: slot,
        },
    )
}

impl ResultSender {
    /// Sends an event. Frames overwrite any frame not read yet.
    ///
    /// Fails only when the receiving side is gone.
    pub fn send(&self, event: WorkerEvent) -> Result<(), WorkerEvent> {
        match event {
            WorkerEvent::Frame(frame) => {
                *self.latest_frame.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
                Ok(())
            }
            other => self.guaranteed.send(other).map_err(|e| e.0),
        }
    }
}

impl ResultReceiver {
    /// Next guaranteed event if any, else the pending frame if any.
    pub fn try_recv(&self) -> Result<Option<WorkerEvent>, TryRecvError> {
        match self.guaranteed.try_recv() {
            Ok(event) => return Ok(Some(event)),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                // frames written before the worker died are still worth handing out
                return match self.take_frame() {
                    Some(frame) => Ok(Some(WorkerEvent::Frame(frame))),
                    None => Err(TryRecvError::Disconnected),
                };
            }
        }
        Ok(self.take_frame().map(WorkerEvent::Frame))
    }

    /// Blocks on the guaranteed path only.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<WorkerEvent, RecvTimeoutError> {
        self.guaranteed.recv_timeout(timeout)
    }

    /// Discards any frame still sitting in the slot.
    pub fn take_frame(&self) -> Option<FrameState> {
        self.latest_frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}
