//! Shared server state and tokio-side sink adapters.
//!
//! The engine crates know nothing about tokio: subscribers register sink
//! trait objects, and these adapters bridge them onto bounded tokio
//! channels. A full channel reports `NotWritable` (the subscriber misses
//! that update); a closed one reports `Closed` and gets unregistered on the
//! next emit attempt.

use gazed_core::SessionRegistry;
use gazed_core::rules::FeedbackCommand;
use gazed_core::session::{CommandSink, SinkError, Snapshot, SnapshotSink};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

pub struct MpscSnapshotSink(pub mpsc::Sender<Snapshot>);

impl SnapshotSink for MpscSnapshotSink {
    fn try_push(&self, snapshot: &Snapshot) -> Result<(), SinkError> {
        match self.0.try_send(snapshot.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::NotWritable),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

pub struct MpscCommandSink(pub mpsc::Sender<FeedbackCommand>);

impl CommandSink for MpscCommandSink {
    fn try_push(&self, command: &FeedbackCommand) -> Result<(), SinkError> {
        match self.0.try_send(command.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::NotWritable),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}
