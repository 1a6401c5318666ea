//! Execution listener fan-out.
//!
//! Each registered listener gets its own unbounded queue and a task that
//! drains it, so a slow listener delays only itself and never the chain
//! that produced the event.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::InternalLogEntry;

/// Observer of executions. All methods default to doing nothing.
pub trait ExecutionListener: Send + Sync + 'static {
    fn on_execution_started(&self, _action_title: &str) {}

    fn on_execution_finished(&self, _entry: &InternalLogEntry) {}

    fn on_output_chunk(&self, _chunk: &[u8], _tracking_id: &str) {}

    fn on_action_map_rebuilt(&self) {}
}

/// Events delivered to listeners
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started { action_title: String },
    Finished { entry: Box<InternalLogEntry> },
    OutputChunk { chunk: Vec<u8>, tracking_id: String },
    ActionMapRebuilt,
}

impl ExecutionEvent {
    fn dispatch(&self, listener: &dyn ExecutionListener) {
        match self {
            Self::Started { action_title } => listener.on_execution_started(action_title),
            Self::Finished { entry } => listener.on_execution_finished(entry),
            Self::OutputChunk { chunk, tracking_id } => listener.on_output_chunk(chunk, tracking_id),
            Self::ActionMapRebuilt => listener.on_action_map_rebuilt(),
        }
    }
}

/// Registered listeners
#[derive(Default)]
pub struct ListenerHub {
    senders: RwLock<Vec<mpsc::UnboundedSender<ExecutionEvent>>>,
}

impl ListenerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Must be called from within a Tokio runtime.
    pub fn add(&self, listener: Arc<dyn ExecutionListener>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                event.dispatch(listener.as_ref());
            }
            debug!("Listener queue closed");
        });

        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
    }

    /// Deliver an event to every listener without waiting on any of them
    pub fn notify(&self, event: ExecutionEvent) {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        for sender in senders.iter() {
            // A closed queue means the listener task is gone; nothing to do
            let _ = sender.send(event.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.senders.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
