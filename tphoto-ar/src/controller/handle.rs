//! UI-side handle on a running controller
//!
//! Commands are queued and applied by the render loop at the start of its
//! next frame; state and events are observed without touching the loop.

use crate::error::{Error, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tphoto_common::events::{ControllerEvent, StateSnapshot};

/// UI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    RefreshScan,
    Pause,
    Resume,
    Background,
    Foreground,
    Release,
}

/// Cloneable command/observation endpoint
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControllerCommand>,
    state: watch::Receiver<StateSnapshot>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<ControllerCommand>,
        state: watch::Receiver<StateSnapshot>,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            commands,
            state,
            events,
        }
    }

    /// Queue a command; fails once the controller is gone
    pub fn send(&self, command: ControllerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::InvalidState("controller no longer running".to_string()))
    }

    pub fn refresh_scan(&self) -> Result<()> {
        self.send(ControllerCommand::RefreshScan)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ControllerCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ControllerCommand::Resume)
    }

    pub fn background(&self) -> Result<()> {
        self.send(ControllerCommand::Background)
    }

    pub fn foreground(&self) -> Result<()> {
        self.send(ControllerCommand::Foreground)
    }

    pub fn release(&self) -> Result<()> {
        self.send(ControllerCommand::Release)
    }

    /// Latest published state
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.borrow().clone()
    }

    /// Observable state stream
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.state.clone()
    }

    /// Subscribe to controller events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }
}
