//! Cloneable front-end handles.
//!
//! A handle shares the engine core without owning the worker threads, so
//! it can be moved into callbacks or other threads to send and close.
//! Once the owning front-end stops, every call reports `NotStarted`.

use crate::engine::Shared;

use cqnet_core::error::Result;
use cqnet_core::id::ConnId;

use std::net::SocketAddrV4;
use std::sync::Arc;

#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn send(&self, id: ConnId, data: &[u8]) -> Result<()> {
        self.shared.send(id, data)
    }

    /// Close `id` without an `on_disconnected` callback.
    pub fn close_socket(&self, id: ConnId) {
        self.shared.close(id);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

#[derive(Clone)]
pub struct DatagramHandle {
    shared: Arc<Shared>,
}

impl DatagramHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn send_to(&self, id: ConnId, data: &[u8], dest: SocketAddrV4) -> Result<()> {
        self.shared.send_to(id, data, dest)
    }

    pub fn close_socket(&self, id: ConnId) {
        self.shared.close(id);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").field("running", &self.is_running()).finish()
    }
}

impl std::fmt::Debug for DatagramHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramHandle").field("running", &self.is_running()).finish()
    }
}
