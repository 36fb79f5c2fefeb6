//! TCP client front-end.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::handle::StreamHandle;
use crate::stream::StreamWorker;

use cqnet_core::addr;
use cqnet_core::error::Result;
use cqnet_core::handler::StreamHandler;
use cqnet_core::id::ConnId;

use std::sync::Arc;

/// Outgoing TCP connections sharing one set of workers.
///
/// `on_connected` is not called for client connections; `connect`
/// returning the id is the notification.
pub struct StreamClient {
    engine: Engine,
    handler: Arc<dyn StreamHandler>,
}

impl StreamClient {
    pub fn init<H: StreamHandler>(config: EngineConfig, handler: H) -> Result<Self> {
        let engine = Engine::init(config, "cqnet-stream")?;
        Ok(Self { engine, handler: Arc::new(handler) })
    }

    pub fn start(&mut self) -> Result<()> {
        let shared = self.engine.shared().clone();
        let handler = self.handler.clone();
        self.engine
            .start(move |i, stop| StreamWorker::new(i, shared.clone(), handler.clone()).run(stop))?;
        Ok(())
    }

    /// Connect to `ip:port` and start receiving. Blocks until the TCP
    /// handshake finishes or fails.
    pub fn connect(&self, ip: &str, port: u16) -> Result<ConnId> {
        let to = addr::socket_addr(ip, port)?;
        self.engine.shared().open_stream(to)
    }

    pub fn send(&self, id: ConnId, data: &[u8]) -> Result<()> {
        self.engine.shared().send(id, data)
    }

    pub fn close_socket(&self, id: ConnId) {
        self.engine.shared().close(id);
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle::new(self.engine.shared().clone())
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    pub fn deinit(self) {
        drop(self);
    }
}
