//! UDP front-end.

use crate::config::EngineConfig;
use crate::datagram::DatagramWorker;
use crate::engine::Engine;
use crate::handle::DatagramHandle;

use cqnet_core::addr;
use cqnet_core::error::Result;
use cqnet_core::handler::DatagramHandler;
use cqnet_core::id::ConnId;

use std::net::SocketAddrV4;
use std::sync::Arc;

/// Any number of bound UDP sockets sharing one set of workers.
pub struct DatagramNode {
    engine: Engine,
    handler: Arc<dyn DatagramHandler>,
}

impl DatagramNode {
    pub fn init<H: DatagramHandler>(config: EngineConfig, handler: H) -> Result<Self> {
        let engine = Engine::init(config, "cqnet-dgram")?;
        Ok(Self { engine, handler: Arc::new(handler) })
    }

    pub fn start(&mut self) -> Result<()> {
        let shared = self.engine.shared().clone();
        let handler = self.handler.clone();
        self.engine
            .start(move |i, stop| {
                DatagramWorker::new(i, shared.clone(), handler.clone()).run(stop)
            })?;
        Ok(())
    }

    /// Bind a socket at `bind_ip:port` and start receiving on it. Port 0
    /// picks a free port; the bound port is returned with the id.
    pub fn create(&self, bind_ip: &str, port: u16) -> Result<(ConnId, u16)> {
        let at = addr::socket_addr(bind_ip, port)?;
        self.engine.shared().open_datagram(at)
    }

    /// Send one datagram of at most one buffer from `id` to `dest`.
    pub fn send_to(&self, id: ConnId, data: &[u8], dest: SocketAddrV4) -> Result<()> {
        self.engine.shared().send_to(id, data, dest)
    }

    pub fn local_addr(&self, id: ConnId) -> Result<SocketAddrV4> {
        self.engine.shared().local_addr(id)
    }

    pub fn close_socket(&self, id: ConnId) {
        self.engine.shared().close(id);
    }

    pub fn handle(&self) -> DatagramHandle {
        DatagramHandle::new(self.engine.shared().clone())
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
