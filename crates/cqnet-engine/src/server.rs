//! TCP server front-end.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::handle::StreamHandle;
use crate::stream::StreamWorker;

use cqnet_core::addr;
use cqnet_core::error::{NetError, Result};
use cqnet_core::handler::StreamHandler;
use cqnet_core::id::ConnId;
use cqnet_core::kerror;

use std::net::SocketAddrV4;
use std::sync::Arc;

/// Accepts TCP connections on one listening socket and delivers their
/// traffic to a [`StreamHandler`].
///
/// ```ignore
/// let mut server = StreamServer::init(EngineConfig::from_env(), handler, "*", 8080)?;
/// server.start()?;
/// // ...
/// server.deinit();
/// ```
pub struct StreamServer {
    engine: Engine,
    handler: Arc<dyn StreamHandler>,
    listener: ConnId,
    local: SocketAddrV4,
}

impl StreamServer {
    /// Open the completion queue and pools and start listening on
    /// `listen_ip:port` (`"*"` for all interfaces, port 0 for any).
    /// Connections are only accepted after [`start`](Self::start).
    pub fn init<H: StreamHandler>(
        config: EngineConfig,
        handler: H,
        listen_ip: &str,
        port: u16,
    ) -> Result<Self> {
        let at = addr::socket_addr(listen_ip, port)?;
        let engine = Engine::init(config, "cqnet-stream")?;
        let listener = engine.shared().open_listener(at)?;
        let local = listener.local_addr().unwrap_or(at);
        Ok(Self {
            listener: listener.id(),
            engine,
            handler: Arc::new(handler),
            local,
        })
    }

    /// Launch the workers and post the first accept. Calling it again
    /// while running does nothing. If the accept cannot be posted the
    /// workers are stopped again and the server is left stopped.
    pub fn start(&mut self) -> Result<()> {
        let shared = self.engine.shared().clone();
        let handler = self.handler.clone();
        let started = self
            .engine
            .start(move |i, stop| {
                StreamWorker::new(i, shared.clone(), handler.clone()).run(stop)
            })?;
        if started {
            if let Err(e) = self.post_first_accept() {
                kerror!("listener {}: first accept failed: {}", self.listener, e);
                self.engine.stop();
                return Err(e);
            }
        }
        Ok(())
    }

    fn post_first_accept(&self) -> Result<()> {
        let shared = self.engine.shared();
        let listener = shared
            .conns
            .lookup(self.listener)
            .ok_or(NetError::NotFound(self.listener))?;
        shared.post_accept(&listener)
    }

    /// Address the listener is bound to, with the OS-assigned port.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn send(&self, id: ConnId, data: &[u8]) -> Result<()> {
        self.engine.shared().send(id, data)
    }

    /// Close `id`. No `on_disconnected` follows; unknown ids are ignored.
    pub fn close_socket(&self, id: ConnId) {
        self.engine.shared().close(id);
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle::new(self.engine.shared().clone())
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Stop workers and close every connection, the listener included.
    pub fn stop(&mut self) {
        self.engine.stop();
    }

    /// Stop if needed and release the queue and pools.
    pub fn deinit(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqnet_core::handler::StreamCallbacks;
    use cqnet_module::Backend;

    #[test]
    fn test_start_without_listener_rolls_back() {
        let config = EngineConfig::new().num_workers(1).backend(Backend::Epoll);
        let mut server =
            StreamServer::init(config, StreamCallbacks::new(|_, _| {}), "127.0.0.1", 0).unwrap();
        server.close_socket(server.listener);

        assert!(matches!(server.start(), Err(NetError::NotFound(id)) if id == server.listener));
        assert!(!server.is_running());
        assert!(!server.handle().is_running());
        // A failed start is final, like stop.
        assert!(matches!(server.start(), Err(NetError::Unsupported(_))));
        server.deinit();
    }
}
