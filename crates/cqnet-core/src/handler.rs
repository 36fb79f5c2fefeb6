//! User callbacks.
//!
//! Callbacks run synchronously on worker threads and should return
//! quickly; a slow callback stalls one worker. No engine lock is held
//! while they run, so a callback may send or close through a front-end
//! handle. Received data is only borrowed for the duration of the call.
//!
//! State the callbacks need is captured by the handler value itself,
//! either a type implementing the trait or closures via
//! [`StreamCallbacks`].

use crate::id::ConnId;
use std::net::SocketAddrV4;
use std::sync::Arc;

pub trait StreamHandler: Send + Sync + 'static {
    /// A server accepted `id`. Delivered before any `on_received` for it.
    fn on_connected(&self, _id: ConnId) {}

    /// One completed receive. Calls for one connection never overlap and
    /// arrive in stream order.
    fn on_received(&self, id: ConnId, data: &[u8]);

    /// The engine detected that `id` left the active state (peer close,
    /// error, failed probe). At most once per id; not delivered for
    /// connections the application closed itself.
    fn on_disconnected(&self, _id: ConnId) {}
}

pub trait DatagramHandler: Send + Sync + 'static {
    fn on_received_from(&self, id: ConnId, data: &[u8], from: SocketAddrV4);
}

impl<T: StreamHandler> StreamHandler for Arc<T> {
    fn on_connected(&self, id: ConnId) {
        (**self).on_connected(id)
    }
    fn on_received(&self, id: ConnId, data: &[u8]) {
        (**self).on_received(id, data)
    }
    fn on_disconnected(&self, id: ConnId) {
        (**self).on_disconnected(id)
    }
}

impl<F> DatagramHandler for F
where
    F: Fn(ConnId, &[u8], SocketAddrV4) + Send + Sync + 'static,
{
    fn on_received_from(&self, id: ConnId, data: &[u8], from: SocketAddrV4) {
        self(id, data, from)
    }
}

type IdFn = Box<dyn Fn(ConnId) + Send + Sync>;
type DataFn = Box<dyn Fn(ConnId, &[u8]) + Send + Sync>;

/// Closure-based [`StreamHandler`].
///
/// ```ignore
/// let handler = StreamCallbacks::new(|id, data| println!("{}: {:?}", id, data))
///     .with_disconnected(|id| println!("{} gone", id));
/// ```
pub struct StreamCallbacks {
    connected: Option<IdFn>,
    received: DataFn,
    disconnected: Option<IdFn>,
}

impl StreamCallbacks {
    pub fn new<F>(on_received: F) -> Self
    where
        F: Fn(ConnId, &[u8]) + Send + Sync + 'static,
    {
        Self { connected: None, received: Box::new(on_received), disconnected: None }
    }

    pub fn with_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnId) + Send + Sync + 'static,
    {
        self.connected = Some(Box::new(f));
        self
    }

    pub fn with_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnId) + Send + Sync + 'static,
    {
        self.disconnected = Some(Box::new(f));
        self
    }
}

impl StreamHandler for StreamCallbacks {
    fn on_connected(&self, id: ConnId) {
        if let Some(f) = &self.connected {
            f(id)
        }
    }
    fn on_received(&self, id: ConnId, data: &[u8]) {
        (self.received)(id, data)
    }
    fn on_disconnected(&self, id: ConnId) {
        if let Some(f) = &self.disconnected {
            f(id)
        }
    }
}
