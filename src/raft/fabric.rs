use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::{
    PingRequest, PingResponse, PollRequest, PollResponse, RaftError, RaftHandle, RpcEndpoint,
    SyncRequest, SyncResponse,
};

#[derive(Default)]
struct Routes {
    nodes: HashMap<String, RaftHandle>,
    /// Nodes which can neither send nor receive.
    isolated: BTreeSet<String>,
    /// Severed links, stored in both directions.
    cut: BTreeSet<(String, String)>,
    /// Per-message delay range in milliseconds; `(0, 0)` delivers at once.
    delay: (u64, u64),
}

/// In-process network connecting [`RaftHandle`]s, with fault injection.
///
/// Cloning shares the same routing table.
#[derive(Clone, Default)]
pub struct LocalFabric {
    routes: Arc<Mutex<Routes>>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// An endpoint sending on behalf of `address`.
    pub fn endpoint(&self, address: &str) -> LocalEndpoint {
        LocalEndpoint {
            fabric: self.clone(),
            from: address.to_string(),
        }
    }

    pub fn register(&self, handle: RaftHandle) {
        self.routes()
            .nodes
            .insert(handle.address().to_string(), handle);
    }

    pub fn unregister(&self, address: &str) -> Option<RaftHandle> {
        self.routes().nodes.remove(address)
    }

    pub fn isolate(&self, address: &str) {
        self.routes().isolated.insert(address.to_string());
    }

    pub fn restore(&self, address: &str) {
        self.routes().isolated.remove(address);
    }

    pub fn is_isolated(&self, address: &str) -> bool {
        self.routes().isolated.contains(address)
    }

    pub fn cut(&self, a: &str, b: &str) {
        let mut routes = self.routes();
        routes.cut.insert((a.to_string(), b.to_string()));
        routes.cut.insert((b.to_string(), a.to_string()));
    }

    /// Restores every isolated node and severed link.
    pub fn heal(&self) {
        let mut routes = self.routes();
        routes.isolated.clear();
        routes.cut.clear();
    }

    /// Delays every message by a random amount in `[min_ms, max_ms]`.
    pub fn set_delay(&self, min_ms: u64, max_ms: u64) {
        self.routes().delay = (min_ms.min(max_ms), max_ms.max(min_ms));
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(routes: &Routes, from: &str, to: &str) -> bool {
        !routes.isolated.contains(from)
            && !routes.isolated.contains(to)
            && !routes.cut.contains(&(from.to_string(), to.to_string()))
    }

    fn route(&self, from: &str, to: &str) -> Result<(RaftHandle, Duration), RaftError> {
        let routes = self.routes();
        if !Self::connected(&routes, from, to) {
            return Err(RaftError::NetworkError(format!("{from} cannot reach {to}")));
        }
        let handle = routes
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| RaftError::NetworkError(format!("unknown address {to}")))?;

        let (min, max) = routes.delay;
        let delay = if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(min..=max))
        };
        Ok((handle, delay))
    }

    /// Sends one request and carries the reply back, dropping either leg
    /// when the link is down at that moment.
    async fn deliver<T, F, Fut>(&self, from: &str, to: &str, call: F) -> Result<T, RaftError>
    where
        F: FnOnce(RaftHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T, RaftError>>,
    {
        let (handle, delay) = self.route(from, to)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = call(handle).await?;
        if !Self::connected(&self.routes(), from, to) {
            return Err(RaftError::NetworkError(format!("reply from {to} lost")));
        }
        Ok(response)
    }
}

/// [`RpcEndpoint`] backed by a [`LocalFabric`].
#[derive(Clone)]
pub struct LocalEndpoint {
    fabric: LocalFabric,
    from: String,
}

#[async_trait]
impl RpcEndpoint for LocalEndpoint {
    async fn ping(&self, address: &str, request: PingRequest) -> Result<PingResponse, RaftError> {
        self.fabric
            .deliver(&self.from, address, |node| async move { node.ping(request).await })
            .await
    }

    async fn poll(&self, address: &str, request: PollRequest) -> Result<PollResponse, RaftError> {
        self.fabric
            .deliver(&self.from, address, |node| async move { node.poll(request).await })
            .await
    }

    async fn sync(&self, address: &str, request: SyncRequest) -> Result<SyncResponse, RaftError> {
        self.fabric
            .deliver(&self.from, address, |node| async move { node.sync(request).await })
            .await
    }
}
