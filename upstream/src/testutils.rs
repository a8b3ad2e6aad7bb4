//! In-memory origin server for tests.

use crate::error::TransportError;
use crate::message::{DiscoveryRequest, DiscoveryResponse};
use crate::transport::{Transport, TransportStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

enum OriginEvent {
    Respond(DiscoveryResponse),
    Fail,
}

#[derive(Default)]
struct OriginState {
    streams: Vec<mpsc::UnboundedSender<OriginEvent>>,
    requests: Vec<DiscoveryRequest>,
    opened: usize,
    refuse: bool,
    stall: bool,
}

/// A fake management server implementing [`Transport`].
///
/// Every opened stream is tracked. Responses can be pushed to all streams at once,
/// and streams can be closed or failed to simulate the origin going away. A stream
/// counts as open until the client drops its end.
#[derive(Clone, Default)]
pub struct MockOrigin {
    inner: Arc<Mutex<OriginState>>,
}

impl MockOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `open_stream` fail with a connection error.
    pub fn refuse_streams(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Makes every subsequent `open_stream` hang forever.
    pub fn stall_streams(&self, stall: bool) {
        self.inner.lock().stall = stall;
    }

    /// Number of streams ever opened.
    pub fn streams_opened(&self) -> usize {
        self.inner.lock().opened
    }

    /// Number of streams whose client side is still alive.
    pub fn open_streams(&self) -> usize {
        self.inner
            .lock()
            .streams
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<DiscoveryRequest> {
        self.inner.lock().requests.clone()
    }

    /// Sends `response` on every open stream.
    pub fn push(&self, response: DiscoveryResponse) {
        for stream in &self.inner.lock().streams {
            let _ = stream.send(OriginEvent::Respond(response.clone()));
        }
    }

    /// Sends `response` on the stream opened `index`-th.
    pub fn push_to(&self, index: usize, response: DiscoveryResponse) {
        if let Some(stream) = self.inner.lock().streams.get(index) {
            let _ = stream.send(OriginEvent::Respond(response));
        }
    }

    /// Fails every open stream with a transport error.
    pub fn fail_all(&self) {
        for stream in &self.inner.lock().streams {
            let _ = stream.send(OriginEvent::Fail);
        }
    }

    /// Closes every stream cleanly, as if the origin process went away.
    pub fn close_all(&self) {
        self.inner.lock().streams.clear();
    }

    pub async fn wait_for_requests(&self, count: usize) -> bool {
        self.wait_until(|origin| origin.requests().len() >= count)
            .await
    }

    pub async fn wait_for_streams_opened(&self, count: usize) -> bool {
        self.wait_until(|origin| origin.streams_opened() >= count)
            .await
    }

    pub async fn wait_for_open_streams(&self, count: usize) -> bool {
        self.wait_until(|origin| origin.open_streams() == count)
            .await
    }

    async fn wait_until(&self, condition: impl Fn(&MockOrigin) -> bool) -> bool {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while !condition(self) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Transport for MockOrigin {
    async fn open_stream(
        &self,
        initial: &DiscoveryRequest,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        let (refuse, stall) = {
            let mut state = self.inner.lock();
            state.requests.push(initial.clone());
            (state.refuse, state.stall)
        };

        if refuse {
            return Err(TransportError::Connection("connection refused".into()));
        }
        if stall {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock();
            state.streams.push(tx);
            state.opened += 1;
        }

        Ok(Box::new(MockStream {
            events: rx,
            origin: self.clone(),
        }))
    }
}

struct MockStream {
    events: mpsc::UnboundedReceiver<OriginEvent>,
    origin: MockOrigin,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn send(&mut self, request: &DiscoveryRequest) -> Result<(), TransportError> {
        self.origin.inner.lock().requests.push(request.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<DiscoveryResponse>, TransportError> {
        match self.events.recv().await {
            Some(OriginEvent::Respond(response)) => Ok(Some(response)),
            Some(OriginEvent::Fail) => Err(TransportError::StreamClosed),
            None => Ok(None),
        }
    }
}

/// A response whose nonce is derived from its version.
pub fn response(type_url: &str, version: &str) -> DiscoveryResponse {
    DiscoveryResponse {
        type_url: type_url.to_string(),
        version_info: version.to_string(),
        resources: vec![],
        nonce: format!("nonce-{version}"),
    }
}
