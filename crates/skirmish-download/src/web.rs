//! Blocking `ureq` requests driven from worker threads.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;

use crate::http::{RequestId, WebError, WebEvent, WebService};

/// Size of the slices streamed back to the game thread.
const CHUNK_SIZE: usize = 16 * 1024;

/// [`WebService`] running each request on its own thread.
pub struct UreqWebService {
    agent: ureq::Agent,
    next_id: u64,
    events_tx: Sender<WebEvent>,
    events_rx: Receiver<WebEvent>,
    cancel_flags: FxHashMap<RequestId, Arc<AtomicBool>>,
}

impl UreqWebService {
    /// Create a service with the given connect and read timeouts.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            agent,
            next_id: 0,
            events_tx,
            events_rx,
            cancel_flags: FxHashMap::default(),
        }
    }

    /// Number of requests that have neither completed nor been cancelled.
    pub fn pending_count(&self) -> usize {
        self.cancel_flags.len()
    }
}

impl Default for UreqWebService {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

fn fetch(
    agent: &ureq::Agent,
    url: &str,
    id: RequestId,
    cancelled: &AtomicBool,
    events: &Sender<WebEvent>,
) -> Result<(), WebError> {
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(404, _) => WebError::NotFound,
        ureq::Error::Status(code, _) => WebError::Status(code),
        ureq::Error::Transport(transport) => WebError::Transport(transport.to_string()),
    })?;

    let mut reader = response.into_reader();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let n = reader
            .read(&mut buf)
            .map_err(|err| WebError::Transport(err.to_string()))?;
        if n == 0 {
            break;
        }
        let chunk = buf[..n].to_vec();
        if events.send(WebEvent::Data { id, chunk }).is_err() {
            return Ok(());
        }
    }
    let _ = events.send(WebEvent::Finished { id });
    Ok(())
}

impl WebService for UreqWebService {
    fn start_request(&mut self, url: &str) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(id, Arc::clone(&cancelled));

        let agent = self.agent.clone();
        let events = self.events_tx.clone();
        let url = url.to_owned();
        thread::spawn(move || {
            if let Err(error) = fetch(&agent, &url, id, &cancelled, &events) {
                tracing::debug!(%url, %error, "HTTP request failed");
                let _ = events.send(WebEvent::Failed { id, error });
            }
        });
        id
    }

    fn poll(&mut self) -> Option<WebEvent> {
        loop {
            let event = self.events_rx.try_recv().ok()?;
            let id = match &event {
                WebEvent::Data { id, .. }
                | WebEvent::Finished { id }
                | WebEvent::Failed { id, .. } => *id,
            };
            if !self.cancel_flags.contains_key(&id) {
                continue;
            }
            if !matches!(event, WebEvent::Data { .. }) {
                self.cancel_flags.remove(&id);
            }
            return Some(event);
        }
    }

    fn cancel(&mut self, id: RequestId) {
        if let Some(flag) = self.cancel_flags.remove(&id) {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for UreqWebService {
    fn drop(&mut self) {
        for flag in self.cancel_flags.values() {
            flag.store(true, Ordering::Relaxed);
        }
    }
}
