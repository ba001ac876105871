use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferEventKind {
    /// The request is about to be made.
    Initiated,
    /// The resource was found and bytes are about to flow.
    Started,
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub resource: String,
    pub total_length: Option<u64>,
    pub transferred: u64,
    pub error: Option<String>,
}

impl TransferEvent {
    fn new(
        kind: TransferEventKind,
        resource: &str,
        total_length: Option<u64>,
        transferred: u64,
    ) -> Self {
        Self {
            kind,
            resource: resource.to_owned(),
            total_length,
            transferred,
            error: None,
        }
    }
}

/// Observer of byte transfers performed by a resource collection.
pub trait TransferListener: Send + Sync {
    fn transfer_progress(&self, event: &TransferEvent);
}

fn same_listener(a: &Arc<dyn TransferListener>, b: &Arc<dyn TransferListener>) -> bool {
    // Data pointers only: vtables of one type can differ between codegen units.
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// The listeners attached to one resource collection.
#[derive(Default)]
pub struct TransferListeners {
    listeners: RwLock<Vec<Arc<dyn TransferListener>>>,
}

impl TransferListeners {
    /// Attaches `listener`, returning `false` if it was already attached.
    pub fn add(&self, listener: Arc<dyn TransferListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|existing| same_listener(existing, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove(&self, listener: &Arc<dyn TransferListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|existing| !same_listener(existing, listener));
        listeners.len() != before
    }

    pub fn contains(&self, listener: &Arc<dyn TransferListener>) -> bool {
        self.listeners
            .read()
            .iter()
            .any(|existing| same_listener(existing, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire(&self, event: &TransferEvent) {
        // Snapshot so listeners may attach/detach from inside a callback.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.transfer_progress(event);
        }
    }

    pub fn initiated(&self, resource: &str) {
        self.fire(&TransferEvent::new(TransferEventKind::Initiated, resource, None, 0));
    }

    pub fn failed(
        &self,
        resource: &str,
        total_length: Option<u64>,
        transferred: u64,
        error: &dyn fmt::Display,
    ) {
        let mut event =
            TransferEvent::new(TransferEventKind::Failed, resource, total_length, transferred);
        event.error = Some(error.to_string());
        self.fire(&event);
    }

    /// Copies `reader` into `writer`, reporting `Started`, `Progress` and
    /// `Completed` (or `Failed`) for `resource` along the way.
    pub fn copy_with_progress(
        &self,
        resource: &str,
        total_length: Option<u64>,
        reader: &mut dyn Read,
        writer: &mut dyn Write,
    ) -> io::Result<u64> {
        self.fire(&TransferEvent::new(
            TransferEventKind::Started,
            resource,
            total_length,
            0,
        ));

        let mut buf = [0u8; 8 * 1024];
        let mut transferred = 0u64;
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.failed(resource, total_length, transferred, &err);
                    return Err(err);
                }
            };
            if let Err(err) = writer.write_all(&buf[..read]) {
                self.failed(resource, total_length, transferred, &err);
                return Err(err);
            }
            transferred += read as u64;
            self.fire(&TransferEvent::new(
                TransferEventKind::Progress,
                resource,
                total_length,
                transferred,
            ));
        }

        self.fire(&TransferEvent::new(
            TransferEventKind::Completed,
            resource,
            total_length,
            transferred,
        ));
        Ok(transferred)
    }
}

impl fmt::Debug for TransferListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferListeners")
            .field("len", &self.len())
            .finish()
    }
}

const PROGRESS_LOG_STEP_BYTES: u64 = 1024 * 1024;

/// Process-wide progress reporter: turns transfer events into `tracing` events.
///
/// Progress is logged at most once per MiB transferred so large downloads
/// don't flood the log.
#[derive(Debug, Default)]
pub struct ProgressLoggingTransferListener {
    last_logged: Mutex<HashMap<String, u64>>,
}

impl ProgressLoggingTransferListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferListener for ProgressLoggingTransferListener {
    fn transfer_progress(&self, event: &TransferEvent) {
        let resource = event.resource.as_str();
        match event.kind {
            TransferEventKind::Initiated => {
                tracing::debug!(target = "nova.deps.transfer", resource, "requesting resource");
            }
            TransferEventKind::Started => {
                self.last_logged.lock().insert(event.resource.clone(), 0);
                tracing::info!(
                    target = "nova.deps.transfer",
                    resource,
                    total_bytes = event.total_length,
                    "download started"
                );
            }
            TransferEventKind::Progress => {
                let mut last_logged = self.last_logged.lock();
                let last = last_logged.entry(event.resource.clone()).or_insert(0);
                if event.transferred >= *last + PROGRESS_LOG_STEP_BYTES {
                    *last = event.transferred;
                    tracing::debug!(
                        target = "nova.deps.transfer",
                        resource,
                        transferred_bytes = event.transferred,
                        total_bytes = event.total_length,
                        "download progress"
                    );
                }
            }
            TransferEventKind::Completed => {
                self.last_logged.lock().remove(resource);
                tracing::info!(
                    target = "nova.deps.transfer",
                    resource,
                    transferred_bytes = event.transferred,
                    "download completed"
                );
            }
            TransferEventKind::Failed => {
                self.last_logged.lock().remove(resource);
                tracing::warn!(
                    target = "nova.deps.transfer",
                    resource,
                    transferred_bytes = event.transferred,
                    error = event.error.as_deref().unwrap_or("unknown error"),
                    "download failed"
                );
            }
        }
    }
}

/// Records every event it sees. Handy for asserting transfer reporting.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingTransferListener {
    events: Mutex<Vec<TransferEvent>>,
}

#[cfg(test)]
impl RecordingTransferListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransferEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: TransferEventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

#[cfg(test)]
impl TransferListener for RecordingTransferListener {
    fn transfer_progress(&self, event: &TransferEvent) {
        self.events.lock().push(event.clone());
    }
}
