//! Relay fabric plumbing
//!
//! The packet queue carrying transfers from a reader to its paired writer,
//! the proxy-end handle relay tasks read from or write to, and the task
//! handle that folds a spawned thread together with its stop token.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use common::StopToken;
use model::{DeviceProxy, Endpoint, HostProxy, ProxyError, Transfer};

/// Capacity of each per-endpoint packet queue and injection inbox
pub const QUEUE_CAPACITY: usize = 256;

/// How long a reader blocks on its source proxy before re-checking its stop
/// token
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Sleep between polls when a queue is momentarily empty or full
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Write end of a packet queue
pub type PacketSender = Sender<Transfer>;
/// Read end of a packet queue
pub type PacketReceiver = Receiver<Transfer>;

/// Create one endpoint's packet queue
///
/// The reader owns the write end and the writer the read end; closing either
/// end wakes the other side, which is how teardown interrupts blocked queue
/// operations.
pub fn packet_queue() -> (PacketSender, PacketReceiver) {
    bounded(QUEUE_CAPACITY)
}

/// The proxy side a relay task talks to
///
/// IN relays read from the device proxy and write to the host proxy; OUT
/// relays (and EP0) do the opposite.
#[derive(Clone)]
pub enum ProxyEnd {
    /// The device-facing proxy
    Device(Arc<dyn DeviceProxy>),
    /// The host-facing proxy
    Host(Arc<dyn HostProxy>),
}

impl ProxyEnd {
    /// Pull the next transfer pending on `endpoint`
    pub fn read(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Transfer, ProxyError> {
        match self {
            ProxyEnd::Device(proxy) => proxy.read(endpoint, timeout),
            ProxyEnd::Host(proxy) => proxy.read(endpoint, timeout),
        }
    }

    /// Push one transfer out through this side
    pub fn write(&self, transfer: &Transfer) -> Result<(), ProxyError> {
        match self {
            ProxyEnd::Device(proxy) => proxy.write(transfer),
            ProxyEnd::Host(proxy) => proxy.write(transfer),
        }
    }

    /// Side name for log lines
    pub fn label(&self) -> &'static str {
        match self {
            ProxyEnd::Device(_) => "device",
            ProxyEnd::Host(_) => "host",
        }
    }
}

/// A spawned relay task: the thread and its stop token as one object
pub struct TaskHandle {
    stop: StopToken,
    thread: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Wrap a freshly spawned task
    pub fn new(stop: StopToken, thread: JoinHandle<()>) -> Self {
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Ask the task to exit at its next blocking boundary. Idempotent.
    pub fn please_stop(&self) {
        self.stop.please_stop();
    }

    /// Whether the task has been asked to stop or stopped itself
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Wait for the task to exit
    ///
    /// A task tearing down the fabric from inside its own loop must not
    /// join itself; the stop flag is already raised, so the thread is
    /// detached instead.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = thread.join();
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.please_stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_queue_close_wakes_receiver() {
        let (tx, rx) = packet_queue();
        tx.send_blocking(Transfer::new(0x81, vec![1])).unwrap();
        tx.close();

        // The queued transfer drains, then the closed end surfaces.
        assert!(rx.recv_blocking().is_ok());
        assert!(rx.recv_blocking().is_err());
    }

    #[test]
    fn test_task_handle_joins_on_drop() {
        let stop = StopToken::new();
        let task_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            while !task_stop.is_stopped() {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        drop(TaskHandle::new(stop.clone(), thread));
        assert!(stop.is_stopped());
    }
}
