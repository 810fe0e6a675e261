//! Relay reader task
//!
//! One reader runs per populated endpoint slot. It pulls transfers from its
//! source proxy one at a time and hands them, owned, to the paired writer
//! through the slot's packet queue. Reads block for at most
//! [`READ_TIMEOUT`](crate::fabric::READ_TIMEOUT) so the stop token is
//! observed promptly.

use std::sync::Arc;
use std::thread;

use async_channel::TrySendError;
use common::StopToken;
use model::{Endpoint, Transfer};
use tracing::{debug, warn};

use crate::fabric::{PacketSender, ProxyEnd, POLL_INTERVAL, READ_TIMEOUT};

/// Reads transfers from one proxy endpoint and publishes them to the slot's
/// queue
pub struct RelayReader {
    endpoint: Arc<Endpoint>,
    source: ProxyEnd,
    queue: PacketSender,
    stop: StopToken,
}

impl RelayReader {
    pub fn new(
        endpoint: Arc<Endpoint>,
        source: ProxyEnd,
        queue: PacketSender,
        stop: StopToken,
    ) -> Self {
        Self {
            endpoint,
            source,
            queue,
            stop,
        }
    }

    /// Run the read loop until stopped or an unrecoverable error
    ///
    /// On exit the queue's write end is closed so the paired writer drains
    /// whatever is left and exits. Unrecoverable read errors also raise the
    /// reader's own stop flag, which is how the manager can observe that the
    /// task died rather than being stopped.
    pub fn run(self) {
        let address = self.endpoint.address();
        debug!(
            "relay reader for endpoint {:#04x} ({} side) started",
            address,
            self.source.label()
        );

        loop {
            if self.stop.is_stopped() {
                break;
            }
            match self.source.read(&self.endpoint, READ_TIMEOUT) {
                Ok(transfer) => {
                    if !self.forward(transfer) {
                        break;
                    }
                }
                Err(err) if err.is_recoverable() => continue,
                Err(err) => {
                    warn!("read error on endpoint {:#04x}: {}", address, err);
                    self.stop.please_stop();
                    break;
                }
            }
        }

        self.queue.close();
        debug!("relay reader for endpoint {:#04x} stopped", address);
    }

    fn forward(&self, transfer: Transfer) -> bool {
        let mut transfer = transfer;
        loop {
            match self.queue.try_send(transfer) {
                Ok(()) => return true,
                Err(TrySendError::Full(returned)) => {
                    if self.stop.is_stopped() {
                        return false;
                    }
                    transfer = returned;
                    thread::sleep(POLL_INTERVAL);
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::packet_queue;
    use crate::testing::{endpoint, MockDeviceProxy};

    #[test]
    fn test_reader_forwards_in_order_and_closes_queue() {
        let proxy = Arc::new(MockDeviceProxy::default_device());
        let ep = Arc::new(endpoint(0x81, 0x02));
        for seq in 0u8..4 {
            proxy.push_read(0x81, Transfer::new(0x81, vec![seq]));
        }

        let (tx, rx) = packet_queue();
        let stop = StopToken::new();
        let reader = RelayReader::new(
            ep,
            ProxyEnd::Device(proxy.clone()),
            tx,
            stop.clone(),
        );
        let handle = std::thread::spawn(move || reader.run());

        for seq in 0u8..4 {
            let transfer = rx.recv_blocking().unwrap();
            assert_eq!(transfer.data, vec![seq]);
        }

        stop.please_stop();
        handle.join().unwrap();
        // Queue closed on exit: the writer side sees the channel end.
        assert!(rx.recv_blocking().is_err());
    }

    #[test]
    fn test_reader_raises_stop_flag_on_fatal_error() {
        let proxy = Arc::new(MockDeviceProxy::default_device());
        proxy.fail_reads_on(0x81);
        let ep = Arc::new(endpoint(0x81, 0x02));

        let (tx, _rx) = packet_queue();
        let stop = StopToken::new();
        let reader = RelayReader::new(ep, ProxyEnd::Device(proxy), tx, stop.clone());
        let handle = std::thread::spawn(move || reader.run());

        handle.join().unwrap();
        assert!(stop.is_stopped());
    }
}
