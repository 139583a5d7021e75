use crate::frames::OutputBuffer;
use crate::transport::Transport;
use log::{debug, trace, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

/// Background thread that keeps the negotiated heartbeat contract.
///
/// Wakes every half interval. If nothing has been written for at least half
/// the interval it emits a heartbeat frame, so a busy publisher never sends
/// redundant heartbeats. If nothing has been *received* for more than twice
/// the interval the server is presumed dead and the transport is closed,
/// which surfaces to the reader thread as a network failure.
pub(crate) struct HeartbeatSender {
    state: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatSender {
    pub(crate) fn start(transport: Arc<Transport>, interval: Duration) -> HeartbeatSender {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_state = Arc::clone(&state);
        let handle = Builder::new()
            .name("burrow-heartbeat".to_string())
            .spawn(move || run(transport, interval, thread_state))
            .expect("failed to spawn heartbeat thread");
        HeartbeatSender {
            state,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.state;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(transport: Arc<Transport>, interval: Duration, state: Arc<(Mutex<bool>, Condvar)>) {
    let tick = interval / 2;
    debug!("heartbeat thread running (interval = {:?})", interval);
    let (lock, cvar) = &*state;
    let mut stopped = lock.lock().unwrap();
    loop {
        let (guard, _) = cvar.wait_timeout(stopped, tick).unwrap();
        stopped = guard;
        if *stopped || transport.is_closed() {
            trace!("heartbeat thread exiting");
            return;
        }
        if transport.rx_idle() > interval * 2 {
            warn!("missed heartbeats from server - dropping connection");
            transport.close();
            return;
        }
        if transport.tx_idle() >= tick {
            trace!("connection idle - sending heartbeat");
            let mut buf = OutputBuffer::empty();
            buf.push_heartbeat();
            if transport.write(&buf).is_err() {
                // the reader thread sees the same dead socket and owns the
                // failure handling
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockstream::SharedMockStream;
    use std::thread;

    fn transport() -> (Arc<Transport>, SharedMockStream) {
        let stream = SharedMockStream::new();
        let peer = stream.clone();
        let (transport, _reader) = Transport::new(Box::new(stream)).unwrap();
        (Arc::new(transport), peer)
    }

    #[test]
    fn emits_heartbeat_when_idle() {
        let (transport, mut peer) = transport();
        let mut sender =
            HeartbeatSender::start(Arc::clone(&transport), Duration::from_millis(40));
        // stay "alive" on the rx side so the watchdog does not fire
        for _ in 0..10 {
            transport.record_rx_activity();
            thread::sleep(Duration::from_millis(20));
        }
        sender.stop();
        let mut expected = OutputBuffer::empty();
        expected.push_heartbeat();
        let written = peer.pop_bytes_written();
        assert!(!written.is_empty());
        assert_eq!(&written[..expected.len()], expected.as_ref());
    }

    #[test]
    fn closes_transport_when_server_goes_silent() {
        let (transport, _peer) = transport();
        let mut sender =
            HeartbeatSender::start(Arc::clone(&transport), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));
        assert!(transport.is_closed());
        sender.stop();
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let (transport, _peer) = transport();
        let mut sender = HeartbeatSender::start(transport, Duration::from_secs(60));
        sender.stop();
        sender.stop();
    }
}
