//! Callback dispatch.
//!
//! The boundary between the bridge and its consumer. Two handler kinds
//! exist per session: a ports handler, invoked exactly once when the
//! session's port pair becomes known, and an input handler, invoked once
//! per validated inbound packet in arrival order.
//!
//! Handlers run synchronously on the invoking task (the session's ingress
//! pump for input, the starting caller for ports). A slow handler therefore
//! stalls its own session only; handing work off is the handler's job.
//! The former C-style `void* user_data` argument is subsumed by closure
//! capture.
//!
//! A panicking handler never takes the pump down: panics are caught here,
//! logged and counted, and the pump moves on to the next packet.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::types::{PortPair, SessionId};

/// Handler invoked when a session's (video, audio) ports become known.
pub type PortsHandler = Arc<dyn Fn(u16, u16) + Send + Sync>;

/// Handler invoked for each validated inbound packet. The byte slice is
/// only valid for the duration of the call; handlers that need the data
/// longer must copy it.
pub type InputHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Forward a ports event to a registered handler.
///
/// Pure forwarding: no transformation, no error return. Returns `false`
/// when the handler panicked.
pub fn invoke_ports_handler(session_id: &SessionId, handler: &PortsHandler, ports: PortPair) -> bool {
    let survived = catch_unwind(AssertUnwindSafe(|| handler(ports.video, ports.audio))).is_ok();
    if !survived {
        error!("Ports handler for session {} panicked", session_id);
    }
    survived
}

/// Forward one packet to a registered handler.
///
/// Returns `false` when the handler panicked; the caller counts the
/// failure and continues with the next packet.
pub fn invoke_input_handler(session_id: &SessionId, handler: &InputHandler, payload: &[u8]) -> bool {
    let survived = catch_unwind(AssertUnwindSafe(|| handler(payload))).is_ok();
    if !survived {
        error!("Input handler for session {} panicked", session_id);
    }
    survived
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn forwards_ports_verbatim() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in = seen.clone();
        let handler: PortsHandler = Arc::new(move |video, audio| {
            *seen_in.lock().unwrap() = Some((video, audio));
        });

        let ok = invoke_ports_handler(
            &SessionId::from_name("s"),
            &handler,
            PortPair { video: 5000, audio: 5002 },
        );
        assert!(ok);
        assert_eq!(*seen.lock().unwrap(), Some((5000, 5002)));
    }

    #[test]
    fn contains_handler_panic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let handler: InputHandler = Arc::new(move |_payload| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            panic!("consumer bug");
        });

        let ok = invoke_input_handler(&SessionId::from_name("s"), &handler, &[1, 2, 3]);
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The dispatcher itself is still usable afterwards.
        let benign: InputHandler = Arc::new(|_| {});
        assert!(invoke_input_handler(&SessionId::from_name("s"), &benign, &[4]));
    }
}
