//! Port allocation for bridged sessions.
//!
//! Each session reserves a (video, audio) pair of even ports from a
//! configured range. Reservation is a single critical section, so two
//! sessions starting concurrently can never observe the same free port.
//! There is deliberately no process-wide allocator instance: the bridge
//! owns its allocator and injects it where needed.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{AllocationStrategy, AllocatorConfig};
use crate::error::{Error, Result};
use crate::types::{PortPair, SessionId};

/// Attempts made per allocation under the Random strategy before falling
/// back to a sequential scan.
const RANDOM_ATTEMPTS: usize = 32;

#[derive(Debug, Default)]
struct AllocatorInner {
    /// Every port currently reserved, regardless of owning session.
    in_use: HashSet<u16>,
    /// Pair reserved per session.
    by_session: HashMap<SessionId, PortPair>,
}

/// Reserves and releases (video, audio) port pairs.
pub struct PortAllocator {
    config: AllocatorConfig,
    inner: Mutex<AllocatorInner>,
}

impl PortAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AllocatorInner::default()),
        }
    }

    /// Atomically reserve a (video, audio) pair of even ports for a session.
    ///
    /// Fails with [`Error::ResourceExhausted`] when no free pair remains,
    /// and with [`Error::InvalidState`] when the session already holds one
    /// (a session owns at most one pair for its whole lifetime).
    pub async fn allocate_pair(&self, session_id: &SessionId) -> Result<PortPair> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.by_session.get(session_id) {
            warn!("Session {} already holds port pair {}", session_id, existing);
            return Err(Error::InvalidState {
                operation: "allocate_pair",
                state: crate::types::SessionState::PortsAssigned,
            });
        }

        let candidate = match self.config.strategy {
            AllocationStrategy::Sequential => self.scan_sequential(&inner).await,
            AllocationStrategy::Random => match self.pick_random(&inner).await {
                Some(pair) => Some(pair),
                None => self.scan_sequential(&inner).await,
            },
        };

        let pair = candidate.ok_or(Error::ResourceExhausted {
            start: self.config.port_range.start,
            end: self.config.port_range.end,
        })?;

        inner.in_use.insert(pair.video);
        inner.in_use.insert(pair.audio);
        inner.by_session.insert(session_id.clone(), pair);
        debug!("Allocated port pair {} for session {}", pair, session_id);
        Ok(pair)
    }

    /// Release the pair held by a session. Releasing a session that holds
    /// no pair is a no-op; double release never fails.
    pub async fn release_session(&self, session_id: &SessionId) -> Option<PortPair> {
        let mut inner = self.inner.lock().await;
        match inner.by_session.remove(session_id) {
            Some(pair) => {
                inner.in_use.remove(&pair.video);
                inner.in_use.remove(&pair.audio);
                debug!("Released port pair {} for session {}", pair, session_id);
                Some(pair)
            }
            None => {
                debug!("Release for session {} with no allocated pair (no-op)", session_id);
                None
            }
        }
    }

    /// Release an explicit pair. Ports not currently reserved are ignored.
    pub async fn release_pair(&self, pair: PortPair) {
        let mut inner = self.inner.lock().await;
        let video_was_used = inner.in_use.remove(&pair.video);
        let audio_was_used = inner.in_use.remove(&pair.audio);
        if !video_was_used && !audio_was_used {
            debug!("Double release of pair {} (no-op)", pair);
        }
        inner.by_session.retain(|_, p| *p != pair);
    }

    /// Number of ports currently reserved.
    pub async fn allocated_count(&self) -> usize {
        self.inner.lock().await.in_use.len()
    }

    /// Pair currently held by a session, if any.
    pub async fn pair_for(&self, session_id: &SessionId) -> Option<PortPair> {
        self.inner.lock().await.by_session.get(session_id).copied()
    }

    /// Scan even base ports upward; a candidate is usable when both the
    /// base (video) and base+2 (audio) are free. Odd ports stay free for
    /// RTCP in a fuller deployment.
    async fn scan_sequential(&self, inner: &AllocatorInner) -> Option<PortPair> {
        let range = self.config.port_range;
        let mut base = range.start.checked_add(range.start & 1)?;
        loop {
            let audio = base.checked_add(2)?;
            if audio > range.end {
                return None;
            }
            if let Some(pair) = self.try_candidate(inner, base).await {
                return Some(pair);
            }
            base = base.checked_add(2)?;
        }
    }

    async fn pick_random(&self, inner: &AllocatorInner) -> Option<PortPair> {
        let range = self.config.port_range;
        let min_end = range.start.checked_add(2)?;
        if range.end < min_end {
            return None;
        }
        for _ in 0..RANDOM_ATTEMPTS {
            let base = {
                let mut rng = rand::thread_rng();
                let raw: u16 = rng.gen_range(range.start..=range.end - 2);
                raw - (raw & 1)
            };
            if base < range.start {
                continue;
            }
            if let Some(pair) = self.try_candidate(inner, base).await {
                return Some(pair);
            }
        }
        None
    }

    async fn try_candidate(&self, inner: &AllocatorInner, base: u16) -> Option<PortPair> {
        let video = base;
        let audio = base + 2;
        if inner.in_use.contains(&video) || inner.in_use.contains(&audio) {
            return None;
        }
        if self.config.bind_verify {
            if !self.probe_bind(video).await || !self.probe_bind(audio).await {
                return None;
            }
        }
        Some(PortPair { video, audio })
    }

    /// Probe-bind a UDP socket to verify the OS considers the port free.
    /// The socket is dropped immediately; the actual media transport binds
    /// later, outside this component.
    async fn probe_bind(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.config.local_ip, port);
        match UdpSocket::bind(addr).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Probe bind failed for {}: {}", addr, e);
                false
            }
        }
    }
}
