//! Rotating egress pool with 403 quarantine
//!
//! Every request goes out through an egress: a configured upstream proxy or
//! the process's own network ("direct"). The pool hands them out round-robin
//! and permanently quarantines an egress after two consecutive HTTP 403
//! responses, appending it to the bad-egress log exactly once. Quarantine
//! lasts for the process lifetime; there is no revival.

use crate::monitoring::{ErrorEvent, ErrorSource};
use crate::net::FetchError;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The network identity used for a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Egress {
    /// Upstream proxy URL, credentials included when configured
    Proxy(String),
    /// The process's direct network
    Direct,
}

impl Egress {
    /// Stable identifier used in logs and the bad-egress file
    pub fn id(&self) -> &str {
        match self {
            Egress::Proxy(url) => url,
            Egress::Direct => "direct",
        }
    }
}

impl std::fmt::Display for Egress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// What happened to a request sent through an egress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Http403,
    Transport,
    Timeout,
}

/// Counters carried by each egress for the process lifetime
#[derive(Debug)]
struct EgressState {
    egress: Egress,
    consecutive_403: u32,
    recent_errors: u32,
    quarantined: bool,
}

/// Point-in-time pool health, attached to error events
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub alive: usize,
    pub quarantined: usize,
    pub incidents_last_5m: usize,
}

const FORBIDDEN_THRESHOLD: u32 = 2;
const INCIDENT_WINDOW: Duration = Duration::from_secs(300);

struct PoolInner {
    entries: Vec<EgressState>,
    cursor: usize,
    incidents: VecDeque<Instant>,
}

/// Shared rotating set of egresses, safe under concurrent acquire/report
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    bad_log_path: Option<PathBuf>,
}

impl ProxyPool {
    /// Builds a pool from configured proxies, optionally including direct.
    ///
    /// # Arguments
    ///
    /// * `proxies` - Proxy URLs in rotation order
    /// * `allow_direct` - Insert the direct egress into the rotation
    /// * `bad_log_path` - Bad-egress log file (append mode); `None` disables
    pub fn new(proxies: &[String], allow_direct: bool, bad_log_path: Option<PathBuf>) -> Self {
        let mut entries: Vec<EgressState> = proxies
            .iter()
            .map(|url| EgressState {
                egress: Egress::Proxy(url.clone()),
                consecutive_403: 0,
                recent_errors: 0,
                quarantined: false,
            })
            .collect();
        if allow_direct {
            entries.push(EgressState {
                egress: Egress::Direct,
                consecutive_403: 0,
                recent_errors: 0,
                quarantined: false,
            });
        }
        Self {
            inner: Mutex::new(PoolInner {
                entries,
                cursor: 0,
                incidents: VecDeque::new(),
            }),
            bad_log_path,
        }
    }

    /// Returns the next non-quarantined egress, round-robin.
    ///
    /// # Returns
    ///
    /// * `Ok(Egress)` - The egress to use for the next request
    /// * `Err(FetchError::PoolExhausted)` - Every egress is quarantined;
    ///   a `proxy_pool_exhausted` event has been logged
    pub fn acquire(&self) -> Result<Egress, FetchError> {
        self.acquire_excluding(&HashSet::new())
    }

    /// Like [`acquire`](Self::acquire), but skips the given egress ids when
    /// other candidates remain (used by the browser retry ladder to force a
    /// fresh egress per rung).
    pub fn acquire_excluding(&self, exclude: &HashSet<String>) -> Result<Egress, FetchError> {
        let mut inner = self.inner.lock().expect("proxy pool lock poisoned");

        let pick = |inner: &mut PoolInner, exclude: &HashSet<String>| -> Option<Egress> {
            let len = inner.entries.len();
            for offset in 0..len {
                let index = (inner.cursor + offset) % len;
                let entry = &inner.entries[index];
                if entry.quarantined || exclude.contains(entry.egress.id()) {
                    continue;
                }
                inner.cursor = (index + 1) % len;
                return Some(inner.entries[index].egress.clone());
            }
            None
        };

        if let Some(egress) = pick(&mut inner, exclude) {
            return Ok(egress);
        }
        // Exclusions are advisory; fall back to the full rotation before
        // declaring the pool dead.
        if !exclude.is_empty() {
            if let Some(egress) = pick(&mut inner, &HashSet::new()) {
                return Ok(egress);
            }
        }

        let snapshot = snapshot_inner(&mut inner);
        drop(inner);
        let event = ErrorEvent::new("proxy_pool_exhausted", ErrorSource::Proxy)
            .action("refresh_pool")
            .detail("alive", snapshot.alive as u64)
            .detail("quarantined", snapshot.quarantined as u64)
            .detail("incidents_last_5m", snapshot.incidents_last_5m as u64);
        tracing::error!(error_event = %event.to_json(), "Every egress is quarantined");
        Err(FetchError::PoolExhausted)
    }

    /// Reports the outcome of a request sent through an egress.
    ///
    /// Two consecutive `Http403` outcomes quarantine the egress for the rest
    /// of the process and append one line to the bad-egress log. Any non-403
    /// outcome resets the 403 streak.
    pub fn report(&self, egress: &Egress, outcome: Outcome) {
        let mut inner = self.inner.lock().expect("proxy pool lock poisoned");
        let now = Instant::now();
        if outcome != Outcome::Ok {
            inner.incidents.push_back(now);
            while let Some(front) = inner.incidents.front() {
                if now.duration_since(*front) > INCIDENT_WINDOW {
                    inner.incidents.pop_front();
                } else {
                    break;
                }
            }
        }

        let Some(entry) = inner.entries.iter_mut().find(|e| &e.egress == egress) else {
            return;
        };

        match outcome {
            Outcome::Http403 => {
                entry.consecutive_403 += 1;
                if entry.consecutive_403 >= FORBIDDEN_THRESHOLD && !entry.quarantined {
                    entry.quarantined = true;
                    let id = entry.egress.id().to_string();
                    tracing::warn!(egress = %id, "Egress quarantined after repeated HTTP 403");
                    self.append_bad_entry(&id);
                }
            }
            Outcome::Ok => {
                entry.consecutive_403 = 0;
            }
            Outcome::Transport | Outcome::Timeout => {
                entry.consecutive_403 = 0;
                entry.recent_errors += 1;
            }
        }
    }

    /// Ids of every quarantined egress
    pub fn quarantined(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("proxy pool lock poisoned");
        inner
            .entries
            .iter()
            .filter(|e| e.quarantined)
            .map(|e| e.egress.id().to_string())
            .collect()
    }

    /// Current pool health for error-event details
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut inner = self.inner.lock().expect("proxy pool lock poisoned");
        snapshot_inner(&mut inner)
    }

    /// Appends `<rfc3339>\t<egress>\tHTTP 403\n` to the bad-egress log.
    /// Called at most once per egress; failures are logged, never fatal.
    fn append_bad_entry(&self, egress_id: &str) {
        let Some(path) = &self.bad_log_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = format!("{}\t{}\tHTTP 403\n", Utc::now().to_rfc3339(), egress_id);
        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut file| {
                file.write_all(line.as_bytes())?;
                file.flush()
            });
        if let Err(err) = result {
            tracing::warn!(path = %path.display(), error = %err, "Failed to append bad-egress log");
        }
    }
}

fn snapshot_inner(inner: &mut PoolInner) -> PoolSnapshot {
    let now = Instant::now();
    while let Some(front) = inner.incidents.front() {
        if now.duration_since(*front) > INCIDENT_WINDOW {
            inner.incidents.pop_front();
        } else {
            break;
        }
    }
    let quarantined = inner.entries.iter().filter(|e| e.quarantined).count();
    PoolSnapshot {
        alive: inner.entries.len() - quarantined,
        quarantined,
        incidents_last_5m: inner.incidents.len(),
    }
}
