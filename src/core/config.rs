//! Centralized tunables for seedkeeper.
//!
//! Everything adjustable lives here so it can be reviewed in one place.
//! On-disk field names stay with the types that serialize them.

use std::time::Duration;

// ── Daemon configuration defaults ───────────────────────────────────────────

/// Connection limit handed to the transfer engine when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 200;

/// Transport toggle (uTP) default.
pub const DEFAULT_UTP: bool = false;

/// Directory created under the user's documents directory for content.
pub const DEFAULT_STORAGE_DIR_NAME: &str = "bitvid-seeder";

// ── Persistence ─────────────────────────────────────────────────────────────

/// Tick of the persistence worker. Under the debounced policy this batches
/// one write per tick; under the immediate policy it only retries snapshots
/// whose write failed.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Attempts at taking the ledger's cross-process lock before a write is
/// counted as failed (and left pending for the next tick).
pub const LOCK_ATTEMPTS: u32 = 50;

/// Delay between lock attempts.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

// ── Commands ────────────────────────────────────────────────────────────────

/// Descriptors must be magnet URIs.
pub const DESCRIPTOR_PREFIX: &str = "magnet:?";

/// Page size used by the control server when a `list` request omits it.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Readability checks after importing a file into the storage root, for
/// filesystems that briefly keep a fresh copy busy.
pub const IMPORT_READY_ATTEMPTS: u32 = 5;

/// Delay between import readability checks.
pub const IMPORT_READY_DELAY: Duration = Duration::from_secs(1);

// ── Control server / telemetry ──────────────────────────────────────────────

/// Loopback port of the control socket.
pub const DEFAULT_CONTROL_PORT: u16 = 3000;

/// Longest accepted control request line, newline included. A client that
/// sends more without a newline gets `invalid_request` and is disconnected.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Interval of the usage telemetry log line.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);
