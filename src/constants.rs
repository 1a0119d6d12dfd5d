//! Fixed limits and well-known names.
//!
//! Every timeout, capacity, and reserved identifier used across the registry
//! lives here so the bounds are visible in one place.

use std::time::Duration;

// ============================================================================
// Buckets and reserved keys
// ============================================================================

/// Bucket holding the serialized node tree and cluster metadata.
pub const ROOT_BUCKET: &str = "loda";
/// Bucket holding users (`u-` keys) and groups (`g-` keys).
pub const AUTH_BUCKET: &str = "authorize";
/// Bucket holding the persisted agent report journal.
pub const REPORT_BUCKET: &str = "report";
/// Key of the journal snapshot inside [`REPORT_BUCKET`].
pub const REPORT_KEY: &str = "journal";

/// Key of the node tree blob inside [`ROOT_BUCKET`].
pub const NODE_KEY: &str = "node";

/// Key prefix for user records inside [`AUTH_BUCKET`].
pub const USER_PREFIX: &str = "u-";
/// Key prefix for group records inside [`AUTH_BUCKET`].
pub const GROUP_PREFIX: &str = "g-";

// ============================================================================
// Tree
// ============================================================================

/// Name of the root node; also the rightmost segment of every NS.
pub const ROOT_NAME: &str = "loda";
/// ID of the root node.
pub const ROOT_ID: &str = "0";
/// Leaf that receives hosts no other leaf claims.
pub const POOL_NODE: &str = "pool";
/// Fully qualified NS of the pool leaf.
pub const POOL_NS: &str = "pool.loda";
/// MachineReg sentinel meaning "never auto-match".
pub const NO_MATCH_REG: &str = "^$";
/// Prefix marking a resource type as a template.
pub const TEMPLATE_PREFIX: &str = "_template_";
/// Separator between NS segments.
pub const NS_SEPARATOR: char = '.';

// ============================================================================
// Resource types and properties
// ============================================================================

pub const RES_MACHINE: &str = "machine";
pub const RES_COLLECT: &str = "collect";
pub const RES_ALARM: &str = "alarm";
pub const RES_DASHBOARD: &str = "dashboard";
pub const RES_DOCUMENT: &str = "document";
pub const RES_NS: &str = "ns";

/// Resource types that carry permission items.
pub const ALL_RESOURCE_TYPES: &[&str] = &[RES_NS, RES_MACHINE, RES_COLLECT, RES_ALARM, RES_DASHBOARD, RES_DOCUMENT];

/// Mandatory id property of every resource.
pub const ID_PROPERTY: &str = "_id";
pub const HOSTNAME_PROPERTY: &str = "hostname";
pub const IP_PROPERTY: &str = "ip";
pub const STATUS_PROPERTY: &str = "status";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_DEAD: &str = "dead";

/// Primary-key property per resource type, checked by copy/move.
pub fn pk_property(resource_type: &str) -> &'static str {
    match resource_type {
        RES_MACHINE => HOSTNAME_PROPERTY,
        RES_COLLECT | RES_ALARM => "name",
        _ => ID_PROPERTY,
    }
}

// ============================================================================
// Auth
// ============================================================================

pub const DEFAULT_GROUP: &str = "loda-defaultgroup";
pub const ADMIN_GROUP: &str = "loda-admingroup";
pub const DEFAULT_USER: &str = "default";
pub const OP_ROLE: &str = "op";
pub const DEV_ROLE: &str = "dev";
pub const ALERT_ENABLE: &str = "enable";
pub const ALERT_DISABLE: &str = "disable";
pub const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE"];

/// Lifetime of a signed-in session.
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Visitors not seen for this long are dropped by the rate limiter.
pub const VISITOR_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How often the rate limiter sweeps idle visitors.
pub const VISITOR_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// How often expired sessions are dropped.
pub const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(600);
/// Requests per second granted to one client IP.
pub const API_RATE_LIMIT: f64 = 10.0;
/// Requests one client IP may save up.
pub const API_RATE_BURST: u32 = 100;

// ============================================================================
// Store and consensus
// ============================================================================

/// Default byte capacity of the read-through cache (50 MiB).
pub const DEFAULT_CACHE_CAPACITY: usize = 50 * 1024 * 1024;
/// Timeout for a single consensus apply.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default dial timeout for raft RPC and forwarding.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval used by `wait_for_leader`.
pub const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a starting member waits for a leader to appear.
pub const LEADER_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum size of a single framed message on the cluster transport.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
/// Maximum concurrent inbound connections per transport channel.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 512;

pub const RAFT_DB_FILE: &str = "raft.db";
pub const REGISTRY_DB_FILE: &str = "registry.db";
pub const PEERS_FILE: &str = "peers.json";

// ============================================================================
// Control loops
// ============================================================================

/// Bound on in-flight leaf searches.
pub const SEARCH_CONCURRENCY: usize = 100;
/// Bound on leaves reclassified at once by the status loop.
pub const MACHINE_STATUS_CONCURRENCY: usize = 16;
/// Interval of the machine status reclassification loop.
pub const MACHINE_STATUS_INTERVAL: Duration = Duration::from_secs(3600);
/// A host that reported within this window is online.
pub const MACHINE_REPORT_ALIVE: Duration = Duration::from_secs(24 * 3600);
/// A host silent for at least this long is dead.
pub const MACHINE_REPORT_TIMEOUT: Duration = Duration::from_secs(48 * 3600);

// ============================================================================
// DNS
// ============================================================================

pub const DNS_TTL: u32 = 60;
pub const DNS_CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(120);
pub const DNS_MAX_PACKET: usize = 4096;
