//! Identifier generation.
//!
//! All PaySentry entities use the same opaque id format:
//! `<prefix>_<lowercase-hex-millisecond-timestamp>_<8-char-base36-random>`.

use chrono::Utc;
use rand::Rng;

/// Well-known id prefixes used by the core.
pub mod prefix {
    /// Transactions
    pub const TRANSACTION: &str = "ps";
    /// Disputes
    pub const DISPUTE: &str = "dsp";
    /// Recovery actions
    pub const RECOVERY: &str = "rcv";
    /// Mandates (reserved for sandbox protocols)
    pub const MANDATE: &str = "mdt";
    /// Alert rules
    pub const ALERT_RULE: &str = "alr";
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a fresh id with the given prefix.
///
/// The hex timestamp makes ids roughly sortable by creation time; the
/// random suffix keeps them unique when many are minted in one millisecond.
pub fn generate_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}_{:x}_{}", prefix, millis, suffix)
}
