//! Key and index layout of the kifu table.
//!
//! ## Table
//! - Root: `pk = KIFU#{kifu_id}`, `sk = ROOT`
//! - Step: `pk = KIFU#{kifu_id}`, `sk = STEP#{seq:010}`
//!
//! Root and steps share a partition, so one query returns the whole kifu.
//! `ROOT` sorts before every `STEP#` key.
//!
//! ## OwnerIndex (root items only)
//! - hash `owner_id`, range `created_key = {created_ts offset:020}#{kifu_id}`
//!
//! Serves owner listing (any order) and recency (descending scan).
//!
//! ## PositionIndex (step items only)
//! - hash `position_key = {owner_id}#{position}`, range `position_sk = {kifu_id}#{seq:010}`
//!
//! ## SignatureIndex (root items only)
//! - hash `signature_key = {final position}`, range `signature_sk = {owner_id}#{kifu_id}`
//!
//! Spans all owners; finds kifu that ended in the same position.

use crate::interfaces::RangeCondition;
use crate::storage::item::{Key, SK_ATTR};

pub const OWNER_INDEX: &str = "OwnerIndex";
pub const POSITION_INDEX: &str = "PositionIndex";
pub const SIGNATURE_INDEX: &str = "SignatureIndex";

pub const OWNER_ATTR: &str = "owner_id";
pub const CREATED_KEY_ATTR: &str = "created_key";
pub const POSITION_KEY_ATTR: &str = "position_key";
pub const POSITION_SK_ATTR: &str = "position_sk";
pub const SIGNATURE_KEY_ATTR: &str = "signature_key";
pub const SIGNATURE_SK_ATTR: &str = "signature_sk";

const KIFU_PREFIX: &str = "KIFU#";
const ROOT_SK: &str = "ROOT";
const STEP_PREFIX: &str = "STEP#";

/// Partition value shared by a kifu's root and steps.
pub fn kifu_partition(kifu_id: &str) -> String {
    format!("{KIFU_PREFIX}{kifu_id}")
}

pub fn root_key(kifu_id: &str) -> Key {
    Key::new(kifu_partition(kifu_id), ROOT_SK)
}

pub fn step_key(kifu_id: &str, seq: u32) -> Key {
    Key::new(kifu_partition(kifu_id), step_sk(seq))
}

fn step_sk(seq: u32) -> String {
    format!("{STEP_PREFIX}{}", padded_seq(seq))
}

/// Wide enough for every u32, so string order equals numeric order.
fn padded_seq(seq: u32) -> String {
    format!("{seq:010}")
}

/// Sort-key condition selecting steps with `from <= seq < to`.
///
/// Returns `None` for an empty range.
pub fn step_range(from: u32, to: u32) -> Option<RangeCondition> {
    if to <= from {
        return None;
    }
    Some(RangeCondition::Between {
        attr: SK_ATTR.to_string(),
        lo: step_sk(from),
        hi: step_sk(to - 1),
    })
}

/// Owner index entry: `(owner_id, created_key)`.
pub fn owner_index_entry(owner_id: &str, created_ts: i64, kifu_id: &str) -> (String, String) {
    // Shift into u64 so lexicographic order equals numeric order for negatives too.
    let shifted = (created_ts as i128 - i64::MIN as i128) as u64;
    (owner_id.to_string(), format!("{shifted:020}#{kifu_id}"))
}

/// Position index entry: `(position_key, position_sk)`.
pub fn position_index_entry(
    owner_id: &str,
    position: &str,
    kifu_id: &str,
    seq: u32,
) -> (String, String) {
    (
        position_partition(owner_id, position),
        format!("{kifu_id}#{}", padded_seq(seq)),
    )
}

/// Signature index entry: `(signature_key, signature_sk)`.
pub fn signature_index_entry(position: &str, owner_id: &str, kifu_id: &str) -> (String, String) {
    (position.to_string(), format!("{owner_id}#{kifu_id}"))
}

/// Hash value of the position index for one owner.
pub fn position_partition(owner_id: &str, position: &str) -> String {
    format!("{owner_id}#{position}")
}
