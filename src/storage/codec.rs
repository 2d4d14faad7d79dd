//! Record codec: kifu roots and steps to and from backend items.
//!
//! Every item carries a `type` discriminant. Decoding fails with
//! `StorageError::InvalidStoredValue` when a required attribute is missing or
//! has the wrong shape.

use std::str::FromStr;

use crate::interfaces::{Result, StorageError};
use crate::kifu::{FinishedStatus, Kifu, KifuSignature, Piece, Pos, Step, Version};
use crate::storage::item::{AttrValue, Item, PK_ATTR, SK_ATTR};
use crate::storage::keys::{
    owner_index_entry, position_index_entry, root_key, signature_index_entry, step_key,
    CREATED_KEY_ATTR, OWNER_ATTR, POSITION_KEY_ATTR, POSITION_SK_ATTR, SIGNATURE_KEY_ATTR,
    SIGNATURE_SK_ATTR,
};

pub const TYPE_ATTR: &str = "type";
pub const VERSION_ATTR: &str = "version";
pub const STEP_COUNT_ATTR: &str = "step_count";

const KIFU_ID_ATTR: &str = "kifu_id";
const CREATED_TS_ATTR: &str = "created_ts";
const START_TS_ATTR: &str = "start_ts";
const END_TS_ATTR: &str = "end_ts";
const POSITION_ATTR: &str = "position";
const HANDICAP_ATTR: &str = "handicap";
const GAME_NAME_ATTR: &str = "game_name";
const FIRST_PLAYERS_ATTR: &str = "first_players";
const SECOND_PLAYERS_ATTR: &str = "second_players";
const NOTE_ATTR: &str = "note";

const SEQ_ATTR: &str = "seq";
const SRC_ATTR: &str = "src";
const DST_ATTR: &str = "dst";
const PIECE_ATTR: &str = "piece";
const PROMOTED_ATTR: &str = "promoted";
const DROP_ATTR: &str = "drop";
const CAPTURED_ATTR: &str = "captured";
const FINISHED_STATUS_ATTR: &str = "finished_status";
const TIMESTAMP_SEC_ATTR: &str = "timestamp_sec";
const THINKING_SEC_ATTR: &str = "thinking_sec";
const NOTES_ATTR: &str = "notes";

const KIFU_TYPE: &str = "KIFU";
const STEP_TYPE: &str = "STEP";

/// Kind of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Root,
    Step,
}

/// Read the discriminant of an item.
pub fn record_kind(item: &Item) -> Result<RecordKind> {
    match req_s(item, TYPE_ATTR)? {
        KIFU_TYPE => Ok(RecordKind::Root),
        STEP_TYPE => Ok(RecordKind::Step),
        other => Err(invalid(format!("unknown record type `{other}`"))),
    }
}

pub fn encode_root(kifu: &Kifu, version: &Version) -> Item {
    let mut item = root_key(&kifu.kifu_id).to_item();
    let (owner, created_key) = owner_index_entry(&kifu.owner_id, kifu.created_ts, &kifu.kifu_id);

    put_s(&mut item, TYPE_ATTR, KIFU_TYPE);
    put_s(&mut item, OWNER_ATTR, &owner);
    put_s(&mut item, CREATED_KEY_ATTR, &created_key);
    put_s(&mut item, KIFU_ID_ATTR, &kifu.kifu_id);
    put_n(&mut item, CREATED_TS_ATTR, kifu.created_ts);
    put_n(&mut item, START_TS_ATTR, kifu.start_ts);
    if let Some(end_ts) = kifu.end_ts {
        put_n(&mut item, END_TS_ATTR, end_ts);
    }
    put_s(&mut item, POSITION_ATTR, &kifu.position);
    if !kifu.position.is_empty() {
        let (signature_key, signature_sk) =
            signature_index_entry(&kifu.position, &kifu.owner_id, &kifu.kifu_id);
        put_s(&mut item, SIGNATURE_KEY_ATTR, &signature_key);
        put_s(&mut item, SIGNATURE_SK_ATTR, &signature_sk);
    }
    put_s(&mut item, VERSION_ATTR, version.as_str());
    put_n(&mut item, STEP_COUNT_ATTR, kifu.step_count);
    put_s(&mut item, HANDICAP_ATTR, &kifu.handicap);
    put_s(&mut item, GAME_NAME_ATTR, &kifu.game_name);
    put_strings(&mut item, FIRST_PLAYERS_ATTR, &kifu.first_players);
    put_strings(&mut item, SECOND_PLAYERS_ATTR, &kifu.second_players);
    put_s(&mut item, NOTE_ATTR, &kifu.note);
    item
}

pub fn decode_root(item: &Item) -> Result<(Kifu, Version)> {
    expect_kind(item, RecordKind::Root)?;

    let kifu = Kifu {
        owner_id: req_s(item, OWNER_ATTR)?.to_string(),
        kifu_id: req_s(item, KIFU_ID_ATTR)?.to_string(),
        created_ts: req_n(item, CREATED_TS_ATTR)?,
        start_ts: req_n(item, START_TS_ATTR)?,
        end_ts: opt_n(item, END_TS_ATTR)?,
        position: req_s(item, POSITION_ATTR)?.to_string(),
        step_count: req_n(item, STEP_COUNT_ATTR)?,
        handicap: opt_s(item, HANDICAP_ATTR)?,
        game_name: opt_s(item, GAME_NAME_ATTR)?,
        first_players: opt_strings(item, FIRST_PLAYERS_ATTR)?,
        second_players: opt_strings(item, SECOND_PLAYERS_ATTR)?,
        note: opt_s(item, NOTE_ATTR)?,
    };
    let version = Version::from(req_s(item, VERSION_ATTR)?);

    Ok((kifu, version))
}

pub fn encode_step(step: &Step) -> Item {
    let mut item = step_key(&step.kifu_id, step.seq).to_item();

    put_s(&mut item, TYPE_ATTR, STEP_TYPE);
    put_s(&mut item, OWNER_ATTR, &step.owner_id);
    put_s(&mut item, KIFU_ID_ATTR, &step.kifu_id);
    put_n(&mut item, SEQ_ATTR, step.seq);
    put_s(&mut item, POSITION_ATTR, &step.position);
    // Index key attributes must not be empty strings.
    if !step.position.is_empty() {
        let (position_key, position_sk) =
            position_index_entry(&step.owner_id, &step.position, &step.kifu_id, step.seq);
        put_s(&mut item, POSITION_KEY_ATTR, &position_key);
        put_s(&mut item, POSITION_SK_ATTR, &position_sk);
    }
    if let Some(src) = step.src {
        item.insert(SRC_ATTR.to_string(), encode_pos(src));
    }
    if let Some(dst) = step.dst {
        item.insert(DST_ATTR.to_string(), encode_pos(dst));
    }
    put_n(&mut item, PIECE_ATTR, step.piece.code());
    item.insert(PROMOTED_ATTR.to_string(), AttrValue::Bool(step.promoted));
    item.insert(DROP_ATTR.to_string(), AttrValue::Bool(step.drop));
    put_n(&mut item, CAPTURED_ATTR, step.captured.code());
    put_n(&mut item, FINISHED_STATUS_ATTR, step.finished_status.code());
    put_n(&mut item, TIMESTAMP_SEC_ATTR, step.timestamp_sec);
    put_n(&mut item, THINKING_SEC_ATTR, step.thinking_sec);
    put_strings(&mut item, NOTES_ATTR, &step.notes);
    item
}

pub fn decode_step(item: &Item) -> Result<Step> {
    expect_kind(item, RecordKind::Step)?;

    let piece = req_n(item, PIECE_ATTR)?;
    let captured = req_n(item, CAPTURED_ATTR)?;
    let finished = req_n(item, FINISHED_STATUS_ATTR)?;

    Ok(Step {
        owner_id: req_s(item, OWNER_ATTR)?.to_string(),
        kifu_id: req_s(item, KIFU_ID_ATTR)?.to_string(),
        seq: req_n(item, SEQ_ATTR)?,
        position: req_s(item, POSITION_ATTR)?.to_string(),
        src: opt_pos(item, SRC_ATTR)?,
        dst: opt_pos(item, DST_ATTR)?,
        piece: Piece::from_code(piece)
            .ok_or_else(|| invalid(format!("unknown piece code {piece}")))?,
        promoted: req_bool(item, PROMOTED_ATTR)?,
        drop: req_bool(item, DROP_ATTR)?,
        captured: Piece::from_code(captured)
            .ok_or_else(|| invalid(format!("unknown piece code {captured}")))?,
        finished_status: FinishedStatus::from_code(finished)
            .ok_or_else(|| invalid(format!("unknown finished status {finished}")))?,
        timestamp_sec: req_n(item, TIMESTAMP_SEC_ATTR)?,
        thinking_sec: req_n(item, THINKING_SEC_ATTR)?,
        notes: opt_strings(item, NOTES_ATTR)?,
    })
}

/// A decoded item of a kifu partition.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Root(Kifu, Version),
    Step(Step),
}

/// Decode an item of either kind, dispatching on its discriminant.
pub fn decode_record(item: &Item) -> Result<Record> {
    match record_kind(item)? {
        RecordKind::Root => decode_root(item).map(|(kifu, version)| Record::Root(kifu, version)),
        RecordKind::Step => decode_step(item).map(Record::Step),
    }
}

/// Step count of a stored root, without decoding the rest of it.
pub fn decode_step_count(item: &Item) -> Result<u32> {
    expect_kind(item, RecordKind::Root)?;
    req_n(item, STEP_COUNT_ATTR)
}

/// A position index hit: which step of which kifu reached the position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionEntry {
    pub owner_id: String,
    pub kifu_id: String,
    pub seq: u32,
}

/// Decode a position index item. Only the attributes the index projects are read.
pub fn decode_position_entry(item: &Item) -> Result<PositionEntry> {
    Ok(PositionEntry {
        owner_id: req_s(item, OWNER_ATTR)?.to_string(),
        kifu_id: req_s(item, KIFU_ID_ATTR)?.to_string(),
        seq: req_n(item, SEQ_ATTR)?,
    })
}

/// Owner and id of a root found through the signature index.
pub fn decode_signature(item: &Item) -> Result<KifuSignature> {
    expect_kind(item, RecordKind::Root)?;
    Ok(KifuSignature {
        owner_id: req_s(item, OWNER_ATTR)?.to_string(),
        kifu_id: req_s(item, KIFU_ID_ATTR)?.to_string(),
    })
}

/// Partition and sort key of an item, for diagnostics.
pub fn describe(item: &Item) -> String {
    let pk = item.get(PK_ATTR).and_then(AttrValue::as_s).unwrap_or("?");
    let sk = item.get(SK_ATTR).and_then(AttrValue::as_s).unwrap_or("?");
    format!("{pk}/{sk}")
}

fn invalid(msg: String) -> StorageError {
    StorageError::InvalidStoredValue(msg)
}

fn expect_kind(item: &Item, expected: RecordKind) -> Result<()> {
    let kind = record_kind(item)?;
    if kind != expected {
        return Err(invalid(format!(
            "expected {expected:?} record, found {kind:?} at {}",
            describe(item)
        )));
    }
    Ok(())
}

fn put_s(item: &mut Item, name: &str, value: &str) {
    item.insert(name.to_string(), AttrValue::S(value.to_string()));
}

fn put_n(item: &mut Item, name: &str, value: impl ToString) {
    item.insert(name.to_string(), AttrValue::N(value.to_string()));
}

fn put_strings(item: &mut Item, name: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    item.insert(
        name.to_string(),
        AttrValue::L(values.iter().cloned().map(AttrValue::S).collect()),
    );
}

fn encode_pos(pos: Pos) -> AttrValue {
    AttrValue::L(vec![
        AttrValue::N(pos.x.to_string()),
        AttrValue::N(pos.y.to_string()),
    ])
}

fn req_s<'a>(item: &'a Item, name: &str) -> Result<&'a str> {
    match item.get(name) {
        Some(AttrValue::S(s)) => Ok(s),
        Some(other) => Err(invalid(format!("`{name}` is not a string: {other:?}"))),
        None => Err(invalid(format!("`{name}` is missing at {}", describe(item)))),
    }
}

fn opt_s(item: &Item, name: &str) -> Result<String> {
    match item.get(name) {
        None | Some(AttrValue::Null) => Ok(String::new()),
        Some(_) => req_s(item, name).map(str::to_string),
    }
}

fn parse_n<T: FromStr>(name: &str, value: &AttrValue) -> Result<T> {
    let raw = value
        .as_n()
        .ok_or_else(|| invalid(format!("`{name}` is not a number: {value:?}")))?;
    raw.parse()
        .map_err(|_| invalid(format!("`{name}` is out of range: {raw}")))
}

fn req_n<T: FromStr>(item: &Item, name: &str) -> Result<T> {
    match item.get(name) {
        Some(value) => parse_n(name, value),
        None => Err(invalid(format!("`{name}` is missing at {}", describe(item)))),
    }
}

fn opt_n<T: FromStr>(item: &Item, name: &str) -> Result<Option<T>> {
    match item.get(name) {
        None | Some(AttrValue::Null) => Ok(None),
        Some(value) => parse_n(name, value).map(Some),
    }
}

fn req_bool(item: &Item, name: &str) -> Result<bool> {
    match item.get(name) {
        Some(AttrValue::Bool(b)) => Ok(*b),
        Some(other) => Err(invalid(format!("`{name}` is not a bool: {other:?}"))),
        None => Err(invalid(format!("`{name}` is missing at {}", describe(item)))),
    }
}

fn opt_strings(item: &Item, name: &str) -> Result<Vec<String>> {
    let Some(value) = item.get(name) else {
        return Ok(Vec::new());
    };
    let list = value
        .as_l()
        .ok_or_else(|| invalid(format!("`{name}` is not a list: {value:?}")))?;
    list.iter()
        .map(|v| {
            v.as_s()
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("`{name}` holds a non-string: {v:?}")))
        })
        .collect()
}

fn opt_pos(item: &Item, name: &str) -> Result<Option<Pos>> {
    let Some(value) = item.get(name) else {
        return Ok(None);
    };
    match value.as_l() {
        Some([x, y]) => Ok(Some(Pos {
            x: parse_n(name, x)?,
            y: parse_n(name, y)?,
        })),
        _ => Err(invalid(format!("`{name}` is not a square: {value:?}"))),
    }
}
