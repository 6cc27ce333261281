// src/core/store/snapshot.rs

//! The snapshot format: a header followed by length-prefixed typed records, one
//! record kind per table, with a trailing CRC-64 checksum.
//!
//! Restore reproduces per-table `max_index` values exactly, so a restored store
//! is indistinguishable from the one that was snapshotted.

use bytes::{Buf, BufMut, BytesMut};
use crc::{CRC_64_REDIS, Crc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::table::{Row, Table};
use super::Tables;
use crate::core::errors::MusterError;
use crate::core::types::Index;

const SNAPSHOT_MAGIC: &[u8] = b"MUSTRSNP";
const SNAPSHOT_VERSION: &[u8] = b"0001";

const RECORD_NODES: u8 = 0x01;
const RECORD_SERVICES: u8 = 0x02;
const RECORD_CHECKS: u8 = 0x03;
const RECORD_SESSIONS: u8 = 0x04;
const RECORD_KV: u8 = 0x05;
const RECORD_INTENTIONS: u8 = 0x06;
const RECORD_CONFIG_ENTRIES: u8 = 0x07;
const RECORD_CA_ROOTS: u8 = 0x08;
const RECORD_PEERINGS: u8 = 0x09;
const RECORD_META: u8 = 0xFE;
const RECORD_EOF: u8 = 0xFF;

const CHECKSUM_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

#[derive(serde::Serialize, serde::Deserialize)]
struct TableRecord<R> {
    max_index: Index,
    rows: Vec<R>,
}

fn encode_table<R>(buf: &mut BytesMut, opcode: u8, table: &Table<R>) -> Result<(), MusterError>
where
    R: Row + Serialize,
{
    let record = TableRecord {
        max_index: table.max_index(),
        rows: table.iter().map(|r| (**r).clone()).collect::<Vec<R>>(),
    };
    let body = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;
    buf.put_u8(opcode);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

fn decode_table<R>(body: &[u8]) -> Result<Arc<Table<R>>, MusterError>
where
    R: Row + DeserializeOwned,
{
    let (record, _): (TableRecord<R>, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())?;
    let mut table = Table::new();
    for row in record.rows {
        table.restore_row(row);
    }
    table.set_max_index(record.max_index);
    Ok(Arc::new(table))
}

/// Serializes the full catalog into the snapshot byte format.
pub fn serialize(tables: &Tables) -> Result<Vec<u8>, MusterError> {
    let mut buf = BytesMut::new();
    buf.put_slice(SNAPSHOT_MAGIC);
    buf.put_slice(SNAPSHOT_VERSION);

    buf.put_u8(RECORD_META);
    buf.put_u32(8);
    buf.put_u64(tables.last_index);

    encode_table(&mut buf, RECORD_NODES, &tables.nodes)?;
    encode_table(&mut buf, RECORD_SERVICES, &tables.services)?;
    encode_table(&mut buf, RECORD_CHECKS, &tables.checks)?;
    encode_table(&mut buf, RECORD_SESSIONS, &tables.sessions)?;
    encode_table(&mut buf, RECORD_KV, &tables.kv)?;
    encode_table(&mut buf, RECORD_INTENTIONS, &tables.intentions)?;
    encode_table(&mut buf, RECORD_CONFIG_ENTRIES, &tables.config_entries)?;
    encode_table(&mut buf, RECORD_CA_ROOTS, &tables.ca_roots)?;
    encode_table(&mut buf, RECORD_PEERINGS, &tables.peerings)?;

    buf.put_u8(RECORD_EOF);
    let checksum = CHECKSUM_ALGO.checksum(&buf);
    buf.put_u64(checksum);
    Ok(buf.to_vec())
}

/// Deserializes a snapshot produced by [`serialize`], validating the header and
/// the trailing checksum before touching any record.
pub fn deserialize(bytes: &[u8]) -> Result<Tables, MusterError> {
    let header_len = SNAPSHOT_MAGIC.len() + SNAPSHOT_VERSION.len();
    if bytes.len() < header_len + 1 + 8 {
        return Err(MusterError::SnapshotCorrupt("truncated snapshot".into()));
    }
    if &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(MusterError::SnapshotCorrupt("bad magic".into()));
    }
    if &bytes[SNAPSHOT_MAGIC.len()..header_len] != SNAPSHOT_VERSION {
        return Err(MusterError::SnapshotCorrupt("unsupported version".into()));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let expected = u64::from_be_bytes(trailer.try_into().expect("8-byte trailer"));
    let actual = CHECKSUM_ALGO.checksum(body);
    if expected != actual {
        return Err(MusterError::SnapshotCorrupt(format!(
            "checksum mismatch: expected {expected:#x}, computed {actual:#x}"
        )));
    }

    let mut cursor = &body[header_len..];
    let mut tables = Tables::default();
    loop {
        if cursor.is_empty() {
            return Err(MusterError::SnapshotCorrupt("missing EOF record".into()));
        }
        let opcode = cursor.get_u8();
        if opcode == RECORD_EOF {
            break;
        }
        if cursor.len() < 4 {
            return Err(MusterError::SnapshotCorrupt("truncated record header".into()));
        }
        let len = cursor.get_u32() as usize;
        if cursor.len() < len {
            return Err(MusterError::SnapshotCorrupt("truncated record body".into()));
        }
        let (record, rest) = cursor.split_at(len);
        cursor = rest;

        match opcode {
            RECORD_META => {
                if record.len() != 8 {
                    return Err(MusterError::SnapshotCorrupt("bad meta record".into()));
                }
                tables.last_index = u64::from_be_bytes(record.try_into().expect("8-byte meta"));
            }
            RECORD_NODES => tables.nodes = decode_table(record)?,
            RECORD_SERVICES => tables.services = decode_table(record)?,
            RECORD_CHECKS => tables.checks = decode_table(record)?,
            RECORD_SESSIONS => tables.sessions = decode_table(record)?,
            RECORD_KV => tables.kv = decode_table(record)?,
            RECORD_INTENTIONS => tables.intentions = decode_table(record)?,
            RECORD_CONFIG_ENTRIES => tables.config_entries = decode_table(record)?,
            RECORD_CA_ROOTS => tables.ca_roots = decode_table(record)?,
            RECORD_PEERINGS => tables.peerings = decode_table(record)?,
            other => {
                return Err(MusterError::SnapshotCorrupt(format!(
                    "unknown record opcode {other:#x}"
                )));
            }
        }
    }
    Ok(tables)
}
