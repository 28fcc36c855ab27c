// src/storage/codec.rs — формат <backend-root>/metadata.db (LE)
//
// MAGIC8 = "LVMETADB"
// u32 version      = 1
// u32 flags        (0; зарезервировано)
// u64 payload_len
// u32 crc32        (crc32fast по payload)
// u32 reserved     (0)
// payload          JSON(MetaState)
//
// Политика:
// - Файл всегда переписывается целиком (tmp+rename, см. util::fs::write_atomic).
// - Любое несоответствие (magic/version/len/crc) — ошибка открытия, не "пустой стор".

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use super::state::MetaState;

pub const META_MAGIC: &[u8; 8] = b"LVMETADB";
pub const META_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 4 + 4;

pub fn encode(state: &MetaState) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(state).context("serialize metadata state")?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(META_MAGIC);
    out.write_u32::<LittleEndian>(META_VERSION)?;
    out.write_u32::<LittleEndian>(0)?; // flags
    out.write_u64::<LittleEndian>(payload.len() as u64)?;
    out.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    out.write_u32::<LittleEndian>(0)?; // reserved
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<MetaState> {
    if bytes.len() < HEADER_LEN {
        return Err(anyhow!(
            "metadata file too short: {} bytes (header is {})",
            bytes.len(),
            HEADER_LEN
        ));
    }
    let mut rd = Cursor::new(bytes);

    let mut magic = [0u8; 8];
    rd.read_exact(&mut magic)?;
    if &magic != META_MAGIC {
        return Err(anyhow!(
            "bad metadata magic (expected {:?}, got {:?})",
            META_MAGIC,
            magic
        ));
    }
    let version = rd.read_u32::<LittleEndian>()?;
    if version != META_VERSION {
        return Err(anyhow!("unsupported metadata version {}", version));
    }
    let _flags = rd.read_u32::<LittleEndian>()?;
    let len = rd.read_u64::<LittleEndian>()?;
    let crc = rd.read_u32::<LittleEndian>()?;
    let _reserved = rd.read_u32::<LittleEndian>()?;

    let payload = &bytes[HEADER_LEN..];
    if payload.len() as u64 != len {
        return Err(anyhow!(
            "metadata payload length mismatch: header {}, actual {}",
            len,
            payload.len()
        ));
    }
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Err(anyhow!(
            "metadata checksum mismatch: stored {:#010x}, computed {:#010x}",
            crc,
            actual
        ));
    }

    let state: MetaState = serde_json::from_slice(payload).context("parse metadata payload")?;
    state.validate().context("metadata state is inconsistent")?;
    Ok(state)
}
