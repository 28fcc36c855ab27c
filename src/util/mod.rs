//! util — общие утилиты.
//!
//! Содержит:
//! - now_unix_ms(): текущее Unix-время в миллисекундах.
//! - random_hex(): случайный hex-суффикс для staging/rm-каталогов.
//! - fs: атомарная запись, копирование дерева, disk usage, RAII-очистка.
//! - tool: запуск внешних утилит (btrfs, zfs) с разбором ошибок.

pub mod fs;
pub mod tool;

use std::time::{SystemTime, UNIX_EPOCH};

/// Текущее Unix-время в миллисекундах.
#[inline]
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Случайная hex-строка длиной 2*n_bytes.
pub fn random_hex(n_bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n_bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex_encode(&buf)
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_ms_monotonic_nonzero() {
        let a = now_unix_ms();
        let b = now_unix_ms();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn random_hex_len_and_alphabet() {
        let s = random_hex(8);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(random_hex(8), random_hex(8));
    }

    #[test]
    fn hex_encode_known() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
