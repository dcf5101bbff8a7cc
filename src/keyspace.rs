//! Key Namespace Router
//!
//! Client keys are flat byte strings carrying an optional table prefix:
//!
//! ```text
//! "orders:42"  ->  table "orders",    name "42"
//! "42"         ->  table "__default", name "42"
//! ":42"        ->  table "__default", name ":42"
//! "orders:"    ->  table "orders",    name "\0"
//! ```
//!
//! Only the first colon delimits. A colon at position 0 is not a split, so the
//! key keeps its colon and lands in the default table. An empty name is
//! replaced with a single NUL byte: zero-length storage keys and the NUL
//! sentinel are different keys downstream.

use bytes::Bytes;

/// Table that unqualified keys belong to.
pub const DEFAULT_TABLE: &str = "__default";

/// Name substituted when the part after the delimiter is empty.
pub const EMPTY_NAME_SENTINEL: &[u8] = b"\0";

/// Delimiter between the table and the name.
pub const TABLE_DELIMITER: u8 = b':';

/// Splits a namespaced key into `(table, name)`.
///
/// Every byte string has a valid decomposition, so this never fails.
///
/// # Example
///
/// ```
/// use reapkv::keyspace::split_key;
///
/// let (table, name) = split_key(b"orders:42");
/// assert_eq!(&table[..], b"orders");
/// assert_eq!(&name[..], b"42");
/// ```
pub fn split_key(key: &[u8]) -> (Bytes, Bytes) {
    match key.iter().position(|&b| b == TABLE_DELIMITER) {
        Some(i) if i > 0 => {
            let table = Bytes::copy_from_slice(&key[..i]);
            (table, name_or_sentinel(&key[i + 1..]))
        }
        Some(_) if key.len() == 1 => (
            Bytes::from_static(DEFAULT_TABLE.as_bytes()),
            Bytes::from_static(EMPTY_NAME_SENTINEL),
        ),
        _ => (
            Bytes::from_static(DEFAULT_TABLE.as_bytes()),
            Bytes::copy_from_slice(key),
        ),
    }
}

#[inline]
fn name_or_sentinel(name: &[u8]) -> Bytes {
    if name.is_empty() {
        Bytes::from_static(EMPTY_NAME_SENTINEL)
    } else {
        Bytes::copy_from_slice(name)
    }
}

/// Builds the namespaced key the write path registers.
///
/// Keys in the default table are stored bare, so `join_key` followed by
/// [`split_key`] gives back the same pair for any name that does not itself
/// start with a colon.
pub fn join_key(table: &[u8], name: &[u8]) -> Bytes {
    if table == DEFAULT_TABLE.as_bytes() {
        return Bytes::copy_from_slice(name);
    }
    let mut key = Vec::with_capacity(table.len() + 1 + name.len());
    key.extend_from_slice(table);
    key.push(TABLE_DELIMITER);
    key.extend_from_slice(name);
    Bytes::from(key)
}

/// Name of the storage structure backing a table.
pub fn table_db_name(table: &[u8]) -> String {
    format!("{}.db", String::from_utf8_lossy(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(key: &str) -> (Bytes, Bytes) {
        split_key(key.as_bytes())
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split("orders:42"), (Bytes::from("orders"), Bytes::from("42")));
    }

    #[test]
    fn test_split_unqualified() {
        assert_eq!(split("42"), (Bytes::from(DEFAULT_TABLE), Bytes::from("42")));
    }

    #[test]
    fn test_split_leading_colon_kept_in_name() {
        assert_eq!(split(":42"), (Bytes::from(DEFAULT_TABLE), Bytes::from(":42")));
    }

    #[test]
    fn test_split_empty_name_uses_sentinel() {
        let (table, name) = split("orders:");
        assert_eq!(table, Bytes::from("orders"));
        assert_eq!(&name[..], b"\0");
        assert_ne!(name, Bytes::new());

        let (table, name) = split(":");
        assert_eq!(table, Bytes::from(DEFAULT_TABLE));
        assert_eq!(&name[..], b"\0");
    }

    #[test]
    fn test_split_only_first_colon_delimits() {
        assert_eq!(split("a:b:c"), (Bytes::from("a"), Bytes::from("b:c")));
    }

    #[test]
    fn test_split_empty_key_is_not_a_split() {
        assert_eq!(split(""), (Bytes::from(DEFAULT_TABLE), Bytes::new()));
    }

    #[test]
    fn test_split_binary_key() {
        let key = [0xffu8, 0x00, b':', 0x01];
        let (table, name) = split_key(&key);
        assert_eq!(&table[..], &[0xff, 0x00]);
        assert_eq!(&name[..], &[0x01]);
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(b"orders", b"42"), Bytes::from("orders:42"));
        assert_eq!(join_key(DEFAULT_TABLE.as_bytes(), b"42"), Bytes::from("42"));

        let key = join_key(b"users", b"alice");
        assert_eq!(split_key(&key), (Bytes::from("users"), Bytes::from("alice")));
    }

    #[test]
    fn test_table_db_name() {
        assert_eq!(table_db_name(b"orders"), "orders.db");
        assert_eq!(table_db_name(DEFAULT_TABLE.as_bytes()), "__default.db");
    }
}
