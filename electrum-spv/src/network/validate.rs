//! Shape checks for server responses and caller arguments.
//!
//! The server is untrusted: every field is type and range checked before use and any
//! violation is reported as [`NetworkError::RequestCorrupted`].

use serde_json::{Map, Value};

use crate::error::{NetworkError, NetworkResult};

fn corrupted(what: impl Into<String>) -> NetworkError {
    NetworkError::RequestCorrupted(what.into())
}

pub fn non_negative_integer(value: &Value) -> NetworkResult<u64> {
    value.as_u64().ok_or_else(|| corrupted(format!("{} should be a non-negative integer", value)))
}

pub fn integer(value: &Value) -> NetworkResult<i64> {
    value.as_i64().ok_or_else(|| corrupted(format!("{} should be an integer", value)))
}

pub fn real_number(value: &Value) -> NetworkResult<f64> {
    value.as_f64().ok_or_else(|| corrupted(format!("{} should be a number", value)))
}

pub fn string(value: &Value) -> NetworkResult<&str> {
    value.as_str().ok_or_else(|| corrupted(format!("{} should be a string", value)))
}

pub fn hex_str(value: &Value) -> NetworkResult<&str> {
    let s = string(value)?;
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(corrupted(format!("{} should be a hex string", value)));
    }
    Ok(s)
}

/// A 32-byte hash in hex.
pub fn hash256_str(value: &Value) -> NetworkResult<&str> {
    let s = hex_str(value)?;
    if s.len() != 64 {
        return Err(corrupted(format!("{} should be a hash256 str", value)));
    }
    Ok(s)
}

pub fn object(value: &Value) -> NetworkResult<&Map<String, Value>> {
    value.as_object().ok_or_else(|| corrupted(format!("{} should be a dict", value)))
}

pub fn list(value: &Value) -> NetworkResult<&Vec<Value>> {
    value.as_array().ok_or_else(|| corrupted(format!("{} should be a list", value)))
}

pub fn field<'a>(map: &'a Map<String, Value>, key: &str) -> NetworkResult<&'a Value> {
    map.get(key).ok_or_else(|| corrupted(format!("missing field {:?}", key)))
}

/// Response to `blockchain.block.headers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub count: u32,
    pub hex: String,
    pub max: u32,
}

pub fn chunk_response(value: &Value) -> NetworkResult<ChunkResponse> {
    let map = object(value)?;
    let count = non_negative_integer(field(map, "count")?)?;
    let hex = hex_str(field(map, "hex")?)?;
    let max = non_negative_integer(field(map, "max")?)?;
    Ok(ChunkResponse {
        count: u32::try_from(count).map_err(|_| corrupted(format!("chunk count {} out of range", count)))?,
        hex: hex.to_string(),
        max: u32::try_from(max).unwrap_or(u32::MAX),
    })
}

/// Tip notification or `blockchain.headers.subscribe` result.
pub fn header_notification(value: &Value) -> NetworkResult<(u32, String)> {
    let map = object(value)?;
    let height = non_negative_integer(field(map, "height")?)?;
    let hex = hex_str(field(map, "hex")?)?;
    let height = u32::try_from(height).map_err(|_| corrupted(format!("height {} out of range", height)))?;
    Ok((height, hex.to_string()))
}

/// Merkle branch for a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub block_height: u64,
    pub merkle: Vec<String>,
    pub pos: u64,
}

pub fn merkle_proof(value: &Value) -> NetworkResult<MerkleProof> {
    let map = object(value)?;
    let block_height = non_negative_integer(field(map, "block_height")?)?;
    let merkle = list(field(map, "merkle")?)?
        .iter()
        .map(|item| hash256_str(item).map(str::to_string))
        .collect::<NetworkResult<_>>()?;
    let pos = non_negative_integer(field(map, "pos")?)?;
    Ok(MerkleProof {
        block_height,
        merkle,
        pos,
    })
}

/// One entry of a scripthash history. Unconfirmed entries (height 0 or -1) carry a fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub height: i64,
    pub tx_hash: String,
    pub fee: Option<u64>,
}

pub fn history(value: &Value) -> NetworkResult<Vec<HistoryItem>> {
    list(value)?
        .iter()
        .map(|item| {
            let map = object(item)?;
            let height = integer(field(map, "height")?)?;
            let tx_hash = hash256_str(field(map, "tx_hash")?)?.to_string();
            let fee = if height == 0 || height == -1 {
                Some(non_negative_integer(field(map, "fee")?)?)
            } else {
                None
            };
            Ok(HistoryItem {
                height,
                tx_hash,
                fee,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub tx_pos: u64,
    pub value: u64,
    pub tx_hash: String,
    pub height: u64,
}

pub fn listunspent(value: &Value) -> NetworkResult<Vec<Utxo>> {
    list(value)?
        .iter()
        .map(|item| {
            let map = object(item)?;
            Ok(Utxo {
                tx_pos: non_negative_integer(field(map, "tx_pos")?)?,
                value: non_negative_integer(field(map, "value")?)?,
                tx_hash: hash256_str(field(map, "tx_hash")?)?.to_string(),
                height: non_negative_integer(field(map, "height")?)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
}

pub fn balance(value: &Value) -> NetworkResult<Balance> {
    let map = object(value)?;
    Ok(Balance {
        confirmed: non_negative_integer(field(map, "confirmed")?)?,
        unconfirmed: non_negative_integer(field(map, "unconfirmed")?)?,
    })
}

/// Result of `blockchain.transaction.id_from_pos`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxidFromPos {
    Txid(String),
    WithMerkle {
        tx_hash: String,
        merkle: Vec<String>,
    },
}

pub fn txid_from_pos(value: &Value, with_merkle: bool) -> NetworkResult<TxidFromPos> {
    if !with_merkle {
        return Ok(TxidFromPos::Txid(hash256_str(value)?.to_string()));
    }
    let map = object(value)?;
    let tx_hash = hash256_str(field(map, "tx_hash")?)?.to_string();
    let merkle = list(field(map, "merkle")?)?
        .iter()
        .map(|item| hash256_str(item).map(str::to_string))
        .collect::<NetworkResult<_>>()?;
    Ok(TxidFromPos::WithMerkle {
        tx_hash,
        merkle,
    })
}

/// `server.version` must answer `[server_software, protocol_version]`.
pub fn server_version(value: &Value) -> NetworkResult<(String, String)> {
    match list(value)?.as_slice() {
        [software, protocol] => Ok((string(software)?.to_string(), string(protocol)?.to_string())),
        other => Err(corrupted(format!("unexpected server.version reply: {:?}", other))),
    }
}

/// Caller-supplied hashes are checked before any I/O.
pub fn require_hash256(arg: &str, name: &str) -> NetworkResult<()> {
    if arg.len() == 64 && arg.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(NetworkError::InvalidArgument(format!("{} {:?} is not a hash256 str", name, arg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "00000000000000000000000000000000000000000000000000000000000000ab";

    #[test]
    fn test_primitive_checks() {
        assert_eq!(non_negative_integer(&json!(5)).unwrap(), 5);
        assert!(non_negative_integer(&json!(-1)).is_err());
        assert!(non_negative_integer(&json!("5")).is_err());
        assert!(non_negative_integer(&json!(1.5)).is_err());
        assert_eq!(integer(&json!(-1)).unwrap(), -1);
        assert!(hex_str(&json!("abc")).is_err());
        assert!(hex_str(&json!("zz")).is_err());
        assert!(hash256_str(&json!("ab")).is_err());
        assert!(hash256_str(&json!(HASH)).is_ok());
    }

    #[test]
    fn test_chunk_response() {
        let chunk = chunk_response(&json!({"count": 1, "hex": "00".repeat(80), "max": 2016})).unwrap();
        assert_eq!(chunk.count, 1);
        assert_eq!(chunk.max, 2016);
        assert!(chunk_response(&json!({"count": -1, "hex": "", "max": 2016})).is_err());
        assert!(chunk_response(&json!({"hex": "", "max": 2016})).is_err());
        assert!(chunk_response(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_history_requires_fee_for_unconfirmed() {
        let items = history(&json!([
            {"height": 100, "tx_hash": HASH},
            {"height": 0, "tx_hash": HASH, "fee": 250},
            {"height": -1, "tx_hash": HASH, "fee": 300}
        ]))
        .unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].fee, None);
        assert_eq!(items[2].fee, Some(300));

        assert!(history(&json!([{"height": 0, "tx_hash": HASH}])).is_err());
        assert!(history(&json!([{"height": -1, "tx_hash": HASH, "fee": -5}])).is_err());
    }

    #[test]
    fn test_balance_and_utxos() {
        assert_eq!(
            balance(&json!({"confirmed": 10, "unconfirmed": 0})).unwrap(),
            Balance {
                confirmed: 10,
                unconfirmed: 0
            }
        );
        assert!(balance(&json!({"confirmed": -10, "unconfirmed": 0})).is_err());

        let utxos =
            listunspent(&json!([{"tx_pos": 1, "value": 5000, "tx_hash": HASH, "height": 7}])).unwrap();
        assert_eq!(utxos[0].value, 5000);
        assert!(listunspent(&json!([{"tx_pos": 1, "value": 5000, "tx_hash": "xx", "height": 7}])).is_err());
    }

    #[test]
    fn test_merkle_and_txid_from_pos() {
        let proof = merkle_proof(&json!({"block_height": 9, "merkle": [HASH], "pos": 2})).unwrap();
        assert_eq!(proof.merkle.len(), 1);
        assert!(merkle_proof(&json!({"block_height": 9, "merkle": ["00"], "pos": 2})).is_err());

        assert_eq!(txid_from_pos(&json!(HASH), false).unwrap(), TxidFromPos::Txid(HASH.into()));
        assert!(matches!(
            txid_from_pos(&json!({"tx_hash": HASH, "merkle": []}), true).unwrap(),
            TxidFromPos::WithMerkle { .. }
        ));
    }

    #[test]
    fn test_server_version() {
        let (software, protocol) = server_version(&json!(["ElectrumX 1.16", "1.4"])).unwrap();
        assert_eq!(software, "ElectrumX 1.16");
        assert_eq!(protocol, "1.4");
        assert!(server_version(&json!(["only one"])).is_err());
        assert!(server_version(&json!([1, "1.4"])).is_err());
    }
}
