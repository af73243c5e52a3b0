//! HTTP(S) tracker announce (BEP 3, compact peers only).

use crate::bencode::{self, Value};
use crate::error::TrackerError;

use super::{parse_compact_peers, AnnounceParams, AnnounceResult};

/// Percent-encodes `bytes` byte-by-byte as `%HH`, which is what a raw
/// 20-byte info-hash needs (it is not valid UTF-8 in general, so the
/// ordinary URL-encoder's notion of "safe characters" does not apply).
pub fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub async fn announce(
    client: &reqwest::Client,
    announce_url: &str,
    params: &AnnounceParams<'_>,
) -> Result<AnnounceResult, TrackerError> {
    let url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1{}",
        announce_url,
        percent_encode_bytes(params.info_hash),
        percent_encode_bytes(params.peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        if params.event.as_http_str().is_empty() {
            String::new()
        } else {
            format!("&event={}", params.event.as_http_str())
        },
    );

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(TrackerError::HttpStatus(response.status().as_u16()));
    }
    let body = response.bytes().await?;
    parse_announce_response(&body)
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResult, TrackerError> {
    let decoded = bencode::decode(body)?;
    let dict = decoded
        .as_dict()
        .ok_or_else(|| TrackerError::Malformed("response is not a dictionary".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(Value::as_text) {
        return Err(TrackerError::Malformed(reason.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(Value::as_int)
        .unwrap_or(1800) as u32;

    let peers_bytes = dict
        .get(b"peers".as_slice())
        .and_then(Value::as_raw_bytes)
        .ok_or_else(|| TrackerError::Malformed("missing compact `peers`".into()))?;

    Ok(AnnounceResult {
        peers: parse_compact_peers(peers_bytes),
        interval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encodes_info_hash_bytes() {
        let encoded = percent_encode_bytes(&[0x00, 0x1a, 0xff, b'A']);
        assert_eq!(encoded, "%00%1A%FFA");
    }

    #[test]
    fn parses_compact_peer_response() {
        // Scenario 6 from the spec.
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"interval".to_vec(), Value::Int(900));
        dict.insert(
            b"peers".to_vec(),
            Value::Bytes(vec![0x7f, 0x00, 0x00, 0x01, 0x1a, 0xe1]),
        );
        let body = bencode::encode(&Value::Dict(dict));

        let result = parse_announce_response(&body).unwrap();
        assert_eq!(result.interval, 900);
        assert_eq!(result.peers.len(), 1);
        assert_eq!(result.peers[0].ip().to_string(), "127.0.0.1");
        assert_eq!(result.peers[0].port(), 6881);
    }

    #[test]
    fn surfaces_failure_reason() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"failure reason".to_vec(),
            Value::Text("not registered".into()),
        );
        let body = bencode::encode(&Value::Dict(dict));
        assert!(parse_announce_response(&body).is_err());
    }
}
