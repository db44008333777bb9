//! Wire encoding for header lists (§3): ordered `(name, value)` string pairs carried
//! in METADATA frame bodies, including the reserved `grpc-status`/`grpc-message` keys.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

pub type HeaderList = Vec<(String, String)>;

pub fn encode(headers: &HeaderList) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(headers.len() as u16);
    for (name, value) in headers {
        let n = name.as_bytes();
        let v = value.as_bytes();
        buf.put_u16(n.len() as u16);
        buf.put_slice(n);
        buf.put_u16(v.len() as u16);
        buf.put_slice(v);
    }
    buf.freeze()
}

pub fn decode(mut buf: Bytes) -> HeaderList {
    let mut out = Vec::new();
    if buf.len() < 2 {
        return out;
    }
    let count = buf.get_u16();
    for _ in 0..count {
        if buf.len() < 2 {
            break;
        }
        let nlen = buf.get_u16() as usize;
        if buf.len() < nlen {
            break;
        }
        let name = String::from_utf8_lossy(&buf.split_to(nlen)).into_owned();
        if buf.len() < 2 {
            break;
        }
        let vlen = buf.get_u16() as usize;
        if buf.len() < vlen {
            break;
        }
        let value = String::from_utf8_lossy(&buf.split_to(vlen)).into_owned();
        out.push((name, value));
    }
    out
}

pub fn get<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .rev()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_list() {
        let headers = vec![
            (GRPC_STATUS.to_string(), "0".to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
        ];
        let bytes = encode(&headers);
        let decoded = decode(bytes);
        assert_eq!(decoded, headers);
    }

    #[test]
    fn last_occurrence_wins_for_duplicate_keys() {
        let headers = vec![
            (GRPC_STATUS.to_string(), "0".to_string()),
            (GRPC_STATUS.to_string(), "5".to_string()),
        ];
        assert_eq!(get(&headers, GRPC_STATUS), Some("5"));
    }
}
