//! DNS wire format for HTTPS (type 65) record lookups
//!
//! Hand-rolled query building and answer parsing, shared by the DoH
//! and UDP DNS paths. The parser handles the two classic traps in
//! responses from the wild:
//!
//! - NAME fields compressed with `0xC0`-prefixed pointers
//! - a Question section that has to be skipped label-by-label before
//!   the answers start
//!
//! From the first HTTPS RR the SvcParams are walked as
//! `{u16 key, u16 len, value}` triples and the value of key 5 (`ech`)
//! is returned verbatim — that value is the raw `ECHConfigList`.

use super::EchError;

/// DNS RR type for HTTPS records
pub const TYPE_HTTPS: u16 = 65;

/// SvcParamKey carrying the ECHConfigList
const SVC_PARAM_ECH: u16 = 5;

/// Build a standard DNS query for `domain` with the given QTYPE.
pub fn build_query(domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::with_capacity(512);

    // Header
    query.extend_from_slice(&[
        0x00, 0x01, // ID
        0x01, 0x00, // standard query, RD
        0x00, 0x01, // QDCOUNT = 1
        0x00, 0x00, // ANCOUNT
        0x00, 0x00, // NSCOUNT
        0x00, 0x00, // ARCOUNT
    ]);

    // QNAME
    for label in domain.split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);

    // QTYPE + QCLASS (IN)
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&[0x00, 0x01]);

    query
}

/// Parse a DNS response and extract the raw `ECHConfigList` from the
/// first HTTPS RR carrying an `ech` SvcParam.
pub fn parse_response(response: &[u8]) -> Result<Vec<u8>, EchError> {
    if response.len() < 12 {
        return Err(EchError::Malformed("response shorter than header".to_string()));
    }

    let ancount = u16::from_be_bytes([response[6], response[7]]);
    if ancount == 0 {
        return Err(EchError::NoEchParam);
    }

    // Skip the Question section label-by-label
    let mut offset = 12;
    while offset < response.len() && response[offset] != 0 {
        offset += response[offset] as usize + 1;
    }
    offset += 5; // root label + QTYPE + QCLASS

    for _ in 0..ancount {
        if offset >= response.len() {
            break;
        }

        // NAME: either a compression pointer or inline labels
        if response[offset] & 0xC0 == 0xC0 {
            offset += 2;
        } else {
            while offset < response.len() && response[offset] != 0 {
                offset += response[offset] as usize + 1;
            }
            offset += 1;
        }

        if offset + 10 > response.len() {
            break;
        }

        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        offset += 8; // TYPE + CLASS + TTL
        let rdata_len = u16::from_be_bytes([response[offset], response[offset + 1]]) as usize;
        offset += 2;

        if offset + rdata_len > response.len() {
            break;
        }
        let rdata = &response[offset..offset + rdata_len];
        offset += rdata_len;

        if rr_type == TYPE_HTTPS {
            if let Some(ech) = parse_https_rdata(rdata) {
                return Ok(ech);
            }
        }
    }

    Err(EchError::NoEchParam)
}

/// Walk an HTTPS RR's RDATA and return the value of SvcParamKey 5.
fn parse_https_rdata(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 2 {
        return None;
    }

    // SvcPriority
    let mut offset = 2;

    // TargetName: root byte or dotted labels
    if offset < data.len() && data[offset] == 0 {
        offset += 1;
    } else {
        while offset < data.len() && data[offset] != 0 {
            offset += data[offset] as usize + 1;
        }
        offset += 1;
    }

    // SvcParams: {u16 key, u16 len, value}
    while offset + 4 <= data.len() {
        let key = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + len > data.len() {
            break;
        }
        let value = &data[offset..offset + len];
        offset += len;

        if key == SVC_PARAM_ECH {
            return Some(value.to_vec());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    const ECH_VALUE: &[u8] = &[0x00, 0x08, 0xfe, 0x0d, 0x00, 0x04, 0xaa, 0xbb, 0xcc, 0xdd];

    /// HTTPS RDATA: priority 1, root target, two SvcParams (alpn + ech)
    fn sample_rdata() -> Vec<u8> {
        let mut rdata = vec![0x00, 0x01, 0x00];
        // key=1 (alpn), value "\x02h2"
        rdata.extend_from_slice(&[0x00, 0x01, 0x00, 0x03, 0x02, b'h', b'2']);
        // key=5 (ech)
        rdata.extend_from_slice(&[0x00, 0x05]);
        rdata.extend_from_slice(&(ECH_VALUE.len() as u16).to_be_bytes());
        rdata.extend_from_slice(ECH_VALUE);
        rdata
    }

    /// Assemble a response with a compressed answer NAME pointing at
    /// the question.
    fn sample_response(domain: &str, rdata: &[u8]) -> Vec<u8> {
        let mut msg = vec![
            0x00, 0x01, // ID
            0x81, 0x80, // response, RD+RA
            0x00, 0x01, // QDCOUNT
            0x00, 0x01, // ANCOUNT
            0x00, 0x00, 0x00, 0x00,
        ];
        for label in domain.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0x00);
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x01]);

        // Answer: NAME = pointer to offset 12
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x01]); // CLASS IN
        msg.extend_from_slice(&[0x00, 0x00, 0x0E, 0x10]); // TTL
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(rdata);
        msg
    }

    #[test]
    fn test_build_query_layout() {
        let q = build_query("cloudflare-ech.com", TYPE_HTTPS);

        // QDCOUNT = 1
        assert_eq!(&q[4..6], &[0x00, 0x01]);
        // First label
        assert_eq!(q[12] as usize, "cloudflare-ech".len());
        assert_eq!(&q[13..27], b"cloudflare-ech");
        // Trailing QTYPE/QCLASS
        let tail = &q[q.len() - 4..];
        assert_eq!(tail, &[0x00, 65, 0x00, 0x01]);
    }

    #[test]
    fn test_parse_response_extracts_ech() {
        let msg = sample_response("cloudflare-ech.com", &sample_rdata());
        let parsed = parse_response(&msg).unwrap();
        assert_eq!(parsed, ECH_VALUE);
        // The base64 image matches what the HTTPS RR advertised
        assert_eq!(STANDARD.encode(&parsed), STANDARD.encode(ECH_VALUE));
    }

    #[test]
    fn test_parse_response_uncompressed_name() {
        // Same answer but with the NAME spelled out instead of a pointer
        let rdata = sample_rdata();
        let mut msg = vec![
            0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in "example.com".split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0x00);
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x01]);
        for label in "example.com".split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0x00);
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x01]);
        msg.extend_from_slice(&[0x00, 0x00, 0x0E, 0x10]);
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(&rdata);

        assert_eq!(parse_response(&msg).unwrap(), ECH_VALUE);
    }

    #[test]
    fn test_parse_response_no_answers() {
        let mut msg = sample_response("example.com", &sample_rdata());
        msg[6] = 0;
        msg[7] = 0;
        assert!(matches!(parse_response(&msg), Err(EchError::NoEchParam)));
    }

    #[test]
    fn test_parse_response_https_record_without_ech() {
        // Only an alpn SvcParam — no key=5
        let mut rdata = vec![0x00, 0x01, 0x00];
        rdata.extend_from_slice(&[0x00, 0x01, 0x00, 0x03, 0x02, b'h', b'2']);
        let msg = sample_response("example.com", &rdata);
        assert!(matches!(parse_response(&msg), Err(EchError::NoEchParam)));
    }

    #[test]
    fn test_parse_response_truncated() {
        let msg = sample_response("example.com", &sample_rdata());
        assert!(parse_response(&msg[..8]).is_err());
    }

    #[test]
    fn test_parse_rdata_with_named_target() {
        // TargetName = "svc.example.com" instead of root
        let mut rdata = vec![0x00, 0x01];
        for label in "svc.example.com".split('.') {
            rdata.push(label.len() as u8);
            rdata.extend_from_slice(label.as_bytes());
        }
        rdata.push(0x00);
        rdata.extend_from_slice(&[0x00, 0x05]);
        rdata.extend_from_slice(&(ECH_VALUE.len() as u16).to_be_bytes());
        rdata.extend_from_slice(ECH_VALUE);

        assert_eq!(parse_https_rdata(&rdata).unwrap(), ECH_VALUE);
    }
}
