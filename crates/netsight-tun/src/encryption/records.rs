//! TLS record framing and ClientHello inspection.

/// Record header: type, version, length.
pub const RECORD_HEADER_LEN: usize = 5;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_HOST: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    ChangeCipherSpec,
    Alert,
    /// Handshake record with the type of its first message, if present.
    Handshake(Option<u8>),
    ApplicationData,
}

impl RecordType {
    pub fn of(record: &[u8]) -> Option<Self> {
        match *record.first()? {
            0x14 => Some(RecordType::ChangeCipherSpec),
            0x15 => Some(RecordType::Alert),
            0x16 => Some(RecordType::Handshake(record.get(RECORD_HEADER_LEN).copied())),
            0x17 => Some(RecordType::ApplicationData),
            _ => None,
        }
    }

    pub fn is_client_hello(self) -> bool {
        self == RecordType::Handshake(Some(HANDSHAKE_CLIENT_HELLO))
    }
}

/// A record stream that cannot be TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRecord(pub u8);

/// Splits one direction of a TLS stream into whole records.
///
/// Header snippets shorter than five bytes and records whose stated length
/// has not arrived yet are held back until the following payload.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    pending: Vec<u8>,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every record completed by them. On an
    /// invalid record type all held bytes stay pending.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, InvalidRecord> {
        self.pending.extend_from_slice(bytes);

        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let rest = &self.pending[offset..];
            let Some(&record_type) = rest.first() else {
                break;
            };
            if !(0x14..=0x17).contains(&record_type) {
                // nothing is consumed; take_pending returns the whole stream
                return Err(InvalidRecord(record_type));
            }
            if rest.len() < RECORD_HEADER_LEN {
                break;
            }
            let stated = u16::from_be_bytes([rest[3], rest[4]]) as usize;
            let total = RECORD_HEADER_LEN + stated;
            if rest.len() < total {
                break;
            }
            records.push(rest[..total].to_vec());
            offset += total;
        }

        self.pending.drain(..offset);
        Ok(records)
    }

    /// Bytes held back waiting for the rest of a record.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Give up framing and hand back whatever is held.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Server name from the SNI extension of a ClientHello record.
pub fn parse_sni(record: &[u8]) -> Option<String> {
    if !RecordType::of(record)?.is_client_hello() {
        return None;
    }

    // record header (5) + handshake header (4) + version (2) + random (32)
    let mut pos = RECORD_HEADER_LEN + 4 + 2 + 32;

    let session_len = *record.get(pos)? as usize;
    pos += 1 + session_len;

    let cipher_len = read_u16(record, pos)? as usize;
    pos += 2 + cipher_len;

    let compression_len = *record.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(record, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(record.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(record, pos)?;
        let ext_len = read_u16(record, pos + 2)? as usize;
        pos += 4;

        if ext_type == EXTENSION_SERVER_NAME {
            let ext = record.get(pos..pos + ext_len)?;
            return first_host_name(ext);
        }
        pos += ext_len;
    }

    None
}

fn first_host_name(ext: &[u8]) -> Option<String> {
    let list_len = read_u16(ext, 0)? as usize;
    let list = ext.get(2..2 + list_len)?;

    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = read_u16(list, pos + 1)? as usize;
        let name = list.get(pos + 3..pos + 3 + name_len)?;
        if name_type == SERVER_NAME_HOST {
            return std::str::from_utf8(name).ok().map(|s| s.to_ascii_lowercase());
        }
        pos += 3 + name_len;
    }
    None
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal ClientHello record carrying an SNI for `host`.
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();

        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list length
        sni.push(SERVER_NAME_HOST);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = Vec::new();
        // an unrelated extension first: supported_versions
        extensions.extend_from_slice(&[0x00, 0x2B, 0x00, 0x03, 0x02, 0x03, 0x04]);
        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy version
        body.extend_from_slice(&[0xAB; 32]); // random
        body.push(0x00); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_sni_extracted() {
        assert_eq!(parse_sni(&client_hello("Example.com")).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_sni_missing_or_truncated() {
        let record = client_hello("example.com");
        assert!(parse_sni(&record[..50]).is_none());

        #[rustfmt::skip]
        let app_data = [
            0x17, 0x03, 0x03, 0x00, 0x02, // application data
            0xDE, 0xAD,
        ];
        assert!(parse_sni(&app_data).is_none());
    }

    #[test]
    fn test_record_types() {
        let hello = client_hello("a.b");
        assert!(RecordType::of(&hello).unwrap().is_client_hello());
        assert_eq!(RecordType::of(&[0x15, 0x03, 0x03]), Some(RecordType::Alert));
        assert_eq!(RecordType::of(&[0x16, 0x03, 0x03, 0x00, 0x00]), Some(RecordType::Handshake(None)));
        assert_eq!(RecordType::of(&[0x42]), None);
    }

    #[test]
    fn test_assembler_waits_for_stated_length() {
        let hello = client_hello("example.com");
        let mut assembler = RecordAssembler::new();

        assert!(assembler.push(&hello[..3]).unwrap().is_empty());
        assert!(assembler.push(&hello[3..20]).unwrap().is_empty());
        assert_eq!(assembler.pending(), 20);

        let records = assembler.push(&hello[20..]).unwrap();
        assert_eq!(records, vec![hello]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_splits_concatenated_records() {
        #[rustfmt::skip]
        let bytes = [
            0x14, 0x03, 0x03, 0x00, 0x01, 0x01, // change cipher spec
            0x17, 0x03, 0x03, 0x00, 0x03, 0x01, 0x02, 0x03, // app data
            0x17, 0x03, // start of the next header
        ];
        let mut assembler = RecordAssembler::new();
        let records = assembler.push(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], &bytes[6..14]);
        assert_eq!(assembler.pending(), 2);

        let records = assembler.push(&[0x03, 0x00, 0x01, 0xFF]).unwrap();
        assert_eq!(records, vec![vec![0x17, 0x03, 0x03, 0x00, 0x01, 0xFF]]);
    }

    #[test]
    fn test_assembler_rejects_invalid_type() {
        let mut assembler = RecordAssembler::new();
        assert_eq!(assembler.push(b"GET / HTTP/1.1\r\n"), Err(InvalidRecord(b'G')));
        assert_eq!(assembler.take_pending(), b"GET / HTTP/1.1\r\n");
    }
}
