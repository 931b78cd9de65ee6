//! Minimal IPP (RFC 8010) encoding for Get-Printer-Attributes.
//!
//! Only what fingerprinting needs: build one request, and decode the textual attributes of
//! the response. Non-text values are skipped.

pub const CONTENT_TYPE: &str = "application/ipp";

const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000B;

const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;
const TAG_END_OF_ATTRIBUTES: u8 = 0x03;

const VALUE_TEXT: u8 = 0x41;
const VALUE_NAME: u8 = 0x42;
const VALUE_KEYWORD: u8 = 0x44;
const VALUE_URI: u8 = 0x45;
const VALUE_URI_SCHEME: u8 = 0x46;
const VALUE_CHARSET: u8 = 0x47;
const VALUE_NATURAL_LANGUAGE: u8 = 0x48;
const VALUE_MIME_MEDIA_TYPE: u8 = 0x49;

/// Encode a Get-Printer-Attributes request asking for every attribute.
pub fn get_printer_attributes_request(printer_uri: &str, request_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + printer_uri.len());
    buf.extend_from_slice(&[0x01, 0x01]);
    buf.extend_from_slice(&OP_GET_PRINTER_ATTRIBUTES.to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.push(TAG_OPERATION_ATTRIBUTES);
    put_attribute(&mut buf, VALUE_CHARSET, "attributes-charset", "utf-8");
    put_attribute(&mut buf, VALUE_NATURAL_LANGUAGE, "attributes-natural-language", "en");
    put_attribute(&mut buf, VALUE_URI, "printer-uri", printer_uri);
    put_attribute(&mut buf, VALUE_KEYWORD, "requested-attributes", "all");
    buf.push(TAG_END_OF_ATTRIBUTES);
    buf
}

fn put_attribute(buf: &mut Vec<u8>, tag: u8, name: &str, value: &str) {
    buf.push(tag);
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppResponse {
    pub version: (u8, u8),
    pub status_code: u16,
    pub request_id: u32,
    /// Textual attributes in wire order. Additional values repeat the attribute name.
    pub attributes: Vec<(String, String)>,
}

impl IppResponse {
    /// `successful-ok` and its `...-ignored-or-substituted` variants.
    pub fn is_success(&self) -> bool {
        self.status_code < 0x0100
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(_, v)| v.as_str())
    }
}

/// Decode a response. Returns `None` when even the header is missing; a truncated attribute
/// section yields whatever was decoded before the cut.
pub fn parse_response(bytes: &[u8]) -> Option<IppResponse> {
    if bytes.len() < 8 {
        return None;
    }
    let mut resp = IppResponse {
        version: (bytes[0], bytes[1]),
        status_code: u16::from_be_bytes([bytes[2], bytes[3]]),
        request_id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        attributes: Vec::new(),
    };

    let mut pos = 8;
    let mut last_name = String::new();
    while let Some(&tag) = bytes.get(pos) {
        pos += 1;
        if tag == TAG_END_OF_ATTRIBUTES {
            break;
        }
        if tag <= 0x0F {
            // group delimiter
            continue;
        }
        let Some((name, next)) = read_field(bytes, pos) else { break };
        let Some((value, next)) = read_field(bytes, next) else { break };
        pos = next;
        if !name.is_empty() {
            last_name = String::from_utf8_lossy(name).into_owned();
        }
        if is_textual(tag) {
            resp.attributes
                .push((last_name.clone(), String::from_utf8_lossy(value).into_owned()));
        }
    }
    Some(resp)
}

fn read_field(bytes: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let len = u16::from_be_bytes([*bytes.get(pos)?, *bytes.get(pos + 1)?]) as usize;
    let start = pos + 2;
    let field = bytes.get(start..start + len)?;
    Some((field, start + len))
}

fn is_textual(tag: u8) -> bool {
    matches!(
        tag,
        VALUE_TEXT
            | VALUE_NAME
            | VALUE_KEYWORD
            | VALUE_URI
            | VALUE_URI_SCHEME
            | VALUE_CHARSET
            | VALUE_NATURAL_LANGUAGE
            | VALUE_MIME_MEDIA_TYPE
    )
}

/// Split an IEEE 1284 device id (`MFG:Canon;MDL:MF440 Series;CLS:PRINTER;`) into
/// manufacturer and model.
pub fn parse_device_id(device_id: &str) -> (Option<String>, Option<String>) {
    let mut mfg = None;
    let mut mdl = None;
    for field in device_id.split(';') {
        let Some((key, value)) = field.split_once(':') else { continue };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_uppercase().as_str() {
            "MFG" | "MANUFACTURER" => mfg = mfg.or_else(|| Some(value.to_string())),
            "MDL" | "MODEL" => mdl = mdl.or_else(|| Some(value.to_string())),
            _ => {}
        }
    }
    (mfg, mdl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, attrs: &[(u8, &str, &str)]) -> Vec<u8> {
        let mut buf = vec![0x01, 0x01];
        buf.extend_from_slice(&status.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(0x01);
        put_attribute(&mut buf, VALUE_CHARSET, "attributes-charset", "utf-8");
        buf.push(0x04);
        for (tag, name, value) in attrs {
            put_attribute(&mut buf, *tag, name, value);
        }
        buf.push(TAG_END_OF_ATTRIBUTES);
        buf
    }

    #[test]
    fn request_layout() {
        let req = get_printer_attributes_request("ipp://10.0.0.5:631/ipp/print", 1);
        assert_eq!(&req[..8], &[0x01, 0x01, 0x00, 0x0B, 0, 0, 0, 1]);
        assert_eq!(req[8], TAG_OPERATION_ATTRIBUTES);
        assert_eq!(*req.last().unwrap(), TAG_END_OF_ATTRIBUTES);
        // the charset attribute comes first, as the protocol requires
        assert_eq!(req[9], VALUE_CHARSET);
        assert_eq!(&req[12..30], b"attributes-charset");
        assert!(req
            .windows(b"ipp://10.0.0.5:631/ipp/print".len())
            .any(|w| w == b"ipp://10.0.0.5:631/ipp/print"));
    }

    #[test]
    fn decodes_text_attributes_and_additional_values() {
        let bytes = response(
            0x0000,
            &[
                (VALUE_TEXT, "printer-make-and-model", "Canon MF440 Series"),
                (VALUE_KEYWORD, "ipp-features-supported", "ipp-everywhere"),
                (VALUE_KEYWORD, "", "scan"),
                (0x23, "printer-state", "\0\0\0\x03"),
            ],
        );
        let resp = parse_response(&bytes).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.request_id, 7);
        assert_eq!(
            resp.attribute("printer-make-and-model"),
            Some("Canon MF440 Series")
        );
        let features: Vec<&str> = resp
            .attributes
            .iter()
            .filter(|(n, _)| n == "ipp-features-supported")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(features, vec!["ipp-everywhere", "scan"]);
        assert!(resp.attribute("printer-state").is_none());
    }

    #[test]
    fn truncated_body_keeps_decoded_prefix() {
        let mut bytes = response(
            0x0000,
            &[(VALUE_TEXT, "printer-info", "Front desk"), (VALUE_TEXT, "printer-location", "Lobby")],
        );
        bytes.truncate(bytes.len() - 4);
        let resp = parse_response(&bytes).unwrap();
        assert_eq!(resp.attribute("printer-info"), Some("Front desk"));
        assert!(resp.attribute("printer-location").is_none());
        assert!(parse_response(&[0x01, 0x01, 0x00]).is_none());
    }

    #[test]
    fn error_status_is_not_success() {
        let resp = parse_response(&response(0x0400, &[])).unwrap();
        assert!(!resp.is_success());
    }

    #[test]
    fn device_id_fields() {
        let (mfg, mdl) = parse_device_id("MFG:Brother;CMD:PJL,PCL;MDL:MFC-L2710DW series;CLS:PRINTER;");
        assert_eq!(mfg.as_deref(), Some("Brother"));
        assert_eq!(mdl.as_deref(), Some("MFC-L2710DW series"));
        assert_eq!(parse_device_id("garbage"), (None, None));
    }
}
