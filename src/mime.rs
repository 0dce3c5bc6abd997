//! MIME building blocks: parts, multipart envelopes and transfer encodings
//!
//! Only the composing direction is implemented. Parts keep their headers in
//! insertion order; header names compare case-insensitively.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

/// Maximum encoded line length for base64 and quoted-printable bodies
pub const MAX_LINE_LEN: usize = 76;

const CRLF: &[u8] = b"\r\n";
const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// A single MIME part: ordered headers plus a raw body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MimePart {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MimePart {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Builder-style variant of [`MimePart::set_header`]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Set a header, replacing any existing header with the same name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize the header block, the separating blank line and the body
    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_header_block(out, self.headers());
        out.extend_from_slice(&self.body);
    }
}

/// Write `Name: value` lines followed by the blank line that ends a header block.
///
/// Values are written verbatim; no folding or escaping is applied.
pub fn write_header_block<'a>(out: &mut Vec<u8>, headers: impl IntoIterator<Item = (&'a str, &'a str)>) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(CRLF);
}

/// Streams parts into a `multipart/*` body separated by `boundary`
#[derive(Debug)]
pub struct MultipartWriter {
    out: Vec<u8>,
    boundary: String,
    parts: usize,
}

impl MultipartWriter {
    /// Continue writing into `out`, which normally already holds the
    /// top-level header block.
    pub fn new(out: Vec<u8>, boundary: impl Into<String>) -> Self {
        Self {
            out,
            boundary: boundary.into(),
            parts: 0,
        }
    }

    pub fn append(&mut self, part: &MimePart) {
        if self.parts > 0 {
            self.out.extend_from_slice(CRLF);
        }
        self.out.extend_from_slice(b"--");
        self.out.extend_from_slice(self.boundary.as_bytes());
        self.out.extend_from_slice(CRLF);
        part.write_to(&mut self.out);
        self.parts += 1;
    }

    /// Write the closing delimiter and hand back the finished bytes
    pub fn finish(mut self) -> Vec<u8> {
        if self.parts > 0 {
            self.out.extend_from_slice(CRLF);
        }
        self.out.extend_from_slice(b"--");
        self.out.extend_from_slice(self.boundary.as_bytes());
        self.out.extend_from_slice(b"--");
        self.out.extend_from_slice(CRLF);
        self.out
    }
}

/// Random multipart boundary, unique per message
pub fn generate_boundary() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Base64-encode `data` and wrap it at [`MAX_LINE_LEN`] with CRLF after every line
pub fn wrap_base64(data: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(data);
    let mut out = Vec::with_capacity(encoded.len() + (encoded.len() / MAX_LINE_LEN + 1) * 2);
    for line in encoded.as_bytes().chunks(MAX_LINE_LEN) {
        out.extend_from_slice(line);
        out.extend_from_slice(CRLF);
    }
    out
}

/// Quoted-printable encode text.
///
/// Hard line breaks (`\n`, `\r\n` or a lone `\r`) become CRLF, whitespace at
/// the end of a line is escaped, and long lines get `=` soft breaks so no
/// encoded line exceeds [`MAX_LINE_LEN`] characters.
pub fn encode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 8);
    let mut line_len = 0usize;
    let mut i = 0usize;

    while i < input.len() {
        let byte = input[i];

        if byte == b'\r' || byte == b'\n' {
            out.extend_from_slice(CRLF);
            line_len = 0;
            i += if byte == b'\r' && input.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
            continue;
        }

        let at_line_end = matches!(input.get(i + 1), None | Some(b'\r') | Some(b'\n'));
        let literal = match byte {
            b' ' | b'\t' => !at_line_end,
            b'=' => false,
            b'!'..=b'~' => true,
            _ => false,
        };
        let token_len = if literal { 1 } else { 3 };

        // One column stays reserved for the soft-break '='
        if line_len + token_len > MAX_LINE_LEN - 1 {
            out.extend_from_slice(b"=\r\n");
            line_len = 0;
        }

        if literal {
            out.push(byte);
        } else {
            out.push(b'=');
            out.push(HEX[(byte >> 4) as usize]);
            out.push(HEX[(byte & 0x0f) as usize]);
        }
        line_len += token_len;
        i += 1;
    }

    out
}
