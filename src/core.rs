use memchr::{memchr, memchr2, memchr3};

use crate::error::{ParseError, ParseErrorKind};

const QUOTE: u8 = b'"';

#[inline]
pub(crate) fn trim_trailing_crlf(slice: &[u8]) -> &[u8] {
    let mut len = slice.len();

    let has_lf = len >= 1 && slice[len - 1] == b'\n';
    let has_crlf = has_lf && len >= 2 && slice[len - 2] == b'\r';

    len -= (has_lf as usize) + (has_crlf as usize);

    &slice[..len]
}

#[inline(always)]
pub(crate) fn trim_bom(slice: &[u8]) -> &[u8] {
    if slice.len() >= 3 && &slice[..3] == b"\xef\xbb\xbf" {
        &slice[3..]
    } else {
        slice
    }
}

fn utf8_field(bytes: Vec<u8>, start: usize) -> Result<String, ParseError> {
    String::from_utf8(bytes).map_err(|err| {
        ParseError::new(
            start + err.utf8_error().valid_up_to() + 1,
            ParseErrorKind::InvalidUtf8,
        )
    })
}

/// The sequential single-record parser the reading pipeline delegates to.
///
/// Consumes exactly one physical line (an optional trailing `\n` or `\r\n`
/// is trimmed); quoted fields therefore cannot span lines.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoreParser {
    pub(crate) delimiter: u8,
    pub(crate) lazy_quotes: bool,
    pub(crate) trim_leading_space: bool,
    pub(crate) trailing_comma: bool,
}

impl CoreParser {
    pub(crate) fn new(
        delimiter: u8,
        lazy_quotes: bool,
        trim_leading_space: bool,
        trailing_comma: bool,
    ) -> Self {
        Self {
            delimiter,
            lazy_quotes,
            trim_leading_space,
            trailing_comma,
        }
    }

    /// Parse one line into `fields`. Errors carry a 1-based byte column;
    /// the line attribute is left at 0 for the caller to stamp.
    pub(crate) fn parse_line(
        &self,
        line: &[u8],
        fields: &mut Vec<String>,
    ) -> Result<(), ParseError> {
        let line = trim_trailing_crlf(line);

        fields.clear();

        if line.is_empty() {
            return Ok(());
        }

        let mut pos: usize = 0;

        loop {
            if self.trim_leading_space {
                while pos < line.len() && (line[pos] == b' ' || line[pos] == b'\t') {
                    pos += 1;
                }
            }

            pos = if pos < line.len() && line[pos] == QUOTE {
                self.parse_quoted_field(line, pos, fields)?
            } else {
                self.parse_bare_field(line, pos, fields)?
            };

            if pos == line.len() {
                return Ok(());
            }

            // `pos` sits on the delimiter
            pos += 1;

            if pos == line.len() {
                if self.trailing_comma {
                    fields.push(String::new());
                    return Ok(());
                }

                return Err(ParseError::new(pos, ParseErrorKind::TrailingComma));
            }
        }
    }

    // Returns the position of the delimiter ending the field, or the line
    // length.
    fn parse_bare_field(
        &self,
        line: &[u8],
        mut pos: usize,
        fields: &mut Vec<String>,
    ) -> Result<usize, ParseError> {
        let start = pos;

        loop {
            match memchr2(self.delimiter, QUOTE, &line[pos..]) {
                Some(offset) if line[pos + offset] == QUOTE => {
                    if !self.lazy_quotes {
                        return Err(ParseError::new(
                            pos + offset + 1,
                            ParseErrorKind::BareQuote,
                        ));
                    }

                    // Lazily-quoted input keeps the quote as plain data.
                    pos += offset + 1;
                }
                Some(offset) => {
                    pos += offset;
                    fields.push(utf8_field(line[start..pos].to_vec(), start)?);
                    return Ok(pos);
                }
                None => {
                    fields.push(utf8_field(line[start..].to_vec(), start)?);
                    return Ok(line.len());
                }
            }
        }
    }

    fn parse_quoted_field(
        &self,
        line: &[u8],
        start: usize,
        fields: &mut Vec<String>,
    ) -> Result<usize, ParseError> {
        let mut pos = start + 1;
        let mut scratch: Vec<u8> = Vec::new();

        loop {
            match memchr(QUOTE, &line[pos..]) {
                None => {
                    // The closing quote never came.
                    if !self.lazy_quotes {
                        return Err(ParseError::new(start + 1, ParseErrorKind::Quote));
                    }

                    scratch.extend_from_slice(&line[pos..]);
                    fields.push(utf8_field(scratch, start)?);
                    return Ok(line.len());
                }
                Some(offset) => {
                    scratch.extend_from_slice(&line[pos..pos + offset]);
                    pos += offset + 1;

                    if pos == line.len() {
                        fields.push(utf8_field(scratch, start)?);
                        return Ok(pos);
                    }

                    let byte = line[pos];

                    if byte == QUOTE {
                        // Doubled quote, one literal quote of data.
                        scratch.push(QUOTE);
                        pos += 1;
                    } else if byte == self.delimiter {
                        fields.push(utf8_field(scratch, start)?);
                        return Ok(pos);
                    } else if self.lazy_quotes {
                        scratch.push(QUOTE);
                    } else {
                        return Err(ParseError::new(pos + 1, ParseErrorKind::Quote));
                    }
                }
            }
        }
    }
}

/// The sequential single-record encoder the writing pipeline delegates to.
///
/// Emits one record plus its line terminator. A field is quoted when it
/// contains the delimiter, a quote, a newline, or (in CRLF mode) a carriage
/// return. Inside quoted fields quotes are doubled; in CRLF mode an
/// embedded `\n` widens to `\r\n` and a bare `\r` is dropped.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoreEncoder {
    pub(crate) delimiter: u8,
    pub(crate) crlf: bool,
}

impl CoreEncoder {
    pub(crate) fn new(delimiter: u8, crlf: bool) -> Self {
        Self { delimiter, crlf }
    }

    pub(crate) fn encode_record(&self, record: &[String], out: &mut Vec<u8>) {
        for (i, field) in record.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }

            let field = field.as_bytes();

            if self.field_needs_quotes(field) {
                self.encode_quoted(field, out);
            } else {
                out.extend_from_slice(field);
            }
        }

        if self.crlf {
            out.extend_from_slice(b"\r\n");
        } else {
            out.push(b'\n');
        }
    }

    fn field_needs_quotes(&self, field: &[u8]) -> bool {
        memchr3(self.delimiter, QUOTE, b'\n', field).is_some()
            || (self.crlf && memchr(b'\r', field).is_some())
    }

    fn encode_quoted(&self, field: &[u8], out: &mut Vec<u8>) {
        out.push(QUOTE);

        for &byte in field {
            match byte {
                QUOTE => out.extend_from_slice(b"\"\""),
                b'\r' => {
                    if !self.crlf {
                        out.push(byte);
                    }
                }
                b'\n' => {
                    if self.crlf {
                        out.extend_from_slice(b"\r\n");
                    } else {
                        out.push(byte);
                    }
                }
                _ => out.push(byte),
            }
        }

        out.push(QUOTE);
    }
}
