use std::path::Path;

use serde_json::Value;

use crate::Record;

/// Framing convention used to find complete records inside a growing file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordShape {
    /// Newline-delimited text; every terminated, non-blank line is a record.
    Lines,
    /// Concatenated JSON objects with no delimiter between them.
    JsonObjects,
}

impl RecordShape {
    /// `.json` files hold concatenated objects; everything else is line-delimited.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::JsonObjects,
            _ => Self::Lines,
        }
    }
}

/// Result of one [`scan`] over a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutput<'a> {
    pub records: Vec<Record>,
    /// Unconsumed tail; prepend it to the next chunk.
    pub remainder: &'a [u8],
    /// Balanced `{...}` spans that failed to parse and were skipped.
    pub malformed: usize,
}

impl ScanOutput<'_> {
    pub fn consumed(&self, buffer_len: usize) -> usize {
        buffer_len - self.remainder.len()
    }
}

/// Extracts every complete record from `buffer`.
///
/// Bytes that cannot yet be classified (a partial line, an open object, an open string
/// between objects) are returned as `remainder`. Scanning `a ++ b` yields the same records
/// as scanning `a` and then `remainder(a) ++ b`.
pub fn scan(buffer: &[u8], shape: RecordShape) -> ScanOutput<'_> {
    match shape {
        RecordShape::Lines => scan_lines(buffer),
        RecordShape::JsonObjects => scan_objects(buffer),
    }
}

/// Scans `buffer` as the last bytes a file will ever receive.
///
/// For [`RecordShape::Lines`] a trailing unterminated line is emitted as a record. For
/// [`RecordShape::JsonObjects`] an unterminated object can never complete and is dropped;
/// its length is reported in the returned count.
pub fn finish(buffer: &[u8], shape: RecordShape) -> (Vec<Record>, usize) {
    let output = scan(buffer, shape);
    let mut records = output.records;
    match shape {
        RecordShape::Lines => {
            if let Some(record) = line_record(output.remainder) {
                records.push(record);
            }
            (records, 0)
        }
        RecordShape::JsonObjects => {
            let dropped = if output.remainder.iter().all(u8::is_ascii_whitespace) {
                0
            } else {
                output.remainder.len()
            };
            (records, dropped)
        }
    }
}

fn scan_lines(buffer: &[u8]) -> ScanOutput<'_> {
    let Some(last_newline) = buffer.iter().rposition(|b| *b == b'\n') else {
        return ScanOutput {
            records: Vec::new(),
            remainder: buffer,
            malformed: 0,
        };
    };

    let records = buffer[..last_newline]
        .split(|b| *b == b'\n')
        .filter_map(line_record)
        .collect();

    ScanOutput {
        records,
        remainder: &buffer[last_newline + 1..],
        malformed: 0,
    }
}

fn line_record(line: &[u8]) -> Option<Record> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(Record::Text(trimmed.to_string()))
    }
}

fn scan_objects(buffer: &[u8]) -> ScanOutput<'_> {
    let mut records = Vec::new();
    let mut malformed = 0;

    let mut lexer = Lexer::default();
    let mut object_start = 0usize;
    // Index just past the last byte after which the scanner was back in its initial state.
    let mut settled = 0usize;

    for (idx, &byte) in buffer.iter().enumerate() {
        match lexer.step(byte) {
            Boundary::Open => object_start = idx,
            Boundary::Close => {
                match serde_json::from_slice::<Value>(&buffer[object_start..=idx]) {
                    Ok(value) => records.push(Record::Object(value)),
                    Err(_) => malformed += 1,
                }
            }
            Boundary::None => {}
        }

        if lexer.is_settled() {
            settled = idx + 1;
        }
    }

    ScanOutput {
        records,
        remainder: &buffer[settled..],
        malformed,
    }
}

/// Brace and string tracking shared by [`scan`] and [`OpenRecord`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
struct Lexer {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

enum Boundary {
    None,
    /// A top-level object starts at this byte.
    Open,
    /// The current top-level object ends at this byte.
    Close,
}

impl Lexer {
    fn step(&mut self, byte: u8) -> Boundary {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return Boundary::None;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' => {
                self.depth += 1;
                if self.depth == 1 {
                    return Boundary::Open;
                }
            }
            // A stray `}` at depth 0 is noise between objects.
            b'}' if self.depth > 0 => {
                self.depth -= 1;
                if self.depth == 0 {
                    return Boundary::Close;
                }
            }
            _ => {}
        }
        Boundary::None
    }

    fn is_settled(&self) -> bool {
        self.depth == 0 && !self.in_string
    }
}

/// Scanner position inside a record whose leading bytes were thrown away.
///
/// Built from a [`scan`] remainder that is too large to keep. Feeding the following bytes
/// to [`OpenRecord::skip_rest`] finds where that record ends, so scanning can resume at a
/// record boundary instead of in the middle of one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OpenRecord {
    shape: RecordShape,
    lexer: Lexer,
}

impl OpenRecord {
    /// State at the end of `remainder`.
    pub fn at_end_of(remainder: &[u8], shape: RecordShape) -> Self {
        let mut lexer = Lexer::default();
        if shape == RecordShape::JsonObjects {
            for &byte in remainder {
                lexer.step(byte);
            }
        }
        Self { shape, lexer }
    }

    /// Consumes the rest of the open record from the front of `buffer`.
    ///
    /// Returns how many bytes of `buffer` belonged to it, or `None` when the record is still
    /// open at the end of `buffer`.
    pub fn skip_rest(&mut self, buffer: &[u8]) -> Option<usize> {
        match self.shape {
            RecordShape::Lines => buffer.iter().position(|b| *b == b'\n').map(|idx| idx + 1),
            RecordShape::JsonObjects => {
                for (idx, &byte) in buffer.iter().enumerate() {
                    self.lexer.step(byte);
                    if self.lexer.is_settled() {
                        return Some(idx + 1);
                    }
                }
                None
            }
        }
    }
}
