//! Forward-only line reader over a raw byte stream.
//!
//! The reader sniffs a byte-order mark first; when one is present it wins
//! over the declared encoding. UTF-8 input is read directly, anything else
//! is transcoded to UTF-8 on the fly through `encoding_rs`.

use std::io::{self, BufRead, BufReader, Read};

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};

/// Read buffer size for the source stream (1 MiB).
const READ_BUFFER_SIZE: usize = 1 << 20;

/// Input block size fed to the transcoder.
const DECODE_BLOCK_SIZE: usize = 64 * 1024;

/// Reads a header line followed by a lazy sequence of data lines.
///
/// Lines are returned without their `\n` / `\r\n` terminator. Pass
/// `&mut source` to keep using the underlying resource afterwards.
pub struct LineReader<R: Read> {
    inner: Inner<R>,
    encoding: &'static Encoding,
    lines_read: u64,
    buf: String,
}

enum Inner<R: Read> {
    Utf8(BufReader<R>),
    Transcoded(BufReader<TranscodingReader<BufReader<R>>>),
}

impl<R: Read> LineReader<R> {
    /// Wraps `source`, detecting a byte-order mark before falling back to
    /// `declared`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the first block cannot be read.
    pub fn new(source: R, declared: &'static Encoding) -> io::Result<Self> {
        let mut buffered = BufReader::with_capacity(READ_BUFFER_SIZE, source);
        let (encoding, bom_len) = {
            let head = buffered.fill_buf()?;
            Encoding::for_bom(head).unwrap_or((declared, 0))
        };
        buffered.consume(bom_len);

        let inner = if encoding == UTF_8 {
            Inner::Utf8(buffered)
        } else {
            Inner::Transcoded(BufReader::with_capacity(
                READ_BUFFER_SIZE,
                TranscodingReader::new(buffered, encoding),
            ))
        };

        Ok(Self {
            inner,
            encoding,
            lines_read: 0,
            buf: String::new(),
        })
    }

    /// The effective encoding (after BOM detection).
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Number of lines handed out so far, header included.
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Reads the next line, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the bytes are not valid in the effective
    /// encoding, or any error raised by the source.
    pub fn next_line(&mut self) -> io::Result<Option<&str>> {
        self.buf.clear();
        let n = match &mut self.inner {
            Inner::Utf8(r) => r.read_line(&mut self.buf)?,
            Inner::Transcoded(r) => r.read_line(&mut self.buf)?,
        };
        if n == 0 {
            return Ok(None);
        }
        if self.buf.ends_with('\n') {
            self.buf.pop();
            if self.buf.ends_with('\r') {
                self.buf.pop();
            }
        }
        self.lines_read += 1;
        Ok(Some(&self.buf))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TranscodingReader
// ─────────────────────────────────────────────────────────────────────────────

/// Adapts a reader in any `encoding_rs` encoding into a UTF-8 byte reader.
struct TranscodingReader<R: Read> {
    source: R,
    decoder: Decoder,
    input: Vec<u8>,
    input_pos: usize,
    input_end: usize,
    output: Vec<u8>,
    output_pos: usize,
    output_end: usize,
    eof: bool,
    finished: bool,
}

impl<R: Read> TranscodingReader<R> {
    fn new(source: R, encoding: &'static Encoding) -> Self {
        let decoder = encoding.new_decoder_without_bom_handling();
        let output_len = decoder
            .max_utf8_buffer_length(DECODE_BLOCK_SIZE)
            .unwrap_or(DECODE_BLOCK_SIZE * 4);
        Self {
            source,
            decoder,
            input: vec![0; DECODE_BLOCK_SIZE],
            input_pos: 0,
            input_end: 0,
            output: vec![0; output_len],
            output_pos: 0,
            output_end: 0,
            eof: false,
            finished: false,
        }
    }

    /// Decodes the next block into `output`. Returns false once drained.
    fn refill(&mut self) -> io::Result<bool> {
        loop {
            if self.finished {
                return Ok(false);
            }
            if self.input_pos == self.input_end && !self.eof {
                let n = self.source.read(&mut self.input)?;
                self.input_pos = 0;
                self.input_end = n;
                self.eof = n == 0;
            }

            let (result, read, written, _) = self.decoder.decode_to_utf8(
                &self.input[self.input_pos..self.input_end],
                &mut self.output,
                self.eof,
            );
            self.input_pos += read;
            self.output_pos = 0;
            self.output_end = written;

            if self.eof && result == CoderResult::InputEmpty {
                self.finished = true;
            }
            if written > 0 {
                return Ok(true);
            }
        }
    }
}

impl<R: Read> Read for TranscodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.output_pos == self.output_end && !self.refill()? {
            return Ok(0);
        }
        let n = buf.len().min(self.output_end - self.output_pos);
        buf[..n].copy_from_slice(&self.output[self.output_pos..self.output_pos + n]);
        self.output_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(mut reader: LineReader<Cursor<Vec<u8>>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().expect("read failed") {
            out.push(line.to_string());
        }
        out
    }

    #[test]
    fn reads_lf_and_crlf_lines() {
        let data = b"h1,h2\r\n1,2\n3,4".to_vec();
        let reader = LineReader::new(Cursor::new(data), UTF_8).unwrap();
        assert_eq!(collect(reader), vec!["h1,h2", "1,2", "3,4"]);
    }

    #[test]
    fn empty_stream_has_no_lines() {
        let mut reader = LineReader::new(Cursor::new(Vec::new()), UTF_8).unwrap();
        assert!(reader.next_line().unwrap().is_none());
        assert_eq!(reader.lines_read(), 0);
    }

    #[test]
    fn strips_utf8_bom() {
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice(b"caller_id,recipient\n1,2\n");
        let reader = LineReader::new(Cursor::new(data), UTF_8).unwrap();
        assert_eq!(collect(reader), vec!["caller_id,recipient", "1,2"]);
    }

    #[test]
    fn bom_overrides_declared_encoding() {
        let mut data = vec![0xFF, 0xFE];
        for unit in "a,b\nä,ß\n".encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        let reader = LineReader::new(Cursor::new(data), UTF_8).unwrap();
        assert_eq!(reader.encoding(), encoding_rs::UTF_16LE);
        assert_eq!(collect(reader), vec!["a,b", "ä,ß"]);
    }

    #[test]
    fn transcodes_declared_single_byte_encoding() {
        // "café" in windows-1252
        let data = b"name\ncaf\xE9\n".to_vec();
        let reader = LineReader::new(Cursor::new(data), encoding_rs::WINDOWS_1252).unwrap();
        assert_eq!(collect(reader), vec!["name", "café"]);
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let data = b"name\n\xFF\xFE\xFD\n".to_vec();
        let mut reader = LineReader::new(Cursor::new(data), UTF_8).unwrap();
        assert_eq!(reader.next_line().unwrap(), Some("name"));
        let err = reader.next_line().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn transcodes_across_block_boundaries() {
        let row = "é".repeat(1000);
        let mut text = String::from("h\n");
        for _ in 0..200 {
            text.push_str(&row);
            text.push('\n');
        }
        let (encoded, _, _) = encoding_rs::WINDOWS_1252.encode(&text);
        let reader =
            LineReader::new(Cursor::new(encoded.into_owned()), encoding_rs::WINDOWS_1252).unwrap();
        let lines = collect(reader);
        assert_eq!(lines.len(), 201);
        assert!(lines[1..].iter().all(|l| *l == row));
    }
}
