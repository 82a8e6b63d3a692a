use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::record::Record;

const BOM: &str = "\u{feff}";

struct Cursor<R> {
    reader: csv::Reader<R>,
    exhausted: bool,
}

/// CSV reader that pre-scans its input once for the row count and header,
/// then hands out records one at a time to any number of callers.
pub struct StreamingReader<R> {
    cursor: Mutex<Cursor<R>>,
    headers: Arc<[String]>,
    count: usize,
    body_column: String,
    method: String,
    url: String,
}

// Column names are trimmed; field values are passed through untouched, quoted
// or not, so bodies and substituted tokens reach the request byte for byte.
fn csv_reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(input)
}

impl<R: Read + Seek> StreamingReader<R> {
    pub fn new(
        mut input: R,
        method: impl Into<String>,
        url: impl Into<String>,
        body_column: impl Into<String>,
    ) -> Result<Self> {
        let (headers, count) = {
            let mut scan = csv_reader(&mut input);
            let headers = read_headers(&mut scan)?;
            let mut count = 0usize;
            let mut row = csv::StringRecord::new();
            while scan
                .read_record(&mut row)
                .with_context(|| format!("malformed input row {}", count + 1))?
            {
                count += 1;
            }
            (headers, count)
        };

        input
            .seek(SeekFrom::Start(0))
            .context("failed to rewind input")?;
        let mut reader = csv_reader(input);
        // consume the header row again so the cursor sits on the first data row
        reader.headers().context("failed to re-read input header")?;

        debug!(rows = count, columns = headers.len(), "scanned input");

        Ok(Self {
            cursor: Mutex::new(Cursor {
                reader,
                exhausted: false,
            }),
            headers: headers.into(),
            count,
            body_column: body_column.into(),
            method: method.into(),
            url: url.into(),
        })
    }
}

impl<R: Read> StreamingReader<R> {
    /// Next record, or `None` once the input is exhausted. Exhaustion is
    /// sticky; a malformed row is an error.
    pub fn read(&self) -> Result<Option<Record>> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        if cursor.exhausted {
            return Ok(None);
        }

        let mut row = csv::StringRecord::new();
        let more = cursor
            .reader
            .read_record(&mut row)
            .context("malformed input row")?;
        if !more {
            cursor.exhausted = true;
            return Ok(None);
        }

        let values = row.iter().map(str::to_string).collect();
        Ok(Some(Record::new(
            self.headers.clone(),
            values,
            &self.body_column,
        )))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn read_headers<R: Read>(reader: &mut csv::Reader<R>) -> Result<Vec<String>> {
    let headers = reader.headers().context("failed to read input header")?;
    let mut headers: Vec<String> = headers.iter().map(str::to_string).collect();
    if let Some(first) = headers.first_mut() {
        if let Some(stripped) = first.strip_prefix(BOM) {
            *first = stripped.trim().to_string();
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor as IoCursor;
    use std::thread;

    fn reader(data: &str) -> StreamingReader<IoCursor<Vec<u8>>> {
        StreamingReader::new(
            IoCursor::new(data.as_bytes().to_vec()),
            "POST",
            "http://localhost/{id}",
            "request_body",
        )
        .unwrap()
    }

    #[test]
    fn test_count_and_headers() {
        let r = reader("id,request_body\n1,\"{}\"\n2,bad\n");
        assert_eq!(r.count(), 2);
        assert_eq!(r.headers(), &["id".to_string(), "request_body".to_string()]);

        let first = r.read().unwrap().unwrap();
        assert_eq!(first.get("id"), Some("1"));
        assert_eq!(first.body(), Some(&b"{}"[..]));
        let second = r.read().unwrap().unwrap();
        assert_eq!(second.get("request_body"), Some("bad"));
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        let r = reader("id\n1\n");
        assert!(r.read().unwrap().is_some());
        for _ in 0..3 {
            assert!(r.read().unwrap().is_none());
        }
    }

    #[test]
    fn test_header_only_input() {
        let r = reader("id,name\n");
        assert_eq!(r.count(), 0);
        assert!(r.read().unwrap().is_none());
    }

    #[test]
    fn test_bom_and_lazy_quotes() {
        let r = reader("\u{feff}id,note\n1,say \"hi\" there\n");
        assert_eq!(r.headers()[0], "id");
        let record = r.read().unwrap().unwrap();
        assert_eq!(record.get("id"), Some("1"));
        assert_eq!(record.get("note"), Some("say \"hi\" there"));
    }

    #[test]
    fn test_field_whitespace_is_preserved() {
        let r = reader("id, request_body\n1,\"  {} \"\n2,  lead\n");
        assert_eq!(r.headers(), &["id".to_string(), "request_body".to_string()]);

        let quoted = r.read().unwrap().unwrap();
        assert_eq!(quoted.body(), Some(&b"  {} "[..]));
        let unquoted = r.read().unwrap().unwrap();
        assert_eq!(unquoted.get("request_body"), Some("  lead"));
        assert_eq!(unquoted.values(), vec!["2", "  lead"]);
    }

    #[test]
    fn test_stray_quotes() {
        // a quote inside an unquoted field is literal
        let r = reader("id,note\n1,a\"b\n2,\"a \"b\" c\"\n");
        let unquoted = r.read().unwrap().unwrap();
        assert_eq!(unquoted.get("note"), Some("a\"b"));

        // a bare quote inside a quoted field closes the quoted run early
        let quoted = r.read().unwrap().unwrap();
        assert_eq!(quoted.get("note"), Some("a b\" c\""));
    }

    #[test]
    fn test_malformed_row_is_fatal() {
        let result = StreamingReader::new(
            IoCursor::new(b"id,name\n1,a\n2\n".to_vec()),
            "GET",
            "http://localhost/{id}",
            "request_body",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_reads_never_duplicate() {
        let mut data = String::from("id\n");
        for i in 0..500 {
            data.push_str(&format!("{i}\n"));
        }
        let r = Arc::new(reader(&data));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(record) = r.read().unwrap() {
                        ids.push(record.get("id").unwrap().to_string());
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.join().unwrap() {
                total += 1;
                seen.insert(id);
            }
        }
        assert_eq!(total, 500);
        assert_eq!(seen.len(), 500);
    }
}
