use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::Response;
use crate::error::{BuildError, JobError};
use crate::record::Record;
use crate::request::Request;

/// One row's unit of work. The request is built up front; a row whose
/// template can't be resolved still becomes a job and fails when run.
#[derive(Debug, Clone)]
pub struct Job {
    /// 1-based data row number, stable for the whole run
    pub id: usize,
    pub record: Arc<Record>,
    pub request: Result<Request, BuildError>,
}

impl Job {
    pub fn new(id: usize, record: Record, request: Result<Request, BuildError>) -> Self {
        Self {
            id,
            record: Arc::new(record),
            request,
        }
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub job_id: usize,
    pub record: Arc<Record>,
    pub result: Result<Response, JobError>,
    pub elapsed: Duration,
}

impl Outcome {
    /// HTTP status, `None` when there is no response.
    pub fn status(&self) -> Option<u16> {
        self.result.as_ref().ok().map(|r| r.status)
    }

    /// Output row: record values, then `status`, the optional columns, `error`.
    pub fn to_row(&self, columns: &OutputColumns) -> Vec<String> {
        let mut row = self.record.values();
        match &self.result {
            Ok(response) => {
                row.push(response.status.to_string());
                if columns.headers {
                    row.push(headers_to_string(&response.headers));
                }
                if columns.body {
                    row.push(String::from_utf8_lossy(&response.body).into_owned());
                }
                row.push(String::new());
            }
            Err(e) => {
                row.push("0".to_string());
                if columns.headers {
                    row.push(String::new());
                }
                if columns.body {
                    row.push(String::new());
                }
                row.push(e.to_string());
            }
        }
        row
    }
}

/// Optional trailer columns, fixed for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputColumns {
    pub headers: bool,
    pub body: bool,
}

impl OutputColumns {
    /// Input header followed by the trailer columns.
    pub fn header_row(&self, input: &[String]) -> Vec<String> {
        let mut row = input.to_vec();
        row.push("status".to_string());
        if self.headers {
            row.push("headers".to_string());
        }
        if self.body {
            row.push("response_body".to_string());
        }
        row.push("error".to_string());
        row
    }
}

/// `Key: v1, v2; Other: v;` with keys sorted.
pub fn headers_to_string(headers: &HeaderMap) -> String {
    let mut keys: Vec<&str> = headers.keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();

    let mut out = String::new();
    for (i, key) in keys.iter().enumerate() {
        let values: Vec<String> = headers
            .get_all(*key)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&values.join(", "));
        out.push_str(if i + 1 < keys.len() { "; " } else { ";" });
    }
    out
}
