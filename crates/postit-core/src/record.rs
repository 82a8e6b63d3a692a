use std::collections::HashMap;
use std::sync::Arc;

/// One input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    headers: Arc<[String]>,
    fields: HashMap<String, String>,
    body: Option<Vec<u8>>,
}

impl Record {
    /// Zip `values` against `headers`; the value of `body_column`, if that
    /// column exists, becomes the raw request body.
    pub fn new(headers: Arc<[String]>, values: Vec<String>, body_column: &str) -> Self {
        let fields: HashMap<String, String> = headers.iter().cloned().zip(values).collect();
        let body = fields.get(body_column).map(|b| b.clone().into_bytes());
        Self {
            headers,
            fields,
            body,
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Column values in original header order. Missing columns become "".
    pub fn values(&self) -> Vec<String> {
        self.headers
            .iter()
            .map(|h| self.fields.get(h).cloned().unwrap_or_default())
            .collect()
    }
}
