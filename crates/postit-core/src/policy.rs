use anyhow::Result;
use std::fmt;

/// Which HTTP statuses a `status` policy writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSelector {
    Any,
    /// `Nxx` matches `[N00, N00 + 100)`; `-Nxx` matches everything outside it
    Class { base: u16, negate: bool },
    Exact(u16),
}

impl StatusSelector {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if s.eq_ignore_ascii_case("any") {
            return Ok(StatusSelector::Any);
        }

        let (negate, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let bytes = body.as_bytes();
        if bytes.len() == 3 && bytes[0].is_ascii_digit() {
            let class = u16::from(bytes[0] - b'0');
            if body[1..].eq_ignore_ascii_case("xx") {
                return Ok(StatusSelector::Class {
                    base: class * 100,
                    negate,
                });
            }
            if !negate && bytes.iter().all(u8::is_ascii_digit) {
                return Ok(StatusSelector::Exact(body.parse()?));
            }
        }
        anyhow::bail!("invalid status selector {raw:?} (expected any, Nxx, -Nxx or a 3-digit code)")
    }

    pub fn matches(&self, status: u16) -> bool {
        match *self {
            StatusSelector::Any => true,
            StatusSelector::Class { base, negate } => {
                let inside = (base..base + 100).contains(&status);
                inside != negate
            }
            StatusSelector::Exact(code) => status == code,
        }
    }
}

impl fmt::Display for StatusSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSelector::Any => write!(f, "any"),
            StatusSelector::Class { base, negate } => {
                write!(f, "{}{}xx", if *negate { "-" } else { "" }, base / 100)
            }
            StatusSelector::Exact(code) => write!(f, "{code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPolicy {
    All,
    /// Only outcomes without a response
    Errors,
    Status(StatusSelector),
}

impl OutputPolicy {
    pub fn parse(response_type: &str, status: &str) -> Result<Self> {
        match response_type.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(OutputPolicy::All),
            "error" | "errors" => Ok(OutputPolicy::Errors),
            "status" | "" => Ok(OutputPolicy::Status(StatusSelector::parse(status)?)),
            other => {
                anyhow::bail!("invalid response type {other:?} (expected all, errors or status)")
            }
        }
    }
}

impl Default for OutputPolicy {
    fn default() -> Self {
        OutputPolicy::Status(StatusSelector::Class {
            base: 200,
            negate: true,
        })
    }
}

/// Per-outcome write decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFilter {
    pub policy: OutputPolicy,
    /// Also write transport failures whatever the policy says
    pub record_errors: bool,
}

impl OutputFilter {
    pub fn new(policy: OutputPolicy, record_errors: bool) -> Self {
        Self {
            policy,
            record_errors,
        }
    }

    /// `status` is `None` when the job has no response.
    pub fn should_write(&self, status: Option<u16>) -> bool {
        if self.record_errors && status.is_none() {
            return true;
        }
        match self.policy {
            OutputPolicy::All => true,
            OutputPolicy::Errors => status.is_none(),
            OutputPolicy::Status(selector) => selector.matches(status.unwrap_or(0)),
        }
    }
}
