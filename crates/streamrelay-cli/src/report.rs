//! Rendering relay results for the caller.

use std::borrow::Cow;

use serde::Serialize;

use streamrelay_core::DecodeMode;
use streamrelay_engine::{DecodeError, DecodePolicy, RelayError, RelayResult};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// What was relayed into what.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Params {
    pub command: Vec<String>,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Outcome {
    pub returncode: i32,
    /// Decoded output; `None` when strict decoding failed.
    pub out: Option<String>,
    pub bytes_written: u64,
}

/// The `--json` report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Report {
    pub status: Status,
    pub params: Params,
    pub result: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

const fn text_policy(mode: DecodeMode) -> DecodePolicy {
    match mode {
        DecodeMode::Strict => DecodePolicy::Strict,
        DecodeMode::Lossy | DecodeMode::Raw => DecodePolicy::Lossy,
    }
}

impl Report {
    /// JSON strings cannot carry arbitrary bytes, so `Raw` is reported as
    /// `Lossy` here.
    pub fn new(params: Params, result: &RelayResult, mode: DecodeMode) -> Self {
        let (out, decode_error) = match result.text(text_policy(mode)) {
            Ok(text) => (Some(text.into_owned()), None),
            Err(e) => (None, Some(RelayError::from(e))),
        };
        let reason = result
            .error
            .as_ref()
            .or(decode_error.as_ref())
            .map(ToString::to_string);

        Self {
            status: if reason.is_none() {
                Status::Ok
            } else {
                Status::Error
            },
            params,
            result: Outcome {
                returncode: result.exit_code,
                out,
                bytes_written: result.bytes_written,
            },
            reason,
        }
    }
}

/// Captured output as it should be written to stdout under `mode`.
pub fn render_plain(result: &RelayResult, mode: DecodeMode) -> Result<Cow<'_, [u8]>, DecodeError> {
    if mode == DecodeMode::Raw {
        return Ok(Cow::Borrowed(result.captured.as_bytes()));
    }
    Ok(match result.text(text_policy(mode))? {
        Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    })
}

/// Process exit status: the child's code when the relay succeeded, 1 otherwise.
pub fn exit_status(result: &RelayResult) -> u8 {
    if !result.is_success() {
        return 1;
    }
    u8::try_from(result.exit_code).unwrap_or(1)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use streamrelay_engine::{CaptureBuffer, Endpoint};

    fn result(out: &[u8], exit_code: i32, error: Option<RelayError>) -> RelayResult {
        let mut captured = CaptureBuffer::new();
        captured.append(Endpoint::Output, out);
        RelayResult {
            exit_code,
            captured,
            bytes_written: 42,
            error,
        }
    }

    fn params() -> Params {
        Params {
            command: vec!["psql".into(), "-q".into()],
            input: "http://files/dump.sql".into(),
            content_type: Some("text/plain".into()),
        }
    }

    #[test]
    fn success_report_has_expected_shape() {
        let report = Report::new(params(), &result(b"CREATE TABLE\n", 0, None), DecodeMode::Lossy);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "ok");
        assert_eq!(json["params"]["content_type"], "text/plain");
        assert_eq!(json["params"]["command"][0], "psql");
        assert_eq!(json["result"]["returncode"], 0);
        assert_eq!(json["result"]["out"], "CREATE TABLE\n");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn relay_error_sets_status_and_reason() {
        let report = Report::new(
            params(),
            &result(b"partial", 143, Some(RelayError::Cancelled)),
            DecodeMode::Lossy,
        );
        assert_eq!(report.status, Status::Error);
        assert_eq!(report.reason.as_deref(), Some("Relay cancelled"));
        assert_eq!(report.result.out.as_deref(), Some("partial"));
        assert_eq!(report.result.returncode, 143);
    }

    #[test]
    fn strict_decode_failure_is_reported() {
        let report = Report::new(params(), &result(b"ok\xff", 0, None), DecodeMode::Strict);
        assert_eq!(report.status, Status::Error);
        assert!(report.result.out.is_none());
        assert!(report.reason.unwrap().contains("valid up to byte 2"));
    }

    #[test]
    fn raw_mode_passes_bytes_through() {
        let relayed = result(b"\xfe\xff", 0, None);
        assert_eq!(
            render_plain(&relayed, DecodeMode::Raw).unwrap().as_ref(),
            b"\xfe\xff"
        );
        assert_eq!(
            render_plain(&relayed, DecodeMode::Lossy).unwrap().as_ref(),
            "\u{fffd}\u{fffd}".as_bytes()
        );
        assert!(render_plain(&relayed, DecodeMode::Strict).is_err());
    }

    #[test]
    fn exit_status_follows_child_unless_relay_failed() {
        assert_eq!(exit_status(&result(b"", 0, None)), 0);
        assert_eq!(exit_status(&result(b"", 3, None)), 3);
        assert_eq!(exit_status(&result(b"", 137, None)), 137);
        assert_eq!(exit_status(&result(b"", -1, None)), 1);
        assert_eq!(exit_status(&result(b"", 0, Some(RelayError::Cancelled))), 1);
    }
}
