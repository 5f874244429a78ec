//! Log redaction. User-provided data (document keys, paths) is wrapped in
//! `<ud>…</ud>` markers wherever it reaches an error message or a log line,
//! so downstream log processors can strip it.

use std::fmt::{Display, Formatter, Result as FmtResult};

/// A display adapter that wraps user data in redaction markers.
pub struct UserData<'a>(pub &'a [u8]);

impl Display for UserData<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "<ud>{}</ud>", String::from_utf8_lossy(self.0))
    }
}

/// Redact a key for storage inside an error value.
pub fn redact_user(bytes: &[u8]) -> String {
    UserData(bytes).to_string()
}
