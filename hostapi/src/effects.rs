//! Effect log — the ordered record of everything a run did that the host
//! can observe.
//!
//! Entries are appended with a monotonic sequence number and never
//! removed or rewritten. One log belongs to one run.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::value::Value;

/// Severity of a guest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectKind {
    /// Raw output from the print primitive.
    Print { text: String },
    /// A console-style log line.
    Log { level: LogLevel, message: String },
    /// A guest write to a tracked global.
    GlobalSet { name: String, value: Value },
    /// An error. `caught` is true when a guest handler received it.
    Error {
        kind: ErrorKind,
        message: String,
        caught: bool,
    },
}

/// One entry of the effect log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Effect {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EffectKind,
}

/// Append-only effect sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EffectLog {
    entries: Vec<Effect>,
}

impl EffectLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an effect and return its sequence number.
    pub fn append(&mut self, kind: EffectKind) -> u64 {
        let seq = self.entries.len() as u64;
        self.entries.push(Effect { seq, kind });
        seq
    }

    pub fn entries(&self) -> &[Effect] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Effect> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Printed text and log messages, in order.
    pub fn output_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match &e.kind {
                EffectKind::Print { text } => Some(text.clone()),
                EffectKind::Log { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Error entries, in order.
    pub fn errors(&self) -> impl Iterator<Item = (&ErrorKind, &str, bool)> {
        self.entries.iter().filter_map(|e| match &e.kind {
            EffectKind::Error {
                kind,
                message,
                caught,
            } => Some((kind, message.as_str(), *caught)),
            _ => None,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Effect serialization cannot fail: every field is a plain value.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// BLAKE3 digest of the serialized log. Two runs with identical
    /// observable behaviour have identical digests.
    pub fn digest(&self) -> [u8; 32] {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn print(text: &str) -> EffectKind {
        EffectKind::Print {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let mut log = EffectLog::new();
        assert_eq!(log.append(print("a")), 0);
        assert_eq!(log.append(print("b")), 1);
        assert_eq!(log.append(print("c")), 2);
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_output_lines_skip_non_text() {
        let mut log = EffectLog::new();
        log.append(print("hello"));
        log.append(EffectKind::GlobalSet {
            name: "stmt".into(),
            value: Value::from("x"),
        });
        log.append(EffectKind::Log {
            level: LogLevel::Info,
            message: "world".into(),
        });
        assert_eq!(log.output_lines(), vec!["hello", "world"]);
    }

    #[test]
    fn test_errors_iterator() {
        let mut log = EffectLog::new();
        log.append(print("x"));
        log.append(EffectKind::Error {
            kind: ErrorKind::UnboundGlobal,
            message: "missing".into(),
            caught: false,
        });
        let errors: Vec<_> = log.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(*errors[0].0, ErrorKind::UnboundGlobal);
        assert!(!errors[0].2);
    }

    #[test]
    fn test_digest_tracks_content() {
        let mut a = EffectLog::new();
        let mut b = EffectLog::new();
        a.append(print("same"));
        b.append(print("same"));
        assert_eq!(a.digest(), b.digest());

        b.append(print("more"));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_json_shape() {
        let mut log = EffectLog::new();
        log.append(EffectKind::Log {
            level: LogLevel::Error,
            message: "boom".into(),
        });
        let json = log.to_json();
        assert_eq!(json["entries"][0]["seq"], 0);
        assert_eq!(json["entries"][0]["type"], "log");
        assert_eq!(json["entries"][0]["level"], "error");
        assert_eq!(json["entries"][0]["message"], "boom");
    }
}
