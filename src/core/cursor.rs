use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::models::{Thread, ThreadId};
use crate::error::{Result, SyncError};

/// Position in the `(created_at DESC, id DESC)` total order.
///
/// `created_at` alone is not unique (concurrent inserts can share a
/// timestamp), so `id` is the mandatory tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: i64,
    pub id: ThreadId,
}

/// Opaque, self-contained pagination token handed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorToken(String);

impl Cursor {
    pub fn from_thread(thread: &Thread) -> Self {
        Cursor {
            created_at: thread.created_at,
            id: thread.id,
        }
    }

    pub fn encode(&self) -> CursorToken {
        CursorToken(format!("{}:{}", self.created_at, self.id))
    }

    pub fn decode(token: &CursorToken) -> Result<Self> {
        token.0.parse()
    }
}

impl FromStr for Cursor {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let [ts, id] = parts.as_slice() else {
            return Err(SyncError::MalformedCursor(format!(
                "expected 2 fields, got {}",
                parts.len()
            )));
        };
        let created_at = ts
            .parse::<i64>()
            .map_err(|e| SyncError::MalformedCursor(format!("timestamp {ts:?}: {e}")))?;
        let id = id
            .parse::<i64>()
            .map_err(|e| SyncError::MalformedCursor(format!("id {id:?}: {e}")))?;
        Ok(Cursor { created_at, id })
    }
}

impl CursorToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CursorToken {
    fn from(s: String) -> Self {
        CursorToken(s)
    }
}

impl From<&str> for CursorToken {
    fn from(s: &str) -> Self {
        CursorToken(s.to_string())
    }
}

impl fmt::Display for CursorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cursor for the page that follows `last_row`.
pub fn encode(last_row: &Thread) -> CursorToken {
    Cursor::from_thread(last_row).encode()
}

pub fn decode(token: &CursorToken) -> Result<Cursor> {
    Cursor::decode(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: i64, created_at: i64) -> Thread {
        Thread {
            id,
            created_at,
            owner_id: "alice".into(),
            content: String::new(),
        }
    }

    #[test]
    fn roundtrip_keeps_full_precision() {
        // microsecond timestamp well past f64's exact integer range
        let row = thread(42, 9_007_199_254_740_993);
        let token = encode(&row);
        assert_eq!(token.as_str(), "9007199254740993:42");
        let cursor = decode(&token).unwrap();
        assert_eq!(cursor.created_at, 9_007_199_254_740_993);
        assert_eq!(cursor.id, 42);
    }

    #[test]
    fn roundtrip_extremes() {
        for (id, ts) in [(i64::MAX, i64::MIN), (-1, 0), (0, i64::MAX)] {
            let cursor = decode(&encode(&thread(id, ts))).unwrap();
            assert_eq!((cursor.created_at, cursor.id), (ts, id));
        }
    }

    #[test]
    fn wrong_arity_is_malformed() {
        for bad in ["", "123", "1:2:3", "::"] {
            let err = decode(&CursorToken::from(bad)).unwrap_err();
            assert!(matches!(err, SyncError::MalformedCursor(_)), "{bad:?}");
        }
    }

    #[test]
    fn non_numeric_fields_are_malformed() {
        for bad in ["abc:1", "1:abc", "1.5:2", "2024-01-01T00:00:00Z:3"] {
            let err = decode(&CursorToken::from(bad)).unwrap_err();
            assert!(matches!(err, SyncError::MalformedCursor(_)), "{bad:?}");
        }
    }

    #[test]
    fn token_serializes_as_plain_string() {
        let token = encode(&thread(7, 1000));
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"1000:7\"");
    }
}
