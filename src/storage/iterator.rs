//! # Partial-Failure-Tolerant Row Iterator
//!
//! Turns a raw result set into the pull-based cursor every resource storage
//! backend exposes. A malformed row does not abort the scan: it lands in a
//! bounded rejected-row set and the scan continues. Only when the bound is
//! exceeded does the iterator enter a terminal error state, so "too many bad
//! rows" is an explicit, reportable failure instead of silent data loss.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

use crate::errors::{KeepsakeError, Result};
use crate::storage::continuation::ContinuationToken;

/// Maximum number of malformed rows tolerated before the scan fails.
pub const MAX_REJECTED_ROWS: usize = 1000;

/// A row the iterator refused to yield, kept for reporting.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    /// Internal row id, or -1 when even the id column failed to decode
    pub row_id: i64,
    pub reason: String,
}

#[derive(Debug)]
struct DecodedRow {
    id: i64,
    name: String,
    namespace: String,
    folder: String,
    resource_version: i64,
    value: Vec<u8>,
}

fn decode_row(row: &SqliteRow) -> std::result::Result<DecodedRow, String> {
    let id: i64 = row.try_get("id").map_err(|e| format!("invalid id column: {}", e))?;
    let name: String = row.try_get("name").map_err(|e| format!("invalid name column: {}", e))?;
    let namespace: String =
        row.try_get("namespace").map_err(|e| format!("invalid namespace column: {}", e))?;
    let folder: String =
        row.try_get("folder").map_err(|e| format!("invalid folder column: {}", e))?;
    let resource_version: i64 = row
        .try_get("resource_version")
        .map_err(|e| format!("invalid resource_version column: {}", e))?;
    let value: Vec<u8> =
        row.try_get("value").map_err(|e| format!("invalid value column: {}", e))?;

    // The stored document must be a JSON object; anything else is a corrupt
    // row from a legacy writer.
    serde_json::from_slice::<serde_json::Value>(&value)
        .map_err(|e| format!("invalid value document: {}", e))?;

    Ok(DecodedRow { id, name, namespace, folder, resource_version, value })
}

/// Pull-based cursor over a fetched result set.
pub struct ListIterator {
    rows: std::vec::IntoIter<SqliteRow>,
    current: Option<DecodedRow>,
    token_id: i64,
    rejected: Vec<RejectedRow>,
    error: Option<KeepsakeError>,
    closed: bool,
}

impl ListIterator {
    pub(crate) fn new(rows: Vec<SqliteRow>, start_token: ContinuationToken) -> Self {
        Self {
            rows: rows.into_iter(),
            current: None,
            token_id: start_token.id,
            rejected: Vec::new(),
            error: None,
            closed: false,
        }
    }

    /// Advance to the next decodable row. Returns false when the result set
    /// is exhausted, the iterator has been closed, or it is in a terminal
    /// error state.
    pub fn next(&mut self) -> bool {
        if self.closed || self.error.is_some() {
            return false;
        }

        for row in self.rows.by_ref() {
            match decode_row(&row) {
                Ok(decoded) => {
                    self.token_id = decoded.id;
                    self.current = Some(decoded);
                    return true;
                }
                Err(reason) => {
                    if self.rejected.len() >= MAX_REJECTED_ROWS {
                        self.current = None;
                        self.error = Some(KeepsakeError::too_many_rejected_rows(
                            self.rejected.len() + 1,
                        ));
                        return false;
                    }
                    let row_id: i64 = row.try_get("id").unwrap_or(-1);
                    warn!(row_id, reason = %reason, "Rejecting malformed row");
                    self.rejected.push(RejectedRow { row_id, reason });
                }
            }
        }

        self.current = None;
        false
    }

    /// Serialized document of the current row.
    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|r| r.value.as_slice()).unwrap_or(&[])
    }

    pub fn name(&self) -> &str {
        self.current.as_ref().map(|r| r.name.as_str()).unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.current.as_ref().map(|r| r.namespace.as_str()).unwrap_or("")
    }

    pub fn folder(&self) -> &str {
        self.current.as_ref().map(|r| r.folder.as_str()).unwrap_or("")
    }

    pub fn resource_version(&self) -> i64 {
        self.current.as_ref().map(|r| r.resource_version).unwrap_or(0)
    }

    /// Token resuming strictly after the last row actually yielded.
    pub fn continue_token(&self) -> String {
        ContinuationToken::new(self.token_id).encode()
    }

    /// Terminal error, if the iterator entered one.
    pub fn error(&self) -> Option<&KeepsakeError> {
        self.error.as_ref()
    }

    /// Take the terminal error out of the iterator.
    pub(crate) fn take_error(&mut self) -> Option<KeepsakeError> {
        self.error.take()
    }

    /// Rows rejected so far. Bounded by [`MAX_REJECTED_ROWS`].
    pub fn rejected(&self) -> &[RejectedRow] {
        &self.rejected
    }

    /// Release the remaining rows. Safe to call multiple times and after
    /// errors.
    pub fn close(&mut self) {
        self.closed = true;
        self.current = None;
        self.rows = Vec::new().into_iter();
    }
}

impl std::fmt::Debug for ListIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListIterator")
            .field("token_id", &self.token_id)
            .field("rejected", &self.rejected.len())
            .field("error", &self.error)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Drain an iterator into (name, value) pairs, propagating a terminal error.
/// Convenience for callers that do not need streaming access.
pub fn collect_rows(iter: &mut ListIterator) -> Result<Vec<(String, Vec<u8>)>> {
    let mut rows = Vec::new();
    while iter.next() {
        rows.push((iter.name().to_string(), iter.value().to_vec()));
    }
    if let Some(err) = iter.take_error() {
        return Err(err);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    async fn insert_row(db: &TestDatabase, name: &str, value: &[u8], rv: i64) {
        sqlx::query(
            "INSERT INTO resource (api_group, resource, namespace, name, folder, value, resource_version, updated) \
             VALUES ('apps', 'deployments', 'ns-1', ?, '', ?, ?, ?)",
        )
        .bind(name)
        .bind(value)
        .bind(rv)
        .bind(rv / 1000)
        .execute(&db.pool)
        .await
        .unwrap();
    }

    async fn fetch_rows(db: &TestDatabase) -> Vec<SqliteRow> {
        sqlx::query(
            "SELECT id, namespace, name, folder, value, resource_version FROM resource ORDER BY id",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_iterator_yields_rows_and_advances_token() {
        let db = TestDatabase::new().await;
        insert_row(&db, "a", br#"{"kind":"A"}"#, 1000).await;
        insert_row(&db, "b", br#"{"kind":"B"}"#, 2000).await;

        let mut iter = ListIterator::new(fetch_rows(&db).await, ContinuationToken::default());
        assert_eq!(iter.continue_token(), "start:0");

        assert!(iter.next());
        assert_eq!(iter.name(), "a");
        assert_eq!(iter.namespace(), "ns-1");
        assert_eq!(iter.resource_version(), 1000);
        assert_eq!(iter.value(), br#"{"kind":"A"}"#);
        assert_eq!(iter.continue_token(), "start:1");

        assert!(iter.next());
        assert_eq!(iter.name(), "b");
        assert_eq!(iter.continue_token(), "start:2");

        assert!(!iter.next());
        assert!(iter.error().is_none());
        // token still reflects the last yielded row
        assert_eq!(iter.continue_token(), "start:2");
    }

    #[tokio::test]
    async fn test_iterator_skips_malformed_rows() {
        let db = TestDatabase::new().await;
        insert_row(&db, "good-1", br#"{"kind":"A"}"#, 1000).await;
        insert_row(&db, "bad", b"not json at all", 2000).await;
        insert_row(&db, "good-2", br#"{"kind":"B"}"#, 3000).await;

        let mut iter = ListIterator::new(fetch_rows(&db).await, ContinuationToken::default());
        let rows = collect_rows(&mut iter).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "good-1");
        assert_eq!(rows[1].0, "good-2");
        assert_eq!(iter.rejected().len(), 1);
        assert_eq!(iter.rejected()[0].row_id, 2);
    }

    #[tokio::test]
    async fn test_iterator_cap_allows_exactly_one_thousand_rejections() {
        let db = TestDatabase::new().await;
        for i in 0..MAX_REJECTED_ROWS {
            insert_row(&db, &format!("bad-{}", i), b"garbage", i as i64).await;
        }
        insert_row(&db, "good", br#"{"kind":"A"}"#, 9999).await;

        let mut iter = ListIterator::new(fetch_rows(&db).await, ContinuationToken::default());

        assert!(iter.next());
        assert_eq!(iter.name(), "good");
        assert!(iter.error().is_none());
        assert_eq!(iter.rejected().len(), MAX_REJECTED_ROWS);

        assert!(!iter.next());
        assert!(iter.error().is_none());
    }

    #[tokio::test]
    async fn test_iterator_cap_breach_is_terminal() {
        let db = TestDatabase::new().await;
        for i in 0..(MAX_REJECTED_ROWS + 1) {
            insert_row(&db, &format!("bad-{}", i), b"garbage", i as i64).await;
        }
        insert_row(&db, "good", br#"{"kind":"A"}"#, 9999).await;

        let mut iter = ListIterator::new(fetch_rows(&db).await, ContinuationToken::default());

        assert!(!iter.next());
        assert!(matches!(iter.error(), Some(KeepsakeError::TooManyRejectedRows { .. })));
        // terminal: stays false, never reaches the valid row
        assert!(!iter.next());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = TestDatabase::new().await;
        insert_row(&db, "a", br#"{"kind":"A"}"#, 1000).await;

        let mut iter = ListIterator::new(fetch_rows(&db).await, ContinuationToken::default());
        iter.close();
        assert!(!iter.next());
        iter.close();
        iter.close();
    }

    #[tokio::test]
    async fn test_iterator_resumes_from_token() {
        let db = TestDatabase::new().await;
        insert_row(&db, "a", br#"{"kind":"A"}"#, 1000).await;

        let start = ContinuationToken::new(17);
        let iter = ListIterator::new(Vec::new(), start);
        // with no rows yielded, the token is unchanged
        assert_eq!(iter.continue_token(), "start:17");
    }
}
