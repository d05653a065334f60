use crate::cache::KvError;

/// Connection-level failures read as an unavailable tier; everything else is a
/// backend error.
pub fn map_kv_error(err: sqlx::Error) -> KvError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            KvError::unavailable(err.to_string())
        }
        sqlx::Error::Io(io) => KvError::unavailable(io.to_string()),
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            KvError::unavailable(db.message().to_string())
        }
        other => KvError::backend(other.to_string()),
    }
}

/// Escape `LIKE` metacharacters so `value` matches literally.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
