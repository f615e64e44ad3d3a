use roundkeeper_core::chrono::Utc;
use roundkeeper_core::LibraryId;

use super::{format_timestamp, LibraryRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLibraryRepository {
    pool: DbPool,
}

impl SqlLibraryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LibraryRepository for SqlLibraryRepository {
    async fn get_or_create(&self, candidate: LibraryId) -> Result<LibraryId, RepositoryError> {
        sqlx::query(
            "INSERT INTO library_identity (singleton, library_id, created_at)
             VALUES (1, ?, ?)
             ON CONFLICT(singleton) DO NOTHING",
        )
        .bind(&candidate.0)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_scalar::<_, String>(
            "SELECT library_id FROM library_identity WHERE singleton = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LibraryId(stored))
    }
}

/// A configured identifier wins; otherwise the deployment's stored one is
/// used, generated on first start.
pub async fn resolve_library_id(
    repository: &dyn LibraryRepository,
    configured: Option<&str>,
) -> Result<LibraryId, RepositoryError> {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(LibraryId(id.to_string()));
    }
    repository.get_or_create(LibraryId::generate()).await
}

#[cfg(test)]
mod tests {
    use roundkeeper_core::LibraryId;

    use super::{resolve_library_id, SqlLibraryRepository};
    use crate::repositories::LibraryRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn identifier_is_generated_once() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlLibraryRepository::new(pool);

        let first = resolve_library_id(&repo, None).await.expect("resolve");
        let second = resolve_library_id(&repo, Some("  ")).await.expect("resolve");
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("library:"));

        let kept = repo.get_or_create(LibraryId("library:other:2".to_string())).await.expect("get");
        assert_eq!(kept, first);
    }

    #[tokio::test]
    async fn configured_identifier_wins() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlLibraryRepository::new(pool);

        let id = resolve_library_id(&repo, Some("library:lab:fixed")).await.expect("resolve");
        assert_eq!(id.as_str(), "library:lab:fixed");
    }
}
