use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::alias_repo::{
    Alias, AliasRecord, AliasRepository, AliasUpdate, AliasValidationError, DeleteAliasError,
    InsertAliasError, OriginalUrl, OriginalUrlValidationError, UpdateAliasError,
    alias_repository_capsule,
};

const SHORTEN_ATTEMPTS: usize = 3;

/// Generated aliases are always exactly this many base62 digits long.
const GENERATED_ALIAS_LEN: u32 = 7;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortenPayload {
    pub full_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutUrlPayload {
    pub full_url: Option<String>,
    pub new_short_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortenedUrl {
    pub full_url: String,
    pub short_url: String,
}

#[derive(Debug)]
pub struct Redirect {
    pub location: String,
}

pub fn alias_rest_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn AliasRestService> {
    let alias_repo = Arc::clone(get.as_ref(alias_repository_capsule));
    Arc::new(AliasRestServiceImpl { alias_repo })
}

#[async_trait]
pub trait AliasRestService: Send + Sync {
    async fn shorten_url(&self, full_url: &str) -> Result<ShortenedUrl, ShortenUrlError>;
    async fn get_url(&self, short_url: &str) -> Result<Redirect, GetUrlError>;
    async fn list_urls(&self) -> anyhow::Result<Vec<ShortenedUrl>>;

    /// Empty strings in `full_url` and `new_short_url` count as omitted.
    async fn put_url(
        &self,
        short_url: &str,
        full_url: Option<String>,
        new_short_url: Option<String>,
    ) -> Result<ShortenedUrl, PutUrlError>;
    async fn delete_url(&self, short_url: &str) -> Result<ShortenedUrl, DeleteUrlError>;
}

#[derive(Debug, Error)]
pub enum ShortenUrlError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] OriginalUrlValidationError),
    #[error("no free alias was found after {0} attempts")]
    AliasesExhausted(usize),
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[derive(Debug, Error)]
pub enum GetUrlError {
    #[error("URL not found")]
    NotFound,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PutUrlError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] OriginalUrlValidationError),
    #[error("invalid new short URL: {0}")]
    InvalidAlias(#[from] AliasValidationError),
    #[error("URL not found")]
    NotFound,
    #[error("short URL {0} is already taken")]
    AliasTaken(String),
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DeleteUrlError {
    #[error("URL not found")]
    NotFound,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

struct AliasRestServiceImpl {
    alias_repo: Arc<dyn AliasRepository>,
}

#[async_trait]
impl AliasRestService for AliasRestServiceImpl {
    #[instrument(skip(self))]
    async fn shorten_url(&self, full_url: &str) -> Result<ShortenedUrl, ShortenUrlError> {
        let original_url = OriginalUrl::new(full_url)?;

        for _ in 0..SHORTEN_ATTEMPTS {
            let attempt = generate_alias();
            let alias = match Alias::new(attempt.clone()) {
                Ok(alias) => alias,
                Err(err) => {
                    // NOTE: only a bug in generate_alias can cause this
                    warn!(?attempt, ?err, "Generated invalid alias");
                    continue;
                }
            };

            let record = AliasRecord {
                alias,
                original_url: original_url.clone(),
            };
            match self.alias_repo.insert_alias(record).await {
                Ok(record) => {
                    info!(alias = record.alias.as_str(), "Created alias");
                    return Ok(record.into());
                }
                Err(InsertAliasError::AliasTaken(alias)) => {
                    warn!(alias = alias.as_str(), "Generated alias that was already taken");
                }
                Err(InsertAliasError::Internal(err)) => {
                    error!(?err, "Encountered internal error while inserting alias");
                    return Err(ShortenUrlError::Internal(err));
                }
            }
        }

        Err(ShortenUrlError::AliasesExhausted(SHORTEN_ATTEMPTS))
    }

    #[instrument(skip(self))]
    async fn get_url(&self, short_url: &str) -> Result<Redirect, GetUrlError> {
        let Ok(alias) = Alias::new(short_url.to_owned()) else {
            return Err(GetUrlError::NotFound);
        };

        match self.alias_repo.retrieve_alias(&alias).await {
            Ok(Some(record)) => Ok(Redirect {
                location: redirect_location(&record.original_url),
            }),
            Ok(None) => Err(GetUrlError::NotFound),
            Err(err) => Err(GetUrlError::Internal(err)),
        }
    }

    #[instrument(skip(self))]
    async fn list_urls(&self) -> anyhow::Result<Vec<ShortenedUrl>> {
        let records = self.alias_repo.list_aliases().await?;
        Ok(records.into_iter().map(ShortenedUrl::from).collect())
    }

    #[instrument(skip(self))]
    async fn put_url(
        &self,
        short_url: &str,
        full_url: Option<String>,
        new_short_url: Option<String>,
    ) -> Result<ShortenedUrl, PutUrlError> {
        let Ok(alias) = Alias::new(short_url.to_owned()) else {
            return Err(PutUrlError::NotFound);
        };

        // A missing alias is reported as such even when the body is invalid.
        let update = match parse_update(full_url, new_short_url) {
            Ok(update) => update,
            Err(err) => {
                return match self.alias_repo.retrieve_alias(&alias).await {
                    Ok(Some(_)) => Err(err),
                    Ok(None) => Err(PutUrlError::NotFound),
                    Err(err) => Err(PutUrlError::Internal(err)),
                };
            }
        };

        match self.alias_repo.update_alias(&alias, update).await {
            Ok(record) => {
                info!(
                    from = alias.as_str(),
                    to = record.alias.as_str(),
                    "Updated alias"
                );
                Ok(record.into())
            }
            Err(UpdateAliasError::NotFound) => Err(PutUrlError::NotFound),
            Err(UpdateAliasError::AliasTaken(taken)) => {
                Err(PutUrlError::AliasTaken(taken.into_inner()))
            }
            Err(UpdateAliasError::Internal(err)) => Err(PutUrlError::Internal(err)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_url(&self, short_url: &str) -> Result<ShortenedUrl, DeleteUrlError> {
        let Ok(alias) = Alias::new(short_url.to_owned()) else {
            return Err(DeleteUrlError::NotFound);
        };

        match self.alias_repo.delete_alias(&alias).await {
            Ok(record) => {
                info!(alias = alias.as_str(), "Deleted alias");
                Ok(record.into())
            }
            Err(DeleteAliasError::NotFound) => Err(DeleteUrlError::NotFound),
            Err(DeleteAliasError::Internal(err)) => Err(DeleteUrlError::Internal(err)),
        }
    }
}

/// Empty strings count as omitted fields.
fn parse_update(
    full_url: Option<String>,
    new_short_url: Option<String>,
) -> Result<AliasUpdate, PutUrlError> {
    Ok(AliasUpdate {
        alias: new_short_url
            .filter(|new_short_url| !new_short_url.is_empty())
            .map(Alias::new)
            .transpose()?,
        original_url: full_url
            .filter(|full_url| !full_url.is_empty())
            .map(|full_url| OriginalUrl::new(&full_url))
            .transpose()?,
    })
}

fn generate_alias() -> String {
    let lower = 62_u64.pow(GENERATED_ALIAS_LEN - 1);
    let upper = 62_u64.pow(GENERATED_ALIAS_LEN);
    base62::encode(u128::from(rand::random_range(lower..upper)))
}

/// URLs are stored verbatim, but a `Location` header only carries visible ASCII,
/// so anything else goes through [`Url`]'s percent-encoding and IDNA.
fn redirect_location(original_url: &OriginalUrl) -> String {
    let raw = original_url.as_str();
    if raw.bytes().all(|b| b.is_ascii_graphic()) {
        return raw.to_owned();
    }
    Url::parse(raw).map_or_else(|_| raw.to_owned(), String::from)
}

impl From<AliasRecord> for ShortenedUrl {
    fn from(
        AliasRecord {
            alias,
            original_url,
        }: AliasRecord,
    ) -> Self {
        Self {
            full_url: original_url.into_inner(),
            short_url: alias.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mockall::{mock, predicate::*};

    use super::*;

    mock! {
        AliasRepository {}

        #[async_trait]
        impl AliasRepository for AliasRepository {
            async fn retrieve_alias(&self, alias: &Alias) -> anyhow::Result<Option<AliasRecord>>;
            async fn list_aliases(&self) -> anyhow::Result<Vec<AliasRecord>>;
            async fn insert_alias(&self, record: AliasRecord) -> Result<AliasRecord, InsertAliasError>;
            async fn update_alias(
                &self,
                alias: &Alias,
                update: AliasUpdate,
            ) -> Result<AliasRecord, UpdateAliasError>;
            async fn delete_alias(&self, alias: &Alias) -> Result<AliasRecord, DeleteAliasError>;
        }
    }

    fn alias(alias: &str) -> Alias {
        Alias::new(alias.to_owned()).unwrap()
    }

    fn record(alias_str: &str, url: &str) -> AliasRecord {
        AliasRecord {
            alias: alias(alias_str),
            original_url: OriginalUrl::new(url).unwrap(),
        }
    }

    fn service(mock_repo: MockAliasRepository) -> AliasRestServiceImpl {
        AliasRestServiceImpl {
            alias_repo: Arc::new(mock_repo),
        }
    }

    #[test]
    fn test_generate_alias() {
        for _ in 0..100 {
            let generated = generate_alias();
            assert_eq!(generated.len(), 7);
            assert!(Alias::new(generated).is_ok());
        }
    }

    #[test]
    fn test_redirect_location() {
        let ascii = OriginalUrl::new("https://example.com").unwrap();
        assert_eq!(redirect_location(&ascii), "https://example.com");

        let with_space = OriginalUrl::new("https://example.com/a b").unwrap();
        assert_eq!(redirect_location(&with_space), "https://example.com/a%20b");

        let unicode = OriginalUrl::new("https://bücher.example/straße").unwrap();
        assert_eq!(
            redirect_location(&unicode),
            "https://xn--bcher-kva.example/stra%C3%9Fe"
        );
    }

    #[tokio::test]
    async fn test_shorten_url_success() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_insert_alias()
            .withf(|record| {
                record.original_url.as_str() == "https://example.com"
                    && record.alias.as_str().len() == 7
            })
            .once()
            .returning(Ok);

        let shortened_url = service(mock_repo)
            .shorten_url("https://example.com")
            .await
            .unwrap();
        assert_eq!(shortened_url.full_url, "https://example.com");
        assert_eq!(shortened_url.short_url.len(), 7);
    }

    #[tokio::test]
    async fn test_shorten_url_retries_taken_alias() {
        let mut mock_repo = MockAliasRepository::new();
        let mut attempts = 0;
        mock_repo
            .expect_insert_alias()
            .times(SHORTEN_ATTEMPTS)
            .returning(move |record| {
                attempts += 1;
                if attempts < SHORTEN_ATTEMPTS {
                    Err(InsertAliasError::AliasTaken(record.alias))
                } else {
                    Ok(record)
                }
            });

        let shortened_url = service(mock_repo)
            .shorten_url("https://example.com")
            .await
            .unwrap();
        assert_eq!(shortened_url.full_url, "https://example.com");
    }

    #[tokio::test]
    async fn test_shorten_url_aliases_exhausted() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_insert_alias()
            .times(SHORTEN_ATTEMPTS)
            .returning(|record| Err(InsertAliasError::AliasTaken(record.alias)));

        let err = service(mock_repo)
            .shorten_url("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ShortenUrlError::AliasesExhausted(SHORTEN_ATTEMPTS)));
    }

    #[tokio::test]
    async fn test_shorten_url_db_error() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_insert_alias()
            .once()
            .returning(|_| Err(InsertAliasError::Internal(anyhow::anyhow!("test failure"))));

        let err = service(mock_repo)
            .shorten_url("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ShortenUrlError::Internal(_)));
    }

    #[tokio::test]
    async fn test_shorten_url_empty_url() {
        let err = service(MockAliasRepository::new())
            .shorten_url("  ")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShortenUrlError::InvalidUrl(OriginalUrlValidationError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_get_url_success() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_retrieve_alias()
            .with(eq(alias("abc123")))
            .once()
            .return_once(|_| Ok(Some(record("abc123", "https://example.com"))));

        let redirect = service(mock_repo).get_url("abc123").await.unwrap();
        assert_eq!(redirect.location, "https://example.com");
    }

    #[tokio::test]
    async fn test_get_url_not_found() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_retrieve_alias()
            .with(eq(alias("abc123")))
            .once()
            .return_once(|_| Ok(None));

        let err = service(mock_repo).get_url("abc123").await.unwrap_err();
        assert!(matches!(err, GetUrlError::NotFound));
    }

    #[tokio::test]
    async fn test_get_url_invalid_alias_is_not_found() {
        let err = service(MockAliasRepository::new())
            .get_url("favicon.ico")
            .await
            .unwrap_err();
        assert!(matches!(err, GetUrlError::NotFound));
    }

    #[tokio::test]
    async fn test_get_url_db_error() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_retrieve_alias()
            .once()
            .return_once(|_| Err(anyhow::anyhow!("test error")));

        let err = service(mock_repo).get_url("abc123").await.unwrap_err();
        assert!(matches!(err, GetUrlError::Internal(err) if err.to_string() == "test error"));
    }

    #[tokio::test]
    async fn test_list_urls() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo.expect_list_aliases().once().return_once(|| {
            Ok(vec![
                record("aaa", "https://a.example.com"),
                record("bbb", "https://b.example.com"),
            ])
        });

        let urls = service(mock_repo).list_urls().await.unwrap();
        assert_eq!(
            urls,
            vec![
                ShortenedUrl {
                    full_url: "https://a.example.com".to_owned(),
                    short_url: "aaa".to_owned(),
                },
                ShortenedUrl {
                    full_url: "https://b.example.com".to_owned(),
                    short_url: "bbb".to_owned(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_put_url_rename() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_update_alias()
            .with(
                eq(alias("abc123")),
                eq(AliasUpdate {
                    alias: Some(alias("xyz")),
                    original_url: None,
                }),
            )
            .once()
            .return_once(|_, _| Ok(record("xyz", "https://example.com")));

        let updated = service(mock_repo)
            .put_url("abc123", None, Some("xyz".to_owned()))
            .await
            .unwrap();
        assert_eq!(updated.short_url, "xyz");
        assert_eq!(updated.full_url, "https://example.com");
    }

    #[tokio::test]
    async fn test_put_url_empty_fields_are_omitted() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_update_alias()
            .with(eq(alias("abc123")), eq(AliasUpdate::default()))
            .once()
            .return_once(|_, _| Ok(record("abc123", "https://example.com")));

        let updated = service(mock_repo)
            .put_url("abc123", Some(String::new()), Some(String::new()))
            .await
            .unwrap();
        assert_eq!(updated.short_url, "abc123");
    }

    #[tokio::test]
    async fn test_put_url_alias_taken() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_update_alias()
            .once()
            .return_once(|_, _| Err(UpdateAliasError::AliasTaken(alias("xyz"))));

        let err = service(mock_repo)
            .put_url("abc123", None, Some("xyz".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, PutUrlError::AliasTaken(taken) if taken == "xyz"));
    }

    #[tokio::test]
    async fn test_put_url_not_found() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_update_alias()
            .once()
            .return_once(|_, _| Err(UpdateAliasError::NotFound));

        let err = service(mock_repo)
            .put_url("abc123", Some("https://example.com".to_owned()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PutUrlError::NotFound));
    }

    #[tokio::test]
    async fn test_put_url_invalid_new_alias() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_retrieve_alias()
            .with(eq(alias("abc123")))
            .once()
            .return_once(|_| Ok(Some(record("abc123", "https://example.com"))));

        let err = service(mock_repo)
            .put_url("abc123", None, Some("shorten".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PutUrlError::InvalidAlias(AliasValidationError::Reserved(_))
        ));
    }

    #[tokio::test]
    async fn test_put_url_invalid_body_on_missing_alias() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_retrieve_alias()
            .with(eq(alias("missing")))
            .once()
            .return_once(|_| Ok(None));

        let err = service(mock_repo)
            .put_url("missing", None, Some("a/b".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, PutUrlError::NotFound));
    }

    #[tokio::test]
    async fn test_put_url_invalid_path_alias_checked_first() {
        let err = service(MockAliasRepository::new())
            .put_url("not/an alias", Some("\u{7}".to_owned()), Some("a/b".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, PutUrlError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_url_success() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_delete_alias()
            .with(eq(alias("abc123")))
            .once()
            .return_once(|_| Ok(record("abc123", "https://example.com")));

        let deleted = service(mock_repo).delete_url("abc123").await.unwrap();
        assert_eq!(deleted.short_url, "abc123");
    }

    #[tokio::test]
    async fn test_delete_url_not_found() {
        let mut mock_repo = MockAliasRepository::new();
        mock_repo
            .expect_delete_alias()
            .once()
            .return_once(|_| Err(DeleteAliasError::NotFound));

        let err = service(mock_repo).delete_url("abc123").await.unwrap_err();
        assert!(matches!(err, DeleteUrlError::NotFound));
    }
}
