use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DbConn, DbErr, EntityTrait,
    QueryFilter, QueryOrder, SqlErr, TransactionTrait, sea_query::Expr,
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{config::db_conn_capsule, orm::short_url};

pub const MAX_ALIAS_LEN: usize = 64;
pub const MAX_ORIGINAL_URL_LEN: usize = 2048;

/// Path segments owned by fixed routes; an alias equal to one of these
/// could never be reached through the redirect route.
pub const RESERVED_ALIASES: [&str; 2] = ["shorten", "shortened-urls"];

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS short_urls (\
    alias TEXT PRIMARY KEY NOT NULL, \
    original_url TEXT NOT NULL\
)";

/// Creates the `short_urls` table if it does not exist yet.
///
/// # Errors
/// Will return [`Err`] if the statement fails.
#[instrument(skip(db))]
pub async fn ensure_schema(db: &DbConn) -> Result<(), DbErr> {
    db.execute_unprepared(CREATE_TABLE_SQL).await?;
    debug!("short_urls table is present");
    Ok(())
}

pub fn alias_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn AliasRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(AliasRepositoryImpl { db })
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Alias(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AliasValidationError {
    #[error("alias must not be empty")]
    Empty,
    #[error("alias is {len} characters long; at most {MAX_ALIAS_LEN} are allowed")]
    TooLong { len: usize },
    #[error("alias contains invalid characters: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
    #[error("alias {0} is reserved")]
    Reserved(String),
}

impl Alias {
    /// # Errors
    /// Will return [`Err`] if the alias is empty, too long, reserved,
    /// or contains characters outside of `[A-Za-z0-9_-]`.
    pub fn new(alias: String) -> Result<Self, AliasValidationError> {
        if alias.is_empty() {
            return Err(AliasValidationError::Empty);
        }

        let len = alias.chars().count();
        if len > MAX_ALIAS_LEN {
            return Err(AliasValidationError::TooLong { len });
        }

        let invalid_chars: String = alias
            .chars()
            .filter(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
            .collect();
        if !invalid_chars.is_empty() {
            return Err(AliasValidationError::InvalidCharacters { invalid_chars });
        }

        if RESERVED_ALIASES.contains(&alias.as_str()) {
            return Err(AliasValidationError::Reserved(alias));
        }

        Ok(Self(alias))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalUrl(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginalUrlValidationError {
    #[error("URL must not be empty")]
    Empty,
    #[error("URL is {len} bytes long; at most {MAX_ORIGINAL_URL_LEN} are allowed")]
    TooLong { len: usize },
    #[error("URL must not contain control characters")]
    ControlCharacters,
}

impl OriginalUrl {
    /// Stored verbatim, surrounding whitespace included.
    ///
    /// # Errors
    /// Will return [`Err`] if the URL is blank, too long, or contains control characters.
    pub fn new(url: &str) -> Result<Self, OriginalUrlValidationError> {
        if url.trim().is_empty() {
            return Err(OriginalUrlValidationError::Empty);
        }
        if url.len() > MAX_ORIGINAL_URL_LEN {
            return Err(OriginalUrlValidationError::TooLong { len: url.len() });
        }
        if url.chars().any(char::is_control) {
            return Err(OriginalUrlValidationError::ControlCharacters);
        }
        Ok(Self(url.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasRecord {
    pub alias: Alias,
    pub original_url: OriginalUrl,
}

/// Fields to change on an existing record; `None` keeps the stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasUpdate {
    pub alias: Option<Alias>,
    pub original_url: Option<OriginalUrl>,
}

#[derive(Debug, Error)]
pub enum InsertAliasError {
    #[error("alias {} is already taken", .0.as_str())]
    AliasTaken(Alias),
    #[error("internal/database error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum UpdateAliasError {
    #[error("alias not found")]
    NotFound,
    #[error("alias {} is already taken", .0.as_str())]
    AliasTaken(Alias),
    #[error("internal/database error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DeleteAliasError {
    #[error("alias not found")]
    NotFound,
    #[error("internal/database error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait AliasRepository: Send + Sync {
    async fn retrieve_alias(&self, alias: &Alias) -> anyhow::Result<Option<AliasRecord>>;

    async fn list_aliases(&self) -> anyhow::Result<Vec<AliasRecord>>;

    /// Inserts a new record; fails if its alias is already stored.
    async fn insert_alias(&self, record: AliasRecord) -> Result<AliasRecord, InsertAliasError>;

    /// Applies `update` to the record stored under `alias` in one transaction.
    async fn update_alias(
        &self,
        alias: &Alias,
        update: AliasUpdate,
    ) -> Result<AliasRecord, UpdateAliasError>;

    async fn delete_alias(&self, alias: &Alias) -> Result<AliasRecord, DeleteAliasError>;
}

struct AliasRepositoryImpl {
    db: DbConn,
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[async_trait]
impl AliasRepository for AliasRepositoryImpl {
    #[instrument(skip(self))]
    async fn retrieve_alias(&self, alias: &Alias) -> anyhow::Result<Option<AliasRecord>> {
        short_url::Entity::find_by_id(alias.as_str())
            .one(&self.db)
            .await
            .context("Failed to retrieve alias from database")?
            .map(AliasRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_aliases(&self) -> anyhow::Result<Vec<AliasRecord>> {
        let models = short_url::Entity::find()
            .order_by_asc(short_url::Column::Alias)
            .all(&self.db)
            .await
            .context("Failed to list aliases from database")?;

        // One bad row must not hide the rest of the table.
        Ok(models
            .into_iter()
            .filter_map(|model| {
                AliasRecord::try_from(model)
                    .inspect_err(|err| warn!("Skipping unreadable alias row: {err:#}"))
                    .ok()
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn insert_alias(&self, record: AliasRecord) -> Result<AliasRecord, InsertAliasError> {
        let to_insert = short_url::ActiveModel {
            alias: Set(record.alias.as_str().to_owned()),
            original_url: Set(record.original_url.as_str().to_owned()),
        };

        match to_insert.insert(&self.db).await {
            Ok(model) => Ok(AliasRecord::try_from(model)?),
            Err(db_err) if is_unique_violation(&db_err) => {
                Err(InsertAliasError::AliasTaken(record.alias))
            }
            Err(db_err) => Err(anyhow::Error::new(db_err)
                .context("Failed to insert alias into database")
                .into()),
        }
    }

    #[instrument(skip(self))]
    async fn update_alias(
        &self,
        alias: &Alias,
        update: AliasUpdate,
    ) -> Result<AliasRecord, UpdateAliasError> {
        let AliasUpdate {
            alias: new_alias,
            original_url: new_original_url,
        } = update;

        let txn = self
            .db
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let existing = short_url::Entity::find_by_id(alias.as_str())
            .one(&txn)
            .await
            .context("Failed to retrieve alias from database")?
            .ok_or(UpdateAliasError::NotFound)?;

        let new_alias = new_alias.filter(|new_alias| new_alias != alias);
        if let Some(new_alias) = &new_alias {
            let taken = short_url::Entity::find_by_id(new_alias.as_str())
                .one(&txn)
                .await
                .context("Failed to check whether alias is taken")?
                .is_some();
            if taken {
                return Err(UpdateAliasError::AliasTaken(new_alias.clone()));
            }
        }

        let updated = short_url::Model {
            alias: new_alias
                .as_ref()
                .map_or(existing.alias, |new_alias| new_alias.as_str().to_owned()),
            original_url: new_original_url
                .map_or(existing.original_url, OriginalUrl::into_inner),
        };

        let result = short_url::Entity::update_many()
            .col_expr(short_url::Column::Alias, Expr::value(updated.alias.clone()))
            .col_expr(
                short_url::Column::OriginalUrl,
                Expr::value(updated.original_url.clone()),
            )
            .filter(short_url::Column::Alias.eq(alias.as_str()))
            .exec(&txn)
            .await;

        match result {
            Ok(result) if result.rows_affected == 0 => return Err(UpdateAliasError::NotFound),
            Ok(_) => {}
            Err(db_err) if is_unique_violation(&db_err) => {
                // NOTE: only reachable when a concurrent insert won the race
                return Err(UpdateAliasError::AliasTaken(
                    new_alias.unwrap_or_else(|| alias.clone()),
                ));
            }
            Err(db_err) => {
                return Err(anyhow::Error::new(db_err)
                    .context("Failed to update alias in database")
                    .into());
            }
        }

        txn.commit().await.context("Failed to commit update")?;
        Ok(AliasRecord::try_from(updated)?)
    }

    #[instrument(skip(self))]
    async fn delete_alias(&self, alias: &Alias) -> Result<AliasRecord, DeleteAliasError> {
        let txn = self
            .db
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let existing = short_url::Entity::find_by_id(alias.as_str())
            .one(&txn)
            .await
            .context("Failed to retrieve alias from database")?
            .ok_or(DeleteAliasError::NotFound)?;

        let result = short_url::Entity::delete_by_id(alias.as_str())
            .exec(&txn)
            .await
            .context("Failed to delete alias from database")?;
        if result.rows_affected == 0 {
            return Err(DeleteAliasError::NotFound);
        }

        txn.commit().await.context("Failed to commit delete")?;
        Ok(AliasRecord::try_from(existing)?)
    }
}

impl TryFrom<short_url::Model> for AliasRecord {
    type Error = anyhow::Error;

    fn try_from(
        short_url::Model {
            alias,
            original_url,
        }: short_url::Model,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            original_url: OriginalUrl::new(&original_url)
                .with_context(|| format!("Stored URL for alias {alias} is invalid"))?,
            alias: Alias::new(alias).context("Stored alias is invalid")?,
        })
    }
}
