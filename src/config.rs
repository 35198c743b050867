use std::env::{self, VarError};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use tracing::{info, instrument, warn};

use crate::alias_repo::ensure_schema;

/// # Errors
/// Will return [`Err`] if the connection to the database fails
/// or if the `short_urls` table could not be created.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!("Connecting to database");
    let db = Database::connect(db_connection_options).await?;
    ensure_schema(&db).await?;
    set_db_conn(db);

    info!("Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    const ENV_VAR_NAME: &str = "DB_URL";
    let mut options: ConnectOptions = env::var(ENV_VAR_NAME)
        .unwrap_or_else(|err| match err {
            VarError::NotPresent => panic!("{ENV_VAR_NAME} is not set"),
            VarError::NotUnicode(actual) => {
                panic!("{ENV_VAR_NAME} is invalid unicode: {}", actual.display());
            }
        })
        .into();
    options.sqlx_logging(false);
    options
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// The socket address to listen on, built from `HOST` and `PORT`.
///
/// # Panics
/// Panics when either environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    const DEFAULT_HOST: &str = "0.0.0.0";
    const DEFAULT_PORT: u16 = 5000;

    let host = env_or_default("HOST", DEFAULT_HOST.to_owned());
    let port = env_or_default("PORT", DEFAULT_PORT.to_string());
    let port: u16 = port
        .parse()
        .unwrap_or_else(|err| panic!("PORT environment variable {port:?} is invalid: {err}"));

    format!("{host}:{port}")
}

fn env_or_default(name: &str, default: String) -> String {
    match env::var(name) {
        Ok(value) => {
            info!(value, "{name} environment variable set");
            value
        }
        Err(VarError::NotPresent) => {
            warn!(
                value = %default,
                "{name} environment variable not set; defaulting to {default}"
            );
            default
        }
        Err(VarError::NotUnicode(actual)) => {
            panic!(
                "{name} environment variable is invalid: {}",
                actual.display()
            );
        }
    }
}
