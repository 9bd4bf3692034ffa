//! Source database connection.
//!
//! The traversal engine owns exactly one PostgreSQL connection and issues
//! at most one query at a time; the server governs parallelism, the engine
//! governs ordering. The connection is read-only by posture: on connect the
//! session is switched to read-only and verified, and the engine itself
//! never issues write DML.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::{Config as PgConfig, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ReadOnlyPosture};
use crate::error::{DumpError, Result};
use crate::graph::RawValue;

/// The exclusive source connection.
pub struct PgSource {
    client: tokio_postgres::Client,
}

impl PgSource {
    /// Connect and prepare the session: TLS per `ssl_mode`, statement
    /// timeout, and the read-only posture.
    pub async fn connect(config: &ConnectionConfig, posture: ReadOnlyPosture) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let client = match config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                let (client, connection) = pg_config
                    .connect(NoTls)
                    .await
                    .map_err(|e| DumpError::connection(e.to_string(), "connecting to source"))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("connection task ended with error: {}", e);
                    }
                });
                client
            }
            mode => {
                let tls_config = build_tls_config(mode)?;
                let tls = MakeRustlsConnect::new(tls_config);
                let (client, connection) = pg_config
                    .connect(tls)
                    .await
                    .map_err(|e| DumpError::connection(e.to_string(), "connecting to source"))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("connection task ended with error: {}", e);
                    }
                });
                client
            }
        };

        info!(
            "Connected to PostgreSQL source: {}:{}/{}",
            config.host, config.port, config.database
        );

        let source = Self { client };
        source
            .setup_session(config.statement_timeout_secs, posture)
            .await?;
        Ok(source)
    }

    async fn setup_session(&self, timeout_secs: u64, posture: ReadOnlyPosture) -> Result<()> {
        self.client
            .batch_execute(&format!("SET statement_timeout = {}", timeout_secs * 1000))
            .await?;

        let read_only = match self
            .client
            .batch_execute("SET default_transaction_read_only = on")
            .await
        {
            Ok(()) => {
                let row = self
                    .client
                    .query_one("SHOW default_transaction_read_only", &[])
                    .await?;
                row.get::<_, String>(0) == "on"
            }
            Err(e) => {
                debug!("could not switch session to read-only: {}", e);
                false
            }
        };

        match (read_only, posture) {
            (true, _) => {
                debug!("session is read-only");
                Ok(())
            }
            (false, ReadOnlyPosture::Require) => Err(DumpError::ReadOnlyEnforcement),
            (false, ReadOnlyPosture::Advisory) => {
                warn!("session could not be made read-only; proceeding on a writable connection");
                Ok(())
            }
            (false, ReadOnlyPosture::AllowWrite) => Ok(()),
        }
    }

    /// Run a parameterless query (all values are inlined as literals by the
    /// callers, which own quoting).
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        debug!(sql, "executing query");
        Ok(self.client.query(sql, &[]).await?)
    }

    /// Run a query with text parameters.
    pub async fn query_params(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        debug!(sql, "executing query");
        Ok(self.client.query(sql, params).await?)
    }

    /// Test the connection.
    pub async fn ping(&self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

/// Build the TLS configuration for the given ssl_mode.
fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
    let config = match ssl_mode {
        "require" => {
            warn!(
                "ssl_mode=require encrypts the connection but accepts any server \
                 certificate; prefer verify-full on untrusted networks"
            );
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth()
        }
        "verify-ca" | "verify-full" => {
            info!("TLS with certificate verification (ssl_mode={})", ssl_mode);
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
        other => {
            return Err(DumpError::Usage(format!(
                "unknown ssl_mode {:?}; expected one of disable, require, verify-ca, verify-full",
                other
            )));
        }
    };

    Ok(config)
}

/// Convert one column of a fetched row into a [`RawValue`] keyed off the
/// catalog's udt_name. Types are never inferred from runtime values.
pub fn convert_row_value(row: &Row, idx: usize, udt_name: &str) -> RawValue {
    match udt_name {
        "bool" => opt(row.try_get::<_, Option<bool>>(idx), RawValue::Bool),
        "int2" => opt(row.try_get::<_, Option<i16>>(idx), RawValue::I16),
        "int4" => opt(row.try_get::<_, Option<i32>>(idx), RawValue::I32),
        "int8" => opt(row.try_get::<_, Option<i64>>(idx), RawValue::I64),
        "float4" => opt(row.try_get::<_, Option<f32>>(idx), RawValue::F32),
        "float8" => opt(row.try_get::<_, Option<f64>>(idx), RawValue::F64),
        "numeric" => opt(
            row.try_get::<_, Option<rust_decimal::Decimal>>(idx),
            RawValue::Decimal,
        ),
        "uuid" => opt(row.try_get::<_, Option<uuid::Uuid>>(idx), RawValue::Uuid),
        "bytea" => opt(row.try_get::<_, Option<Vec<u8>>>(idx), RawValue::Bytes),
        "date" => opt(
            row.try_get::<_, Option<chrono::NaiveDate>>(idx),
            RawValue::Date,
        ),
        "time" => opt(
            row.try_get::<_, Option<chrono::NaiveTime>>(idx),
            RawValue::Time,
        ),
        "timestamp" => opt(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx),
            RawValue::Timestamp,
        ),
        "timestamptz" => opt(
            row.try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx),
            RawValue::TimestampTz,
        ),
        "json" | "jsonb" => opt(
            row.try_get::<_, Option<serde_json::Value>>(idx),
            RawValue::Json,
        ),
        array if array.starts_with('_') => convert_array_value(row, idx, &array[1..]),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(Some(v)) => RawValue::Other(v),
            _ => RawValue::Null,
        },
    }
}

/// Convert an array column by element type. Element types without a
/// dedicated variant fall back to a textual rendering.
fn convert_array_value(row: &Row, idx: usize, elem_udt: &str) -> RawValue {
    fn arr<T>(
        res: std::result::Result<Option<Vec<T>>, tokio_postgres::Error>,
        f: impl Fn(T) -> RawValue,
    ) -> RawValue {
        match res {
            Ok(Some(items)) => RawValue::Array(items.into_iter().map(f).collect()),
            _ => RawValue::Null,
        }
    }

    match elem_udt {
        "bool" => arr(row.try_get::<_, Option<Vec<bool>>>(idx), RawValue::Bool),
        "int2" => arr(row.try_get::<_, Option<Vec<i16>>>(idx), RawValue::I16),
        "int4" => arr(row.try_get::<_, Option<Vec<i32>>>(idx), RawValue::I32),
        "int8" => arr(row.try_get::<_, Option<Vec<i64>>>(idx), RawValue::I64),
        "float4" => arr(row.try_get::<_, Option<Vec<f32>>>(idx), RawValue::F32),
        "float8" => arr(row.try_get::<_, Option<Vec<f64>>>(idx), RawValue::F64),
        "uuid" => arr(row.try_get::<_, Option<Vec<uuid::Uuid>>>(idx), RawValue::Uuid),
        "text" | "varchar" | "bpchar" => {
            arr(row.try_get::<_, Option<Vec<String>>>(idx), RawValue::Text)
        }
        _ => match row.try_get::<_, Option<Vec<String>>>(idx) {
            Ok(Some(items)) => RawValue::Array(items.into_iter().map(RawValue::Other).collect()),
            _ => RawValue::Null,
        },
    }
}

fn opt<T>(
    res: std::result::Result<Option<T>, tokio_postgres::Error>,
    f: impl FnOnce(T) -> RawValue,
) -> RawValue {
    match res {
        Ok(Some(v)) => f(v),
        Ok(None) => RawValue::Null,
        Err(_) => RawValue::Null,
    }
}

/// Verifier for `ssl_mode=require`: skips certificate chain and hostname
/// checks (self-signed server certificates are the norm for that mode) but
/// still verifies handshake signatures against the provider's supported
/// algorithms, so the advertised scheme list always matches what the
/// crypto provider can actually check.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
