//! PostgreSQL engine built on sqlx
//!
//! Each endpoint gets a single dedicated `PgConnection`; no pool is involved.
//! Queries are prepared first so that submission errors are told apart from
//! errors raised while rows stream back. The rows themselves are fetched over
//! the simple query protocol, so the server sends every value in its text
//! output form and types without a mapping still read as the server prints
//! them.

use super::{Connector, EngineError, ResultSet, Session};
use crate::value::{render, Cell};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgHasArrayType, PgRow, PgValueFormat};
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::mac_address::MacAddress;
use sqlx::{
    Column, Connection, Decode, Executor, Postgres, Row, Statement, Type, TypeInfo, ValueRef,
};
use std::str::FromStr;
use tracing::{debug, trace};

/// Application name reported to the server
pub const APPLICATION_NAME: &str = "pgfan";

/// Connects single `PgConnection`s
#[derive(Debug, Clone, Default)]
pub struct PgConnector;

impl PgConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self, descriptor: &str) -> Result<PgSession, EngineError> {
        let options = PgConnectOptions::from_str(descriptor)?.application_name(APPLICATION_NAME);
        let conn = PgConnection::connect_with(&options).await?;
        Ok(PgSession { conn })
    }
}

/// A connected endpoint
pub struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl Session for PgSession {
    async fn execute<'a>(&'a mut self, sql: &'a str) -> Result<ResultSet<'a>, EngineError> {
        let statement = self.conn.prepare(sql).await?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        // extension types (citext) are only resolved by name on the prepare path
        let type_names: Vec<String> = statement
            .columns()
            .iter()
            .map(|column| column.type_info().name().to_string())
            .collect();
        debug!(columns = columns.len(), "Query prepared");

        // a bare &str carries no arguments, so sqlx sends a simple Query and
        // the rows arrive in text format
        let rows = self
            .conn
            .fetch(sql)
            .map(move |row| {
                row.map(|row| decode_row(&row, &type_names))
                    .map_err(EngineError::from)
            })
            .boxed();

        Ok(ResultSet { columns, rows })
    }

    async fn close(self) -> Result<(), EngineError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Decode every column of a row.
///
/// `type_names` are the prepared statement's column types; a column past
/// their end falls back to the name the row itself reports.
pub fn decode_row(row: &PgRow, type_names: &[String]) -> Vec<Cell> {
    (0..row.columns().len())
        .map(|idx| {
            let type_name = type_names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| row.columns()[idx].type_info().name().to_string());
            decode_cell(row, idx, type_name)
        })
        .collect()
}

/// Decode one column into a [`Cell`].
///
/// Never fails: a value whose type has no dedicated mapping, or which does not
/// decode as its declared type (NUMERIC 'NaN', say), becomes [`Cell::Unknown`]
/// carrying the value's text form.
///
/// Values are decoded unchecked against `type_name` because the row only
/// knows built-in types by name.
pub fn decode_cell(row: &PgRow, idx: usize, type_name: String) -> Cell {
    let format = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Cell::Null,
        Ok(raw) => raw.format(),
        Err(e) => return Cell::unknown(type_name, e.to_string()),
    };

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get_unchecked::<bool, _>(idx).map(Cell::Boolean),
        "INT2" => row.try_get_unchecked::<i16, _>(idx).map(|v| Cell::Integer(v.into())),
        "INT4" => row.try_get_unchecked::<i32, _>(idx).map(|v| Cell::Integer(v.into())),
        "INT8" => row.try_get_unchecked::<i64, _>(idx).map(|v| Cell::Integer(v.into())),
        "OID" => row
            .try_get_unchecked::<sqlx::postgres::types::Oid, _>(idx)
            .map(|v| Cell::Integer(v.0.into())),
        "FLOAT4" => row.try_get_unchecked::<f32, _>(idx).map(|v| Cell::Float(v.into())),
        "FLOAT8" => row.try_get_unchecked::<f64, _>(idx).map(Cell::Float),
        "NUMERIC" => row.try_get_unchecked::<BigDecimal, _>(idx).map(Cell::Decimal),
        // sqlx names blank-padded CHAR(n) "CHAR"
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "citext" => {
            row.try_get_unchecked::<String, _>(idx).map(Cell::Text)
        },
        // single-byte internal type, not CHAR(n)
        "\"CHAR\"" => row
            .try_get_unchecked::<i8, _>(idx)
            .map(|v| Cell::Text(single_byte_char(v))),
        "UUID" => row
            .try_get_unchecked::<uuid::Uuid, _>(idx)
            .map(|v| Cell::Text(v.to_string())),
        "MACADDR" => row.try_get_unchecked::<MacAddress, _>(idx).map(Cell::HardwareAddr),
        "BYTEA" => row.try_get_unchecked::<Vec<u8>, _>(idx).map(Cell::Binary),
        "INET" | "CIDR" => row.try_get_unchecked::<IpNetwork, _>(idx).map(Cell::Network),
        "TIMESTAMP" => row
            .try_get_unchecked::<NaiveDateTime, _>(idx)
            .map(Cell::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get_unchecked::<DateTime<Utc>, _>(idx)
            .map(Cell::TimestampTz),
        "DATE" => row.try_get_unchecked::<NaiveDate, _>(idx).map(Cell::Date),
        "TIME" => row.try_get_unchecked::<NaiveTime, _>(idx).map(Cell::Time),
        // sqlx only reads the binary interval layout; the server's own text
        // output is already the canonical form
        "INTERVAL" => match format {
            PgValueFormat::Binary => row
                .try_get_unchecked::<PgInterval, _>(idx)
                .map(Cell::Interval),
            PgValueFormat::Text => row.try_get_unchecked::<String, _>(idx).map(Cell::Text),
        },
        "JSON" | "JSONB" => row
            .try_get_unchecked::<serde_json::Value, _>(idx)
            .map(Cell::Json),
        "BOOL[]" => decode_array(row, idx, &type_name, Cell::Boolean),
        "INT2[]" => decode_array(row, idx, &type_name, |v: i16| Cell::Integer(v.into())),
        "INT4[]" => decode_array(row, idx, &type_name, |v: i32| Cell::Integer(v.into())),
        "INT8[]" => decode_array(row, idx, &type_name, |v: i64| Cell::Integer(v.into())),
        "FLOAT4[]" => decode_array(row, idx, &type_name, |v: f32| Cell::Float(v.into())),
        "FLOAT8[]" => decode_array(row, idx, &type_name, Cell::Float),
        "NUMERIC[]" => decode_array(row, idx, &type_name, Cell::Decimal),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => {
            decode_array(row, idx, &type_name, Cell::Text)
        },
        _ => return raw_fallback(row, idx, type_name),
    };

    decoded.unwrap_or_else(|e| {
        trace!(column = idx, type_name = %type_name, error = %e, "Falling back to raw value");
        raw_fallback(row, idx, type_name)
    })
}

/// Text of a `"char"` value; the empty value arrives as 0
fn single_byte_char(value: i8) -> String {
    match value as u8 {
        0 => String::new(),
        byte => char::from(byte).to_string(),
    }
}

/// One-dimensional array as `(TYPE[]): [a b c]`, each element rendered as
/// its own kind
fn decode_array<T>(
    row: &PgRow,
    idx: usize,
    type_name: &str,
    to_cell: impl Fn(T) -> Cell,
) -> Result<Cell, sqlx::Error>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres> + PgHasArrayType,
{
    let items: Vec<Option<T>> = row.try_get_unchecked(idx)?;
    let rendered: Vec<String> = items
        .into_iter()
        .map(|item| render(&item.map(&to_cell).unwrap_or(Cell::Null)))
        .collect();

    Ok(Cell::unknown(type_name, format!("[{}]", rendered.join(" "))))
}

/// The server's text form of the value.
///
/// Binary-format bytes are never written as text; they come out as
/// PostgreSQL hex instead.
fn raw_fallback(row: &PgRow, idx: usize, type_name: String) -> Cell {
    let text = match row.try_get_raw(idx) {
        Ok(raw) => match (raw.format(), raw.as_bytes()) {
            (PgValueFormat::Text, Ok(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            (PgValueFormat::Binary, Ok(bytes)) => format!("\\x{}", hex::encode(bytes)),
            (_, Err(e)) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    Cell::unknown(type_name, text)
}
