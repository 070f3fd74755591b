use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, Type};

use crate::geometry::looks_like_wkb;

/// One decoded result cell. Geometry payloads are kept as raw EWKB until
/// the post-processing pass converts them through the database.
#[derive(Debug, Clone)]
pub enum Cell {
    Null,
    Json(serde_json::Value),
    Geometry(Vec<u8>),
}

impl<'a> FromSql<'a> for Cell {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if *ty == Type::BOOL {
            return Ok(Cell::Json(serde_json::Value::Bool(bool::from_sql(ty, raw)?)));
        }
        if *ty == Type::INT2 {
            return Ok(Cell::Json((i16::from_sql(ty, raw)? as i64).into()));
        }
        if *ty == Type::INT4 {
            return Ok(Cell::Json((i32::from_sql(ty, raw)? as i64).into()));
        }
        if *ty == Type::INT8 {
            return Ok(Cell::Json(i64::from_sql(ty, raw)?.into()));
        }
        if *ty == Type::FLOAT4 {
            return Ok(number_cell(f32::from_sql(ty, raw)? as f64));
        }
        if *ty == Type::FLOAT8 {
            return Ok(number_cell(f64::from_sql(ty, raw)?));
        }
        if *ty == Type::NUMERIC {
            let decimal = Decimal::from_sql(ty, raw)?;
            return Ok(match decimal.to_f64().and_then(serde_json::Number::from_f64) {
                Some(n) => Cell::Json(serde_json::Value::Number(n)),
                None => Cell::Json(serde_json::Value::String(decimal.to_string())),
            });
        }
        if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
        {
            return Ok(Cell::Json(serde_json::Value::String(String::from_sql(
                ty, raw,
            )?)));
        }
        if *ty == Type::UUID {
            return Ok(Cell::Json(serde_json::Value::String(
                uuid::Uuid::from_sql(ty, raw)?.to_string(),
            )));
        }
        if *ty == Type::DATE {
            let date = chrono::NaiveDate::from_sql(ty, raw)?;
            return Ok(Cell::Json(serde_json::Value::String(
                date.format("%Y-%m-%d").to_string(),
            )));
        }
        if *ty == Type::TIME {
            let time = chrono::NaiveTime::from_sql(ty, raw)?;
            return Ok(Cell::Json(serde_json::Value::String(
                time.format("%H:%M:%S%.f").to_string(),
            )));
        }
        if *ty == Type::TIMESTAMP {
            let ts = chrono::NaiveDateTime::from_sql(ty, raw)?;
            return Ok(Cell::Json(serde_json::Value::String(
                ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            )));
        }
        if *ty == Type::TIMESTAMPTZ {
            let ts = chrono::DateTime::<chrono::Utc>::from_sql(ty, raw)?;
            return Ok(Cell::Json(serde_json::Value::String(ts.to_rfc3339())));
        }
        if *ty == Type::JSON || *ty == Type::JSONB {
            return Ok(Cell::Json(serde_json::Value::from_sql(ty, raw)?));
        }
        if *ty == Type::BYTEA {
            let bytes = raw.to_vec();
            if looks_like_wkb(&bytes) {
                return Ok(Cell::Geometry(bytes));
            }
            return Ok(Cell::Json(serde_json::Value::String(hex_encode(&bytes))));
        }
        match ty.name() {
            "geometry" | "geography" => Ok(Cell::Geometry(raw.to_vec())),
            other => {
                // Enums and other textual user-defined types decode as their
                // label; anything else degrades to null.
                match std::str::from_utf8(raw) {
                    Ok(text) => Ok(Cell::Json(serde_json::Value::String(text.to_string()))),
                    Err(_) => {
                        tracing::debug!(pg_type = other, "Undecodable column type, emitting null");
                        Ok(Cell::Null)
                    }
                }
            }
        }
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Cell::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn number_cell(value: f64) -> Cell {
    match serde_json::Number::from_f64(value) {
        Some(n) => Cell::Json(serde_json::Value::Number(n)),
        None => Cell::Null,
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Decode every cell of a row, keyed by column name.
pub fn row_to_pairs(row: &Row) -> Result<Vec<(String, Cell)>, tokio_postgres::Error> {
    let mut pairs = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let cell: Cell = row.try_get(index)?;
        pairs.push((column.name().to_string(), cell));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding_matches_postgres_style() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0x01]), "\\xdead01");
        assert_eq!(hex_encode(&[]), "\\x");
    }

    #[test]
    fn nan_floats_become_null() {
        assert!(matches!(number_cell(f64::NAN), Cell::Null));
        assert!(matches!(number_cell(1.5), Cell::Json(_)));
    }
}
