use deadpool_postgres::Object;

/// WKB / EWKB sniffing for bytea payloads: a byte-order marker followed by
/// a plausible geometry type code (point..geometrycollection, with ISO Z/M
/// offsets or EWKB flag bits).
pub fn looks_like_wkb(bytes: &[u8]) -> bool {
    if bytes.len() < 9 {
        return false;
    }
    let type_bytes = [bytes[1], bytes[2], bytes[3], bytes[4]];
    let geom_type = match bytes[0] {
        0 => u32::from_be_bytes(type_bytes),
        1 => u32::from_le_bytes(type_bytes),
        _ => return false,
    };
    // Strip EWKB Z/M/SRID flags, then accept ISO base types 1..=7.
    let masked = geom_type & 0x0FFF_FFFF;
    if masked >= 4000 {
        return false;
    }
    (1..=7).contains(&(masked % 1000))
}

/// Convert an EWKB payload to GeoJSON with a round-trip through the
/// database. Returns None when the database yields no JSON.
pub async fn wkb_to_geojson(
    client: &Object,
    wkb: &[u8],
) -> Result<Option<serde_json::Value>, tokio_postgres::Error> {
    let row = client
        .query_one("SELECT ST_AsGeoJSON(ST_GeomFromEWKB($1))", &[&wkb])
        .await?;
    let geojson: Option<String> = row.get(0);
    Ok(geojson.and_then(|s| serde_json::from_str(&s).ok()))
}
