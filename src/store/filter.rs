//! Catalog filter → parameterized SQL.
//!
//! Every catalog query (listing, map points, location/device groups) shares
//! one filter record and one WHERE builder. All values travel as bind
//! parameters; free-text search escapes LIKE metacharacters so a `%` in the
//! query box matches a literal percent sign.

use rusqlite::types::Value as SqlValue;

/// Filter over the media table. Empty fields are inactive.
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    pub state: String,
    pub county: String,
    pub city: String,
    pub road: String,
    pub kind: String,
    pub query: String,
    pub capture_from: String,
    pub capture_to: String,
    /// "yes", "no", or empty.
    pub has_gps: String,
    pub album_id: i64,
    pub near_lat: f64,
    pub near_lon: f64,
    pub has_near: bool,
    pub device_make: String,
    pub device_model: String,
    pub device_unset: bool,
}

pub fn escape_like_pattern(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Build the WHERE clause body (no leading `WHERE`) plus its parameters.
pub fn build_media_where(filter: &MediaFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = vec!["1=1".to_string()];
    let mut params: Vec<SqlValue> = Vec::new();

    let mut location = |col: &str, value: &str| {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if value.eq_ignore_ascii_case("unknown") {
            clauses.push(format!("({col} IS NULL OR TRIM({col}) = '')"));
            return;
        }
        // Stored values may carry stray whitespace or casing from providers.
        clauses.push(format!("LOWER(TRIM(COALESCE({col}, ''))) = LOWER(?)"));
        params.push(SqlValue::Text(value.to_string()));
    };

    location("loc_state", &filter.state);
    location("loc_county", &filter.county);
    location("loc_city", &filter.city);
    location("loc_road", &filter.road);

    let kind = filter.kind.trim().to_lowercase();
    if kind == "image" || kind == "video" {
        clauses.push("kind = ?".to_string());
        params.push(SqlValue::Text(kind));
    }

    let q = filter.query.trim().to_lowercase();
    if !q.is_empty() {
        let like = format!("%{}%", escape_like_pattern(&q));
        let text_cols = [
            "LOWER(file_name)",
            "LOWER(extension)",
            "LOWER(COALESCE(make,''))",
            "LOWER(COALESCE(model,''))",
            "LOWER(COALESCE(loc_display_name,''))",
        ];
        let search = text_cols
            .iter()
            .map(|col| format!(r"{col} LIKE ? ESCAPE '\'"))
            .collect::<Vec<_>>()
            .join(" OR ");
        clauses.push(format!("({search})"));
        for _ in 0..5 {
            params.push(SqlValue::Text(like.clone()));
        }
    }

    if !filter.capture_from.trim().is_empty() {
        clauses.push("capture_time >= ?".to_string());
        params.push(SqlValue::Text(filter.capture_from.trim().to_string()));
    }
    if !filter.capture_to.trim().is_empty() {
        clauses.push("capture_time <= ?".to_string());
        params.push(SqlValue::Text(filter.capture_to.trim().to_string()));
    }

    match filter.has_gps.trim().to_lowercase().as_str() {
        "yes" => clauses.push("gps_lat IS NOT NULL AND gps_lon IS NOT NULL".to_string()),
        "no" => clauses.push("(gps_lat IS NULL OR gps_lon IS NULL)".to_string()),
        _ => {}
    }

    if filter.album_id > 0 {
        clauses.push("id IN (SELECT media_id FROM album_items WHERE album_id = ?)".to_string());
        params.push(SqlValue::Integer(filter.album_id));
    }

    if filter.has_near {
        clauses.push("gps_lat IS NOT NULL AND gps_lon IS NOT NULL".to_string());
    }

    if filter.device_unset {
        clauses.push("TRIM(COALESCE(make, '')) = '' AND TRIM(COALESCE(model, '')) = ''".to_string());
    } else {
        if !filter.device_make.trim().is_empty() {
            clauses.push("TRIM(COALESCE(make, '')) = ?".to_string());
            params.push(SqlValue::Text(filter.device_make.trim().to_string()));
        }
        if !filter.device_model.trim().is_empty() {
            clauses.push("TRIM(COALESCE(model, '')) = ?".to_string());
            params.push(SqlValue::Text(filter.device_model.trim().to_string()));
        }
    }

    (clauses.join(" AND "), params)
}

/// Resolve the caller-supplied sort key to a real column expression. Unknown
/// keys fall back to capture time. `distance` is only honored with a near
/// point and contributes bind parameters of its own.
pub fn sort_expression(sort_by: &str, filter: &MediaFilter) -> (String, Vec<SqlValue>) {
    let col = match sort_by {
        "capture_time" | "" => "capture_time",
        "ingested_at" => "ingested_at",
        "file_name" => "file_name",
        "size_bytes" => "size_bytes",
        "kind" => "kind",
        "make" => "make",
        "model" => "model",
        "camera_yaw" => "camera_yaw",
        "camera_pitch" => "camera_pitch",
        "camera_roll" => "camera_roll",
        "gps_lat" => "gps_lat",
        "gps_lon" => "gps_lon",
        "state" => "loc_state",
        "county" => "loc_county",
        "city" => "loc_city",
        "road" => "loc_road",
        "extension" => "extension",
        "distance" if filter.has_near => {
            // Squared lat/lon distance is monotonic with true distance at
            // regional scale, which is all the UI needs.
            let expr =
                "((gps_lat - ?) * (gps_lat - ?) + (gps_lon - ?) * (gps_lon - ?))".to_string();
            let params = vec![
                SqlValue::Real(filter.near_lat),
                SqlValue::Real(filter.near_lat),
                SqlValue::Real(filter.near_lon),
                SqlValue::Real(filter.near_lon),
            ];
            return (expr, params);
        }
        _ => "capture_time",
    };
    (col.to_string(), Vec::new())
}

pub fn sort_order(sort_by: &str, order: &str) -> &'static str {
    if sort_by.eq_ignore_ascii_case("distance") {
        // Nearest-first unless explicitly reversed.
        if order.eq_ignore_ascii_case("desc") {
            return "DESC";
        }
        return "ASC";
    }
    if order.eq_ignore_ascii_case("asc") {
        "ASC"
    } else {
        "DESC"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_is_a_tautology() {
        let (sql, params) = build_media_where(&MediaFilter::default());
        assert_eq!(sql, "1=1");
        assert!(params.is_empty());
    }

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like_pattern("100%_done\\x"), "100\\%\\_done\\\\x");
    }

    #[test]
    fn unknown_location_selects_null_or_blank() {
        let filter = MediaFilter {
            state: "Unknown".to_string(),
            ..Default::default()
        };
        let (sql, params) = build_media_where(&filter);
        assert!(sql.contains("loc_state IS NULL OR TRIM(loc_state) = ''"));
        assert!(params.is_empty());
    }

    #[test]
    fn location_values_bind_as_parameters() {
        let filter = MediaFilter {
            state: " Colorado ".to_string(),
            city: "Denver".to_string(),
            ..Default::default()
        };
        let (sql, params) = build_media_where(&filter);
        assert_eq!(sql.matches('?').count(), 2);
        assert_eq!(params.len(), 2);
        assert!(matches!(&params[0], SqlValue::Text(t) if t == "Colorado"));
    }

    #[test]
    fn invalid_kind_is_ignored() {
        let filter = MediaFilter {
            kind: "audio".to_string(),
            ..Default::default()
        };
        let (sql, _) = build_media_where(&filter);
        assert!(!sql.contains("kind"));
    }

    #[test]
    fn distance_sort_needs_near_point() {
        let without = MediaFilter::default();
        let (expr, params) = sort_expression("distance", &without);
        assert_eq!(expr, "capture_time");
        assert!(params.is_empty());

        let with = MediaFilter {
            has_near: true,
            near_lat: 39.7,
            near_lon: -104.9,
            ..Default::default()
        };
        let (expr, params) = sort_expression("distance", &with);
        assert!(expr.contains("gps_lat"));
        assert_eq!(params.len(), 4);
        assert_eq!(sort_order("distance", ""), "ASC");
        assert_eq!(sort_order("distance", "desc"), "DESC");
    }

    #[test]
    fn sort_whitelist_blocks_injection() {
        let (expr, _) = sort_expression("capture_time; DROP TABLE media_files", &MediaFilter::default());
        assert_eq!(expr, "capture_time");
    }
}
