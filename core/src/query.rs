//! Analytic query rendering for the canned report and decoding for ad-hoc queries.

/// Daily snapshot of hosted sites, partitioned by `pdate`.
pub const FUNCTION_APPS_TABLE: &str = "WawsAn_dailyentity";

pub const DEFAULT_RESULT_LIMIT: i64 = 100;

/// Render the "recently active function apps" query.
///
/// The subscription id is interpolated as-is into a quoted literal; a quote
/// character inside it produces an invalid query rather than an escaped one.
pub fn generate_function_apps_query(start_time: &str, subscription_id: &str, limit: i64) -> String {
    [
        FUNCTION_APPS_TABLE.to_string(),
        format!("| where pdate >= datetime({start_time})"),
        "| where isfunction == true".to_string(),
        "| where isactive == true".to_string(),
        format!("| where sitesubscription == \"{subscription_id}\""),
        "| summarize arg_max(pdate, *) by sitename".to_string(),
        format!("| take {limit}"),
    ]
    .join("\n")
}

/// Percent-decode a caller-supplied query. Input that does not decode to
/// valid UTF-8 is returned unchanged.
pub fn decode_query(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_apps_query_has_each_clause_once_in_order() {
        let query = generate_function_apps_query("2025-03-08T12:30:45.123Z", "sub-123", 50);
        let lines: Vec<&str> = query.lines().collect();
        assert_eq!(
            lines,
            vec![
                "WawsAn_dailyentity",
                "| where pdate >= datetime(2025-03-08T12:30:45.123Z)",
                "| where isfunction == true",
                "| where isactive == true",
                "| where sitesubscription == \"sub-123\"",
                "| summarize arg_max(pdate, *) by sitename",
                "| take 50",
            ]
        );
        assert_eq!(
            lines.iter().filter(|line| line.contains("take")).count(),
            1
        );
    }

    #[test]
    fn subscription_id_is_not_escaped() {
        let query = generate_function_apps_query("2025-01-01T00:00:00.000Z", "a\"b", 1);
        assert!(query.contains("| where sitesubscription == \"a\"b\""));
    }

    #[test]
    fn decode_query_handles_percent_escapes() {
        assert_eq!(
            decode_query("StormEvents%20%7C%20take%2010"),
            "StormEvents | take 10"
        );
        assert_eq!(decode_query("already plain"), "already plain");
    }

    #[test]
    fn decode_query_leaves_plus_signs_alone() {
        assert_eq!(decode_query("T+%7C+count"), "T+|+count");
    }

    #[test]
    fn decode_query_falls_back_to_original_on_invalid_utf8() {
        assert_eq!(decode_query("T%FF%FE"), "T%FF%FE");
    }
}
