//! Content-type normalization (spec §4.4, §9): strip parameters and
//! lowercase at every boundary; only normalized forms are ever stored or
//! compared.

pub const JSON: &str = "application/json";

pub fn normalize(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn is_json(normalized: &str) -> bool {
    normalized == JSON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_parameters_and_lowercases() {
        assert_eq!(normalize("Application/JSON; charset=utf-8"), "application/json");
        assert_eq!(normalize("text/plain"), "text/plain");
        assert_eq!(normalize("  TEXT/PLAIN ;boundary=x"), "text/plain");
    }

    #[test]
    fn json_charset_variant_is_treated_as_identical_to_bare_json() {
        assert_eq!(normalize("application/json"), normalize("application/json; charset=utf-8"));
        assert!(is_json(&normalize("application/json; charset=utf-8")));
    }
}
