use hubsnap_core::AppError;

/// Parse the abbreviated count strings hub pages render.
///
/// ```
/// use hubsnap_client::parse::count_to_i64;
///
/// assert_eq!(count_to_i64("295,137").unwrap(), 295_137);
/// assert_eq!(count_to_i64("1.7k").unwrap(), 1_700);
/// assert_eq!(count_to_i64("-").unwrap(), 0);
/// ```
pub fn count_to_i64(s: &str) -> Result<i64, AppError> {
    let s = s.trim();
    if s.is_empty() || s == "-" {
        return Ok(0);
    }
    let s = s.replace(',', "");

    let scaled = |stripped: &str, factor: f64| -> Result<i64, AppError> {
        stripped
            .parse::<f64>()
            .map(|n| (n * factor) as i64)
            .map_err(|_| AppError::Scrape(format!("unparseable count: {s:?}")))
    };

    if let Some(stripped) = s.strip_suffix(['k', 'K']) {
        scaled(stripped, 1_000.0)
    } else if let Some(stripped) = s.strip_suffix(['m', 'M']) {
        scaled(stripped, 1_000_000.0)
    } else if let Some(stripped) = s.strip_suffix(['b', 'B']) {
        scaled(stripped, 1_000_000_000.0)
    } else {
        s.parse::<i64>()
            .map_err(|_| AppError::Scrape(format!("unparseable count: {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_comma_separated_numbers() {
        assert_eq!(count_to_i64("0").unwrap(), 0);
        assert_eq!(count_to_i64("1234").unwrap(), 1234);
        assert_eq!(count_to_i64("295,137").unwrap(), 295_137);
    }

    #[test]
    fn suffixed_counts_scale() {
        assert_eq!(count_to_i64("1.7k").unwrap(), 1_700);
        assert_eq!(count_to_i64("38k").unwrap(), 38_000);
        assert_eq!(count_to_i64("3.1m").unwrap(), 3_100_000);
        assert_eq!(count_to_i64("2B").unwrap(), 2_000_000_000);
    }

    #[test]
    fn placeholders_are_zero() {
        assert_eq!(count_to_i64("").unwrap(), 0);
        assert_eq!(count_to_i64("-").unwrap(), 0);
        assert_eq!(count_to_i64("  ").unwrap(), 0);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(count_to_i64("lots").is_err());
        assert!(count_to_i64("1.2.3k").is_err());
    }
}
