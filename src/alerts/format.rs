// Human formatting helpers for alert payloads

/// "$2.5M", "$750K", "$120"
pub fn format_usd(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1_000_000.0 {
        format!("${:.1}M", abs / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("${:.0}K", abs / 1_000.0)
    } else {
        format!("${:.0}", abs)
    }
}

/// "$50,000.00"
pub fn format_price(value: f64) -> String {
    let negative = value < 0.0;
    let abs = value.abs();
    let whole = abs.trunc() as i64;
    let cents = ((abs - abs.trunc()) * 100.0).round() as i64;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    format!("{}${}.{:02}", if negative { "-" } else { "" }, grouped, cents)
}

pub fn format_pct(value: f64) -> String {
    format!("{:.1}%", value)
}

/// "45s", "5m", "1h 5m", "2d 3h 10m"
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        return format!("{}s", seconds);
    }
    if seconds < 3600 {
        return format!("{}m", seconds / 60);
    }
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    if hours >= 24 {
        return format!("{}d {}h {}m", hours / 24, hours % 24, mins);
    }
    format!("{}h {}m", hours, mins)
}

/// "HH:MM:SS" in UTC.
pub fn format_time_utc(ts_ms: i64) -> String {
    let day_secs = (ts_ms / 1000).rem_euclid(86_400);
    format!(
        "{:02}:{:02}:{:02}",
        day_secs / 3600,
        (day_secs % 3600) / 60,
        day_secs % 60
    )
}

pub fn delta_arrow(value: f64) -> &'static str {
    if value > 0.0 {
        "\u{1f7e2}"
    } else if value < 0.0 {
        "\u{1f534}"
    } else {
        "\u{26aa}"
    }
}

/// Split on newlines so each chunk fits the sink's message size limit.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_len {
            chunks.push(rest.to_string());
            break;
        }
        let window = &rest[..max_len];
        let split_pos = window.rfind('\n').unwrap_or(max_len);
        chunks.push(rest[..split_pos].to_string());
        rest = rest[split_pos..].trim_start_matches('\n');
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(2_500_000.0), "$2.5M");
        assert_eq!(format_usd(750_000.0), "$750K");
        assert_eq!(format_usd(-1_200_000.0), "$1.2M");
        assert_eq!(format_usd(120.0), "$120");
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(50_000.0), "$50,000.00");
        assert_eq!(format_price(1_234_567.89), "$1,234,567.89");
        assert_eq!(format_price(997.5), "$997.50");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(300), "5m");
        assert_eq!(format_duration(3900), "1h 5m");
        assert_eq!(format_duration(2 * 86_400 + 3 * 3600 + 600), "2d 3h 10m");
    }

    #[test]
    fn test_format_time_utc() {
        assert_eq!(format_time_utc(0), "00:00:00");
        assert_eq!(format_time_utc(86_399_000), "23:59:59");
    }

    #[test]
    fn test_split_text_on_newlines() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_text(text, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "aaaa\nbbbb");
        assert_eq!(chunks[1], "cccc");
    }
}
