// src/utils/html.rs

/// Sanitizes teacher-authored rich text (question bodies, choices, feedback).
///
/// Whitelist-based: formatting tags such as <b>, <p>, <code> survive, while
/// <script>, <iframe> and event-handler attributes are stripped.
pub fn clean_html(input: &str) -> String {
    ammonia::clean(input)
}

pub fn clean_optional(input: Option<&str>) -> Option<String> {
    input.map(clean_html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_scripts_keeps_formatting() {
        let cleaned = clean_html("<p>Solve <b>x</b></p><script>alert(1)</script>");
        assert_eq!(cleaned, "<p>Solve <b>x</b></p>");
    }

    #[test]
    fn test_strips_event_handlers() {
        let cleaned = clean_html(r#"<img src="a.png" onerror="steal()">"#);
        assert!(!cleaned.contains("onerror"));
    }

    #[test]
    fn test_optional_passthrough() {
        assert_eq!(clean_optional(None), None);
        assert_eq!(clean_optional(Some("ok")), Some("ok".to_string()));
    }
}
