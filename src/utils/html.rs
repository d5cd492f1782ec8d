use crate::config::MAX_DISPLAY_NAME_LEN;
use crate::error::AppError;

/// Strips all markup from a display name using the ammonia library.
///
/// Names are rebroadcast to every client of a session, so no tag survives.
/// Whitespace runs are collapsed and the result is cut to
/// `MAX_DISPLAY_NAME_LEN` characters.
pub fn sanitize_display_name(input: &str) -> Result<String, AppError> {
    let stripped = ammonia::Builder::empty().clean(input).to_string();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let name: String = collapsed.chars().take(MAX_DISPLAY_NAME_LEN).collect();

    if name.is_empty() {
        return Err(AppError::BadRequest("Display name cannot be empty".to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_keeps_text() {
        assert_eq!(sanitize_display_name("<i>Bob</i>  the  builder").unwrap(), "Bob the builder");
    }

    #[test]
    fn truncates_long_names() {
        let name = sanitize_display_name(&"x".repeat(100)).unwrap();
        assert_eq!(name.chars().count(), MAX_DISPLAY_NAME_LEN);
    }

    #[test]
    fn empty_after_cleaning_is_rejected() {
        assert!(sanitize_display_name("<br>").is_err());
        assert!(sanitize_display_name("").is_err());
    }
}
