/// Expand a stored media path into an absolute URL. Paths that are already
/// absolute URLs pass through unchanged; everything else is anchored at the
/// configured base URL.
pub fn build_full_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }

    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_is_anchored() {
        assert_eq!(
            build_full_url("http://localhost:8000", "/media/pic.png"),
            "http://localhost:8000/media/pic.png"
        );
    }

    #[test]
    fn missing_leading_slash_is_added() {
        assert_eq!(
            build_full_url("http://localhost:8000", "media/pic.png"),
            "http://localhost:8000/media/pic.png"
        );
    }

    #[test]
    fn trailing_slash_on_base_is_collapsed() {
        assert_eq!(
            build_full_url("http://localhost:8000/", "/media/pic.png"),
            "http://localhost:8000/media/pic.png"
        );
    }

    #[test]
    fn absolute_urls_pass_through() {
        assert_eq!(
            build_full_url("http://localhost:8000", "https://cdn.example.com/pic.png"),
            "https://cdn.example.com/pic.png"
        );
    }
}
