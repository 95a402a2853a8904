//! Server Pages - Rendered HTML & Stream Paths
//!
//! Pages and stream paths are rendered once per server start, from the
//! settings snapshot taken at that moment. With PIN protection enabled the
//! stream endpoints get an unguessable random path so knowing the PIN page
//! URL alone is not enough to fetch frames.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::settings::SettingsSnapshot;

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const PIN_REQUEST_HTML: &str = include_str!("../../assets/pinrequest.html");
const BLOCKED_HTML: &str = include_str!("../../assets/blocked.html");

const STREAM_PATH_LENGTH: usize = 16;

/// Immutable page set for one server instance
#[derive(Debug, Clone)]
pub struct ServerPages {
    pub index_html: String,
    pub pin_request_html: String,
    pub pin_request_error_html: String,
    pub blocked_html: String,
    /// e.g. `kR3tZ....mjpeg` or `stream.mjpeg`, without leading slash
    pub stream_path: String,
    /// Single-frame fallback, same base name with `.jpeg`
    pub jpeg_path: String,
}

impl ServerPages {
    pub fn render(settings: &SettingsSnapshot) -> Self {
        let base = if settings.enable_pin {
            random_string(STREAM_PATH_LENGTH)
        } else {
            "stream".to_string()
        };

        let enable_buttons = settings.html_enable_buttons && !settings.enable_pin;
        let index_html = INDEX_HTML
            .replace("BACKGROUND_COLOR", &back_color(settings.html_back_color))
            .replace("ENABLE_BUTTONS", &enable_buttons.to_string())
            .replace("STREAM_ADDRESS", &format!("/{base}.mjpeg"));

        Self {
            index_html,
            pin_request_html: PIN_REQUEST_HTML.replace("WRONG_PIN_MESSAGE", "&nbsp"),
            pin_request_error_html: PIN_REQUEST_HTML.replace("WRONG_PIN_MESSAGE", "Wrong PIN"),
            blocked_html: BLOCKED_HTML.to_string(),
            stream_path: format!("{base}.mjpeg"),
            jpeg_path: format!("{base}.jpeg"),
        }
    }
}

fn back_color(rgb: u32) -> String {
    format!("#{:06X}", rgb & 0x00FF_FFFF)
}

/// Random alphanumeric string for unguessable stream paths
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Random six-digit PIN, zero padded
pub fn random_pin() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_path_without_pin() {
        let settings = SettingsSnapshot::default();
        let pages = ServerPages::render(&settings);
        assert_eq!(pages.stream_path, "stream.mjpeg");
        assert_eq!(pages.jpeg_path, "stream.jpeg");
    }

    #[test]
    fn test_random_path_with_pin() {
        let settings = SettingsSnapshot {
            enable_pin: true,
            ..Default::default()
        };
        let first = ServerPages::render(&settings);
        let second = ServerPages::render(&settings);
        assert!(first.stream_path.ends_with(".mjpeg"));
        assert_ne!(first.stream_path, "stream.mjpeg");
        assert_ne!(first.stream_path, second.stream_path);
        // The fallback image shares the random base name.
        assert_eq!(
            first.jpeg_path.trim_end_matches(".jpeg"),
            first.stream_path.trim_end_matches(".mjpeg")
        );
    }

    #[test]
    fn test_index_substitutions() {
        let settings = SettingsSnapshot {
            html_enable_buttons: true,
            html_back_color: 0x00AB_CDEF,
            ..Default::default()
        };
        let pages = ServerPages::render(&settings);
        assert!(pages.index_html.contains("#ABCDEF"));
        assert!(pages.index_html.contains("true"));
        assert!(pages.index_html.contains("/stream.mjpeg"));
        assert!(!pages.index_html.contains("BACKGROUND_COLOR"));
    }

    #[test]
    fn test_buttons_disabled_with_pin() {
        let settings = SettingsSnapshot {
            html_enable_buttons: true,
            enable_pin: true,
            ..Default::default()
        };
        let pages = ServerPages::render(&settings);
        assert!(!pages.index_html.contains("ENABLE_BUTTONS"));
        assert!(pages.index_html.contains("false"));
    }

    #[test]
    fn test_pin_error_page_variants() {
        let settings = SettingsSnapshot {
            enable_pin: true,
            ..Default::default()
        };
        let pages = ServerPages::render(&settings);
        assert!(pages.pin_request_html.contains("&nbsp"));
        assert!(pages.pin_request_error_html.contains("Wrong PIN"));
    }

    #[test]
    fn test_random_pin_format() {
        for _ in 0..20 {
            let pin = random_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
