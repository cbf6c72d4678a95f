//! Icons embedded at compile time using rust_embed

use gpui::AssetSource;
use rust_embed::RustEmbed;
use std::borrow::Cow;

#[derive(RustEmbed)]
#[folder = "assets"]
#[include = "icons/*.svg"]
pub struct Assets;

/// Icon paths used by the UI
pub mod icons {
    pub const MIC: &str = "icons/mic.svg";
    pub const UPLOAD: &str = "icons/upload.svg";
    pub const PLAY: &str = "icons/play.svg";
    pub const STOP: &str = "icons/stop.svg";
    pub const CLOSE: &str = "icons/x.svg";
}

impl AssetSource for Assets {
    fn load(&self, path: &str) -> anyhow::Result<Option<Cow<'static, [u8]>>> {
        if path.is_empty() {
            return Ok(None);
        }
        Ok(Self::get(path).map(|f| f.data))
    }

    fn list(&self, path: &str) -> anyhow::Result<Vec<gpui::SharedString>> {
        Ok(Self::iter()
            .filter(|p| p.starts_with(path))
            .map(|p| p.into())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_icon_is_embedded() {
        for path in [icons::MIC, icons::UPLOAD, icons::PLAY, icons::STOP, icons::CLOSE] {
            let data = Assets.load(path).unwrap();
            assert!(data.is_some(), "missing {}", path);
        }
        assert_eq!(Assets.list("icons/").unwrap().len(), 5);
    }
}
