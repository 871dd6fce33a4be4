//! Core domain model for Deal Post Press.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealpress-core";

/// Canonical column names of the deal sheet.
pub mod columns {
    pub const DEAL_URL: &str = "DEAL_URL";
    pub const PRODUCT_TITLE: &str = "PRODUCT_TITLE";
    pub const IMAGEURL: &str = "IMAGEURL";
    pub const PRICE: &str = "PRICE";
    pub const REG: &str = "REG";
    pub const BADGE: &str = "BADGE";
    pub const COLOR: &str = "COLOR";
    pub const BADGE_COLOR: &str = "BADGE_COLOR";
    pub const PROMO_CODE: &str = "PROMO_CODE";
    pub const EDITED_IMAGE: &str = "EDITED_IMAGE";
    pub const PINTREST_EDITED: &str = "PINTREST_EDITED";
    pub const CAPTION_WITH_HASHTAG: &str = "CAPTION_WITH_HASHTAG";
    pub const COMMENTS: &str = "COMMENTS";

    /// The four generated outputs; a row with all four already filled is skipped.
    pub const OUTPUT_COLUMNS: [&str; 4] =
        [EDITED_IMAGE, PINTREST_EDITED, CAPTION_WITH_HASHTAG, COMMENTS];

    /// Resolved inputs echoed back so autofilled values land in the sheet.
    pub const ECHO_COLUMNS: [&str; 4] = [PRODUCT_TITLE, IMAGEURL, PRICE, REG];

    /// Every column the pipeline ensures exists and writes at the end of a
    /// run, in ensure order: outputs first, echoed inputs after.
    pub const WRITEBACK_COLUMNS: [&str; 8] = [
        EDITED_IMAGE,
        PINTREST_EDITED,
        CAPTION_WITH_HASHTAG,
        COMMENTS,
        PRODUCT_TITLE,
        IMAGEURL,
        PRICE,
        REG,
    ];
}

/// One data row of the deal sheet. `position` is the 1-based index within
/// the data region, so the sheet row is `position + 1` (row 1 is the header).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRow {
    pub position: usize,
    fields: HashMap<String, String>,
}

impl DealRow {
    pub fn new(position: usize, fields: HashMap<String, String>) -> Self {
        Self { position, fields }
    }

    /// Trimmed cell value. A missing column and an empty cell read the same.
    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(|v| v.trim()).unwrap_or("")
    }

    pub fn is_blank(&self, column: &str) -> bool {
        self.get(column).is_empty()
    }

    /// Sheet row number (header is row 1).
    pub fn sheet_row(&self) -> usize {
        self.position + 1
    }
}

/// Product facts assembled by the enrichment cascade. Empty string means
/// "still unknown"; merge order decides which source wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProductData {
    pub catalog_id: String,
    pub name: String,
    pub price: String,
    pub regular_price: String,
    pub image_url: String,
    pub promo: PromoInfo,
    pub promo_code: PromoCode,
}

impl ProductData {
    /// Fill still-empty fields from a lower-priority source. Existing values
    /// are never replaced.
    pub fn fill_from(&mut self, other: ProductData) {
        if self.catalog_id.is_empty() {
            self.catalog_id = other.catalog_id;
        }
        if self.name.is_empty() {
            self.name = other.name;
        }
        if self.price.is_empty() {
            self.price = other.price;
        }
        if self.regular_price.is_empty() {
            self.regular_price = other.regular_price;
        }
        if self.image_url.is_empty() {
            self.image_url = other.image_url;
        }
        if !self.promo.has_promo && other.promo.has_promo {
            self.promo = other.promo;
        }
        if !self.promo_code.has_promo && other.promo_code.has_promo {
            self.promo_code = other.promo_code;
        }
    }

    /// Whether every field the downstream stages read is present.
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty()
            && !self.price.is_empty()
            && !self.regular_price.is_empty()
            && !self.image_url.is_empty()
    }
}

/// Active-promotion flag plus its marketing line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PromoInfo {
    pub has_promo: bool,
    pub promo_text: String,
}

impl PromoInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            has_promo: true,
            promo_text: text.into(),
        }
    }
}

/// Promo-code resolution result: code, advertised discount label (may be
/// empty) and a ready-made announcement line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PromoCode {
    pub has_promo: bool,
    pub code: String,
    pub discount: String,
    pub text: String,
}

impl PromoCode {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Badge shape drawn behind the price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeShape {
    Circle,
    Square,
    None,
}

impl BadgeShape {
    /// Parse a sheet cell value; unrecognized values fall back to circle.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "square" => BadgeShape::Square,
            "none" => BadgeShape::None,
            _ => BadgeShape::Circle,
        }
    }
}

impl Default for BadgeShape {
    fn default() -> Self {
        BadgeShape::Circle
    }
}

const DEFAULT_BADGE_COLOR: &str = "#FF0000";

/// Map a sheet color value to a `#RRGGBB` hex string. Named colors come from
/// a fixed palette; hex values pass through uppercased; anything else falls
/// back to red.
pub fn normalize_color(value: &str) -> String {
    let v = value.trim();
    match v.to_ascii_lowercase().as_str() {
        "red" => "#FF0000".to_string(),
        "green" => "#3B8132".to_string(),
        "blue" => "#3895D3".to_string(),
        "yellow" => "#FFED29".to_string(),
        "orange" => "#FFAE42".to_string(),
        _ => {
            if v.len() == 7
                && v.starts_with('#')
                && v[1..].chars().all(|c| c.is_ascii_hexdigit())
            {
                v.to_ascii_uppercase()
            } else {
                DEFAULT_BADGE_COLOR.to_string()
            }
        }
    }
}

/// Everything the composer needs for one output image. Overlay paths are
/// resolved by the caller; `None` means the overlay is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub product_image: PathBuf,
    pub price: String,
    pub regular_price: String,
    pub badge_color: String,
    pub badge_shape: BadgeShape,
    pub marketing_badge: Option<PathBuf>,
    pub link_badge: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl ComposeRequest {
    pub fn new(product_image: impl Into<PathBuf>, price: impl Into<String>) -> Self {
        Self {
            product_image: product_image.into(),
            price: price.into(),
            regular_price: String::new(),
            badge_color: DEFAULT_BADGE_COLOR.to_string(),
            badge_shape: BadgeShape::Circle,
            marketing_badge: None,
            link_badge: None,
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_colors_map_to_palette_hex() {
        assert_eq!(normalize_color("red"), "#FF0000");
        assert_eq!(normalize_color("GREEN"), "#3B8132");
        assert_eq!(normalize_color(" blue "), "#3895D3");
        assert_eq!(normalize_color("yellow"), "#FFED29");
        assert_eq!(normalize_color("orange"), "#FFAE42");
    }

    #[test]
    fn hex_passes_through_uppercased() {
        assert_eq!(normalize_color("#abcdef"), "#ABCDEF");
        assert_eq!(normalize_color("#FF00aa"), "#FF00AA");
    }

    #[test]
    fn unknown_color_falls_back_to_red() {
        assert_eq!(normalize_color("mauve"), "#FF0000");
        assert_eq!(normalize_color(""), "#FF0000");
        assert_eq!(normalize_color("#12345"), "#FF0000");
        assert_eq!(normalize_color("#1234567"), "#FF0000");
        assert_eq!(normalize_color("#12345g"), "#FF0000");
    }

    #[test]
    fn fill_from_keeps_existing_values() {
        let mut first = ProductData {
            name: "Widget".into(),
            price: "$9.99".into(),
            ..Default::default()
        };
        first.fill_from(ProductData {
            name: "Other".into(),
            price: "$1.00".into(),
            regular_price: "$19.99".into(),
            image_url: "https://example.com/w.jpg".into(),
            ..Default::default()
        });
        assert_eq!(first.name, "Widget");
        assert_eq!(first.price, "$9.99");
        assert_eq!(first.regular_price, "$19.99");
        assert_eq!(first.image_url, "https://example.com/w.jpg");
    }

    #[test]
    fn missing_column_reads_as_empty() {
        let row = DealRow::new(1, HashMap::new());
        assert_eq!(row.get(columns::DEAL_URL), "");
        assert!(row.is_blank(columns::CAPTION_WITH_HASHTAG));
        assert_eq!(row.sheet_row(), 2);
    }

    #[test]
    fn row_values_are_trimmed() {
        let mut fields = HashMap::new();
        fields.insert(columns::PRICE.to_string(), "  $5.00  ".to_string());
        let row = DealRow::new(3, fields);
        assert_eq!(row.get(columns::PRICE), "$5.00");
    }

    #[test]
    fn badge_shape_parses_with_circle_default() {
        assert_eq!(BadgeShape::parse("square"), BadgeShape::Square);
        assert_eq!(BadgeShape::parse(" NONE "), BadgeShape::None);
        assert_eq!(BadgeShape::parse("circle"), BadgeShape::Circle);
        assert_eq!(BadgeShape::parse("hexagon"), BadgeShape::Circle);
        assert_eq!(BadgeShape::parse(""), BadgeShape::Circle);
    }
}
