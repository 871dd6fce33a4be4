//! Deterministic deal-card composer: a 1080 square canvas with the product
//! shot centered, a price badge top right, optional overlay art and a price
//! disclaimer. Same request, same bytes.

use std::path::{Path, PathBuf};

use ab_glyph::{Font, FontRef, PxScale, ScaleFont};
use dealpress_core::{BadgeShape, ComposeRequest};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut,
};
use imageproc::rect::Rect;
use thiserror::Error;

pub const CRATE_NAME: &str = "dealpress-image";

pub const CANVAS_SIZE: u32 = 1080;
pub const BADGE_SIZE: u32 = 200;
pub const MARGIN: u32 = 40;

const PRICE_FONT: f32 = 70.0;
const PRICE_FONT_SMALL: f32 = 50.0;
const REG_FONT: f32 = 25.0;
const DISCLAIMER_FONT: f32 = 24.0;
const LINE_SPACING: f32 = 4.0;
const PRICE_WRAP_WIDTH: f32 = 150.0;
const PRODUCT_LIMIT: u32 = 756;
const MARKETING_BADGE_SCALE: f32 = 0.30;
const LINK_BADGE_SCALE: f32 = 1.6;
const DISCLAIMER_TEXT: &str = "*Prices are subject to change at any time.";

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const DISCLAIMER_GRAY: Rgba<u8> = Rgba([119, 119, 119, 255]);

const BOLD_FONT_BYTES: &[u8] = include_bytes!("../assets/fonts/DejaVuSans-Bold.ttf");
const REGULAR_FONT_BYTES: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid badge color {0:?}")]
    Color(String),
    #[error("bundled font is invalid")]
    Font(#[from] ab_glyph::InvalidFont),
}

/// Renders one deal card from a compose request and returns where it was
/// written. The source image is never modified.
pub trait Composer: Send + Sync {
    fn compose(&self, request: &ComposeRequest) -> Result<PathBuf, ComposeError>;
}

/// Black on bright badge colors, white otherwise. Values that do not parse
/// as `#RRGGBB` count as dark.
pub fn contrast_color(hex_color: &str) -> Rgba<u8> {
    let hex = hex_color.replace('#', "");
    if hex.len() != 6 || !hex.is_ascii() {
        return WHITE;
    }
    let Some((r, g, b)) = parse_rgb(&hex) else {
        return WHITE;
    };
    let brightness = (f32::from(r) * 299.0 + f32::from(g) * 587.0 + f32::from(b) * 114.0) / 1000.0;
    if brightness > 160.0 {
        BLACK
    } else {
        WHITE
    }
}

fn parse_rgb(hex: &str) -> Option<(u8, u8, u8)> {
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

fn badge_fill(hex_color: &str) -> Option<Rgba<u8>> {
    let hex = hex_color.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    parse_rgb(hex).map(|(r, g, b)| Rgba([r, g, b, 255]))
}

/// `{stem}_final.jpg` beside the source image.
pub fn default_output_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    source.with_file_name(format!("{stem}_final.jpg"))
}

/// Composer backed by the bundled sans faces, so output never depends on
/// which fonts the host has installed.
pub struct ImageComposer {
    bold: FontRef<'static>,
    regular: FontRef<'static>,
}

impl ImageComposer {
    pub fn new() -> Result<Self, ComposeError> {
        Ok(Self {
            bold: FontRef::try_from_slice(BOLD_FONT_BYTES)?,
            regular: FontRef::try_from_slice(REGULAR_FONT_BYTES)?,
        })
    }

    fn text_width(&self, font: &FontRef<'static>, scale: PxScale, text: &str) -> f32 {
        let scaled = font.as_scaled(scale);
        let mut width = 0.0;
        let mut last = None;
        for ch in text.chars() {
            let id = scaled.glyph_id(ch);
            if let Some(prev) = last {
                width += scaled.kern(prev, id);
            }
            width += scaled.h_advance(id);
            last = Some(id);
        }
        width
    }

    /// Rendered ink height of one text run, the way the vertical centering
    /// math wants it.
    fn text_ink_height(&self, font: &FontRef<'static>, scale: PxScale, text: &str) -> f32 {
        let scaled = font.as_scaled(scale);
        let mut min_y = f32::MAX;
        let mut max_y = f32::MIN;
        let mut caret = 0.0;
        let mut last = None;
        for ch in text.chars() {
            let id = scaled.glyph_id(ch);
            if let Some(prev) = last {
                caret += scaled.kern(prev, id);
            }
            let glyph = id.with_scale_and_position(scale, ab_glyph::point(caret, scaled.ascent()));
            if let Some(outline) = font.outline_glyph(glyph) {
                let bounds = outline.px_bounds();
                min_y = min_y.min(bounds.min.y);
                max_y = max_y.max(bounds.max.y);
            }
            caret += scaled.h_advance(id);
            last = Some(id);
        }
        if max_y > min_y {
            max_y - min_y
        } else {
            0.0
        }
    }

    /// Greedy word wrap capped at two lines. Words that no longer fit once
    /// two lines exist are dropped.
    fn split_two_lines(
        &self,
        font: &FontRef<'static>,
        scale: PxScale,
        text: &str,
        max_width: f32,
    ) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            let test = if current.is_empty() {
                word.to_string()
            } else {
                format!("{current} {word}")
            };
            if self.text_width(font, scale, &test) <= max_width {
                current = test;
            } else {
                if !current.is_empty() {
                    lines.push(current);
                }
                current = word.to_string();
            }
            if lines.len() == 2 {
                break;
            }
        }
        if !current.is_empty() && lines.len() < 2 {
            lines.push(current);
        }
        lines.truncate(2);
        lines
    }

    fn overlay_scaled(
        &self,
        canvas: &mut RgbaImage,
        path: &Path,
        scale: f32,
        position: (i64, i64),
    ) -> Result<(), ComposeError> {
        let art = image::open(path).map_err(|source| ComposeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let w = ((art.width() as f32 * scale) as u32).max(1);
        let h = ((art.height() as f32 * scale) as u32).max(1);
        let art = art.resize_exact(w, h, FilterType::Lanczos3).to_rgba8();
        imageops::overlay(canvas, &art, position.0, position.1);
        Ok(())
    }

    fn strike_through(&self, canvas: &mut RgbaImage, x0: f32, x1: f32, y: f32) {
        for dy in -1..=1 {
            let yy = y + dy as f32;
            draw_line_segment_mut(canvas, (x0, yy), (x1, yy), BLACK);
        }
    }
}

impl Composer for ImageComposer {
    fn compose(&self, request: &ComposeRequest) -> Result<PathBuf, ComposeError> {
        let mut canvas = RgbaImage::from_pixel(CANVAS_SIZE, CANVAS_SIZE, BACKGROUND);

        if let Some(badge_path) = &request.marketing_badge {
            if badge_path.exists() {
                self.overlay_scaled(
                    &mut canvas,
                    badge_path,
                    MARKETING_BADGE_SCALE,
                    (i64::from(MARGIN), i64::from(MARGIN)),
                )?;
            }
        }

        let product = image::open(&request.product_image).map_err(|source| ComposeError::Read {
            path: request.product_image.clone(),
            source,
        })?;
        let product = if product.width() > PRODUCT_LIMIT || product.height() > PRODUCT_LIMIT {
            product.resize(PRODUCT_LIMIT, PRODUCT_LIMIT, FilterType::Lanczos3)
        } else {
            product
        };
        let product = image::DynamicImage::ImageRgb8(product.to_rgb8()).to_rgba8();
        let px = (CANVAS_SIZE - product.width()) / 2;
        let py = (CANVAS_SIZE - product.height()) / 2;
        imageops::overlay(&mut canvas, &product, i64::from(px), i64::from(py));

        let price_scale = PxScale::from(PRICE_FONT);
        let small_scale = PxScale::from(PRICE_FONT_SMALL);
        let reg_scale = PxScale::from(REG_FONT);

        let lines =
            self.split_two_lines(&self.bold, price_scale, &request.price, PRICE_WRAP_WIDTH);
        let line_scale = if lines.len() == 2 {
            small_scale
        } else {
            price_scale
        };
        let reg_text = request.regular_price.trim();

        match request.badge_shape {
            BadgeShape::Circle | BadgeShape::Square => {
                let bx = (CANVAS_SIZE - BADGE_SIZE - MARGIN) as f32;
                let by = MARGIN as f32;
                let fill = badge_fill(&request.badge_color)
                    .ok_or_else(|| ComposeError::Color(request.badge_color.clone()))?;
                let text_color = contrast_color(&request.badge_color);

                if request.badge_shape == BadgeShape::Circle {
                    let radius = (BADGE_SIZE / 2) as i32;
                    let center = (bx as i32 + radius, by as i32 + radius);
                    draw_filled_circle_mut(&mut canvas, center, radius, fill);
                } else {
                    let rect = Rect::at(bx as i32, by as i32).of_size(BADGE_SIZE, BADGE_SIZE);
                    draw_filled_rect_mut(&mut canvas, rect, fill);
                }

                let mut height: f32 = lines
                    .iter()
                    .map(|line| self.text_ink_height(&self.bold, line_scale, line))
                    .sum();
                height += lines.len().saturating_sub(1) as f32 * LINE_SPACING;
                if !reg_text.is_empty() {
                    height += REG_FONT + LINE_SPACING;
                }

                let mut ty = by + (BADGE_SIZE as f32 - height) / 2.0;
                for line in &lines {
                    let w = self.text_width(&self.bold, line_scale, line);
                    let x = bx + (BADGE_SIZE as f32 - w) / 2.0;
                    draw_text_mut(
                        &mut canvas,
                        text_color,
                        x.round() as i32,
                        ty.round() as i32,
                        line_scale,
                        &self.bold,
                        line,
                    );
                    ty += self.text_ink_height(&self.bold, line_scale, line) + LINE_SPACING;
                }

                if !reg_text.is_empty() {
                    let w = self.text_width(&self.regular, reg_scale, reg_text);
                    let rx = bx + (BADGE_SIZE as f32 - w) / 2.0;
                    draw_text_mut(
                        &mut canvas,
                        BLACK,
                        rx.round() as i32,
                        ty.round() as i32,
                        reg_scale,
                        &self.regular,
                        reg_text,
                    );
                    self.strike_through(&mut canvas, rx, rx + w, ty + REG_FONT / 2.0);
                }
            }
            BadgeShape::None => {
                let text_color = badge_fill(&request.badge_color)
                    .ok_or_else(|| ComposeError::Color(request.badge_color.clone()))?;
                let right_x = (CANVAS_SIZE - MARGIN) as f32;
                let mut ty = MARGIN as f32;

                for line in &lines {
                    let w = self.text_width(&self.bold, line_scale, line);
                    draw_text_mut(
                        &mut canvas,
                        text_color,
                        (right_x - w).round() as i32,
                        ty.round() as i32,
                        line_scale,
                        &self.bold,
                        line,
                    );
                    ty += self.text_ink_height(&self.bold, line_scale, line) + LINE_SPACING;
                }

                if !reg_text.is_empty() {
                    let w = self.text_width(&self.regular, reg_scale, reg_text);
                    draw_text_mut(
                        &mut canvas,
                        BLACK,
                        (right_x - w).round() as i32,
                        ty.round() as i32,
                        reg_scale,
                        &self.regular,
                        reg_text,
                    );
                    self.strike_through(&mut canvas, right_x - w, right_x, ty + REG_FONT / 2.0);
                }
            }
        }

        let disclaimer_scale = PxScale::from(DISCLAIMER_FONT);
        let dw = self.text_width(&self.regular, disclaimer_scale, DISCLAIMER_TEXT);
        draw_text_mut(
            &mut canvas,
            DISCLAIMER_GRAY,
            (CANVAS_SIZE as f32 - dw - MARGIN as f32).round() as i32,
            1030,
            disclaimer_scale,
            &self.regular,
            DISCLAIMER_TEXT,
        );

        if let Some(link_path) = &request.link_badge {
            if link_path.exists() {
                let art = image::open(link_path).map_err(|source| ComposeError::Read {
                    path: link_path.clone(),
                    source,
                })?;
                let w = ((art.width() as f32 * LINK_BADGE_SCALE) as u32).max(1);
                let h = ((art.height() as f32 * LINK_BADGE_SCALE) as u32).max(1);
                let art = art.resize_exact(w, h, FilterType::Lanczos3).to_rgba8();
                let ly = i64::from(CANVAS_SIZE) - i64::from(art.height()) - 20;
                imageops::overlay(&mut canvas, &art, 20, ly);
            }
        }

        let output = match &request.output {
            Some(path) => path.clone(),
            None => default_output_path(&request.product_image),
        };
        let rgb = image::DynamicImage::ImageRgba8(canvas).to_rgb8();
        rgb.save(&output).map_err(|source| ComposeError::Write {
            path: output.clone(),
            source,
        })?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    fn write_product(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        let img = RgbImage::from_pixel(w, h, image::Rgb([10, 160, 30]));
        img.save(&path).expect("write product fixture");
        path
    }

    #[test]
    fn bright_colors_get_black_text() {
        assert_eq!(contrast_color("#FFFFFF"), BLACK);
        assert_eq!(contrast_color("#FFED29"), BLACK);
    }

    #[test]
    fn dark_colors_get_white_text() {
        assert_eq!(contrast_color("#000000"), WHITE);
        assert_eq!(contrast_color("#FF0000"), WHITE);
    }

    #[test]
    fn brightness_boundary_is_exclusive() {
        // r = g = b = 0xA0 works out to brightness 160 exactly.
        assert_eq!(contrast_color("#9F9F9F"), WHITE);
        assert_eq!(contrast_color("#A0A0A0"), WHITE);
        assert_eq!(contrast_color("#A1A1A1"), BLACK);
    }

    #[test]
    fn malformed_colors_count_as_dark() {
        assert_eq!(contrast_color("nope"), WHITE);
        assert_eq!(contrast_color("#12345"), WHITE);
        assert_eq!(contrast_color("#GGGGGG"), WHITE);
    }

    #[test]
    fn default_output_is_final_jpg_beside_source() {
        assert_eq!(
            default_output_path(Path::new("/tmp/media/photo.png")),
            PathBuf::from("/tmp/media/photo_final.jpg")
        );
    }

    #[test]
    fn short_price_stays_on_one_line() {
        let composer = ImageComposer::new().expect("composer");
        let scale = PxScale::from(PRICE_FONT);
        let lines = composer.split_two_lines(&composer.bold, scale, "$9.99", 1000.0);
        assert_eq!(lines, vec!["$9.99".to_string()]);
    }

    #[test]
    fn narrow_width_wraps_to_two_lines_and_drops_overflow() {
        let composer = ImageComposer::new().expect("composer");
        let scale = PxScale::from(PRICE_FONT);
        let word = composer.text_width(&composer.bold, scale, "AAAA");
        let lines =
            composer.split_two_lines(&composer.bold, scale, "AAAA BBBB CCCC", word + 1.0);
        assert_eq!(lines, vec!["AAAA".to_string(), "BBBB".to_string()]);
    }

    #[test]
    fn oversized_single_word_is_kept() {
        let composer = ImageComposer::new().expect("composer");
        let scale = PxScale::from(PRICE_FONT);
        let lines = composer.split_two_lines(&composer.bold, scale, "$1099.99", 10.0);
        assert_eq!(lines, vec!["$1099.99".to_string()]);
    }

    #[test]
    fn compose_writes_card_and_leaves_source_alone() {
        let dir = tempdir().expect("tempdir");
        let product = write_product(dir.path(), "product.png", 400, 300);
        let before = std::fs::read(&product).expect("read fixture");

        let composer = ImageComposer::new().expect("composer");
        let mut request = ComposeRequest::new(&product, "$19.99");
        request.regular_price = "$29.99".to_string();
        let output = composer.compose(&request).expect("compose");

        assert_eq!(output, dir.path().join("product_final.jpg"));
        let card = image::open(&output).expect("open card").to_rgb8();
        assert_eq!(card.dimensions(), (CANVAS_SIZE, CANVAS_SIZE));
        assert_eq!(std::fs::read(&product).expect("reread fixture"), before);

        // Upper part of the circle, clear of the price text, carries the
        // default red fill; corners stay white.
        assert_eq!(card.get_pixel(940, 60), &image::Rgb([255, 0, 0]));
        assert_eq!(card.get_pixel(5, 5), &image::Rgb([255, 255, 255]));
    }

    #[test]
    fn explicit_output_path_is_honored() {
        let dir = tempdir().expect("tempdir");
        let product = write_product(dir.path(), "item.png", 200, 200);
        let target = dir.path().join("pin.jpg");

        let composer = ImageComposer::new().expect("composer");
        let mut request = ComposeRequest::new(&product, "$5.00");
        request.output = Some(target.clone());
        let output = composer.compose(&request).expect("compose");
        assert_eq!(output, target);
        assert!(target.exists());
    }

    #[test]
    fn shapeless_card_skips_the_badge_fill() {
        let dir = tempdir().expect("tempdir");
        let product = write_product(dir.path(), "item.png", 200, 200);

        let composer = ImageComposer::new().expect("composer");
        let mut request = ComposeRequest::new(&product, "$5.00");
        request.badge_shape = BadgeShape::None;
        request.badge_color = "#112233".to_string();
        let output = composer.compose(&request).expect("compose");

        let card = image::open(&output).expect("open card").to_rgb8();
        // Bottom of the badge square would be filled in shape mode.
        assert_eq!(card.get_pixel(940, 230), &image::Rgb([255, 255, 255]));
    }

    #[test]
    fn invalid_badge_color_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let product = write_product(dir.path(), "item.png", 200, 200);

        let composer = ImageComposer::new().expect("composer");
        let mut request = ComposeRequest::new(&product, "$5.00");
        request.badge_shape = BadgeShape::None;
        request.badge_color = "cherry".to_string();
        match composer.compose(&request) {
            Err(ComposeError::Color(value)) => assert_eq!(value, "cherry"),
            other => panic!("expected color error, got {other:?}"),
        }
    }

    #[test]
    fn same_request_renders_identical_bytes() {
        let dir = tempdir().expect("tempdir");
        let product = write_product(dir.path(), "item.png", 320, 240);

        let composer = ImageComposer::new().expect("composer");
        let mut request = ComposeRequest::new(&product, "$12.49");
        request.regular_price = "$20.00".to_string();
        request.output = Some(dir.path().join("first.jpg"));
        composer.compose(&request).expect("first compose");

        request.output = Some(dir.path().join("second.jpg"));
        composer.compose(&request).expect("second compose");

        let first = std::fs::read(dir.path().join("first.jpg")).expect("first bytes");
        let second = std::fs::read(dir.path().join("second.jpg")).expect("second bytes");
        assert_eq!(first, second);
    }

    #[test]
    fn missing_overlay_art_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let product = write_product(dir.path(), "item.png", 200, 200);

        let composer = ImageComposer::new().expect("composer");
        let mut request = ComposeRequest::new(&product, "$5.00");
        request.marketing_badge = Some(dir.path().join("absent.png"));
        request.link_badge = Some(dir.path().join("also-absent.png"));
        assert!(composer.compose(&request).is_ok());
    }
}
