use crate::common::config::CaptureConfig;
use crate::core::quality::{PressureHint, QualitySignal};
use image::GrayImage;
use std::io::{self, Write};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent},
    terminal::{self, ClearType},
    cursor,
};

const ASCII_RAMP: &str = " .·:;+=xX#@";
const DEFAULT_WIDTH: usize = 80;
const DEFAULT_HEIGHT: usize = 30;

pub struct AsciiRenderer {
    width: usize,
    height: usize,
}

impl AsciiRenderer {
    pub fn new(width: Option<usize>, height: Option<usize>) -> Self {
        let (term_width, term_height) = terminal::size()
            .map(|(w, h)| (w as usize, h as usize))
            .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));

        Self {
            width: width.unwrap_or((term_width / 2).min(DEFAULT_WIDTH / 2)).max(8),
            height: height.unwrap_or(term_height.saturating_sub(5).min(DEFAULT_HEIGHT)).max(4),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Frame preview with the quality line on top and an optional stage bar
    /// along the bottom edge.
    pub fn render_frame_with_quality(
        &self,
        image: &GrayImage,
        quality: &QualitySignal,
        config: &CaptureConfig,
        stage: Option<(usize, usize)>,
    ) -> String {
        let mut grid = self.image_to_ascii(image);

        let hint = match quality.pressure_hint(config) {
            PressureHint::TooLight => "press harder",
            PressureHint::Good => "good",
            PressureHint::TooHard => "lift slightly",
        };
        let label = format!(" Q{:>3} {} ", quality.sharpness, hint);
        self.overlay_text(&mut grid, &label, self.width / 2, 0);

        if let Some((captured, total)) = stage {
            let bar = self.create_progress_bar(captured, total);
            self.overlay_text(&mut grid, &bar, self.width / 2, self.height - 1);
        }

        self.grid_to_string(&grid)
    }

    fn image_to_ascii(&self, gray: &GrayImage) -> Vec<Vec<char>> {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let (img_width, img_height) = gray.dimensions();
        let ramp: Vec<char> = ASCII_RAMP.chars().collect();

        for (term_y, row) in grid.iter_mut().enumerate() {
            for (term_x, cell) in row.iter_mut().enumerate() {
                let img_x = (term_x as f32 / self.width as f32 * img_width as f32) as u32;
                let img_y = (term_y as f32 / self.height as f32 * img_height as f32) as u32;

                if img_x < img_width && img_y < img_height {
                    // Ridges are dark on the sensor; draw them dense
                    let darkness = 255 - gray.get_pixel(img_x, img_y)[0];
                    let idx = (darkness as usize * (ramp.len() - 1)) / 255;
                    *cell = ramp[idx];
                }
            }
        }

        grid
    }

    fn create_progress_bar(&self, captured: usize, total: usize) -> String {
        let filled = "■".repeat(captured.min(total));
        let empty = "□".repeat(total.saturating_sub(captured));
        format!("[{}{}]", filled, empty)
    }

    fn overlay_text(&self, grid: &mut [Vec<char>], text: &str, center_x: usize, y: usize) {
        if y >= self.height {
            return;
        }

        let text_len = text.chars().count();
        let start_x = center_x.saturating_sub(text_len / 2);

        for (i, ch) in text.chars().enumerate() {
            let x = start_x + i;
            if x < self.width {
                grid[y][x] = ch;
            }
        }
    }

    fn grid_to_string(&self, grid: &[Vec<char>]) -> String {
        grid.iter()
            .map(|row| row.iter().take(self.width).collect::<String>())
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

pub fn clear_screen() -> io::Result<()> {
    crossterm::execute!(
        io::stdout(),
        terminal::Clear(ClearType::All),
        cursor::MoveTo(0, 0)
    )?;
    io::stdout().flush()
}

pub fn check_for_escape() -> io::Result<bool> {
    if event::poll(std::time::Duration::from_millis(0))? {
        if let Event::Key(KeyEvent { code, .. }) = event::read()? {
            return Ok(code == KeyCode::Esc);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::Frame;
    use image::Luma;

    #[test]
    fn preview_has_requested_geometry_and_overlay() {
        let renderer = AsciiRenderer::new(Some(20), Some(6));
        let image = GrayImage::from_fn(64, 64, |x, _| Luma([if x < 32 { 0 } else { 255 }]));
        let quality = QualitySignal::analyze(&Frame::from_image(image.clone()));

        let out = renderer.render_frame_with_quality(&image, &quality, &CaptureConfig::default(), Some((1, 3)));
        let lines: Vec<&str> = out.split("\r\n").collect();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|l| l.chars().count() == 20));
        assert!(lines[0].contains("Q"));
        assert!(lines[5].contains("[■□□]"));
        assert!(lines[2].starts_with('@'));
        assert!(lines[2].ends_with(' '));
    }
}
