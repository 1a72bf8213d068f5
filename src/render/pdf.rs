use std::io::BufWriter;

use printpdf::*;

use super::{Align, Block, ReportDocument};
use crate::error::{RecordsError, Result};

// US Letter dimensions (mm)
const PAGE_W: f32 = 215.9;
const PAGE_H: f32 = 279.4;
const MARGIN_TOP: f32 = 25.4;
const MARGIN_BOTTOM: f32 = 25.4;
const MARGIN_LEFT: f32 = 19.05;
const MARGIN_RIGHT: f32 = 19.05;
const CONTENT_W: f32 = PAGE_W - MARGIN_LEFT - MARGIN_RIGHT;
const LABEL_W: f32 = 50.0;
const ROW_H: f32 = 5.0;
const FONT_SIZE: f32 = 10.0;
const TITLE_SIZE: f32 = 16.0;
const HEADING_SIZE: f32 = 12.0;
const SUBTITLE_SIZE: f32 = 8.0;

fn approx_text_width(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * 0.18
}

fn chars_that_fit(width: f32, size: f32) -> usize {
    ((width / (size * 0.18)) as usize).max(4)
}

/// Cut `text` so it fits in `width`, marking the cut with "..".
fn fit(text: &str, width: f32) -> String {
    let max = chars_that_fit(width, FONT_SIZE).saturating_sub(1);
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(2)).collect();
    cut.push_str("..");
    cut
}

/// First column twice as wide as the rest.
fn column_widths(n: usize) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    let unit = CONTENT_W / (n as f32 + 1.0);
    (0..n).map(|i| if i == 0 { unit * 2.0 } else { unit }).collect()
}

struct PdfWriter {
    doc: PdfDocumentReference,
    font: IndirectFontRef,
    font_bold: IndirectFontRef,
    current_page: PdfPageIndex,
    current_layer: PdfLayerIndex,
    y: f32,
    pages: usize,
}

impl PdfWriter {
    fn new(title: &str) -> Result<Self> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        let font = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| RecordsError::RenderFailure(format!("{e:?}")))?;
        let font_bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| RecordsError::RenderFailure(format!("{e:?}")))?;
        Ok(Self {
            doc,
            font,
            font_bold,
            current_page: page,
            current_layer: layer,
            y: MARGIN_TOP,
            pages: 1,
        })
    }

    fn pdf_y(&self) -> f32 {
        PAGE_H - self.y
    }

    fn new_page(&mut self) {
        let (page, layer) = self.doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer");
        self.current_page = page;
        self.current_layer = layer;
        self.y = MARGIN_TOP;
        self.pages += 1;
    }

    fn ensure_space(&mut self, needed: f32) {
        if self.y + needed > PAGE_H - MARGIN_BOTTOM {
            self.new_page();
        }
    }

    fn text(&self, s: &str, x: f32, size: f32, bold: bool) {
        let font = if bold { &self.font_bold } else { &self.font };
        let layer = self
            .doc
            .get_page(self.current_page)
            .get_layer(self.current_layer);
        layer.use_text(s, size, Mm(x), Mm(self.pdf_y()), font);
    }

    fn hline(&self, x1: f32, x2: f32) {
        let layer = self
            .doc
            .get_page(self.current_page)
            .get_layer(self.current_layer);
        layer.set_outline_thickness(0.5);
        let line = Line {
            points: vec![
                (Point::new(Mm(x1), Mm(self.pdf_y())), false),
                (Point::new(Mm(x2), Mm(self.pdf_y())), false),
            ],
            is_closed: false,
        };
        layer.add_line(line);
    }

    fn cells(&mut self, widths: &[f32], align: &[Align], values: &[String], bold: bool) {
        let mut x = MARGIN_LEFT;
        for (i, width) in widths.iter().enumerate() {
            if let Some(value) = values.get(i) {
                let value = fit(value, *width);
                match align.get(i).copied().unwrap_or(Align::Left) {
                    Align::Left => self.text(&value, x, FONT_SIZE, bold),
                    Align::Right => {
                        let tw = approx_text_width(&value, FONT_SIZE);
                        self.text(&value, x + width - tw, FONT_SIZE, bold);
                    }
                }
            }
            x += width;
        }
        self.y += ROW_H;
    }

    fn table(&mut self, headers: &[String], align: &[Align], rows: &[Vec<String>], total_row: bool) {
        let widths = column_widths(headers.len());
        self.ensure_space(ROW_H * 3.0);
        self.cells(&widths, align, headers, true);
        self.hline(MARGIN_LEFT, PAGE_W - MARGIN_RIGHT);
        self.y += 2.0;
        for (i, row) in rows.iter().enumerate() {
            let is_total = total_row && i + 1 == rows.len();
            self.ensure_space(ROW_H);
            if is_total {
                self.separator();
            }
            self.cells(&widths, align, row, is_total);
        }
        self.y += 2.0;
    }

    fn key_values(&mut self, pairs: &[(String, String)]) {
        let value_chars = chars_that_fit(CONTENT_W - LABEL_W, FONT_SIZE);
        for (key, value) in pairs {
            let lines = textwrap::wrap(value, value_chars);
            self.ensure_space(ROW_H * lines.len().max(1) as f32);
            self.text(&fit(key, LABEL_W), MARGIN_LEFT, FONT_SIZE, true);
            if lines.is_empty() {
                self.y += ROW_H;
            }
            for line in lines {
                self.text(&line, MARGIN_LEFT + LABEL_W, FONT_SIZE, false);
                self.y += ROW_H;
            }
        }
    }

    fn paragraph(&mut self, body: &str) {
        for line in textwrap::wrap(body, chars_that_fit(CONTENT_W, FONT_SIZE)) {
            self.ensure_space(ROW_H);
            self.text(&line, MARGIN_LEFT, FONT_SIZE, false);
            self.y += ROW_H;
        }
    }

    fn separator(&mut self) {
        self.hline(MARGIN_LEFT, PAGE_W - MARGIN_RIGHT);
        self.y += 2.0;
    }

    fn to_bytes(self) -> Result<Vec<u8>> {
        let mut buf = BufWriter::new(Vec::new());
        self.doc
            .save(&mut buf)
            .map_err(|e| RecordsError::RenderFailure(format!("{e:?}")))?;
        buf.into_inner()
            .map_err(|e| RecordsError::RenderFailure(e.to_string()))
    }
}

pub(super) fn render(document: &ReportDocument) -> Result<Vec<u8>> {
    let pdf = layout(document)?;
    log::debug!("Laid out '{}' on {} pages", document.title, pdf.pages);
    pdf.to_bytes()
}

fn layout(document: &ReportDocument) -> Result<PdfWriter> {
    let mut pdf = PdfWriter::new(&document.title)?;
    for block in &document.blocks {
        match block {
            Block::Title(t) => {
                pdf.text(t, MARGIN_LEFT, TITLE_SIZE, true);
                pdf.y += 7.0;
            }
            Block::Subtitle(t) => {
                pdf.text(t, MARGIN_LEFT, SUBTITLE_SIZE, false);
                pdf.y += 5.0;
            }
            Block::Heading(t) => {
                pdf.ensure_space(ROW_H * 4.0);
                pdf.y += ROW_H;
                pdf.text(t, MARGIN_LEFT, HEADING_SIZE, true);
                pdf.y += 6.0;
            }
            Block::Subheading(t) => {
                pdf.ensure_space(ROW_H * 3.0);
                pdf.y += 2.0;
                pdf.text(&fit(t, CONTENT_W), MARGIN_LEFT, FONT_SIZE, true);
                pdf.y += ROW_H;
            }
            Block::KeyValues(pairs) => pdf.key_values(pairs),
            Block::Table {
                headers,
                align,
                rows,
                total_row,
            } => pdf.table(headers, align, rows, *total_row),
            Block::Paragraph(body) => pdf.paragraph(body),
            Block::Separator => pdf.separator(),
        }
    }
    Ok(pdf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_truncates_long_cells() {
        let long = "x".repeat(200);
        let cut = fit(&long, 30.0);
        assert!(cut.ends_with(".."));
        assert!(approx_text_width(&cut, FONT_SIZE) <= 30.0);
        assert_eq!(fit("Urea", 30.0), "Urea");
    }

    #[test]
    fn test_column_widths_fill_content() {
        let widths = column_widths(5);
        let total: f32 = widths.iter().sum();
        assert!((total - CONTENT_W).abs() < 0.01);
        assert!(widths[0] > widths[1]);
    }

    #[test]
    fn test_long_document_paginates() {
        let rows: Vec<Vec<String>> = (0..120)
            .map(|i| vec![format!("Row {i}"), format!("{i}")])
            .collect();
        let doc = ReportDocument {
            title: "Long".to_string(),
            blocks: vec![
                Block::Title("Long".to_string()),
                Block::Table {
                    headers: vec!["Name".to_string(), "N".to_string()],
                    align: vec![Align::Left, Align::Right],
                    rows,
                    total_row: false,
                },
            ],
        };
        let pdf = layout(&doc).unwrap();
        assert!(pdf.pages >= 2, "laid out on {} pages", pdf.pages);
        assert!(pdf.to_bytes().unwrap().starts_with(b"%PDF"));

        let short = ReportDocument {
            title: "Short".to_string(),
            blocks: vec![Block::Title("Short".to_string())],
        };
        assert_eq!(layout(&short).unwrap().pages, 1);
    }
}
