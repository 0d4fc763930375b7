//! A4 invoice rendering with printpdf.
//!
//! Pure formatting: the renderer consumes a stored [`Bill`] and nothing
//! else, so a bill can be re-downloaded by serial at any time and the
//! bytes match the original. The PDF metadata dates are derived from the
//! bill date (not the wall clock) and the XMP/ICC conformance extras are
//! disabled; both would otherwise make re-renders differ byte-for-byte.

use printpdf::{
    BuiltinFont, Color, CustomPdfConformance, IndirectFontRef, Line, Mm, PdfConformance,
    PdfDocument, PdfLayerReference, Point, Rgb,
};

use crate::bills::Bill;
use crate::error::{Error, Result};

pub const COMPANY_NAME: &str = "PURE SINDH WATER LTD";
pub const FOOTER_NOTE: &str = "Thank you for choosing PURE SINDH WATER LTD";

// A4 geometry in millimetres
const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const MARGIN: f32 = 18.0;
// Below this cursor height the item table overflows onto a fresh page
const TABLE_FLOOR: f32 = 45.0;

// Table column x positions
const X_ITEM: f32 = MARGIN + 2.0;
const X_QTY: f32 = 110.0;
const X_RATE: f32 = 140.0;
const X_TOTAL: f32 = 172.0;

fn accent() -> Color {
    // Teal header accent
    Color::Rgb(Rgb::new(0.0, 0.431, 0.588, None))
}

fn black() -> Color {
    Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None))
}

fn grey() -> Color {
    Color::Rgb(Rgb::new(0.45, 0.45, 0.45, None))
}

fn text(layer: &PdfLayerReference, font: &IndirectFontRef, s: &str, size: f32, x: f32, y: f32) {
    layer.use_text(s, size, Mm(x), Mm(y), font);
}

fn rule(layer: &PdfLayerReference, y: f32) {
    layer.add_line(Line {
        points: vec![
            (Point::new(Mm(MARGIN), Mm(y)), false),
            (Point::new(Mm(PAGE_W - MARGIN), Mm(y)), false),
        ],
        is_closed: false,
    });
}

/// Render a stored bill into a fixed-layout A4 invoice PDF.
pub fn render(bill: &Bill) -> Result<Vec<u8>> {
    let created = time::OffsetDateTime::from_unix_timestamp(bill.bill_date.timestamp())
        .map_err(|e| Error::Internal(format!("invoice date: {e}")))?;

    let (doc, page1, layer1) = PdfDocument::new(
        format!("Invoice #{}", bill.serial),
        Mm(PAGE_W),
        Mm(PAGE_H),
        "Layer 1",
    );
    let doc = doc
        .with_conformance(PdfConformance::Custom(CustomPdfConformance {
            requires_icc_profile: false,
            requires_xmp_metadata: false,
            ..Default::default()
        }))
        .with_creation_date(created)
        .with_mod_date(created);

    let mut layer = doc.get_page(page1).get_layer(layer1);

    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| Error::Internal(format!("invoice font: {e}")))?;
    let font_bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| Error::Internal(format!("invoice font: {e}")))?;
    let font_italic = doc
        .add_builtin_font(BuiltinFont::HelveticaOblique)
        .map_err(|e| Error::Internal(format!("invoice font: {e}")))?;

    // Header: company left, bill date right
    let mut y = PAGE_H - MARGIN;
    text(&layer, &font_bold, COMPANY_NAME, 16.0, MARGIN, y);
    let stamp = bill.bill_date.format("%Y-%m-%d %H:%M").to_string();
    text(&layer, &font, &stamp, 10.0, 155.0, y + 1.5);

    y -= 5.0;
    rule(&layer, y);

    // Bill meta
    y -= 8.0;
    text(
        &layer,
        &font,
        &format!("Bill Serial: {}", bill.serial),
        11.0,
        MARGIN,
        y,
    );
    text(
        &layer,
        &font,
        &format!("Customer: {}", bill.customer_name),
        11.0,
        95.0,
        y,
    );

    // Item table header in the accent colour
    y -= 10.0;
    layer.set_fill_color(accent());
    text(&layer, &font_bold, "Item", 10.0, X_ITEM, y);
    text(&layer, &font_bold, "Quantity", 10.0, X_QTY, y);
    text(&layer, &font_bold, "Rate", 10.0, X_RATE, y);
    text(&layer, &font_bold, "Total", 10.0, X_TOTAL, y);
    layer.set_fill_color(black());
    y -= 2.0;
    rule(&layer, y);

    // Items
    y -= 6.0;
    for item in &bill.items {
        if y < TABLE_FLOOR {
            let (page, inner) = doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
            layer = doc.get_page(page).get_layer(inner);
            y = PAGE_H - MARGIN - 8.0;
        }
        text(&layer, &font, &item.name, 10.0, X_ITEM, y);
        text(&layer, &font, &format!("{:.2}", item.qty), 10.0, X_QTY, y);
        text(&layer, &font, &format!("{:.2}", item.price), 10.0, X_RATE, y);
        text(&layer, &font, &format!("{:.2}", item.total), 10.0, X_TOTAL, y);
        y -= 6.0;
    }

    y -= 2.0;
    rule(&layer, y);

    // Summary block: advance and payment shown as deductions
    y -= 8.0;
    text(&layer, &font, "Subtotal:", 11.0, X_RATE, y);
    text(&layer, &font, &format!("{:.2}", bill.subtotal), 11.0, X_TOTAL, y);
    y -= 7.0;
    text(&layer, &font, "Advance Applied:", 11.0, X_RATE, y);
    text(
        &layer,
        &font,
        &format!("-{:.2}", bill.advance_applied),
        11.0,
        X_TOTAL,
        y,
    );
    y -= 7.0;
    text(&layer, &font, "Amount Paid (Now):", 11.0, X_RATE, y);
    text(
        &layer,
        &font,
        &format!("-{:.2}", bill.amount_paid),
        11.0,
        X_TOTAL,
        y,
    );
    y -= 8.0;
    text(&layer, &font_bold, "Remaining After:", 12.0, X_RATE, y);
    text(
        &layer,
        &font_bold,
        &format!("{:.2}", bill.remaining_after),
        12.0,
        X_TOTAL,
        y,
    );
    y -= 8.0;
    text(&layer, &font_bold, "Advance Balance:", 12.0, X_RATE, y);
    text(
        &layer,
        &font_bold,
        &format!("{:.2}", bill.advance_after),
        12.0,
        X_TOTAL,
        y,
    );

    // Footer note (fixed string, visually centred)
    layer.set_fill_color(grey());
    text(&layer, &font_italic, FOOTER_NOTE, 10.0, 62.0, MARGIN);
    layer.set_fill_color(black());

    let mut writer = std::io::BufWriter::new(Vec::<u8>::new());
    doc.save(&mut writer)
        .map_err(|e| Error::Internal(format!("invoice save: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| Error::Internal(format!("invoice buffer: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================
