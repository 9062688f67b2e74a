use std::collections::HashSet;
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use markpdf_core::{
    replacement_bindings, Annotation, AnnotationKind, Color, EditorSession, Fragment, FragmentId,
    LiveStroke, PagePoint, PageRect, RenderImage, StrokeStyle, SurfaceConfig, SurfaceError, Tool,
};
use once_cell::sync::Lazy;
use tiny_skia::{
    FillRule, IntSize, LineCap, LineJoin, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke,
    StrokeDash, Transform,
};
use tracing::{instrument, warn};
use ttf_parser::{Face, OutlineBuilder};

const SELECTION_IDLE: Color = Color {
    r: 148,
    g: 163,
    b: 184,
};
const SELECTION_ACTIVE: Color = Color {
    r: 59,
    g: 130,
    b: 246,
};
const HANDLE_SIZE: f32 = 6.0;
const SIGNATURE_PEN_WIDTH: f32 = 2.0;

/// Everything the compositor needs for one page view, borrowed from the
/// session so rendering never mutates surface state.
pub struct OverlayScene<'a> {
    pub zoom: f32,
    pub width: u32,
    pub height: u32,
    pub edit_mode: bool,
    pub fragments: &'a [Fragment],
    pub superseded: HashSet<FragmentId>,
    pub selected: Option<FragmentId>,
    pub annotations: Vec<&'a Annotation>,
    pub bindings: Vec<(&'a Annotation, Option<&'a Fragment>)>,
    pub live_stroke: Option<&'a LiveStroke>,
    pub config: &'a SurfaceConfig,
}

impl<'a> OverlayScene<'a> {
    pub fn from_session(session: &'a EditorSession, width: u32, height: u32) -> Self {
        Self {
            zoom: session.zoom(),
            width,
            height,
            edit_mode: session.tool() == Tool::EditText,
            fragments: session.fragments(),
            superseded: session.superseded_fragments(),
            selected: session.selected_fragment(),
            annotations: session.annotations_for_page(session.page_number()).collect(),
            bindings: replacement_bindings(
                session.annotations(),
                session.fragments(),
                session.page_number(),
            ),
            live_stroke: session.live_stroke(),
            config: session.config(),
        }
    }
}

/// Renders the mutable annotation layer for one page view.
///
/// Draw order is fixed: fragment selection indicators (edit mode only), then
/// masking rectangles over superseded fragments, then committed annotations in
/// creation order, then the in-progress stroke preview. Masking must precede
/// annotation drawing so original glyphs never show through a replacement.
pub fn render_overlay(scene: &OverlayScene) -> Result<Pixmap> {
    let mut pixmap = Pixmap::new(scene.width, scene.height)
        .ok_or_else(|| anyhow!("overlay canvas must have non-zero dimensions"))?;

    if scene.edit_mode {
        draw_fragment_indicators(&mut pixmap, scene);
    }
    draw_masks(&mut pixmap, scene);

    let orphaned = scene
        .bindings
        .iter()
        .filter(|(_, fragment)| fragment.is_none())
        .count();
    if orphaned > 0 {
        warn!(
            count = orphaned,
            "rendering orphaned text replacements as free text"
        );
    }

    for annotation in &scene.annotations {
        draw_annotation(&mut pixmap, annotation, scene);
    }

    if let Some(stroke) = scene.live_stroke {
        draw_stroke(
            &mut pixmap,
            &stroke.points,
            stroke.color,
            stroke.style,
            scene,
        );
    }

    Ok(pixmap)
}

/// Composites the immutable base layer under the annotation overlay.
pub fn compose(base: &RenderImage, overlay: &Pixmap) -> Result<RenderImage> {
    let size = IntSize::from_wh(base.width, base.height)
        .ok_or_else(|| anyhow!("page canvas must have non-zero dimensions"))?;
    let mut combined = Pixmap::from_vec(premultiply(&base.pixels), size)
        .ok_or_else(|| anyhow!("page raster does not match its dimensions"))?;
    combined.draw_pixmap(
        0,
        0,
        overlay.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        None,
    );
    Ok(pixmap_to_image(&combined))
}

/// Flattens the current page and its annotations into one raster at the
/// current zoom. Export is page-by-page; it never writes back into the
/// source document.
#[instrument(skip(session))]
pub fn export_current_page(session: &EditorSession) -> Result<RenderImage, SurfaceError> {
    let base = session.render_base()?;
    let scene = OverlayScene::from_session(session, base.width, base.height);
    let overlay = render_overlay(&scene).map_err(SurfaceError::Backend)?;
    compose(&base, &overlay).map_err(SurfaceError::Backend)
}

pub fn encode_png(image: &RenderImage) -> Result<Vec<u8>> {
    let buffer =
        image::RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
            .ok_or_else(|| anyhow!("raster dimensions do not match pixel data"))?;
    let mut out = Cursor::new(Vec::new());
    buffer
        .write_to(&mut out, image::ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(out.into_inner())
}

pub fn decode_image(bytes: &[u8]) -> Result<RenderImage> {
    let decoded = image::load_from_memory(bytes)
        .context("failed to decode image bytes")?
        .to_rgba8();
    Ok(RenderImage {
        width: decoded.width(),
        height: decoded.height(),
        pixels: decoded.into_raw(),
    })
}

/// Decodes a `data:image/...;base64,` payload, the form a signature pad or a
/// file picker hands back.
pub fn decode_data_url(url: &str) -> Result<RenderImage> {
    let (_, payload) = url
        .split_once("base64,")
        .ok_or_else(|| anyhow!("unsupported data URL"))?;
    let bytes = BASE64
        .decode(payload.trim())
        .context("invalid base64 payload in data URL")?;
    decode_image(&bytes)
}

/// Freehand capture state for the modal signature pad. Coordinates are pad
/// pixels; the pad is rasterized once on save and the result placed as a
/// signature annotation.
#[derive(Debug, Clone)]
pub struct SignaturePad {
    width: u32,
    height: u32,
    strokes: Vec<Vec<PagePoint>>,
    active: Option<Vec<PagePoint>>,
}

impl SignaturePad {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            strokes: Vec::new(),
            active: None,
        }
    }

    pub fn from_config(config: &SurfaceConfig) -> Self {
        Self::new(
            config.defaults.signature_pad_width,
            config.defaults.signature_pad_height,
        )
    }

    pub fn pointer_down(&mut self, x: f32, y: f32) {
        self.active = Some(vec![PagePoint::new(x, y)]);
    }

    pub fn pointer_move(&mut self, x: f32, y: f32) {
        if let Some(points) = self.active.as_mut() {
            points.push(PagePoint::new(x, y));
        }
    }

    pub fn pointer_up(&mut self) {
        if let Some(points) = self.active.take() {
            if !points.is_empty() {
                self.strokes.push(points);
            }
        }
    }

    pub fn clear(&mut self) {
        self.strokes.clear();
        self.active = None;
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty() && self.active.is_none()
    }

    pub fn strokes(&self) -> &[Vec<PagePoint>] {
        &self.strokes
    }
}

pub fn rasterize_signature(pad: &SignaturePad) -> Result<RenderImage> {
    let mut pixmap = Pixmap::new(pad.width, pad.height)
        .ok_or_else(|| anyhow!("signature pad must have non-zero dimensions"))?;
    let paint = fill_paint(Color::BLACK, 1.0);
    let stroke = Stroke {
        width: SIGNATURE_PEN_WIDTH,
        line_cap: LineCap::Round,
        line_join: LineJoin::Round,
        ..Stroke::default()
    };
    for points in pad.strokes.iter().chain(pad.active.iter()) {
        if let Some(path) = polyline_path(points, 1.0) {
            pixmap.stroke_path(&path, &paint, &stroke, Transform::identity(), None);
        }
    }
    Ok(pixmap_to_image(&pixmap))
}

fn draw_fragment_indicators(pixmap: &mut Pixmap, scene: &OverlayScene) {
    let dash = StrokeDash::new(vec![5.0, 5.0], 0.0);
    for fragment in scene.fragments {
        if scene.superseded.contains(&fragment.id) {
            continue;
        }
        let selected = scene.selected == Some(fragment.id);
        let color = if selected {
            SELECTION_ACTIVE
        } else {
            SELECTION_IDLE
        };
        let rect = scale_rect(fragment.rect, scene.zoom);
        let Some(sk_rect) = tiny_skia::Rect::from_xywh(rect.x, rect.y, rect.width, rect.height)
        else {
            continue;
        };
        let path = PathBuilder::from_rect(sk_rect);
        let stroke = Stroke {
            width: if selected { 2.0 } else { 1.0 },
            dash: dash.clone(),
            ..Stroke::default()
        };
        pixmap.stroke_path(
            &path,
            &fill_paint(color, 1.0),
            &stroke,
            Transform::identity(),
            None,
        );

        if selected {
            let half = HANDLE_SIZE / 2.0;
            for corner_x in [rect.x, rect.x + rect.width] {
                if let Some(handle) = tiny_skia::Rect::from_xywh(
                    corner_x - half,
                    rect.y - half,
                    HANDLE_SIZE,
                    HANDLE_SIZE,
                ) {
                    pixmap.fill_path(
                        &PathBuilder::from_rect(handle),
                        &fill_paint(color, 1.0),
                        FillRule::Winding,
                        Transform::identity(),
                        None,
                    );
                }
            }
        }
    }
}

/// Paints the background color over every fragment a replacement supersedes.
/// Uses the fragment's box, not the replacement's, since the replacement text
/// is positioned from the fragment.
fn draw_masks(pixmap: &mut Pixmap, scene: &OverlayScene) {
    for (_, fragment) in &scene.bindings {
        let Some(fragment) = fragment else { continue };
        let rect = scale_rect(
            fragment.rect.expanded(scene.config.mask.padding),
            scene.zoom,
        );
        if let Some(sk_rect) =
            tiny_skia::Rect::from_xywh(rect.x, rect.y, rect.width, rect.height)
        {
            pixmap.fill_path(
                &PathBuilder::from_rect(sk_rect),
                &fill_paint(scene.config.mask.background, 1.0),
                FillRule::Winding,
                Transform::identity(),
                None,
            );
        }
    }
}

fn draw_annotation(pixmap: &mut Pixmap, annotation: &Annotation, scene: &OverlayScene) {
    let zoom = scene.zoom;
    let anchor = annotation.anchor;
    match &annotation.kind {
        AnnotationKind::FreeText {
            content,
            font_size,
            color,
        }
        | AnnotationKind::TextReplacement {
            content,
            font_size,
            color,
            ..
        } => {
            paint_text(
                pixmap,
                content,
                anchor.x * zoom,
                anchor.y * zoom,
                font_size * zoom,
                *color,
            );
        }
        AnnotationKind::Stroke {
            points,
            color,
            style,
        } => {
            draw_stroke(pixmap, points, *color, *style, scene);
        }
        AnnotationKind::Rectangle {
            width,
            height,
            color,
        } => {
            if let Some(rect) = tiny_skia::Rect::from_xywh(
                anchor.x * zoom,
                anchor.y * zoom,
                width * zoom,
                height * zoom,
            ) {
                let stroke = Stroke {
                    width: scene.config.style.shape_width,
                    ..Stroke::default()
                };
                pixmap.stroke_path(
                    &PathBuilder::from_rect(rect),
                    &fill_paint(*color, 1.0),
                    &stroke,
                    Transform::identity(),
                    None,
                );
            }
        }
        AnnotationKind::Circle { radius, color } => {
            let mut builder = PathBuilder::new();
            builder.push_circle(anchor.x * zoom, anchor.y * zoom, radius * zoom);
            if let Some(path) = builder.finish() {
                let stroke = Stroke {
                    width: scene.config.style.shape_width,
                    ..Stroke::default()
                };
                pixmap.stroke_path(
                    &path,
                    &fill_paint(*color, 1.0),
                    &stroke,
                    Transform::identity(),
                    None,
                );
            }
        }
        AnnotationKind::Image {
            raster,
            width,
            height,
        }
        | AnnotationKind::Signature {
            raster,
            width,
            height,
        } => {
            blit_raster(
                pixmap,
                raster,
                anchor.x * zoom,
                anchor.y * zoom,
                width * zoom,
                height * zoom,
            );
        }
    }
}

fn draw_stroke(
    pixmap: &mut Pixmap,
    points: &[PagePoint],
    color: Color,
    style: StrokeStyle,
    scene: &OverlayScene,
) {
    let Some(path) = polyline_path(points, scene.zoom) else {
        return;
    };
    let style_config = &scene.config.style;
    let (stroke, alpha) = match style {
        StrokeStyle::Freehand => (
            Stroke {
                width: style_config.freehand_width,
                line_join: LineJoin::Round,
                ..Stroke::default()
            },
            1.0,
        ),
        StrokeStyle::Highlight => (
            Stroke {
                width: style_config.highlight_width,
                line_cap: LineCap::Round,
                line_join: LineJoin::Round,
                ..Stroke::default()
            },
            style_config.highlight_opacity,
        ),
    };
    pixmap.stroke_path(
        &path,
        &fill_paint(color, alpha),
        &stroke,
        Transform::identity(),
        None,
    );
}

fn blit_raster(
    pixmap: &mut Pixmap,
    raster: &RenderImage,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
) {
    if raster.width == 0 || raster.height == 0 || width <= 0.0 || height <= 0.0 {
        return;
    }
    let Some(size) = IntSize::from_wh(raster.width, raster.height) else {
        return;
    };
    let Some(source) = Pixmap::from_vec(premultiply(&raster.pixels), size) else {
        return;
    };
    let sx = width / raster.width as f32;
    let sy = height / raster.height as f32;
    let transform = Transform::from_row(sx, 0.0, 0.0, sy, x, y);
    pixmap.draw_pixmap(
        0,
        0,
        source.as_ref(),
        &PixmapPaint::default(),
        transform,
        None,
    );
}

struct UiFont {
    data: Vec<u8>,
    index: u32,
}

/// Best-effort system sans-serif; `None` on hosts with no usable fonts, in
/// which case text falls back to placeholder glyph boxes.
static UI_FONT: Lazy<Option<UiFont>> = Lazy::new(load_ui_font);

fn load_ui_font() -> Option<UiFont> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    let query = fontdb::Query {
        families: &[fontdb::Family::SansSerif],
        ..fontdb::Query::default()
    };
    let id = db.query(&query)?;
    db.with_face_data(id, |data, index| UiFont {
        data: data.to_vec(),
        index,
    })
}

fn paint_text(
    pixmap: &mut Pixmap,
    content: &str,
    x: f32,
    baseline_y: f32,
    size_px: f32,
    color: Color,
) {
    if let Some(font) = UI_FONT.as_ref() {
        if paint_text_glyphs(pixmap, content, x, baseline_y, size_px, color, font).is_some() {
            return;
        }
    }
    paint_text_blocks(pixmap, content, x, baseline_y, size_px, color);
}

struct GlyphOutline {
    builder: PathBuilder,
    scale: f32,
    dx: f32,
    dy: f32,
}

impl OutlineBuilder for GlyphOutline {
    fn move_to(&mut self, x: f32, y: f32) {
        self.builder
            .move_to(self.dx + x * self.scale, self.dy - y * self.scale);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.builder
            .line_to(self.dx + x * self.scale, self.dy - y * self.scale);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        self.builder.quad_to(
            self.dx + x1 * self.scale,
            self.dy - y1 * self.scale,
            self.dx + x * self.scale,
            self.dy - y * self.scale,
        );
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.builder.cubic_to(
            self.dx + x1 * self.scale,
            self.dy - y1 * self.scale,
            self.dx + x2 * self.scale,
            self.dy - y2 * self.scale,
            self.dx + x * self.scale,
            self.dy - y * self.scale,
        );
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn paint_text_glyphs(
    pixmap: &mut Pixmap,
    content: &str,
    x: f32,
    baseline_y: f32,
    size_px: f32,
    color: Color,
    font: &UiFont,
) -> Option<()> {
    let face = Face::parse(&font.data, font.index).ok()?;
    let upem = face.units_per_em() as f32;
    if upem <= 0.0 {
        return None;
    }
    let scale = size_px / upem;
    let paint = fill_paint(color, 1.0);
    let mut pen_x = x;

    for ch in content.chars() {
        let Some(glyph) = face.glyph_index(ch) else {
            pen_x += size_px * 0.5;
            continue;
        };
        let mut outline = GlyphOutline {
            builder: PathBuilder::new(),
            scale,
            dx: pen_x,
            dy: baseline_y,
        };
        face.outline_glyph(glyph, &mut outline);
        if let Some(path) = outline.builder.finish() {
            pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
        }
        pen_x += face
            .glyph_hor_advance(glyph)
            .map(|advance| advance as f32 * scale)
            .unwrap_or(size_px * 0.5);
    }
    Some(())
}

/// Placeholder glyph boxes for hosts with no usable font: uppercase and
/// digits at cap height, lowercase at x-height, everything else in between.
/// Text ink is always deposited, so masking stays observable.
fn paint_text_blocks(
    pixmap: &mut Pixmap,
    content: &str,
    x: f32,
    baseline_y: f32,
    size_px: f32,
    color: Color,
) {
    let char_width = size_px * 0.6;
    let paint = fill_paint(color, 1.0);
    let mut pen_x = x;

    for ch in content.chars() {
        if ch.is_whitespace() {
            pen_x += char_width;
            continue;
        }
        let height = if ch.is_ascii_uppercase() || ch.is_ascii_digit() {
            size_px * 0.8
        } else if ch.is_lowercase() {
            size_px * 0.5
        } else {
            size_px * 0.7
        };
        if let Some(rect) =
            tiny_skia::Rect::from_xywh(pen_x, baseline_y - height, char_width * 0.8, height)
        {
            pixmap.fill_path(
                &PathBuilder::from_rect(rect),
                &paint,
                FillRule::Winding,
                Transform::identity(),
                None,
            );
        }
        pen_x += char_width;
    }
}

fn polyline_path(points: &[PagePoint], zoom: f32) -> Option<tiny_skia::Path> {
    let first = points.first()?;
    let mut builder = PathBuilder::new();
    builder.move_to(first.x * zoom, first.y * zoom);
    for point in &points[1..] {
        builder.line_to(point.x * zoom, point.y * zoom);
    }
    builder.finish()
}

fn scale_rect(rect: PageRect, zoom: f32) -> PageRect {
    PageRect::new(
        rect.x * zoom,
        rect.y * zoom,
        rect.width * zoom,
        rect.height * zoom,
    )
}

fn fill_paint(color: Color, alpha: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(sk_color(color, alpha));
    paint.anti_alias = true;
    paint
}

fn sk_color(color: Color, alpha: f32) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba(
        color.r as f32 / 255.0,
        color.g as f32 / 255.0,
        color.b as f32 / 255.0,
        alpha.clamp(0.0, 1.0),
    )
    .unwrap_or(tiny_skia::Color::BLACK)
}

fn premultiply(pixels: &[u8]) -> Vec<u8> {
    let mut out = pixels.to_vec();
    for px in out.chunks_exact_mut(4) {
        let alpha = px[3] as u16;
        px[0] = ((px[0] as u16 * alpha) / 255) as u8;
        px[1] = ((px[1] as u16 * alpha) / 255) as u8;
        px[2] = ((px[2] as u16 * alpha) / 255) as u8;
    }
    out
}

fn pixmap_to_image(pixmap: &Pixmap) -> RenderImage {
    let mut pixels = Vec::with_capacity((pixmap.width() * pixmap.height() * 4) as usize);
    for px in pixmap.pixels() {
        let color = px.demultiply();
        pixels.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
    }
    RenderImage {
        width: pixmap.width(),
        height: pixmap.height(),
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use markpdf_core::{
        fragment_id, DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider,
        RenderRequest,
    };

    const PAGE_WIDTH: f32 = 200.0;
    const PAGE_HEIGHT: f32 = 100.0;

    fn invoice_rect() -> PageRect {
        PageRect::new(10.0, 10.0, 60.0, 12.0)
    }

    struct FakeBackend {
        info: DocumentInfo,
    }

    impl FakeBackend {
        fn new(page_count: usize) -> Self {
            Self {
                info: DocumentInfo {
                    page_count,
                    metadata: DocumentMetadata::default(),
                },
            }
        }
    }

    impl DocumentBackend for FakeBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(&self, request: RenderRequest) -> anyhow::Result<RenderImage> {
            // White page with the "Invoice" glyph box painted red, standing in
            // for the original text the mask must cover.
            let scale = request.scale;
            let width = (PAGE_WIDTH * scale) as u32;
            let height = (PAGE_HEIGHT * scale) as u32;
            let mut pixels = vec![255u8; (width * height * 4) as usize];
            let rect = invoice_rect();
            let x0 = (rect.x * scale) as u32;
            let x1 = ((rect.x + rect.width) * scale) as u32;
            let y0 = (rect.y * scale) as u32;
            let y1 = ((rect.y + rect.height) * scale) as u32;
            for y in y0..y1.min(height) {
                for x in x0..x1.min(width) {
                    let idx = ((y * width + x) * 4) as usize;
                    pixels[idx] = 255;
                    pixels[idx + 1] = 0;
                    pixels[idx + 2] = 0;
                }
            }
            Ok(RenderImage {
                width,
                height,
                pixels,
            })
        }

        fn page_fragments(&self, page_number: usize) -> anyhow::Result<Vec<Fragment>> {
            let rect = invoice_rect();
            Ok(vec![Fragment {
                id: fragment_id(page_number, "Invoice", rect),
                page_number,
                rect,
                content: "Invoice".into(),
                font_size: 12.0,
            }])
        }
    }

    struct FakeProvider;

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        async fn open_bytes(&self, _bytes: &[u8]) -> anyhow::Result<Arc<dyn DocumentBackend>> {
            Ok(Arc::new(FakeBackend::new(2)))
        }
    }

    async fn session() -> EditorSession {
        let mut session =
            EditorSession::open_bytes(&FakeProvider, b"%stub", SurfaceConfig::default())
                .await
                .unwrap();
        session.set_zoom(1.0);
        session.drain_events();
        session
    }

    fn pixel(image: &RenderImage, x: u32, y: u32) -> (u8, u8, u8, u8) {
        let idx = ((y * image.width + x) * 4) as usize;
        (
            image.pixels[idx],
            image.pixels[idx + 1],
            image.pixels[idx + 2],
            image.pixels[idx + 3],
        )
    }

    fn region_has(
        image: &RenderImage,
        x0: u32,
        x1: u32,
        y0: u32,
        y1: u32,
        predicate: impl Fn((u8, u8, u8, u8)) -> bool,
    ) -> bool {
        for y in y0..y1.min(image.height) {
            for x in x0..x1.min(image.width) {
                if predicate(pixel(image, x, y)) {
                    return true;
                }
            }
        }
        false
    }

    fn is_red(px: (u8, u8, u8, u8)) -> bool {
        px.0 > 200 && px.1 < 50 && px.2 < 50
    }

    fn is_white(px: (u8, u8, u8, u8)) -> bool {
        px.0 > 240 && px.1 > 240 && px.2 > 240
    }

    #[tokio::test]
    async fn replacement_masks_the_original_text() {
        let mut session = session().await;
        session.select_tool(Tool::EditText).unwrap();
        session.pointer_down(15.0, 15.0).unwrap();
        session.commit_text("Receipt".into());

        let exported = export_current_page(&session).unwrap();

        // The original red glyph box must be fully painted over...
        assert!(!region_has(&exported, 10, 70, 10, 22, is_red));
        // ...and the replacement must leave visible ink near the baseline.
        assert!(region_has(&exported, 8, 80, 4, 24, |px| !is_white(px)
            && !is_red(px)));
    }

    #[tokio::test]
    async fn export_without_annotations_is_the_bare_page() {
        let session = session().await;
        let exported = export_current_page(&session).unwrap();
        assert!(region_has(&exported, 10, 70, 10, 22, is_red));
        assert!(region_has(&exported, 100, 120, 50, 60, is_white));
    }

    #[tokio::test]
    async fn stroke_ink_follows_the_zoom_factor() {
        let mut session = session().await;
        session.select_tool(Tool::Freehand).unwrap();
        session.pointer_down(100.0, 50.0).unwrap();
        session.pointer_move(140.0, 50.0);
        session.pointer_up();

        let exported = export_current_page(&session).unwrap();
        assert!(region_has(&exported, 100, 140, 48, 53, |px| !is_white(px)));

        session.set_zoom(2.0);
        let zoomed = export_current_page(&session).unwrap();
        assert_eq!(zoomed.width, exported.width * 2);
        assert!(region_has(&zoomed, 200, 280, 97, 104, |px| !is_white(px)));
        assert!(!region_has(&zoomed, 200, 280, 45, 55, |px| !is_white(px)));
    }

    #[tokio::test]
    async fn live_stroke_previews_before_commit() {
        let mut session = session().await;
        session.select_tool(Tool::Highlight).unwrap();
        session.pointer_down(100.0, 50.0).unwrap();
        session.pointer_move(140.0, 50.0);

        let exported = export_current_page(&session).unwrap();
        assert!(region_has(&exported, 100, 140, 40, 60, |px| !is_white(px)));
    }

    #[tokio::test]
    async fn rectangle_outline_lands_on_the_page() {
        let mut session = session().await;
        session.select_tool(Tool::Rectangle).unwrap();
        session.pointer_down(100.0, 20.0).unwrap();

        let exported = export_current_page(&session).unwrap();
        // Left edge of the default 100x60 rectangle.
        assert!(region_has(&exported, 98, 103, 20, 80, |px| !is_white(px)));
    }

    #[tokio::test]
    async fn edit_mode_draws_selection_indicators() {
        let mut session = session().await;
        session.select_tool(Tool::EditText).unwrap();

        let exported = export_current_page(&session).unwrap();
        let rect = invoice_rect();
        let x0 = rect.x as u32;
        let x1 = (rect.x + rect.width) as u32 + 1;
        assert!(region_has(&exported, x0, x1, 8, 12, |px| !is_white(px)
            && !is_red(px)));
    }

    #[test]
    fn orphaned_replacement_still_renders_text() {
        let annotations = vec![Annotation {
            id: uuid::Uuid::new_v4(),
            page_number: 1,
            anchor: PagePoint::new(20.0, 40.0),
            kind: AnnotationKind::TextReplacement {
                content: "Receipt".into(),
                font_size: 12.0,
                color: Color::BLACK,
                fragment_id: uuid::Uuid::new_v4(),
            },
        }];
        let config = SurfaceConfig::default();
        let scene = OverlayScene {
            zoom: 1.0,
            width: 200,
            height: 100,
            edit_mode: false,
            fragments: &[],
            superseded: annotations
                .iter()
                .filter_map(Annotation::replaced_fragment)
                .collect(),
            selected: None,
            annotations: annotations.iter().collect(),
            bindings: replacement_bindings(&annotations, &[], 1),
            live_stroke: None,
            config: &config,
        };

        let overlay = render_overlay(&scene).unwrap();
        let image = pixmap_to_image(&overlay);
        assert!(region_has(&image, 18, 90, 28, 42, |px| px.3 > 0));
    }

    #[test]
    fn zero_sized_canvas_is_rejected() {
        let config = SurfaceConfig::default();
        let scene = OverlayScene {
            zoom: 1.0,
            width: 0,
            height: 100,
            edit_mode: false,
            fragments: &[],
            superseded: HashSet::new(),
            selected: None,
            annotations: Vec::new(),
            bindings: Vec::new(),
            live_stroke: None,
            config: &config,
        };
        assert!(render_overlay(&scene).is_err());
    }

    #[test]
    fn placeholder_blocks_always_deposit_ink() {
        let mut pixmap = Pixmap::new(100, 40).unwrap();
        paint_text_blocks(&mut pixmap, "Receipt", 5.0, 30.0, 16.0, Color::BLACK);
        let image = pixmap_to_image(&pixmap);
        assert!(region_has(&image, 5, 90, 10, 31, |px| px.3 > 0));
    }

    #[test]
    fn signature_pad_captures_and_rasterizes_strokes() {
        let mut pad = SignaturePad::new(120, 60);
        assert!(pad.is_empty());

        pad.pointer_down(10.0, 30.0);
        pad.pointer_move(60.0, 30.0);
        pad.pointer_move(100.0, 40.0);
        pad.pointer_up();
        assert!(!pad.is_empty());
        assert_eq!(pad.strokes().len(), 1);
        assert_eq!(pad.strokes()[0].len(), 3);

        let raster = rasterize_signature(&pad).unwrap();
        assert_eq!(raster.width, 120);
        assert!(region_has(&raster, 10, 100, 25, 45, |px| px.3 > 0));

        pad.clear();
        assert!(pad.is_empty());
    }

    #[test]
    fn data_url_roundtrip() {
        let original = RenderImage {
            width: 2,
            height: 2,
            pixels: vec![
                255, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255, 255, 255, 255, 255,
            ],
        };
        let png = encode_png(&original).unwrap();
        let url = format!("data:image/png;base64,{}", BASE64.encode(&png));

        let decoded = decode_data_url(&url).unwrap();
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.height, 2);
        assert_eq!(decoded.pixels, original.pixels);

        assert!(decode_data_url("data:image/png,plain").is_err());
    }

    #[tokio::test]
    async fn committed_image_is_blitted_at_its_anchor() {
        let mut config = SurfaceConfig::default();
        config.defaults.image_anchor_x = 50.0;
        config.defaults.image_anchor_y = 20.0;
        config.defaults.image_width = 20.0;
        config.defaults.image_height = 20.0;
        let mut session = EditorSession::open_bytes(&FakeProvider, b"%stub", config)
            .await
            .unwrap();
        session.set_zoom(1.0);

        let ticket = session.stage_placement();
        let raster = RenderImage {
            width: 2,
            height: 2,
            pixels: vec![0, 0, 255, 255].repeat(4),
        };
        session.commit_image(ticket, raster).unwrap();

        let exported = export_current_page(&session).unwrap();
        let is_blue = |px: (u8, u8, u8, u8)| px.2 > 200 && px.0 < 50 && px.1 < 50;
        assert!(region_has(&exported, 50, 70, 20, 40, is_blue));
        assert!(!region_has(&exported, 80, 200, 50, 100, is_blue));
    }
}
