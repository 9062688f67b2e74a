use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

pub type AnnotationId = Uuid;
pub type FragmentId = Uuid;

static FRAGMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f1a7c42-8d0b-5e19-9b6f-2c4d81e0aa57").expect("valid namespace UUID")
});

/// Derives a fragment id from page, content and position, so that repeated
/// extraction of the same text yields the same id regardless of extraction
/// order. Coordinates are quantized to tenths of a point before hashing.
pub fn fragment_id(page_number: usize, content: &str, rect: PageRect) -> FragmentId {
    let rendered = format!(
        "{}:{}:{}:{}:{}:{}",
        page_number,
        quantize_coord(rect.x),
        quantize_coord(rect.y),
        quantize_coord(rect.width),
        quantize_coord(rect.height),
        content,
    );
    Uuid::new_v5(&FRAGMENT_NAMESPACE, rendered.as_bytes())
}

fn quantize_coord(value: f32) -> i64 {
    let scaled = (value * 10.0).round();
    if scaled.is_finite() {
        scaled as i64
    } else {
        0
    }
}

/// A point in unscaled page space: origin top-left, y growing downward,
/// independent of the current zoom factor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PagePoint {
    pub x: f32,
    pub y: f32,
}

impl PagePoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PageRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, point: PagePoint) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }

    pub fn expanded(&self, pad: f32) -> Self {
        Self {
            x: self.x - pad,
            y: self.y - pad,
            width: self.width + pad * 2.0,
            height: self.height + pad * 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
    };
    pub const YELLOW: Color = Color {
        r: 255,
        g: 255,
        b: 0,
    };
}

/// An RGBA8 raster, either a rendered page or a decoded user image.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    /// 1-based page number.
    pub page_number: usize,
    pub scale: f32,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// A unit of original page text with a known bounding box, re-extracted per
/// page view. Read-only; supersession happens through annotations.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub page_number: usize,
    pub rect: PageRect,
    pub content: String,
    pub font_size: f32,
}

/// First fragment in extraction order whose bounding box contains the point,
/// skipping fragments already superseded by a text replacement.
pub fn hit_test<'a>(
    fragments: &'a [Fragment],
    superseded: &HashSet<FragmentId>,
    point: PagePoint,
) -> Option<&'a Fragment> {
    fragments
        .iter()
        .filter(|fragment| !superseded.contains(&fragment.id))
        .find(|fragment| fragment.rect.contains(point))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokeStyle {
    Freehand,
    Highlight,
}

#[derive(Debug, Clone)]
pub enum AnnotationKind {
    FreeText {
        content: String,
        font_size: f32,
        color: Color,
    },
    TextReplacement {
        content: String,
        font_size: f32,
        color: Color,
        fragment_id: FragmentId,
    },
    Stroke {
        points: Vec<PagePoint>,
        color: Color,
        style: StrokeStyle,
    },
    Rectangle {
        width: f32,
        height: f32,
        color: Color,
    },
    Circle {
        radius: f32,
        color: Color,
    },
    Image {
        raster: RenderImage,
        width: f32,
        height: f32,
    },
    Signature {
        raster: RenderImage,
        width: f32,
        height: f32,
    },
}

#[derive(Debug, Clone)]
pub struct Annotation {
    pub id: AnnotationId,
    pub page_number: usize,
    pub anchor: PagePoint,
    pub kind: AnnotationKind,
}

impl Annotation {
    fn new(page_number: usize, anchor: PagePoint, kind: AnnotationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_number,
            anchor,
            kind,
        }
    }

    pub fn replaced_fragment(&self) -> Option<FragmentId> {
        match &self.kind {
            AnnotationKind::TextReplacement { fragment_id, .. } => Some(*fragment_id),
            _ => None,
        }
    }
}

/// Pairs each text replacement on the page with its source fragment, when the
/// fragment can still be located. A `None` binding is an orphaned replacement:
/// it renders as free-standing text and is never masked.
pub fn replacement_bindings<'a>(
    annotations: &'a [Annotation],
    fragments: &'a [Fragment],
    page_number: usize,
) -> Vec<(&'a Annotation, Option<&'a Fragment>)> {
    annotations
        .iter()
        .filter(|annotation| annotation.page_number == page_number)
        .filter_map(|annotation| {
            let fragment_id = annotation.replaced_fragment()?;
            let fragment = fragments.iter().find(|fragment| fragment.id == fragment_id);
            Some((annotation, fragment))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Select,
    EditText,
    AddText,
    Signature,
    Freehand,
    Highlight,
    Rectangle,
    Circle,
    AddImage,
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("document bytes could not be parsed: {0}")]
    InvalidDocument(anyhow::Error),
    #[error("page {requested} out of range 1..={page_count}")]
    PageOutOfRange { requested: usize, page_count: usize },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    RedrawNeeded,
    TextInputRequested {
        anchor: PagePoint,
    },
    TextEditRequested {
        fragment_id: FragmentId,
        rect: PageRect,
        content: String,
        font_size: f32,
    },
    SignaturePadRequested {
        anchor: PagePoint,
    },
    ImagePickerRequested,
    AnnotationCommitted(AnnotationId),
}

#[derive(Debug, Clone)]
pub enum Command {
    SelectTool(Tool),
    SetPage { page_number: usize },
    NextPage,
    PrevPage,
    SetZoom { factor: f32 },
    SetColor(Color),
    SetFontSize(f32),
    PointerDown { x: f32, y: f32 },
    PointerMove { x: f32, y: f32 },
    PointerUp,
    CommitText { content: String },
    CancelPending,
    DeleteAnnotation(AnnotationId),
    ClearAll,
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> anyhow::Result<RenderImage>;
    fn page_fragments(&self, page_number: usize) -> anyhow::Result<Vec<Fragment>>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open_bytes(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn DocumentBackend>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZoomConfig {
    pub min: f32,
    pub max: f32,
    pub initial: f32,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            min: 0.5,
            max: 3.0,
            initial: 1.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    pub color: Color,
    pub font_size: f32,
    pub freehand_width: f32,
    pub highlight_width: f32,
    pub highlight_opacity: f32,
    pub highlight_color: Color,
    pub shape_width: f32,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            color: Color::BLACK,
            font_size: 16.0,
            freehand_width: 2.0,
            highlight_width: 20.0,
            highlight_opacity: 0.4,
            highlight_color: Color::YELLOW,
            shape_width: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultSizes {
    pub rect_width: f32,
    pub rect_height: f32,
    pub circle_radius: f32,
    pub image_width: f32,
    pub image_height: f32,
    pub image_anchor_x: f32,
    pub image_anchor_y: f32,
    pub signature_width: f32,
    pub signature_height: f32,
    pub signature_pad_width: u32,
    pub signature_pad_height: u32,
}

impl Default for DefaultSizes {
    fn default() -> Self {
        Self {
            rect_width: 100.0,
            rect_height: 60.0,
            circle_radius: 50.0,
            image_width: 150.0,
            image_height: 150.0,
            image_anchor_x: 100.0,
            image_anchor_y: 100.0,
            signature_width: 200.0,
            signature_height: 100.0,
            signature_pad_width: 500,
            signature_pad_height: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub background: Color,
    pub padding: f32,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            background: Color::WHITE,
            padding: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub zoom: ZoomConfig,
    pub style: StyleConfig,
    pub defaults: DefaultSizes,
    pub mask: MaskConfig,
}

impl SurfaceConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("failed to decode config file {:?}", path))
    }

    /// Loads the platform config file when present, otherwise the defaults.
    /// A present-but-malformed file is an error, not a silent fallback.
    pub fn load_or_default() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "markpdf", "markpdf")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// The live state of a stroke being drawn, committed on pointer-up.
#[derive(Debug, Clone)]
pub struct LiveStroke {
    pub style: StrokeStyle,
    pub color: Color,
    pub points: Vec<PagePoint>,
}

#[derive(Debug, Clone)]
enum PendingText {
    AddAt(PagePoint),
    EditFragment(PendingTextEdit),
}

#[derive(Debug, Clone)]
pub struct PendingTextEdit {
    pub fragment_id: FragmentId,
    pub rect: PageRect,
    pub original: String,
    pub current: String,
    pub font_size: f32,
    pub existing: Option<AnnotationId>,
}

/// Handed out when an asynchronous decode begins; a commit with a ticket from
/// an earlier generation is discarded instead of applied to the wrong page.
#[derive(Debug, Clone, Copy)]
pub struct PlacementTicket {
    generation: u64,
}

const BASE_CACHE_CAPACITY: usize = 4;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct BaseKey {
    page_number: usize,
    scale_milli: u32,
}

impl BaseKey {
    fn new(page_number: usize, scale: f32) -> Self {
        Self {
            page_number,
            scale_milli: quantize_scale(scale),
        }
    }

    fn distance(&self, reference_page: usize) -> usize {
        self.page_number.abs_diff(reference_page)
    }
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// The annotation editing surface for one loaded document.
///
/// Constructed only by a successful [`EditorSession::open_bytes`]; a parse
/// failure leaves no partial session behind. All coordinates entering through
/// pointer commands are canvas pixels and are divided by the zoom factor
/// before storage, so stored annotations are zoom-invariant.
pub struct EditorSession {
    info: DocumentInfo,
    backend: Arc<dyn DocumentBackend>,
    config: SurfaceConfig,
    page_number: usize,
    zoom: f32,
    tool: Tool,
    annotations: Vec<Annotation>,
    fragments: Vec<Fragment>,
    fragments_page: Option<usize>,
    selected_fragment: Option<FragmentId>,
    pending_text: Option<PendingText>,
    pending_signature: Option<PagePoint>,
    live_stroke: Option<LiveStroke>,
    style_color: Color,
    style_font_size: f32,
    generation: u64,
    events: Vec<SurfaceEvent>,
    base_cache: Mutex<HashMap<BaseKey, RenderImage>>,
}

impl EditorSession {
    #[instrument(skip(provider, bytes, config), fields(len = bytes.len()))]
    pub async fn open_bytes<P: DocumentProvider>(
        provider: &P,
        bytes: &[u8],
        config: SurfaceConfig,
    ) -> Result<Self, SurfaceError> {
        let backend = provider
            .open_bytes(bytes)
            .await
            .map_err(SurfaceError::InvalidDocument)?;
        let info = backend.info().clone();
        if info.page_count == 0 {
            return Err(SurfaceError::InvalidDocument(anyhow::anyhow!(
                "document has no pages"
            )));
        }
        let zoom = config.zoom.initial.clamp(config.zoom.min, config.zoom.max);
        Ok(Self {
            info,
            backend,
            style_color: config.style.color,
            style_font_size: config.style.font_size,
            config,
            page_number: 1,
            zoom,
            tool: Tool::Select,
            annotations: Vec::new(),
            fragments: Vec::new(),
            fragments_page: None,
            selected_fragment: None,
            pending_text: None,
            pending_signature: None,
            live_stroke: None,
            generation: 0,
            events: Vec::new(),
            base_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn page_count(&self) -> usize {
        self.info.page_count
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn config(&self) -> &SurfaceConfig {
        &self.config
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn annotations_for_page(&self, page_number: usize) -> impl Iterator<Item = &Annotation> {
        self.annotations
            .iter()
            .filter(move |annotation| annotation.page_number == page_number)
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn selected_fragment(&self) -> Option<FragmentId> {
        self.selected_fragment
    }

    pub fn live_stroke(&self) -> Option<&LiveStroke> {
        self.live_stroke.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fragment ids on the current page hidden behind a text replacement.
    pub fn superseded_fragments(&self) -> HashSet<FragmentId> {
        self.annotations
            .iter()
            .filter(|annotation| annotation.page_number == self.page_number)
            .filter_map(Annotation::replaced_fragment)
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<SurfaceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn apply(&mut self, command: Command) -> Result<(), SurfaceError> {
        match command {
            Command::SelectTool(tool) => self.select_tool(tool)?,
            Command::SetPage { page_number } => self.set_page(page_number)?,
            Command::NextPage => self.next_page()?,
            Command::PrevPage => self.prev_page()?,
            Command::SetZoom { factor } => self.set_zoom(factor),
            Command::SetColor(color) => self.style_color = color,
            Command::SetFontSize(size) => self.style_font_size = size.max(1.0),
            Command::PointerDown { x, y } => self.pointer_down(x, y)?,
            Command::PointerMove { x, y } => self.pointer_move(x, y),
            Command::PointerUp => self.pointer_up(),
            Command::CommitText { content } => self.commit_text(content),
            Command::CancelPending => self.cancel_pending(),
            Command::DeleteAnnotation(id) => self.delete_annotation(id),
            Command::ClearAll => self.clear_all(),
        }
        Ok(())
    }

    pub fn select_tool(&mut self, tool: Tool) -> Result<(), SurfaceError> {
        self.tool = tool;
        self.live_stroke = None;
        self.pending_text = None;
        self.pending_signature = None;
        self.selected_fragment = None;
        self.refresh_fragments()?;
        if tool == Tool::AddImage {
            self.push_event(SurfaceEvent::ImagePickerRequested);
        }
        self.push_event(SurfaceEvent::RedrawNeeded);
        Ok(())
    }

    pub fn set_page(&mut self, page_number: usize) -> Result<(), SurfaceError> {
        if page_number < 1 || page_number > self.info.page_count {
            return Err(SurfaceError::PageOutOfRange {
                requested: page_number,
                page_count: self.info.page_count,
            });
        }
        if page_number == self.page_number {
            return Ok(());
        }
        self.page_number = page_number;
        self.generation += 1;
        self.fragments.clear();
        self.fragments_page = None;
        self.selected_fragment = None;
        self.pending_text = None;
        self.pending_signature = None;
        self.live_stroke = None;
        self.refresh_fragments()?;
        self.push_event(SurfaceEvent::RedrawNeeded);
        Ok(())
    }

    /// Clamped page navigation; never surfaces `PageOutOfRange`.
    pub fn next_page(&mut self) -> Result<(), SurfaceError> {
        let next = (self.page_number + 1).min(self.info.page_count);
        if next != self.page_number {
            self.set_page(next)?;
        }
        Ok(())
    }

    pub fn prev_page(&mut self) -> Result<(), SurfaceError> {
        let prev = self.page_number.saturating_sub(1).max(1);
        if prev != self.page_number {
            self.set_page(prev)?;
        }
        Ok(())
    }

    pub fn set_zoom(&mut self, factor: f32) {
        let zoom = factor.clamp(self.config.zoom.min, self.config.zoom.max);
        if (self.zoom - zoom).abs() > f32::EPSILON {
            self.zoom = zoom;
            self.push_event(SurfaceEvent::RedrawNeeded);
        }
    }

    pub fn pointer_down(&mut self, x: f32, y: f32) -> Result<(), SurfaceError> {
        let point = self.to_page(x, y);
        match self.tool {
            Tool::Select | Tool::AddImage => {}
            Tool::EditText => self.edit_hit(point),
            Tool::AddText => {
                self.pending_text = Some(PendingText::AddAt(point));
                self.push_event(SurfaceEvent::TextInputRequested { anchor: point });
            }
            Tool::Signature => {
                self.pending_signature = Some(point);
                self.push_event(SurfaceEvent::SignaturePadRequested { anchor: point });
            }
            Tool::Freehand => self.begin_stroke(StrokeStyle::Freehand, point),
            Tool::Highlight => self.begin_stroke(StrokeStyle::Highlight, point),
            Tool::Rectangle => {
                let kind = AnnotationKind::Rectangle {
                    width: self.config.defaults.rect_width,
                    height: self.config.defaults.rect_height,
                    color: self.style_color,
                };
                self.commit_annotation(point, kind);
            }
            Tool::Circle => {
                let kind = AnnotationKind::Circle {
                    radius: self.config.defaults.circle_radius,
                    color: self.style_color,
                };
                self.commit_annotation(point, kind);
            }
        }
        Ok(())
    }

    pub fn pointer_move(&mut self, x: f32, y: f32) {
        let point = self.to_page(x, y);
        if let Some(stroke) = self.live_stroke.as_mut() {
            stroke.points.push(point);
            self.push_event(SurfaceEvent::RedrawNeeded);
        }
    }

    pub fn pointer_up(&mut self) {
        if let Some(stroke) = self.live_stroke.take() {
            if stroke.points.is_empty() {
                return;
            }
            let anchor = stroke.points[0];
            let kind = AnnotationKind::Stroke {
                points: stroke.points,
                color: stroke.color,
                style: stroke.style,
            };
            self.commit_annotation(anchor, kind);
        }
    }

    /// Resolves the pending text interaction. An empty prompt and an unchanged
    /// edit are both silently discarded; neither grows the annotation list.
    pub fn commit_text(&mut self, content: String) {
        match self.pending_text.take() {
            None => {}
            Some(PendingText::AddAt(anchor)) => {
                if content.trim().is_empty() {
                    return;
                }
                let kind = AnnotationKind::FreeText {
                    content,
                    font_size: self.style_font_size,
                    color: self.style_color,
                };
                self.commit_annotation(anchor, kind);
            }
            Some(PendingText::EditFragment(edit)) => {
                self.selected_fragment = None;
                if let Some(id) = edit.existing {
                    if content == edit.current {
                        self.push_event(SurfaceEvent::RedrawNeeded);
                        return;
                    }
                    if let Some(annotation) =
                        self.annotations.iter_mut().find(|a| a.id == id)
                    {
                        if let AnnotationKind::TextReplacement {
                            content: existing, ..
                        } = &mut annotation.kind
                        {
                            *existing = content;
                        }
                    }
                    self.push_event(SurfaceEvent::RedrawNeeded);
                    return;
                }
                if content == edit.original {
                    self.push_event(SurfaceEvent::RedrawNeeded);
                    return;
                }
                // The replacement is drawn from the fragment's baseline, so the
                // anchor derives from the fragment box rather than the click.
                let anchor = PagePoint::new(edit.rect.x, edit.rect.y + edit.rect.height - 2.0);
                let kind = AnnotationKind::TextReplacement {
                    content,
                    font_size: edit.font_size,
                    color: self.style_color,
                    fragment_id: edit.fragment_id,
                };
                self.commit_annotation(anchor, kind);
            }
        }
    }

    pub fn cancel_pending(&mut self) {
        self.pending_text = None;
        self.pending_signature = None;
        self.selected_fragment = None;
        self.push_event(SurfaceEvent::RedrawNeeded);
    }

    /// Captures the current generation for an asynchronous decode; the commit
    /// is applied only if the surface has not moved on in the meantime.
    pub fn stage_placement(&self) -> PlacementTicket {
        PlacementTicket {
            generation: self.generation,
        }
    }

    pub fn commit_image(
        &mut self,
        ticket: PlacementTicket,
        raster: RenderImage,
    ) -> Option<AnnotationId> {
        if ticket.generation != self.generation {
            warn!(
                staged = ticket.generation,
                current = self.generation,
                "discarding stale image decode"
            );
            return None;
        }
        let anchor = PagePoint::new(
            self.config.defaults.image_anchor_x,
            self.config.defaults.image_anchor_y,
        );
        let kind = AnnotationKind::Image {
            raster,
            width: self.config.defaults.image_width,
            height: self.config.defaults.image_height,
        };
        Some(self.commit_annotation(anchor, kind))
    }

    pub fn commit_signature(
        &mut self,
        ticket: PlacementTicket,
        raster: RenderImage,
    ) -> Option<AnnotationId> {
        if ticket.generation != self.generation {
            warn!(
                staged = ticket.generation,
                current = self.generation,
                "discarding stale signature"
            );
            self.pending_signature = None;
            return None;
        }
        let anchor = self.pending_signature.take()?;
        let kind = AnnotationKind::Signature {
            raster,
            width: self.config.defaults.signature_width,
            height: self.config.defaults.signature_height,
        };
        let id = self.commit_annotation(anchor, kind);
        self.tool = Tool::Select;
        Some(id)
    }

    pub fn delete_annotation(&mut self, id: AnnotationId) {
        let before = self.annotations.len();
        self.annotations.retain(|annotation| annotation.id != id);
        if self.annotations.len() != before {
            self.push_event(SurfaceEvent::RedrawNeeded);
        }
    }

    pub fn clear_all(&mut self) {
        self.annotations.clear();
        self.push_event(SurfaceEvent::RedrawNeeded);
    }

    /// The immutable base layer: the page raster at the current zoom, cached
    /// so annotation edits never re-render the page itself.
    pub fn render_base(&self) -> Result<RenderImage, SurfaceError> {
        let key = BaseKey::new(self.page_number, self.zoom);
        if let Some(image) = self.base_cache.lock().get(&key) {
            return Ok(image.clone());
        }
        let image = self.backend.render_page(RenderRequest {
            page_number: self.page_number,
            scale: self.zoom,
        })?;
        let mut cache = self.base_cache.lock();
        cache.insert(key, image.clone());
        if cache.len() > BASE_CACHE_CAPACITY {
            let mut keys: Vec<_> = cache.keys().cloned().collect();
            keys.sort_by_key(|k| k.distance(self.page_number));
            for stale in keys.into_iter().skip(BASE_CACHE_CAPACITY) {
                cache.remove(&stale);
            }
        }
        Ok(image)
    }

    fn to_page(&self, x: f32, y: f32) -> PagePoint {
        PagePoint::new(x / self.zoom, y / self.zoom)
    }

    fn begin_stroke(&mut self, style: StrokeStyle, point: PagePoint) {
        let color = match style {
            StrokeStyle::Freehand => self.style_color,
            StrokeStyle::Highlight => self.config.style.highlight_color,
        };
        self.live_stroke = Some(LiveStroke {
            style,
            color,
            points: vec![point],
        });
        self.push_event(SurfaceEvent::RedrawNeeded);
    }

    fn edit_hit(&mut self, point: PagePoint) {
        let superseded = self.superseded_fragments();
        let replaced_hit = self
            .fragments
            .iter()
            .filter(|fragment| superseded.contains(&fragment.id))
            .find(|fragment| fragment.rect.contains(point))
            .map(|f| (f.id, f.rect, f.content.clone(), f.font_size));

        if let Some((fragment_id, rect, original, font_size)) = replaced_hit {
            // Clicking through to a superseded fragment reopens its
            // replacement rather than stacking a second one.
            let existing = self
                .annotations
                .iter()
                .find(|a| a.replaced_fragment() == Some(fragment_id))
                .map(|a| {
                    let current = match &a.kind {
                        AnnotationKind::TextReplacement { content, .. } => content.clone(),
                        _ => String::new(),
                    };
                    (a.id, current)
                });
            if let Some((annotation_id, current)) = existing {
                self.selected_fragment = Some(fragment_id);
                self.pending_text = Some(PendingText::EditFragment(PendingTextEdit {
                    fragment_id,
                    rect,
                    original,
                    current: current.clone(),
                    font_size,
                    existing: Some(annotation_id),
                }));
                self.push_event(SurfaceEvent::TextEditRequested {
                    fragment_id,
                    rect,
                    content: current,
                    font_size,
                });
                self.push_event(SurfaceEvent::RedrawNeeded);
            }
            return;
        }

        let fresh_hit = hit_test(&self.fragments, &superseded, point)
            .map(|f| (f.id, f.rect, f.content.clone(), f.font_size));
        match fresh_hit {
            Some((fragment_id, rect, content, font_size)) => {
                self.selected_fragment = Some(fragment_id);
                self.pending_text = Some(PendingText::EditFragment(PendingTextEdit {
                    fragment_id,
                    rect,
                    original: content.clone(),
                    current: content.clone(),
                    font_size,
                    existing: None,
                }));
                self.push_event(SurfaceEvent::TextEditRequested {
                    fragment_id,
                    rect,
                    content,
                    font_size,
                });
                self.push_event(SurfaceEvent::RedrawNeeded);
            }
            None => {
                self.selected_fragment = None;
                self.pending_text = None;
                self.push_event(SurfaceEvent::RedrawNeeded);
            }
        }
    }

    /// Fragments are extracted only when something needs them: the edit tool
    /// for hit-testing, or a replacement on the page for masking.
    fn refresh_fragments(&mut self) -> Result<(), SurfaceError> {
        let needed = self.tool == Tool::EditText
            || self
                .annotations
                .iter()
                .any(|a| a.page_number == self.page_number && a.replaced_fragment().is_some());
        if !needed {
            self.fragments.clear();
            self.fragments_page = None;
            return Ok(());
        }
        if self.fragments_page == Some(self.page_number) {
            return Ok(());
        }
        self.fragments = self.backend.page_fragments(self.page_number)?;
        self.fragments_page = Some(self.page_number);
        Ok(())
    }

    fn commit_annotation(&mut self, anchor: PagePoint, kind: AnnotationKind) -> AnnotationId {
        let annotation = Annotation::new(self.page_number, anchor, kind);
        let id = annotation.id;
        self.annotations.push(annotation);
        self.push_event(SurfaceEvent::AnnotationCommitted(id));
        self.push_event(SurfaceEvent::RedrawNeeded);
        id
    }

    fn push_event(&mut self, event: SurfaceEvent) {
        self.events.push(event);
    }
}
