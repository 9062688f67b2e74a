use markpdf_core::{fragment_id, Fragment, PageRect};

#[cfg(feature = "pdf")]
mod pdfium_backend {
    use std::mem;
    use std::sync::Arc;

    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use markpdf_core::{
        DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider, Fragment, RenderImage,
        RenderRequest,
    };
    use parking_lot::Mutex;
    use pdfium_render::prelude::*;
    use tracing::{instrument, warn};

    use crate::fragment_from_segment;

    pub struct PdfiumRenderFactory {
        pdfium: Arc<Pdfium>,
    }

    impl PdfiumRenderFactory {
        pub fn new() -> Result<Self> {
            let pdfium = match bind_pdfium_from_env() {
                Some(pdfium) => pdfium,
                None => bind_pdfium_default()?,
            };
            Ok(Self {
                pdfium: Arc::new(pdfium),
            })
        }
    }

    #[async_trait]
    impl DocumentProvider for PdfiumRenderFactory {
        async fn open_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn DocumentBackend>> {
            let bytes = bytes.to_vec();
            let info = {
                let document = self
                    .pdfium
                    .load_pdf_from_byte_slice(&bytes, None)
                    .context("failed to parse document bytes")?;
                build_document_info(&document)
            };
            Ok(Arc::new(PdfiumDocument::new(
                Arc::clone(&self.pdfium),
                bytes,
                info,
            )))
        }
    }

    struct PdfiumDocument {
        // Declared first so the cached document drops before the byte buffer
        // and the Pdfium bindings it borrows from.
        document: Mutex<Option<PdfDocument<'static>>>,
        render_cache: Mutex<Option<RenderCacheEntry>>,
        fragment_cache: Mutex<Option<(usize, Vec<Fragment>)>>,
        info: DocumentInfo,
        bytes: Vec<u8>,
        pdfium: Arc<Pdfium>,
    }

    struct RenderCacheEntry {
        page_number: usize,
        scale: f32,
        image: RenderImage,
    }

    impl PdfiumDocument {
        fn new(pdfium: Arc<Pdfium>, bytes: Vec<u8>, info: DocumentInfo) -> Self {
            Self {
                document: Mutex::new(None),
                render_cache: Mutex::new(None),
                fragment_cache: Mutex::new(None),
                info,
                bytes,
                pdfium,
            }
        }

        fn open_document(&self) -> Result<PdfDocument<'static>> {
            let document = self
                .pdfium
                .load_pdf_from_byte_slice(&self.bytes, None)
                .context("failed to reopen document from bytes")?;
            // SAFETY: the returned PdfDocument borrows both self.bytes and the
            // Pdfium bindings behind self.pdfium. Both live in this struct, and
            // the cached document is declared before them, so field drop order
            // guarantees it is gone before either borrow target is released.
            let document =
                unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
            Ok(document)
        }

        fn with_document<R, F>(&self, f: F) -> Result<R>
        where
            F: FnOnce(&PdfDocument<'static>) -> Result<R>,
        {
            let mut guard = self.document.lock();
            if guard.is_none() {
                let document = self.open_document()?;
                *guard = Some(document);
            }
            let document = guard.as_ref().expect("document must be loaded");
            f(document)
        }

        fn page_at<'a>(
            &self,
            document: &'a PdfDocument<'static>,
            page_number: usize,
        ) -> Result<PdfPage<'a>> {
            let index: PdfPageIndex = page_number
                .checked_sub(1)
                .and_then(|i| i.try_into().ok())
                .ok_or_else(|| anyhow!("page {} is out of supported range", page_number))?;
            document
                .pages()
                .get(index)
                .with_context(|| format!("page {} out of range", page_number))
        }

        fn render_internal(
            &self,
            document: &PdfDocument<'static>,
            request: &RenderRequest,
        ) -> Result<RenderImage> {
            let page = self.page_at(document, request.page_number)?;
            let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_number))?;
            let image = bitmap.as_image().to_rgba8();
            Ok(RenderImage {
                width: image.width(),
                height: image.height(),
                pixels: image.into_raw(),
            })
        }

        fn fragments_internal(
            &self,
            document: &PdfDocument<'static>,
            page_number: usize,
        ) -> Result<Vec<Fragment>> {
            let page = self.page_at(document, page_number)?;
            let page_height = page.height().value;
            if page_height <= 0.0 {
                warn!(page = page_number, "page reports non-positive height");
                return Ok(Vec::new());
            }
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_number))?;

            let mut fragments = Vec::new();
            for segment in text.segments().iter() {
                let content = segment.text();
                let bounds = segment.bounds();
                if let Some(fragment) = fragment_from_segment(
                    page_number,
                    &content,
                    bounds.left().value,
                    bounds.right().value,
                    bounds.top().value,
                    bounds.bottom().value,
                    page_height,
                ) {
                    fragments.push(fragment);
                }
            }
            Ok(fragments)
        }
    }

    impl DocumentBackend for PdfiumDocument {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        #[instrument(skip(self))]
        fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
            {
                let cache = self.render_cache.lock();
                if let Some(entry) = cache.as_ref() {
                    if entry.page_number == request.page_number
                        && (entry.scale - request.scale).abs() < f32::EPSILON
                    {
                        return Ok(entry.image.clone());
                    }
                }
            }

            let image = self.with_document(|document| self.render_internal(document, &request))?;

            let mut cache = self.render_cache.lock();
            *cache = Some(RenderCacheEntry {
                page_number: request.page_number,
                scale: request.scale,
                image: image.clone(),
            });

            Ok(image)
        }

        fn page_fragments(&self, page_number: usize) -> Result<Vec<Fragment>> {
            {
                let cache = self.fragment_cache.lock();
                if let Some((cached_page, fragments)) = cache.as_ref() {
                    if *cached_page == page_number {
                        return Ok(fragments.clone());
                    }
                }
            }

            let fragments =
                self.with_document(|document| self.fragments_internal(document, page_number))?;

            let mut cache = self.fragment_cache.lock();
            *cache = Some((page_number, fragments.clone()));

            Ok(fragments)
        }
    }

    fn build_document_info(document: &PdfDocument<'_>) -> DocumentInfo {
        let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
        let metadata = document.metadata();

        let title = metadata
            .get(PdfDocumentMetadataTagType::Title)
            .map(|t| t.value().to_owned());
        let author = metadata
            .get(PdfDocumentMetadataTagType::Author)
            .map(|t| t.value().to_owned());

        DocumentInfo {
            page_count,
            metadata: DocumentMetadata { title, author },
        }
    }

    fn bind_pdfium_from_env() -> Option<Pdfium> {
        match std::env::var("MARKPDF_PDFIUM_LIBRARY_PATH") {
            Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
                Ok(bindings) => Some(Pdfium::new(bindings)),
                Err(err) => {
                    warn!("failed to load Pdfium from {}: {}", path, err);
                    None
                }
            },
            _ => None,
        }
    }

    fn bind_pdfium_default() -> Result<Pdfium> {
        let mut errors = Vec::new();

        let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

        match Pdfium::bind_to_library(&cwd_path) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(err) => {
                errors.push(format!("{}: {}", cwd_path.display(), err));
            }
        }

        match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(err) => {
                errors.push(format!("system: {err}"));
                Err(anyhow!(
                    "failed to bind to a pdfium library; ensure it is installed ({})",
                    errors.join(", ")
                ))
            }
        }
    }
}

#[cfg(feature = "pdf")]
pub use pdfium_backend::PdfiumRenderFactory;

#[cfg(feature = "pdf")]
pub type PdfRenderFactory = PdfiumRenderFactory;

/// Builds a fragment from one extracted text segment, converting the
/// bottom-left y-up page space the parser reports into the surface's
/// top-left y-down unscaled space. Whitespace-only segments are dropped.
/// Segment extraction carries no reliable font metrics, so the glyph box
/// height stands in for the font size.
pub fn fragment_from_segment(
    page_number: usize,
    content: &str,
    left: f32,
    right: f32,
    top: f32,
    bottom: f32,
    page_height: f32,
) -> Option<Fragment> {
    if content.trim().is_empty() {
        return None;
    }
    let width = (right - left).max(0.0);
    let height = (top - bottom).max(0.0);
    if width <= 0.0 || height <= 0.0 {
        return None;
    }
    let rect = PageRect::new(left, page_height - top, width, height);
    Some(Fragment {
        id: fragment_id(page_number, content, rect),
        page_number,
        rect,
        content: content.to_owned(),
        font_size: height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_coordinates_flip_to_top_left_space() {
        // A segment sitting 700pt up a 792pt page, 12pt tall.
        let fragment = fragment_from_segment(1, "Invoice", 72.0, 180.0, 712.0, 700.0, 792.0)
            .expect("fragment");
        assert_eq!(fragment.rect, PageRect::new(72.0, 80.0, 108.0, 12.0));
        assert_eq!(fragment.font_size, 12.0);
        assert_eq!(fragment.page_number, 1);
    }

    #[test]
    fn whitespace_segments_are_dropped() {
        assert!(fragment_from_segment(1, "   ", 0.0, 10.0, 10.0, 0.0, 100.0).is_none());
        assert!(fragment_from_segment(1, "", 0.0, 10.0, 10.0, 0.0, 100.0).is_none());
    }

    #[test]
    fn degenerate_boxes_are_dropped() {
        assert!(fragment_from_segment(1, "x", 10.0, 10.0, 20.0, 10.0, 100.0).is_none());
        assert!(fragment_from_segment(1, "x", 10.0, 20.0, 10.0, 10.0, 100.0).is_none());
    }

    #[test]
    fn identical_segments_extract_to_identical_ids() {
        let first = fragment_from_segment(2, "Total", 10.0, 50.0, 30.0, 20.0, 100.0).unwrap();
        let second = fragment_from_segment(2, "Total", 10.0, 50.0, 30.0, 20.0, 100.0).unwrap();
        assert_eq!(first.id, second.id);

        let moved = fragment_from_segment(2, "Total", 10.0, 50.0, 40.0, 30.0, 100.0).unwrap();
        assert_ne!(first.id, moved.id);
    }
}
