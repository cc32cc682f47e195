
use std::fs;
use std::io::Read;
use std::path::Path;

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::{RagError, Result};

/// A loaded document: text plus source metadata. Loaders may add keys of
/// their own (`page` for PDFs, `section` for markdown).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(content: String, source: &Path) -> Self {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!(source.display().to_string()));
        Self { content, metadata }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
    }
}

/// A document loader. Loaders are a flat set dispatched by iteration; there
/// is no inheritance hierarchy to extend, only this capability pair.
pub trait Loader: Send + Sync {
    fn supports(&self, path: &Path) -> bool;
    fn load(&self, path: &Path) -> Result<Vec<Document>>;
}

/// Static registry of loaders, assembled once at startup.
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn Loader>>,
    max_file_size: u64,
}

impl LoaderRegistry {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            loaders: vec![
                Box::new(TextLoader),
                Box::new(MarkdownLoader),
                Box::new(PdfLoader),
                Box::new(DocxLoader),
            ],
            max_file_size,
        }
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.loaders.iter().any(|l| l.supports(path))
    }

    /// Load a file through the first loader that supports its extension.
    /// Oversized and unsupported files fail with `RagError::Loader`.
    pub fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let size = fs::metadata(path)
            .map_err(|e| RagError::Loader(format!("cannot stat {}: {e}", path.display())))?
            .len();
        if size > self.max_file_size {
            return Err(RagError::Loader(format!(
                "{} is {size} bytes, exceeding the {} byte limit",
                path.display(),
                self.max_file_size
            )));
        }

        for loader in &self.loaders {
            if loader.supports(path) {
                let documents = loader.load(path)?;
                debug!(
                    "Loaded {} document(s) from {}",
                    documents.len(),
                    path.display()
                );
                return Ok(documents);
            }
        }

        Err(RagError::Loader(format!(
            "unsupported file type: {}",
            path.display()
        )))
    }
}

fn extension_is(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Plain-text loader. Tries UTF-8, then GBK, then GB2312, then Latin-1;
/// the first decoding without errors wins.
pub struct TextLoader;

impl Loader for TextLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_is(path, "txt")
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = fs::read(path)
            .map_err(|e| RagError::Loader(format!("cannot read {}: {e}", path.display())))?;
        let content = decode_text(&bytes).ok_or_else(|| {
            RagError::Loader(format!("{}: no supported encoding decoded", path.display()))
        })?;

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Document::new(content, path)])
    }
}

fn decode_text(bytes: &[u8]) -> Option<String> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some(text.to_string());
    }
    for label in ["gbk", "gb2312"] {
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
            let (decoded, _, had_errors) = encoding.decode(bytes);
            if !had_errors {
                return Some(decoded.into_owned());
            }
        }
    }
    // Latin-1 maps every byte to a code point, so this always succeeds.
    Some(bytes.iter().map(|&b| b as char).collect())
}

/// Markdown loader. Splits on top-level headings so each section becomes a
/// document; a file without headings falls back to a single plain-text
/// document.
pub struct MarkdownLoader;

impl Loader for MarkdownLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_is(path, "md") || extension_is(path, "markdown")
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = fs::read(path)
            .map_err(|e| RagError::Loader(format!("cannot read {}: {e}", path.display())))?;
        let text = decode_text(&bytes).ok_or_else(|| {
            RagError::Loader(format!("{}: no supported encoding decoded", path.display()))
        })?;

        let sections = split_markdown_sections(&text);
        if sections.is_empty() {
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![Document::new(text, path)]);
        }

        Ok(sections
            .into_iter()
            .map(|(heading, body)| {
                let mut doc = Document::new(body, path);
                if let Some(heading) = heading {
                    doc = doc.with_meta("section", json!(heading));
                }
                doc
            })
            .collect())
    }
}

fn split_markdown_sections(text: &str) -> Vec<(Option<String>, String)> {
    let mut sections: Vec<(Option<String>, String)> = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut current_body = String::new();
    let mut heading_buffer: Option<String> = None;
    let mut saw_heading = false;

    let mut flush =
        |heading: Option<String>, body: &mut String, sections: &mut Vec<(Option<String>, String)>| {
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                sections.push((heading, trimmed.to_string()));
            }
            body.clear();
        };

    for event in Parser::new(text) {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                saw_heading = true;
                flush(current_heading.take(), &mut current_body, &mut sections);
                heading_buffer = Some(String::new());
            }
            Event::End(TagEnd::Heading(_)) => {
                current_heading = heading_buffer.take();
                if let Some(h) = &current_heading {
                    current_body.push_str(h);
                    current_body.push_str("\n\n");
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if let Some(buffer) = heading_buffer.as_mut() {
                    buffer.push_str(&t);
                } else {
                    current_body.push_str(&t);
                }
            }
            Event::SoftBreak | Event::HardBreak => current_body.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => current_body.push_str("\n\n"),
            _ => {}
        }
    }
    flush(current_heading.take(), &mut current_body, &mut sections);

    if saw_heading { sections } else { Vec::new() }
}

/// PDF loader producing one document per page, with a 1-based `page` key.
pub struct PdfLoader;

impl Loader for PdfLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_is(path, "pdf")
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let pdf = lopdf::Document::load(path)
            .map_err(|e| RagError::Loader(format!("cannot parse {}: {e}", path.display())))?;

        let mut documents = Vec::new();
        for (page_number, _) in pdf.get_pages() {
            let text = match pdf.extract_text(&[page_number]) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        "Skipping page {page_number} of {}: text extraction failed ({e})",
                        path.display()
                    );
                    continue;
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            documents
                .push(Document::new(text, path).with_meta("page", json!(page_number)));
        }

        Ok(documents)
    }
}

/// DOCX loader. A .docx file is a zip archive; body text lives in
/// `word/document.xml` as `<w:t>` runs grouped into `<w:p>` paragraphs.
pub struct DocxLoader;

impl Loader for DocxLoader {
    fn supports(&self, path: &Path) -> bool {
        extension_is(path, "docx")
    }

    fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let file = fs::File::open(path)
            .map_err(|e| RagError::Loader(format!("cannot open {}: {e}", path.display())))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| RagError::Loader(format!("{} is not a docx archive: {e}", path.display())))?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|e| {
                RagError::Loader(format!("{} has no document body: {e}", path.display()))
            })?
            .read_to_string(&mut xml)
            .map_err(|e| RagError::Loader(format!("cannot read {}: {e}", path.display())))?;

        let content = extract_docx_text(&xml)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Document::new(content, path)])
    }
}

fn extract_docx_text(xml: &str) -> Result<String> {
    use quick_xml::events::Event as XmlEvent;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut content = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Ok(XmlEvent::End(e)) if e.name().as_ref() == b"w:t" => in_text_run = false,
            Ok(XmlEvent::End(e)) if e.name().as_ref() == b"w:p" => content.push('\n'),
            Ok(XmlEvent::Empty(e)) if e.name().as_ref() == b"w:tab" => content.push('\t'),
            Ok(XmlEvent::Empty(e)) if e.name().as_ref() == b"w:br" => content.push('\n'),
            Ok(XmlEvent::Text(t)) if in_text_run => {
                let text = t
                    .unescape()
                    .map_err(|e| RagError::Loader(format!("malformed docx XML: {e}")))?;
                content.push_str(&text);
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(RagError::Loader(format!("malformed docx XML: {e}"))),
            _ => {}
        }
    }

    Ok(content)
}
