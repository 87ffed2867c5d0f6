//! The external EPUB writer §4.8 hands a `{title, html}` manifest to.
//!
//! Grounded in the teacher's `updater/native/epub.rs::write_epub` (build a
//! zip archive with `xml::writer` events for each OPF/NCX/XHTML part),
//! trimmed of its inline-image download-and-transcode pass: this writer's
//! input is already plain `{title, html}` pairs, never raw chapter markup
//! with image URLs to resolve, so there is no `image`/`webp` dependency here.

use crate::error::{EngineError, Result};
use std::io::Write;
use std::path::Path;
use xml::writer::XmlEvent;
use xml::EmitterConfig;

pub struct EpubChapter {
    pub title: String,
    pub html: String,
}

pub struct EpubMetadata {
    pub title: String,
    pub author: String,
    pub source_url: String,
    pub cover_url: Option<String>,
}

pub trait EpubWriter: Send + Sync {
    fn write(&self, metadata: &EpubMetadata, chapters: &[EpubChapter], out_path: &Path) -> Result<()>;
}

#[derive(Default)]
pub struct ZipEpubWriter;

impl EpubWriter for ZipEpubWriter {
    fn write(&self, metadata: &EpubMetadata, chapters: &[EpubChapter], out_path: &Path) -> Result<()> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::internal(format!("could not create {parent:?}: {e}")))?;
        }
        let file = std::fs::File::create(out_path)
            .map_err(|e| EngineError::internal(format!("could not create {out_path:?}: {e}")))?;
        let mut zip = zip::ZipWriter::new(file);
        let io_err = |e: std::io::Error| EngineError::internal(format!("epub write failed: {e}"));
        let zip_err = |e: zip::result::ZipError| EngineError::internal(format!("epub write failed: {e}"));

        zip.start_file("mimetype", zip::write::FileOptions::default()).map_err(zip_err)?;
        zip.write_all(b"application/epub+zip").map_err(io_err)?;

        zip.add_directory("META-INF", zip::write::FileOptions::default()).map_err(zip_err)?;
        zip.start_file("META-INF/container.xml", zip::write::FileOptions::default()).map_err(zip_err)?;
        write_container_xml(&mut zip).map_err(io_err)?;

        zip.start_file("OEBPS/toc.ncx", zip::write::FileOptions::default()).map_err(zip_err)?;
        write_toc_ncx(metadata, chapters, &mut zip).map_err(io_err)?;

        zip.start_file("OEBPS/text/title.xhtml", zip::write::FileOptions::default()).map_err(zip_err)?;
        write_title_xhtml(metadata, &mut zip).map_err(io_err)?;

        for (index, chapter) in chapters.iter().enumerate() {
            zip.start_file(format!("OEBPS/text/chapter_{index}.xhtml"), zip::write::FileOptions::default())
                .map_err(zip_err)?;
            write_chapter_xhtml(chapter, &mut zip).map_err(io_err)?;
        }

        zip.start_file("OEBPS/content.opf", zip::write::FileOptions::default()).map_err(zip_err)?;
        write_content_opf(metadata, chapters, &mut zip).map_err(io_err)?;

        zip.finish().map_err(zip_err)?;
        Ok(())
    }
}

fn write_container_xml(file: &mut impl Write) -> std::io::Result<()> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);
    xml.write(
        XmlEvent::start_element("container")
            .attr("version", "1.0")
            .ns("", "urn:oasis:names:tc:opendocument:xmlns:container"),
    )?;
    xml.write(XmlEvent::start_element("rootfiles"))?;
    xml.write(
        XmlEvent::start_element("rootfile")
            .attr("full-path", "OEBPS/content.opf")
            .attr("media-type", "application/oebps-package+xml"),
    )?;
    xml.write(XmlEvent::end_element())?; // rootfile
    xml.write(XmlEvent::end_element())?; // rootfiles
    xml.write(XmlEvent::end_element())?; // container
    Ok(())
}

fn write_title_xhtml(metadata: &EpubMetadata, file: &mut impl Write) -> std::io::Result<()> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);
    xml.write(XmlEvent::start_element("html").ns("", "http://www.w3.org/1999/xhtml"))?;
    xml.write(XmlEvent::start_element("head"))?;
    xml.write(XmlEvent::start_element("title"))?;
    xml.write(XmlEvent::characters(&metadata.title))?;
    xml.write(XmlEvent::end_element())?; // title
    xml.write(XmlEvent::end_element())?; // head
    xml.write(XmlEvent::start_element("body"))?;
    xml.write(XmlEvent::start_element("h1").attr("class", "title"))?;
    xml.write(XmlEvent::characters(&metadata.title))?;
    xml.write(XmlEvent::end_element())?; // h1
    xml.write(XmlEvent::start_element("h2").attr("class", "author"))?;
    xml.write(XmlEvent::characters(&metadata.author))?;
    xml.write(XmlEvent::end_element())?; // h2
    if let Some(cover) = &metadata.cover_url {
        xml.write(XmlEvent::start_element("img").attr("src", cover.as_str()).attr("alt", "Cover"))?;
        xml.write(XmlEvent::end_element())?; // img
    }
    xml.write(XmlEvent::end_element())?; // body
    xml.write(XmlEvent::end_element())?; // html
    Ok(())
}

fn write_chapter_xhtml(chapter: &EpubChapter, file: &mut impl Write) -> std::io::Result<()> {
    {
        let mut xml = EmitterConfig::new().perform_indent(true).create_writer(&mut *file);
        xml.write(XmlEvent::start_element("html").ns("", "http://www.w3.org/1999/xhtml"))?;
        xml.write(XmlEvent::start_element("head"))?;
        xml.write(XmlEvent::start_element("title"))?;
        xml.write(XmlEvent::characters(&chapter.title))?;
        xml.write(XmlEvent::end_element())?; // title
        xml.write(XmlEvent::end_element())?; // head
        xml.write(XmlEvent::start_element("body"))?;
        xml.write(XmlEvent::start_element("h1").attr("class", "chapter-title"))?;
        xml.write(XmlEvent::characters(&chapter.title))?;
        xml.write(XmlEvent::end_element())?; // h1
        xml.write(XmlEvent::start_element("div").attr("class", "chapter-content"))?;
    }
    // `chapter.html` is the Assembler's `<p>...</p>`-wrapped markup, not
    // character data, so it's written raw here rather than through an
    // escaping `XmlEvent::characters()` call.
    file.write_all(chapter.html.as_bytes())?;
    {
        let mut xml = EmitterConfig::new()
            .perform_indent(true)
            .write_document_declaration(false)
            .create_writer(&mut *file);
        xml.write(XmlEvent::end_element().name("div"))?;
        xml.write(XmlEvent::end_element().name("body"))?;
        xml.write(XmlEvent::end_element().name("html"))?;
    }
    Ok(())
}

fn write_toc_ncx(metadata: &EpubMetadata, chapters: &[EpubChapter], file: &mut impl Write) -> std::io::Result<()> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);
    xml.write(
        XmlEvent::start_element("ncx")
            .ns("", "http://www.daisy.org/z3986/2005/ncx/")
            .attr("version", "2005-1"),
    )?;
    xml.write(XmlEvent::start_element("head"))?;
    xml.write(XmlEvent::end_element())?; // head
    xml.write(XmlEvent::start_element("docTitle"))?;
    xml.write(XmlEvent::start_element("text"))?;
    xml.write(XmlEvent::characters(&metadata.title))?;
    xml.write(XmlEvent::end_element())?; // text
    xml.write(XmlEvent::end_element())?; // docTitle
    xml.write(XmlEvent::start_element("navMap"))?;
    for (index, chapter) in chapters.iter().enumerate() {
        xml.write(
            XmlEvent::start_element("navPoint")
                .attr("id", &format!("chapter_{index}"))
                .attr("playOrder", &(index + 1).to_string()),
        )?;
        xml.write(XmlEvent::start_element("navLabel"))?;
        xml.write(XmlEvent::start_element("text"))?;
        xml.write(XmlEvent::characters(&chapter.title))?;
        xml.write(XmlEvent::end_element())?; // text
        xml.write(XmlEvent::end_element())?; // navLabel
        xml.write(XmlEvent::start_element("content").attr("src", &format!("text/chapter_{index}.xhtml")))?;
        xml.write(XmlEvent::end_element())?; // content
        xml.write(XmlEvent::end_element())?; // navPoint
    }
    xml.write(XmlEvent::end_element())?; // navMap
    xml.write(XmlEvent::end_element())?; // ncx
    Ok(())
}

fn write_content_opf(metadata: &EpubMetadata, chapters: &[EpubChapter], file: &mut impl Write) -> std::io::Result<()> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);
    xml.write(
        XmlEvent::start_element("package")
            .ns("", "http://www.idpf.org/2007/opf")
            .attr("version", "2.0")
            .attr("unique-identifier", "bookid"),
    )?;
    xml.write(XmlEvent::start_element("metadata").ns("dc", "http://purl.org/dc/elements/1.1/"))?;
    xml.write(XmlEvent::start_element("dc:title"))?;
    xml.write(XmlEvent::characters(&metadata.title))?;
    xml.write(XmlEvent::end_element())?;
    xml.write(XmlEvent::start_element("dc:creator"))?;
    xml.write(XmlEvent::characters(&metadata.author))?;
    xml.write(XmlEvent::end_element())?;
    xml.write(XmlEvent::start_element("dc:source"))?;
    xml.write(XmlEvent::characters(&metadata.source_url))?;
    xml.write(XmlEvent::end_element())?;
    xml.write(XmlEvent::start_element("dc:identifier").attr("id", "bookid"))?;
    xml.write(XmlEvent::characters(&metadata.source_url))?;
    xml.write(XmlEvent::end_element())?;
    xml.write(XmlEvent::end_element())?; // metadata

    xml.write(XmlEvent::start_element("manifest"))?;
    xml.write(
        XmlEvent::start_element("item")
            .attr("id", "title")
            .attr("href", "text/title.xhtml")
            .attr("media-type", "application/xhtml+xml"),
    )?;
    xml.write(XmlEvent::end_element())?;
    xml.write(
        XmlEvent::start_element("item")
            .attr("id", "toc")
            .attr("href", "toc.ncx")
            .attr("media-type", "application/x-dtbncx+xml"),
    )?;
    xml.write(XmlEvent::end_element())?;
    for index in 0..chapters.len() {
        xml.write(
            XmlEvent::start_element("item")
                .attr("id", &format!("chapter_{index}"))
                .attr("href", &format!("text/chapter_{index}.xhtml"))
                .attr("media-type", "application/xhtml+xml"),
        )?;
        xml.write(XmlEvent::end_element())?;
    }
    xml.write(XmlEvent::end_element())?; // manifest

    xml.write(XmlEvent::start_element("spine").attr("toc", "toc"))?;
    xml.write(XmlEvent::start_element("itemref").attr("idref", "title"))?;
    xml.write(XmlEvent::end_element())?;
    for index in 0..chapters.len() {
        xml.write(XmlEvent::start_element("itemref").attr("idref", &format!("chapter_{index}")))?;
        xml.write(XmlEvent::end_element())?;
    }
    xml.write(XmlEvent::end_element())?; // spine
    xml.write(XmlEvent::end_element())?; // package
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_readable_zip_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        let writer = ZipEpubWriter;
        let metadata = EpubMetadata {
            title: "Title".to_owned(),
            author: "Author".to_owned(),
            source_url: "https://example.com/1".to_owned(),
            cover_url: None,
        };
        let chapters = vec![EpubChapter { title: "Chapter 1".to_owned(), html: "<p>Hello</p>".to_owned() }];
        writer.write(&metadata, &chapters, &path).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert!(archive.by_name("mimetype").is_ok());
        assert!(archive.by_name("OEBPS/content.opf").is_ok());
        assert!(archive.by_name("OEBPS/text/chapter_0.xhtml").is_ok());
    }

    #[test]
    fn chapter_body_is_embedded_as_real_markup_not_escaped() {
        let mut buf: Vec<u8> = Vec::new();
        let chapter = EpubChapter { title: "Chapter 1".to_owned(), html: "<p>Para1</p>\n<p>Para2</p>".to_owned() };
        write_chapter_xhtml(&chapter, &mut buf).unwrap();
        let xhtml = String::from_utf8(buf).unwrap();

        assert!(xhtml.contains("<p>Para1</p>"), "expected raw <p> markup, got: {xhtml}");
        assert!(xhtml.contains("<p>Para2</p>"));
        assert!(!xhtml.contains("&lt;p&gt;"), "chapter body must not be XML-escaped, got: {xhtml}");
        assert!(xhtml.trim_end().ends_with("</html>"));
    }
}
