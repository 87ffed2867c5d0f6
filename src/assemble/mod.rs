//! Turns fetched chapter bodies into a final on-disk artifact: a flat `.txt`
//! file or an EPUB built by the [`epub_writer`] trait.
//!
//! Grounded in the teacher's `updater/native/epub.rs::write_epub` entrypoint,
//! split here into a format-agnostic front (this module) and a zip/xml
//! writer behind a trait, so the txt path never has to know an `EpubWriter`
//! exists.

pub mod epub_writer;

use crate::blobstore::{sanitize, BlobStore};
use crate::download::FetchedChapter;
use crate::error::{EngineError, Result};
use crate::task::Format;
use epub_writer::{EpubChapter, EpubMetadata, EpubWriter};
use std::path::PathBuf;
use std::sync::Arc;

pub struct AssembleInput<'a> {
    pub title: &'a str,
    pub author: &'a str,
    pub source_url: &'a str,
    pub cover_url: Option<&'a str>,
    pub chapters: &'a [FetchedChapter],
}

/// `{sanitize(title)}_{sanitize(author)}.{ext}`, the same scheme the teacher
/// uses for its on-disk EPUB filenames in `updater/native/epub.rs`.
#[must_use]
pub fn output_filename(title: &str, author: &str, format: Format) -> String {
    let ext = match format {
        Format::Txt => "txt",
        Format::Epub => "epub",
    };
    format!("{}_{}.{ext}", sanitize(title), sanitize(author))
}

pub async fn assemble(
    input: AssembleInput<'_>,
    format: Format,
    blobs: &BlobStore,
    epub_writer: &Arc<dyn EpubWriter + Send + Sync>,
) -> Result<PathBuf> {
    let filename = output_filename(input.title, input.author, format);
    let out_path = blobs.download_path(&filename);

    match format {
        Format::Txt => assemble_txt(&input, &out_path, blobs),
        Format::Epub => assemble_epub(&input, &out_path, epub_writer),
    }?;

    Ok(out_path)
}

fn assemble_txt(input: &AssembleInput<'_>, out_path: &std::path::Path, blobs: &BlobStore) -> Result<()> {
    let mut text = format!("{}\n{}\n\n", input.title, input.author);
    for chapter in input.chapters {
        text.push_str(&chapter.title);
        text.push_str("\n\n");
        text.push_str(&chapter.content);
        text.push_str("\n\n");
    }
    blobs.write(out_path, text.as_bytes())
}

fn assemble_epub(
    input: &AssembleInput<'_>,
    out_path: &std::path::Path,
    epub_writer: &Arc<dyn EpubWriter + Send + Sync>,
) -> Result<()> {
    let metadata = EpubMetadata {
        title: input.title.to_owned(),
        author: input.author.to_owned(),
        source_url: input.source_url.to_owned(),
        cover_url: input.cover_url.map(str::to_owned),
    };
    let chapters: Vec<EpubChapter> = input
        .chapters
        .iter()
        .map(|chapter| EpubChapter {
            title: chapter.title.clone(),
            html: wrap_paragraphs(&chapter.content),
        })
        .collect();

    if chapters.is_empty() {
        return Err(EngineError::internal("cannot assemble an epub with no chapters"));
    }

    epub_writer.write(&metadata, &chapters, out_path)
}

/// Splits plain chapter text on blank lines into `<p>` elements, escaping
/// each line. The fetched chapter content is already stripped of markup by
/// [`crate::source::adapter::SourceAdapter::chapter`], so this is the only
/// place chapter bodies re-acquire any HTML structure.
fn wrap_paragraphs(content: &str) -> String {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_xml(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(order: u32, title: &str, content: &str) -> FetchedChapter {
        FetchedChapter {
            order,
            title: title.to_owned(),
            content: content.to_owned(),
            failed: false,
        }
    }

    #[test]
    fn output_filename_sanitizes_title_and_author() {
        let name = output_filename("Tales: Of Fire", "A/B", Format::Epub);
        assert_eq!(name, "Tales_ Of Fire_A_B.epub");
    }

    #[test]
    fn wrap_paragraphs_splits_on_blank_lines_and_escapes() {
        let html = wrap_paragraphs("Hello & <world>\n\nSecond line");
        assert_eq!(html, "<p>Hello &amp; &lt;world&gt;</p>\n<p>Second line</p>");
    }

    #[tokio::test]
    async fn assemble_txt_writes_title_author_and_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path().join("cache"), dir.path().join("downloads")).unwrap();
        let chapters = vec![chapter(1, "Chapter 1", "Once upon a time.")];
        let input = AssembleInput {
            title: "My Book",
            author: "Jane Doe",
            source_url: "https://example.com/1",
            cover_url: None,
            chapters: &chapters,
        };
        let writer: Arc<dyn EpubWriter + Send + Sync> = Arc::new(epub_writer::ZipEpubWriter);
        let path = assemble(input, Format::Txt, &blobs, &writer).await.unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("My Book"));
        assert!(text.contains("Chapter 1"));
        assert!(text.contains("Once upon a time."));
    }

    #[tokio::test]
    async fn assemble_epub_rejects_empty_chapter_list() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path().join("cache"), dir.path().join("downloads")).unwrap();
        let chapters: Vec<FetchedChapter> = Vec::new();
        let input = AssembleInput {
            title: "Empty",
            author: "Nobody",
            source_url: "https://example.com/1",
            cover_url: None,
            chapters: &chapters,
        };
        let writer: Arc<dyn EpubWriter + Send + Sync> = Arc::new(epub_writer::ZipEpubWriter);
        let result = assemble(input, Format::Epub, &blobs, &writer).await;
        assert!(result.is_err());
    }
}
