//! Local OCR engine wrapping the `tesseract` CLI tool.
//!
//! This engine needs no credentials, so it's always available and serves as
//! the last resort for automatic engine selection.

use std::time::Instant;

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, config::OcrConfig, cpu_limit::with_cpu_semaphore,
    preprocess::pixel_buffer::PixelBuffer, prelude::*,
};

use super::{EngineError, EngineId, ExtractOptions, OcrEngine, OcrResult, require_text};

/// `tesseract` TSV level for individual words.
const WORD_LEVEL: u32 = 5;

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct LocalOcrEngine {
    /// The command to run.
    command: String,
}

impl LocalOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.tesseract_cmd.clone(),
        }
    }

    /// Run `tesseract` on `png` and return its TSV output.
    async fn run_tesseract(&self, png: &[u8], language: &str) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, png)
            .await
            .context("cannot write tesseract input file")?;

        // Tesseract is happy to use a whole core, so take a CPU permit.
        let output = with_cpu_semaphore(|| async {
            Command::new(&self.command)
                .arg(&input_path)
                .arg("stdout")
                .arg("-l")
                .arg(language)
                .arg("tsv")
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("cannot run {}", self.command))
        })
        .await?;
        check_for_command_failure(&self.command, &output)?;
        String::from_utf8(output.stdout).context("tesseract output was not UTF-8")
    }
}

/// Text and mean word confidence parsed from `tesseract` TSV output.
#[derive(Debug, PartialEq)]
struct TsvPage {
    text: String,
    confidence: f32,
}

/// Rebuild the page text from `tesseract` TSV output.
///
/// Words on the same line are joined with spaces. A new paragraph or block
/// starts after a blank line. Confidence is the mean over words that have
/// one; `tesseract` uses `-1` for "no score".
fn parse_tsv(tsv: &str) -> TsvPage {
    let mut text = String::new();
    let mut current_line = None;
    let mut current_paragraph = None;
    let mut confidence_total = 0.0f64;
    let mut confidence_count = 0u32;

    // Skip the header row.
    for row in tsv.lines().skip(1) {
        let fields = row.split('\t').collect::<Vec<_>>();
        if fields.len() < 12 {
            continue;
        }
        if fields[0].parse::<u32>().ok() != Some(WORD_LEVEL) {
            continue;
        }
        let word = fields[11].trim();
        if word.is_empty() {
            continue;
        }

        // (page, block, paragraph) and (page, block, paragraph, line).
        let paragraph = (fields[1], fields[2], fields[3]);
        let line = (fields[1], fields[2], fields[3], fields[4]);
        if current_line != Some(line) {
            if current_line.is_some() {
                text.push('\n');
                if current_paragraph != Some(paragraph) {
                    text.push('\n');
                }
            }
            current_line = Some(line);
            current_paragraph = Some(paragraph);
        } else {
            text.push(' ');
        }
        text.push_str(word);

        if let Ok(conf) = fields[10].trim().parse::<f64>()
            && conf >= 0.0
        {
            confidence_total += conf;
            confidence_count += 1;
        }
    }

    let confidence = if confidence_count == 0 {
        0.0
    } else {
        (confidence_total / f64::from(confidence_count)) as f32
    };
    TsvPage { text, confidence }
}

#[async_trait]
impl OcrEngine for LocalOcrEngine {
    fn id(&self) -> EngineId {
        EngineId::LocalOcr
    }

    fn is_available(&self) -> bool {
        true
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.id(), language = %options.language))]
    async fn extract(
        &self,
        image: &PixelBuffer,
        options: &ExtractOptions,
    ) -> Result<OcrResult, EngineError> {
        let started = Instant::now();
        let png = image
            .to_png()
            .map_err(|e| EngineError::Extraction(format!("could not encode image: {e:#}")))?;
        let tsv = self
            .run_tesseract(&png, &options.language)
            .await
            .map_err(|e| EngineError::Transport(format!("{e:#}")))?;
        let page = parse_tsv(&tsv);
        let text = require_text(self.id(), page.text)?;
        debug!(confidence = page.confidence, chars = text.len(), "tesseract extracted text");
        Ok(OcrResult::new(
            self.id(),
            text,
            page.confidence,
            started.elapsed(),
            options,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn tsv(rows: &[&str]) -> String {
        let mut out = HEADER.to_owned();
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out
    }

    #[test]
    fn rebuilds_lines_and_paragraphs() {
        let input = tsv(&[
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t",
            "5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\tNota",
            "5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t80\tfiscal",
            "5\t1\t1\t1\t2\t1\t0\t0\t10\t10\t70\tnº",
            "5\t1\t2\t1\t1\t1\t0\t0\t10\t10\t60.5\tTotal",
        ]);
        let page = parse_tsv(&input);
        assert_eq!(page.text, "Nota fiscal\nnº\n\nTotal");
        assert!((page.confidence - 75.125).abs() < 1e-4);
    }

    #[test]
    fn ignores_words_without_confidence() {
        let input = tsv(&[
            "5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t-1\tCPF",
            "5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t88\t123",
        ]);
        let page = parse_tsv(&input);
        assert_eq!(page.text, "CPF 123");
        assert_eq!(page.confidence, 88.0);
    }

    #[test]
    fn empty_output_has_no_text() {
        let page = parse_tsv(HEADER);
        assert_eq!(
            page,
            TsvPage {
                text: String::new(),
                confidence: 0.0
            }
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_error() {
        let engine = LocalOcrEngine::new(&OcrConfig {
            tesseract_cmd: "definitely-not-tesseract-4d1f".to_owned(),
            ..OcrConfig::default()
        });
        let image = PixelBuffer::from_gray(1, 1, &[0]).unwrap();
        let result = engine.extract(&image, &ExtractOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
    }

    #[tokio::test]
    #[ignore = "Needs tesseract installed"]
    async fn recognizes_a_blank_page_as_empty() {
        let engine = LocalOcrEngine::new(&OcrConfig::default());
        let image = PixelBuffer::from_gray(64, 64, &[255; 64 * 64]).unwrap();
        let result = engine.extract(&image, &ExtractOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Extraction(_))));
    }
}
