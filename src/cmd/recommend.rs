//! The `recommend` subcommand.

use clap::Args;
use tokio::{fs::File, io::AsyncReadExt as _};

use crate::{config::OcrConfig, prelude::*};

use super::service_from_config;

/// How many bytes we read when sniffing a file's type.
const SNIFF_BYTES: usize = 8192;

/// Recommendation command line arguments.
#[derive(Debug, Args)]
pub struct RecommendOpts {
    /// The file to recommend an engine for.
    #[clap(value_name = "FILE")]
    pub input: PathBuf,

    #[clap(flatten)]
    pub config: OcrConfig,
}

/// The `recommend` subcommand.
#[instrument(level = "debug", skip_all, fields(path = %opts.input.display()))]
pub async fn cmd_recommend(opts: &RecommendOpts) -> Result<()> {
    let service = service_from_config(&opts.config)?;
    let path = opts.input.as_path();

    let file_size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("could not read metadata for {}", path.display()))?
        .len();
    let file_type = detect_file_type(path).await?;
    info!(%file_type, file_size, "Detected file type");

    println!("{}", service.recommend_engine(&file_type, file_size));
    Ok(())
}

/// Detect a file's MIME type from its first few bytes, falling back to its
/// extension.
async fn detect_file_type(path: &Path) -> Result<String> {
    let file = File::open(path)
        .await
        .with_context(|| format!("could not open {}", path.display()))?;
    let mut header = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64)
        .read_to_end(&mut header)
        .await
        .with_context(|| format!("could not read {}", path.display()))?;
    Ok(mime_type(path, &header))
}

/// Pick a MIME type for `path` with contents starting with `header`.
fn mime_type(path: &Path, header: &[u8]) -> String {
    match infer::get(header) {
        Some(kind) => kind.mime_type().to_owned(),
        None => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_beat_extensions() {
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
        assert_eq!(mime_type(Path::new("scan.jpg"), png), "image/png");
    }

    #[test]
    fn extension_is_a_fallback() {
        assert_eq!(mime_type(Path::new("scan.tiff"), b""), "image/tiff");
        assert_eq!(
            mime_type(Path::new("mystery"), b"hello"),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn detects_type_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page");
        tokio::fs::write(&path, b"\xff\xd8\xff\xe0\0\x10JFIF\0")
            .await
            .unwrap();
        assert_eq!(detect_file_type(&path).await.unwrap(), "image/jpeg");
    }

    #[tokio::test]
    async fn sniffs_only_the_start_of_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.tiff");
        let mut data = b"II*\0".to_vec();
        data.resize(SNIFF_BYTES * 4, 0);
        tokio::fs::write(&path, &data).await.unwrap();
        assert_eq!(detect_file_type(&path).await.unwrap(), "image/tiff");
    }
}
