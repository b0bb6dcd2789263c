//! `zip scripts`: pack a directory into a zip archive.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Deflate every file under `dir` into a new archive at `dest`. Entry names
/// are relative to `dir`. Returns the archive bytes.
pub fn zip_directory(dir: &Path, dest: &Path) -> Result<Vec<u8>, ArchiveError> {
    if !dir.is_dir() {
        return Err(ArchiveError::NotADirectory(dir.to_path_buf()));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let file = File::create(dest).map_err(io_err(dest))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = std::fs::read_dir(&current)
            .map_err(io_err(&current))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err(&current))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            // The archive may live inside the directory being packed.
            if path == dest {
                continue;
            }
            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            let name = relative.to_string_lossy().replace('\\', "/");
            if path.is_dir() {
                writer.add_directory(format!("{name}/"), options)?;
                pending.push(path);
            } else {
                let mut contents = Vec::new();
                File::open(&path)
                    .and_then(|mut f| f.read_to_end(&mut contents))
                    .map_err(io_err(&path))?;
                writer.start_file(name, options)?;
                writer.write_all(&contents).map_err(io_err(&path))?;
            }
        }
    }
    writer.finish()?;

    std::fs::read(dest).map_err(io_err(dest))
}

/// Archive `dir` into `dest` on a blocking thread and return the archive as
/// base64.
pub async fn zip_to_base64(dir: PathBuf, dest: PathBuf) -> Result<String, ArchiveError> {
    let bytes = tokio::task::spawn_blocking(move || zip_directory(&dir, &dest)).await??;
    Ok(STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_nested_files_with_relative_names() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("suite/module")).unwrap();
        std::fs::write(src.path().join("top.json"), "{}").unwrap();
        std::fs::write(src.path().join("suite/module/test.json"), "[1]").unwrap();

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("scripts.zip");
        let bytes = zip_directory(src.path(), &dest).unwrap();
        assert!(!bytes.is_empty());

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_owned).collect();
        assert!(names.contains(&"top.json".to_string()));
        assert!(names.contains(&"suite/module/test.json".to_string()));

        let mut entry = archive.by_name("suite/module/test.json").unwrap();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "[1]");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let out = tempfile::tempdir().unwrap();
        let err = zip_directory(&out.path().join("nope"), &out.path().join("a.zip")).unwrap_err();
        assert!(matches!(err, ArchiveError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn base64_output_decodes_to_zip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), "hello").unwrap();
        let dest = src.path().join("scripts.zip");

        let encoded = zip_to_base64(src.path().to_path_buf(), dest).await.unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(names, vec!["a.txt"]);
    }
}
