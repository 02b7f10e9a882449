use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;

use crate::errors::CatalogError;
use crate::store::generations::{CURRENT_FILE, GENERATIONS_DIR};

const BACKUP_FILES: &[&str] = &["config.yaml", CURRENT_FILE];

/// Write `catalog-backup-<timestamp>.tar.gz` into `output_dir` holding the
/// config, the `CURRENT` pointer and the live generation directory.
pub fn create_backup(
    base_path: &Path,
    generation_dir: Option<&Path>,
    output_dir: &Path,
) -> Result<PathBuf, CatalogError> {
    std::fs::create_dir_all(output_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let archive_path = output_dir.join(format!("catalog-backup-{timestamp}.tar.gz"));

    let file = File::create(&archive_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut archive = Builder::new(encoder);

    let mut included_count = 0;

    for filename in BACKUP_FILES {
        let file_path = base_path.join(filename);
        if file_path.exists() {
            archive.append_path_with_name(&file_path, filename)?;
            log::debug!("  + {filename}");
            included_count += 1;
        }
    }

    if let Some(dir) = generation_dir {
        if let Some(name) = dir.file_name() {
            let prefix = Path::new(GENERATIONS_DIR).join(name);
            included_count += append_dir(&mut archive, dir, &prefix)?;
        }
    }

    if included_count == 0 {
        let _ = std::fs::remove_file(&archive_path);
        return Err(CatalogError::IO(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no files found to back up in {}", base_path.display()),
        )));
    }

    let encoder = archive.into_inner()?;
    encoder.finish()?.flush()?;

    let size_kb = std::fs::metadata(&archive_path)?.len() / 1024;
    log::info!("Backup created: {} ({} KB)", archive_path.display(), size_kb);

    Ok(archive_path)
}

fn append_dir<W: Write>(archive: &mut Builder<W>, source_dir: &Path, archive_prefix: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(source_dir)? {
        let entry_path = entry?.path();
        let Some(file_name) = entry_path.file_name() else {
            continue;
        };
        let archive_path = archive_prefix.join(file_name);

        if entry_path.is_dir() {
            count += append_dir(archive, &entry_path, &archive_path)?;
        } else {
            archive.append_path_with_name(&entry_path, &archive_path)?;
            log::debug!("  + {}", archive_path.display());
            count += 1;
        }
    }
    Ok(count)
}
