use serde::Serialize;

use pario_core::backend::{IoType, OpenMode, configured_iotypes};

/// Primary on-disk format, detected from the leading magic bytes alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileFormat {
    ClassicV1,
    OffsetV2,
    DataV5,
    Hdf5,
    LogStructured,
    Unknown,
}

impl FileFormat {
    pub fn label(self) -> &'static str {
        match self {
            FileFormat::ClassicV1 => "classic-v1",
            FileFormat::OffsetV2 => "64-bit-offset-v2",
            FileFormat::DataV5 => "64-bit-data-v5",
            FileFormat::Hdf5 => "v4/HDF5",
            FileFormat::LogStructured => "log-structured",
            FileFormat::Unknown => "unknown",
        }
    }
}

/// Classify a file by its first four bytes.
pub fn detect_format(magic: &[u8]) -> FileFormat {
    match magic {
        [b'C', b'D', b'F', 0x01, ..] => FileFormat::ClassicV1,
        [b'C', b'D', b'F', 0x02, ..] => FileFormat::OffsetV2,
        [b'C', b'D', b'F', 0x05, ..] => FileFormat::DataV5,
        [0x89, b'H', b'D', b'F', ..] => FileFormat::Hdf5,
        [b'L', b'O', b'G', 0x31, ..] => FileFormat::LogStructured,
        _ => FileFormat::Unknown,
    }
}

/// Scan result for one file.
#[derive(Debug, Serialize)]
pub struct FileReport {
    pub path: String,
    pub format: FileFormat,
    /// Names of backends that successfully opened the file.
    pub opens_with: Vec<&'static str>,
}

/// Probe one file: magic detection plus an open attempt with every
/// configured backend, driven through the probe iosystem so the scan
/// exercises the same open path the library uses.
pub fn scan_file(iosysid: i32, path: &str) -> std::io::Result<FileReport> {
    let mut magic = [0u8; 4];
    {
        use std::io::Read;
        let mut f = std::fs::File::open(path)?;
        let n = f.read(&mut magic)?;
        if n < 4 {
            return Ok(FileReport {
                path: path.to_string(),
                format: FileFormat::Unknown,
                opens_with: Vec::new(),
            });
        }
    }
    let format = detect_format(&magic);

    let mut opens_with = Vec::new();
    if format != FileFormat::Unknown {
        for iotype in configured_iotypes() {
            if let Ok((ncid, _)) =
                pario_core::openfile(iosysid, iotype, path, OpenMode::empty(), false)
            {
                opens_with.push(iotype.name());
                let _ = pario_core::closefile(ncid);
            }
        }
    }
    Ok(FileReport {
        path: path.to_string(),
        format,
        opens_with,
    })
}

/// Scan every regular file in a directory, sorted by name.
pub fn scan_dir(iosysid: i32, dir: &str) -> std::io::Result<Vec<FileReport>> {
    let mut paths: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path().to_string_lossy().to_string())
        .collect();
    paths.sort();
    paths.iter().map(|p| scan_file(iosysid, p)).collect()
}

/// The configured backend set, by name.
pub fn configured_backend_names() -> Vec<&'static str> {
    configured_iotypes().iter().map(|t| t.name()).collect()
}

#[allow(dead_code)]
pub fn iotype_label(t: IoType) -> &'static str {
    t.name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pario_core::{LocalComm, Rearranger};

    #[test]
    fn test_detect_format_magics() {
        assert_eq!(detect_format(b"CDF\x01"), FileFormat::ClassicV1);
        assert_eq!(detect_format(b"CDF\x02"), FileFormat::OffsetV2);
        assert_eq!(detect_format(b"CDF\x05"), FileFormat::DataV5);
        assert_eq!(detect_format(b"\x89HDF"), FileFormat::Hdf5);
        assert_eq!(detect_format(b"LOG1"), FileFormat::LogStructured);
        assert_eq!(detect_format(b"????"), FileFormat::Unknown);
        assert_eq!(detect_format(b"CDF\x03"), FileFormat::Unknown);
    }

    #[test]
    fn test_scan_short_file_is_unknown() {
        let comm = LocalComm::world(1).into_iter().next().unwrap();
        let iosysid = pario_core::init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"CD").unwrap();
        let report = scan_file(iosysid, path.to_str().unwrap()).unwrap();
        assert_eq!(report.format, FileFormat::Unknown);
        assert!(report.opens_with.is_empty());

        pario_core::finalize(iosysid).unwrap();
    }
}
