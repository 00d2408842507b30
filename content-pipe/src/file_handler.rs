// Local file protocol handler, the default when a URI carries no scheme.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{PipeError, PipeResult};
use crate::handler::{
    ConfigKey, ConfigValue, OpenAccess, ParserKind, ProtocolHandler, ProtocolHandlerFactory,
};

pub struct FileHandler {
    file: Mutex<File>,
    size: Option<u64>,
}

impl FileHandler {
    fn uri_to_path(uri: &str) -> &str {
        uri.strip_prefix("file://").unwrap_or(uri)
    }

    pub fn open(uri: &str, access: OpenAccess) -> PipeResult<Self> {
        let path = Self::uri_to_path(uri);
        let file = match access {
            OpenAccess::Read => OpenOptions::new().read(true).open(path),
            OpenAccess::Write => OpenOptions::new().write(true).create(true).truncate(true).open(path),
            OpenAccess::ReadWrite => OpenOptions::new().read(true).write(true).create(true).open(path),
        }
        .map_err(PipeError::from)?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ProtocolHandler for FileHandler {
    fn read(&self, buf: &mut [u8]) -> PipeResult<usize> {
        let mut file = self.file.lock().unwrap();
        let n = file.read(buf).map_err(PipeError::from)?;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> PipeResult<usize> {
        let mut file = self.file.lock().unwrap();
        let n = file.write(buf).map_err(PipeError::from)?;
        Ok(n)
    }

    fn seek(&self, offset: i64, origin: crate::handler::SeekOrigin) -> PipeResult<u64> {
        use crate::handler::SeekOrigin::*;
        let mut file = self.file.lock().unwrap();
        let pos = match origin {
            Begin => SeekFrom::Start(offset.max(0) as u64),
            Current => SeekFrom::Current(offset),
            End => SeekFrom::End(offset),
            Time => return Err(PipeError::NotSupported),
        };
        file.seek(pos).map_err(PipeError::from)
    }

    fn position(&self) -> PipeResult<u64> {
        let mut file = self.file.lock().unwrap();
        file.stream_position().map_err(PipeError::from)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn is_streaming(&self) -> bool {
        false
    }

    fn query_config(&self, key: &ConfigKey) -> PipeResult<ConfigValue> {
        match key {
            ConfigKey::CanSeekByTime => Ok(ConfigValue::Bool(false)),
            ConfigKey::ChunkSize => Ok(ConfigValue::U64(256 * 1024)),
            _ => Err(PipeError::NotSupported),
        }
    }
}

pub struct FileHandlerFactory;

impl ProtocolHandlerFactory for FileHandlerFactory {
    fn open(&self, uri: &str, access: OpenAccess) -> PipeResult<Arc<dyn ProtocolHandler>> {
        Ok(Arc::new(FileHandler::open(uri, access)?))
    }

    fn probe_parser(&self, uri: &str) -> ParserKind {
        let path = FileHandler::uri_to_path(uri);
        probe_by_extension(path)
    }
}

pub fn probe_by_extension(path: &str) -> ParserKind {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") | Some("m4a") | Some("mov") => ParserKind::Mp4,
        Some("mp3") => ParserKind::Mp3,
        Some("avi") => ParserKind::Avi,
        Some("asf") | Some("wmv") | Some("wma") => ParserKind::Asf,
        Some("mkv") | Some("webm") => ParserKind::Mkv,
        _ => ParserKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn reads_whole_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let uri = format!("file://{}", tmp.path().display());
        let handler = FileHandler::open(&uri, OpenAccess::Read).unwrap();
        assert_eq!(handler.size(), Some(11));
        let mut buf = [0u8; 11];
        let n = handler.read(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn probes_extension() {
        assert_eq!(probe_by_extension("/a/b/movie.mp4"), ParserKind::Mp4);
        assert_eq!(probe_by_extension("/a/b/song.mp3"), ParserKind::Mp3);
        assert_eq!(probe_by_extension("/a/b/clip.xyz"), ParserKind::Unknown);
    }
}
