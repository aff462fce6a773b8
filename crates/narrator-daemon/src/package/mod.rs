//! The downloadable result of a narration: audio plus both caption formats.

use std::{
    io::{Cursor, Write},
    path::Path,
};

use anyhow::{Context, Result};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub const PACKAGE_FILE_NAME: &str = "tts_output.zip";
pub const PACKAGE_CONTENT_TYPE: &str = "application/zip";

pub const AUDIO_FILE: &str = "audio.wav";
pub const SRT_FILE: &str = "captions.srt";
pub const VTT_FILE: &str = "captions.vtt";

#[derive(Debug, Clone)]
pub struct NarrationArtifacts {
    pub wav: Vec<u8>,
    pub srt: String,
    pub vtt: String,
}

impl NarrationArtifacts {
    fn entries(&self) -> [(&'static str, &[u8]); 3] {
        [
            (AUDIO_FILE, self.wav.as_slice()),
            (SRT_FILE, self.srt.as_bytes()),
            (VTT_FILE, self.vtt.as_bytes()),
        ]
    }

    pub fn to_zip(&self) -> Result<Vec<u8>> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in self.entries() {
            writer
                .start_file(name, options)
                .with_context(|| format!("failed to add {name} to package"))?;
            writer.write_all(contents)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    /// Writes the three files side by side into `dir`, creating it if needed.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        for (name, contents) in self.entries() {
            let path = dir.join(name);
            std::fs::write(&path, contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn artifacts() -> NarrationArtifacts {
        NarrationArtifacts {
            wav: b"RIFF....WAVE".to_vec(),
            srt: "1\n00:00:00,000 --> 00:00:01,000\nHi\n\n".into(),
            vtt: "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nHi\n".into(),
        }
    }

    #[test]
    fn zip_holds_all_three_files() {
        let bytes = artifacts().to_zip().unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);

        let mut srt = String::new();
        archive
            .by_name(SRT_FILE)
            .unwrap()
            .read_to_string(&mut srt)
            .unwrap();
        assert_eq!(srt, artifacts().srt);
        assert!(archive.by_name(AUDIO_FILE).is_ok());
        assert!(archive.by_name(VTT_FILE).is_ok());
    }

    #[test]
    fn writes_loose_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        artifacts().write_to_dir(&out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join(VTT_FILE)).unwrap(),
            artifacts().vtt
        );
    }
}
