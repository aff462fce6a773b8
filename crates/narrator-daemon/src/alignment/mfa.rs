use std::{env, io::ErrorKind, path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{
    AlignError, ForcedAligner,
    textgrid::{UtteranceBounds, spoken_bounds},
};
use crate::{
    audio::{AudioBuffer, encode_wav},
    config::AlignmentConfig,
    text::TextChunk,
};

/// Montreal Forced Aligner run over a one-off corpus with one `.wav` and one
/// `.lab` per chunk. The scratch directory goes away on every exit path.
pub struct MfaAligner {
    command: Vec<String>,
    dictionary: String,
    acoustic_model: String,
    num_jobs: usize,
    single_speaker: bool,
    timeout: Option<Duration>,
}

impl MfaAligner {
    /// `MFA_EXE` replaces the executable when the configured command is the bare default.
    pub fn from_config(config: &AlignmentConfig) -> Self {
        let mut command = config.command.clone();
        if command == ["mfa"] {
            if let Ok(exe) = env::var("MFA_EXE") {
                command = vec![exe];
            }
        }
        Self {
            command,
            dictionary: config.dictionary.clone(),
            acoustic_model: config.acoustic_model.clone(),
            num_jobs: config.num_jobs(),
            single_speaker: config.single_speaker,
            timeout: config.timeout(),
        }
    }

    fn utterance(i: usize) -> String {
        format!("utt_{:04}", i + 1)
    }

    async fn write_corpus(
        corpus: &Path,
        chunks: &[TextChunk],
        buffers: &[AudioBuffer],
    ) -> Result<(), AlignError> {
        tokio::fs::create_dir_all(corpus).await?;
        for (i, (chunk, buffer)) in chunks.iter().zip(buffers).enumerate() {
            let name = Self::utterance(i);
            let wav = encode_wav(buffer).map_err(|err| AlignError::Malformed(format!("{err:#}")))?;
            tokio::fs::write(corpus.join(format!("{name}.wav")), wav).await?;
            tokio::fs::write(corpus.join(format!("{name}.lab")), chunk.text.trim()).await?;
        }
        Ok(())
    }

    fn build_command(&self, corpus: &Path, aligned: &Path) -> Result<Command, AlignError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| AlignError::NotFound("empty aligner command".into()))?;
        let mut command = Command::new(program);
        command
            .args(leading)
            .arg("align")
            .arg(corpus)
            .arg(&self.dictionary)
            .arg(&self.acoustic_model)
            .arg(aligned)
            .arg("--clean")
            .arg("--num_jobs")
            .arg(self.num_jobs.max(1).to_string());
        if self.single_speaker {
            command.arg("--single_speaker");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl ForcedAligner for MfaAligner {
    async fn align(
        &self,
        chunks: &[TextChunk],
        buffers: &[AudioBuffer],
    ) -> Result<Vec<UtteranceBounds>, AlignError> {
        let scratch = tempfile::Builder::new().prefix("mfa_").tempdir()?;
        let corpus = scratch.path().join("corpus");
        let aligned = scratch.path().join("aligned");
        Self::write_corpus(&corpus, chunks, buffers).await?;

        let mut command = self.build_command(&corpus, &aligned)?;
        debug!(?command, "Running forced aligner");
        let run = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| AlignError::Timeout(limit))?,
            None => run.await,
        }
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => AlignError::NotFound(self.command.join(" ")),
            _ => AlignError::Io(err),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AlignError::Exit {
                code: output.status.code(),
                stderr: stderr.trim().lines().last().unwrap_or_default().to_string(),
            });
        }

        let mut bounds = Vec::with_capacity(chunks.len());
        for i in 0..chunks.len() {
            let path = aligned.join(format!("{}.TextGrid", Self::utterance(i)));
            let contents = tokio::fs::read_to_string(&path).await.map_err(|err| {
                AlignError::Malformed(format!("missing {}: {err}", path.display()))
            })?;
            bounds.push(spoken_bounds(&contents)?);
        }
        Ok(bounds)
    }
}
