//! Engines that live in their own executable. Text goes in on stdin, audio
//! comes back as WAV files in a scratch directory or as raw s16le on stdout.

use std::{
    fs,
    io::{ErrorKind, Read, Write},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread::{self, JoinHandle},
};

use tracing::{debug, info, warn};

use super::{BackendError, Engine, FrameIter, SpeechBackend, VoiceParams, whole_unit_frames};
use crate::{
    audio::{self, AudioBuffer},
    config::{BackendConfig, BackendProvider},
};

const OOM_MARKERS: [&str; 2] = ["out of memory", "outofmemory"];

pub struct CommandBackend {
    engine: Engine,
    sample_rate: u32,
    lang_code: String,
    voices: Vec<String>,
    program: String,
    args: Vec<String>,
    cpu_args: Vec<String>,
    stream_args: Option<Vec<String>>,
    batch: bool,
    native_speed: bool,
    degraded: AtomicBool,
}

impl CommandBackend {
    pub fn from_config(config: &BackendConfig) -> Self {
        let (program, args, cpu_args, stream_args, batch, native_speed) = match &config.provider {
            BackendProvider::Command {
                program,
                args,
                cpu_args,
                stream_args,
                batch,
                native_speed,
            } => (
                program.clone(),
                args.clone(),
                cpu_args.clone(),
                stream_args.clone(),
                *batch,
                *native_speed,
            ),
            BackendProvider::Null => (String::new(), Vec::new(), Vec::new(), None, false, false),
        };
        Self {
            engine: config.engine,
            sample_rate: config.sample_rate,
            lang_code: config.lang_code.clone(),
            voices: config.voices.clone(),
            program,
            args,
            cpu_args,
            stream_args,
            batch,
            native_speed,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn command(
        &self,
        template: &[String],
        params: &VoiceParams,
        output: &Path,
        reference: Option<&Path>,
    ) -> Command {
        let mut command = Command::new(&self.program);
        for arg in template {
            if arg.contains("{reference}") && reference.is_none() {
                continue;
            }
            let arg = arg
                .replace("{voice}", &params.voice)
                .replace("{speed}", &params.speed.to_string())
                .replace("{lang}", &self.lang_code)
                .replace("{output}", &output.to_string_lossy())
                .replace(
                    "{reference}",
                    &reference.map(|p| p.to_string_lossy()).unwrap_or_default(),
                );
            command.arg(arg);
        }
        if self.is_degraded() {
            command.args(&self.cpu_args);
        }
        command
    }

    /// Writes the cloning prompt next to the other scratch files.
    fn write_reference(
        &self,
        scratch: &Path,
        params: &VoiceParams,
    ) -> Result<Option<std::path::PathBuf>, BackendError> {
        let Some(reference) = &params.reference else {
            return Ok(None);
        };
        let path = scratch.join("reference.wav");
        fs::write(&path, audio::encode_wav(&reference.audio)?)?;
        Ok(Some(path))
    }

    fn run(&self, mut command: Command, input: &str) -> Result<(), BackendError> {
        let mut child = self.spawn(&mut command)?;
        let writer = feed_stdin(&mut child, input);
        let output = child.wait_with_output()?;
        finish_stdin(writer)?;
        if output.status.success() {
            return Ok(());
        }
        Err(self.classify_failure(&output.stderr, &output.status.to_string()))
    }

    fn spawn(&self, command: &mut Command) -> Result<Child, BackendError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    BackendError::Unavailable(format!("{} not found", self.program))
                }
                _ => BackendError::Io(err),
            })
    }

    fn classify_failure(&self, stderr: &[u8], status: &str) -> BackendError {
        let stderr = String::from_utf8_lossy(stderr);
        let lowered = stderr.to_ascii_lowercase();
        let tail = stderr.trim().lines().last().unwrap_or_default().to_string();
        if OOM_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            return BackendError::ResourceExhausted(tail);
        }
        BackendError::Synthesis(format!("{} exited with {status}: {tail}", self.program))
    }

    fn read_output(&self, path: &Path) -> Result<AudioBuffer, BackendError> {
        let bytes = fs::read(path).map_err(|err| {
            BackendError::Synthesis(format!("missing output {}: {err}", path.display()))
        })?;
        Ok(audio::decode_wav(&bytes)?)
    }
}

impl SpeechBackend for CommandBackend {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn lang_code(&self) -> &str {
        &self.lang_code
    }

    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    fn native_speed(&self) -> bool {
        self.native_speed
    }

    fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioBuffer, BackendError> {
        let scratch = tempfile::Builder::new().prefix("narrator_tts_").tempdir()?;
        let reference = self.write_reference(scratch.path(), params)?;
        let output = scratch.path().join("out.wav");
        let command = self.command(&self.args, params, &output, reference.as_deref());
        self.run(command, text)?;
        self.read_output(&output)
    }

    /// Texts are joined with newlines; the executable writes `0000.wav`,
    /// `0001.wav` and so on into the `{output}` directory.
    fn synthesize_batch(
        &self,
        texts: &[String],
        params: &VoiceParams,
    ) -> Result<Vec<AudioBuffer>, BackendError> {
        if !self.batch {
            return texts
                .iter()
                .map(|text| self.synthesize(text, params))
                .collect();
        }
        let scratch = tempfile::Builder::new().prefix("narrator_batch_").tempdir()?;
        let reference = self.write_reference(scratch.path(), params)?;
        let out_dir = scratch.path().join("out");
        fs::create_dir(&out_dir)?;
        let command = self.command(&self.args, params, &out_dir, reference.as_deref());
        self.run(command, &texts.join("\n"))?;

        (0..texts.len())
            .map(|i| self.read_output(&out_dir.join(format!("{i:04}.wav"))))
            .collect()
    }

    fn synthesize_streaming(
        &self,
        text: &str,
        params: &VoiceParams,
        frame_ms: u32,
    ) -> Result<FrameIter, BackendError> {
        let stream_args = match &self.stream_args {
            Some(args) if self.native_speed || (params.speed - 1.0).abs() <= 0.01 => args,
            _ => return whole_unit_frames(self, text, params, frame_ms),
        };

        let scratch = tempfile::Builder::new().prefix("narrator_stream_").tempdir()?;
        let reference = self.write_reference(scratch.path(), params)?;
        let mut command = self.command(stream_args, params, scratch.path(), reference.as_deref());
        command.stderr(Stdio::null());
        let mut child = self.spawn(&mut command)?;
        let writer = feed_stdin(&mut child, text);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Synthesis("stdout not captured".into()))?;
        let frame_bytes = (self.sample_rate as usize * frame_ms.max(1) as usize / 1000).max(1) * 2;
        debug!(engine = %self.engine, frame_bytes, "Streaming from engine stdout");

        Ok(Box::new(StdoutFrames {
            child,
            stdout,
            writer,
            frame_bytes,
            finished: false,
            _scratch: scratch,
        }))
    }

    fn degrade(&self) -> bool {
        if self.cpu_args.is_empty() {
            return false;
        }
        let first = !self.degraded.swap(true, Ordering::AcqRel);
        if first {
            info!(engine = %self.engine, "Falling back to CPU execution");
        }
        first
    }
}

type StdinWriter = Option<JoinHandle<std::io::Result<()>>>;

/// Writes the text and closes stdin on its own thread, so an engine that
/// fills stdout or stderr before draining its input cannot stall us.
fn feed_stdin(child: &mut Child, text: &str) -> StdinWriter {
    let mut stdin = child.stdin.take()?;
    let input = text.as_bytes().to_vec();
    Some(thread::spawn(move || stdin.write_all(&input)))
}

/// An engine that exits without reading its input is judged by its exit
/// status, not by the broken pipe.
fn finish_stdin(writer: StdinWriter) -> Result<(), BackendError> {
    let Some(writer) = writer else {
        return Ok(());
    };
    match writer.join() {
        Ok(Err(err)) if err.kind() != ErrorKind::BrokenPipe => Err(BackendError::Io(err)),
        Ok(_) => Ok(()),
        Err(_) => Err(BackendError::Synthesis("stdin writer panicked".into())),
    }
}

/// Raw s16le read off a running engine. Dropping it kills the process.
struct StdoutFrames {
    child: Child,
    stdout: ChildStdout,
    writer: StdinWriter,
    frame_bytes: usize,
    finished: bool,
    _scratch: tempfile::TempDir,
}

impl Iterator for StdoutFrames {
    type Item = Result<Vec<u8>, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut frame = vec![0u8; self.frame_bytes];
        match self.stdout.read(&mut frame) {
            Ok(0) => {
                self.finished = true;
                if let Err(err) = finish_stdin(self.writer.take()) {
                    let _ = self.child.wait();
                    return Some(Err(err));
                }
                match self.child.wait() {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some(Err(BackendError::Synthesis(format!(
                        "streaming engine exited with {status}"
                    )))),
                    Err(err) => Some(Err(BackendError::Io(err))),
                }
            }
            Ok(n) => {
                frame.truncate(n);
                Some(Ok(frame))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(BackendError::Io(err)))
            }
        }
    }
}

impl Drop for StdoutFrames {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.child.kill() {
                warn!(?err, "Failed to stop streaming engine");
            }
        }
        let _ = self.child.wait();
        if let Err(err) = finish_stdin(self.writer.take()) {
            debug!(?err, "Streaming engine input was cut short");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn backend(program: &str, args: &[&str], cpu_args: &[&str]) -> CommandBackend {
        CommandBackend::from_config(&BackendConfig {
            engine: Engine::Kokoro,
            sample_rate: 24_000,
            lang_code: "a".into(),
            voices: vec!["af_heart".into()],
            provider: BackendProvider::Command {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
                cpu_args: cpu_args.iter().map(|s| s.to_string()).collect(),
                stream_args: Some(vec!["-c".into(), "head -c 7 /dev/zero".into()]),
                batch: false,
                native_speed: true,
            },
        })
    }

    #[test]
    fn missing_program_is_unavailable() {
        let backend = backend("definitely-not-a-real-tts-binary", &[], &[]);
        let err = backend
            .synthesize("Hello.", &VoiceParams::new("af_heart", 1.0))
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{err:?}");
    }

    #[test]
    fn oom_on_stderr_is_resource_exhaustion() {
        let backend = backend(
            "sh",
            &["-c", "echo 'CUDA error: out of memory' >&2; exit 1"],
            &["--device", "cpu"],
        );
        let err = backend
            .synthesize("Hello.", &VoiceParams::new("af_heart", 1.0))
            .unwrap_err();
        assert!(matches!(err, BackendError::ResourceExhausted(_)), "{err:?}");

        assert!(backend.degrade());
        assert!(backend.is_degraded());
        assert!(!backend.degrade());
    }

    #[test]
    fn degrade_without_cpu_args_is_a_no_op() {
        let backend = backend("sh", &[], &[]);
        assert!(!backend.degrade());
        assert!(!backend.is_degraded());
    }

    #[test]
    fn streams_raw_stdout_with_odd_lengths() {
        let backend = backend("sh", &[], &[]);
        let frames: Vec<Vec<u8>> = backend
            .synthesize_streaming("Hello.", &VoiceParams::new("af_heart", 1.0), 30)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.iter().map(Vec::len).sum::<usize>(), 7);
    }

    /// Well past a pipe buffer in both directions.
    fn long_text() -> String {
        "Hello there. ".repeat(20_000)
    }

    #[test]
    fn chatty_engine_with_long_input_completes() {
        let scratch = tempfile::tempdir().unwrap();
        let canned = scratch.path().join("canned.wav");
        let audio = AudioBuffer::new(vec![0.25; 240], 24_000);
        fs::write(&canned, audio::encode_wav(&audio).unwrap()).unwrap();

        let script = format!(
            "head -c 200000 /dev/zero >&2; cat > /dev/null; cp '{}' \"$0\"",
            canned.display()
        );
        let backend = backend("sh", &["-c", script.as_str(), "{output}"], &[]);
        let out = backend
            .synthesize(&long_text(), &VoiceParams::new("af_heart", 1.0))
            .unwrap();
        assert_eq!(out.len(), 240);
    }

    #[test]
    fn streaming_engine_may_answer_before_reading_input() {
        let mut backend = backend("sh", &[], &[]);
        backend.stream_args = Some(vec![
            "-c".into(),
            "head -c 100000 /dev/zero; cat > /dev/null".into(),
        ]);
        let frames: Vec<Vec<u8>> = backend
            .synthesize_streaming(&long_text(), &VoiceParams::new("af_heart", 1.0), 30)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.iter().map(Vec::len).sum::<usize>(), 100_000);
    }
}
