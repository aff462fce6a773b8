//! Host capability description and the engine recommendation derived from it.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tts::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_gb: f32,
}

/// Detected where the platform makes it cheap; accelerator details come from
/// the `[system]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCapabilities {
    #[serde(default = "Platform::current")]
    pub platform: Platform,
    #[serde(default = "SystemCapabilities::detect_apple_silicon")]
    pub apple_silicon: bool,
    #[serde(default = "SystemCapabilities::detect_ram_gb")]
    pub ram_gb: f32,
    #[serde(default = "SystemCapabilities::detect_cpu_count")]
    pub cpu_count: usize,
    #[serde(default)]
    pub gpu: Option<GpuInfo>,
}

impl SystemCapabilities {
    fn detect_apple_silicon() -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64"))
    }

    fn detect_cpu_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn detect_ram_gb() -> f32 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_mem_total_gb(&meminfo))
            .unwrap_or(8.0)
    }

    pub fn tier(&self) -> CapabilityTier {
        match recommend_engine(self) {
            Engine::Kokoro => CapabilityTier::Standard,
            Engine::CosyVoice2 => CapabilityTier::High,
        }
    }
}

impl Default for SystemCapabilities {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            apple_silicon: Self::detect_apple_silicon(),
            ram_gb: Self::detect_ram_gb(),
            cpu_count: Self::detect_cpu_count(),
            gpu: None,
        }
    }
}

fn parse_mem_total_gb(meminfo: &str) -> Option<f32> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kib / (1024.0 * 1024.0)) as f32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    Standard,
    High,
}

pub fn recommend_engine(caps: &SystemCapabilities) -> Engine {
    if caps.platform == Platform::MacOs && caps.apple_silicon {
        return if caps.ram_gb >= 16.0 {
            Engine::CosyVoice2
        } else {
            Engine::Kokoro
        };
    }

    if let Some(gpu) = &caps.gpu {
        if gpu.vram_gb >= 8.0 {
            return Engine::CosyVoice2;
        }
        if gpu.name.contains("970") || gpu.vram_gb <= 4.0 {
            return Engine::Kokoro;
        }
    }

    if caps.ram_gb >= 32.0 && caps.cpu_count >= 16 {
        return Engine::CosyVoice2;
    }
    Engine::Kokoro
}

/// Logs the decision once at startup.
pub fn log_recommendation(caps: &SystemCapabilities) -> Engine {
    let engine = recommend_engine(caps);
    info!(
        %engine,
        platform = ?caps.platform,
        ram_gb = caps.ram_gb,
        cpus = caps.cpu_count,
        gpu = caps.gpu.as_ref().map(|g| g.name.as_str()).unwrap_or("none"),
        "Recommended engine for this host"
    );
    engine
}
