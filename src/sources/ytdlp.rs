use async_process::Command;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{watch_url, PlayableResource, ResourceResolver};
use crate::error::{JukeboxError, JukeboxResult};

/// Resuelve ids de YouTube a URLs de audio directas usando yt-dlp
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Verifica que el binario responda
    pub async fn verify(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            anyhow::bail!("{} --version terminó con {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Interpreta la salida de `-e -g`: título en la primera línea, URL del stream en la última.
    fn parse_output(item_id: &str, stdout: &str) -> JukeboxResult<PlayableResource> {
        let lines: Vec<&str> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let stream_url = lines
            .iter()
            .rev()
            .find(|line| line.starts_with("http://") || line.starts_with("https://"))
            .ok_or_else(|| JukeboxError::resolution(item_id, "yt-dlp no devolvió ninguna URL"))?;

        let mut resource = PlayableResource::new(item_id, *stream_url);
        if let Some(title) = lines.first().filter(|first| *first != stream_url) {
            resource = resource.with_title(*title);
        }
        Ok(resource)
    }
}

#[async_trait]
impl ResourceResolver for YtDlpResolver {
    async fn resolve(&self, item_id: &str) -> JukeboxResult<PlayableResource> {
        let url = watch_url(item_id);
        debug!("🔍 Resolviendo {} con {}", url, self.binary);

        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true).args([
            "-f",
            "bestaudio/best",
            "--no-playlist",
            "--no-warnings",
            "-e",
            "-g",
            url.as_str(),
        ]);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                JukeboxError::resolution(
                    item_id,
                    format!("timeout tras {}", humantime::format_duration(self.timeout)),
                )
            })?
            .map_err(|e| JukeboxError::resolution(item_id, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("❌ yt-dlp falló para {}: {}", item_id, stderr.trim());
            return Err(JukeboxError::resolution(item_id, stderr.trim()));
        }

        let resource = Self::parse_output(item_id, &String::from_utf8_lossy(&output.stdout))?;
        info!("✅ Resuelto {}: {}", item_id, resource.display_name());
        Ok(resource)
    }
}
