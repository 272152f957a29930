//! Typed Rust client for the Docker Engine REST API.
//!
//! Covers the subset needed for running game servers:
//! images (inspect, build), containers (create, start, logs, remove).
//!
//! Only TCP endpoints are supported (`tcp://host:2375` or `http://host:2375`).

mod types;

pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("docker api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("docker api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("image build for {tag} failed: {message}")]
    Build { tag: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Docker Engine REST API.
#[derive(Clone)]
pub struct DockerClient {
    base_url: String,
    http: reqwest::Client,
}

impl DockerClient {
    /// `host` accepts the `DOCKER_HOST` form (`tcp://127.0.0.1:2375`) or a plain URL.
    pub fn new(host: impl AsRef<str>) -> Self {
        let host = host.as_ref().trim_end_matches('/');
        let base_url = match host.strip_prefix("tcp://") {
            Some(rest) => format!("http://{rest}"),
            None => host.to_string(),
        };
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Like `check` but also accepts one extra status (404 on delete, 304 on start).
    async fn check_allow(
        resp: reqwest::Response,
        endpoint: &'static str,
        allowed: u16,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != allowed {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Images ───────────────────────────────────────────────────────

    /// Returns `None` when the engine has no image with that name.
    pub async fn inspect_image(&self, name: &str) -> Result<Option<ImageInspect>> {
        let resp = self
            .http
            .get(self.url(&format!("/images/{name}/json")))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Self::check(resp, "inspect image")
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Error::from)
    }

    /// Build an image from a tar build context.
    ///
    /// The engine reports build failures inside a 200 response, so the
    /// output stream is parsed line by line. Every `stream`/`status` line is
    /// handed to `on_output`.
    pub async fn build_image(
        &self,
        tag: &str,
        context: Vec<u8>,
        mut on_output: impl FnMut(&str) + Send,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/build"))
            .query(&[
                ("t", tag),
                ("dockerfile", "Dockerfile"),
                ("rm", "true"),
                ("forcerm", "true"),
            ])
            .header("Content-Type", "application/x-tar")
            .body(context)
            .send()
            .await?;

        let mut resp = Self::check(resp, "build image").await?;
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = resp.chunk().await? {
            pending.extend_from_slice(&chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                Self::handle_build_line(tag, &line, &mut on_output)?;
            }
        }
        if !pending.is_empty() {
            Self::handle_build_line(tag, &pending, &mut on_output)?;
        }

        Ok(())
    }

    fn handle_build_line(tag: &str, line: &[u8], on_output: &mut impl FnMut(&str)) -> Result<()> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        // Unparseable lines are passed through verbatim.
        let message: BuildMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(_) => {
                on_output(text);
                return Ok(());
            }
        };

        if let Some(error) = message.error {
            return Err(Error::Build {
                tag: tag.to_string(),
                message: error,
            });
        }
        if let Some(out) = message.stream.as_deref().or(message.status.as_deref()) {
            let out = out.trim_end();
            if !out.is_empty() {
                on_output(out);
            }
        }
        Ok(())
    }

    // ── Containers ───────────────────────────────────────────────────

    pub async fn create_container(
        &self,
        name: &str,
        req: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        let resp = self
            .http
            .post(self.url("/containers/create"))
            .query(&[("name", name)])
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create container")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/containers/{id}/start")))
            .send()
            .await?;

        // 304: already started
        Self::check_allow(resp, "start container", 304).await?;
        Ok(())
    }

    /// Fetch the last `tail` lines of combined stdout/stderr, demultiplexed.
    pub async fn container_logs(&self, id: &str, tail: usize) -> Result<String> {
        let resp = self
            .http
            .get(self.url(&format!("/containers/{id}/logs")))
            .query(&[
                ("stdout", "true".to_string()),
                ("stderr", "true".to_string()),
                ("tail", tail.to_string()),
            ])
            .send()
            .await?;

        let raw = Self::check(resp, "container logs").await?.bytes().await?;
        Ok(demux_logs(&raw))
    }

    /// Force-remove a container. A missing container counts as removed.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/containers/{id}")))
            .query(&[("force", "true")])
            .send()
            .await?;

        Self::check_allow(resp, "remove container", 404).await?;
        Ok(())
    }
}

/// Strip the engine's stream multiplexing headers from a non-TTY log body.
///
/// Each frame is `[stream, 0, 0, 0, len_be_u32]` followed by `len` payload
/// bytes. Bodies from TTY containers carry no headers and are returned as-is.
pub fn demux_logs(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;

    while rest.len() >= 8 && matches!(rest[0], 0..=2) && rest[1..4] == [0, 0, 0] {
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + size).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);

    String::from_utf8_lossy(&out).into_owned()
}
