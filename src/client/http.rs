use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;
use url::Url;

use super::{FetchOutcome, FrameFetcher};

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Pulls `/api/frame` from a relay over plain HTTP.
pub struct HttpFrameFetcher {
    agent: ureq::Agent,
    url: Url,
}

impl HttpFrameFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("parse relay url '{}'", base_url))?;
        let url = base.join("/api/frame").context("build frame url")?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl FrameFetcher for HttpFrameFetcher {
    fn fetch(&mut self) -> Result<FetchOutcome> {
        let response = self
            .agent
            .get(self.url.as_str())
            .set("Cache-Control", "no-cache")
            .set("Pragma", "no-cache")
            .call()
            .with_context(|| format!("fetch {}", self.url))?;

        match response.status() {
            204 => Ok(FetchOutcome::NotReady),
            200 => {
                let expected = response
                    .header("Content-Length")
                    .and_then(|value| value.trim().parse::<usize>().ok());
                let mut bytes = Vec::with_capacity(expected.unwrap_or(64 * 1024).min(MAX_FRAME_BYTES));
                response
                    .into_reader()
                    .take(MAX_FRAME_BYTES as u64 + 1)
                    .read_to_end(&mut bytes)
                    .context("read frame body")?;
                if bytes.len() > MAX_FRAME_BYTES {
                    return Err(anyhow!("frame exceeds {} bytes", MAX_FRAME_BYTES));
                }
                if let Some(expected) = expected {
                    if expected != bytes.len() {
                        return Err(anyhow!(
                            "frame body length {} does not match Content-Length {}",
                            bytes.len(),
                            expected
                        ));
                    }
                }
                if bytes.is_empty() {
                    return Err(anyhow!("empty frame body"));
                }
                Ok(FetchOutcome::Frame(bytes))
            }
            other => Err(anyhow!("unexpected status {} from {}", other, self.url)),
        }
    }
}
