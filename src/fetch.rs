//! Fetchers download the bytes behind a URL.  The cache calls them
//! from its background pool, so blocking is fine, and never retries
//! a failed fetch on its own.
use std::io::Write;
use std::time::Duration;

use derivative::Derivative;

use crate::error::Error;
use crate::error::Result;

/// Default timeout for [`HttpFetcher`] requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streams the body at a URL into a writer.
pub trait Fetcher: Send + Sync {
    /// Writes the full body for `url` to `dst`, or fails with
    /// [`Error::Transport`] or [`Error::Status`].  Partial output on
    /// failure is discarded by the caller.
    fn fetch(&self, url: &str, dst: &mut dyn Write) -> Result<()>;
}

/// Blocking HTTP(S) fetcher backed by a `ureq` agent.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct HttpFetcher {
    #[derivative(Debug = "ignore")]
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        HttpFetcher::new(DEFAULT_TIMEOUT)
    }
}

impl HttpFetcher {
    /// Returns a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        HttpFetcher {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dst: &mut dyn Write) -> Result<()> {
        let transport = |message: String| Error::Transport {
            url: url.to_owned(),
            message,
        };

        let response = match self.agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(Error::Status {
                    url: url.to_owned(),
                    status,
                })
            }
            Err(e) => return Err(transport(e.to_string())),
        };

        let mut body = response.into_reader();
        std::io::copy(&mut body, dst).map_err(|e| transport(e.to_string()))?;
        Ok(())
    }
}

/// Unreachable hosts fail with a transport error rather than
/// panicking or hanging.
#[test]
fn test_fetch_unreachable() {
    let fetcher = HttpFetcher::new(Duration::from_secs(2));
    let mut sink = Vec::new();

    assert!(matches!(
        fetcher.fetch("http://127.0.0.1:1/a.png", &mut sink),
        Err(Error::Transport { .. })
    ));
}
