//! Jenkins REST calls: crumb based online probe and script approval.

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::error::{FarmError, Result};

/// Header name Jenkins uses for its CSRF crumb.
const CRUMB_FIELD: &str = "Jenkins-Crumb";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one Jenkins instance.
#[derive(Clone)]
pub struct JenkinsRestAccessor {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl std::fmt::Debug for JenkinsRestAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JenkinsRestAccessor")
            .field("url", &self.url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl JenkinsRestAccessor {
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().map_err(|e| {
            FarmError::RestRequestFailed { url: url.to_string(), reason: e.to_string() }
        })?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn crumb_url(&self) -> String {
        format!("{}/crumbIssuer/api/xml?xpath=concat(//crumbRequestField,\":\",//crumb)", self.url)
    }

    fn request_error(&self, url: &str, reason: impl ToString) -> FarmError {
        FarmError::RestRequestFailed { url: url.to_string(), reason: reason.to_string() }
    }

    /// Fetch the crumb as `Jenkins-Crumb:<value>`.
    pub async fn crumb(&self) -> Result<String> {
        let url = self.crumb_url();
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| self.request_error(&url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.request_error(&url, e))?;
        if !status.is_success() || !body.contains(CRUMB_FIELD) {
            return Err(self.request_error(&url, format!("no crumb in response ({})", status)));
        }
        Ok(body.trim().to_string())
    }

    /// Wait until Jenkins hands out crumbs.
    ///
    /// Sleeps `initial_delay` first, then polls every `interval`. Gives up
    /// with [`FarmError::ServerNotOnline`] after `max_wait` of polling.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn wait_until_online(
        &self,
        initial_delay: Duration,
        interval: Duration,
        max_wait: Duration,
    ) -> Result<()> {
        info!("Waiting for Jenkins to come online");
        tokio::time::sleep(initial_delay).await;

        let start = Instant::now();
        loop {
            match self.crumb().await {
                Ok(_) => {
                    info!("Jenkins is online");
                    return Ok(());
                }
                Err(e) => debug!("Jenkins not ready: {}", e),
            }
            if start.elapsed() >= max_wait {
                return Err(FarmError::ServerNotOnline {
                    url: self.url.clone(),
                    waited_secs: (initial_delay + start.elapsed()).as_secs(),
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Run a groovy script through `/scriptText` and return its output.
    pub async fn run_script(&self, script: &str) -> Result<String> {
        let crumb = self.crumb().await?;
        let (field, value) = crumb.split_once(':').unwrap_or((CRUMB_FIELD, crumb.as_str()));
        let url = format!("{}/scriptText", self.url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .header(field, value)
            .form(&[("script", script)])
            .send()
            .await
            .map_err(|e| self.request_error(&url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.request_error(&url, e))?;
        if !status.is_success() {
            return Err(self.request_error(&url, format!("{}: {}", status, body.trim())));
        }
        Ok(body)
    }

    pub async fn approve_system_commands(&self, commands: &[String]) -> Result<()> {
        for command in commands {
            info!("Approving system command: {}", command);
            self.run_script(&approve_system_command_script(command)).await?;
        }
        Ok(())
    }

    pub async fn approve_script_signatures(&self, signatures: &[String]) -> Result<()> {
        for signature in signatures {
            info!("Approving script signature: {}", signature);
            self.run_script(&approve_script_signature_script(signature)).await?;
        }
        Ok(())
    }
}

/// Escape `value` for a single-quoted groovy string.
fn groovy_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn approve_system_command_script(command: &str) -> String {
    format!(
        "def scriptApproval = Jenkins.instance.getExtensionList('org.jenkinsci.plugins.scriptsecurity.scripts.ScriptApproval')[0];\
         scriptApproval.approveScript(scriptApproval.hash({}, 'system-command'))",
        groovy_string(command)
    )
}

pub fn approve_script_signature_script(signature: &str) -> String {
    format!(
        "def signature = {};\
         org.jenkinsci.plugins.scriptsecurity.scripts.ScriptApproval.get().approveSignature(signature)",
        groovy_string(signature)
    )
}
