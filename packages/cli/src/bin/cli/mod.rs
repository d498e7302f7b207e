pub mod fetch;
pub mod run;

use anyhow::Result;
use tutorbox_config::RuntimeConfig;

/// Runtime configuration from the environment, with the command line's
/// content URL taking precedence.
pub fn load_config(content_url: Option<String>) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(url) = content_url {
        config.content_url = url.trim_end_matches('/').to_string();
    }
    Ok(config)
}
