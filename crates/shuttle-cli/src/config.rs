//! 設定ファイル（TOML）の読み込み

use std::path::Path;

use anyhow::Context;
use shuttle_core::SchedulerConfig;

/// Read `path` when given, otherwise fall back to the defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    let Some(path) = path else {
        return Ok(SchedulerConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn parse(text: &str) -> anyhow::Result<SchedulerConfig> {
    let config: SchedulerConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}
